//! Sessions backed by a real server through `tokio-postgres`.

use super::{config::ConnectionConfig, Connector, SessionHandle};
use crate::core::{CoordError, Result};
use crate::result::QueryResult;
use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

/// How long `close` waits for the connection task to flush and exit.
const DRIVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn SessionHandle>> {
        let (client, connection) =
            tokio_postgres::connect(&config.to_pg_config_string(), NoTls).await?;

        // The connection future drives the socket; it is owned by the session
        // and awaited on close.
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("Postgres connection error: {}", e);
            }
        });

        let pid: i32 = client
            .simple_query("SELECT pg_backend_pid()")
            .await
            .map_err(CoordError::from)
            .map(collect_result)?
            .first_value()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        debug!("Connected to {} (backend pid {})", config.to_url(), pid);
        Ok(Box::new(PgSession {
            client: Some(client),
            driver,
            pid,
        }))
    }
}

pub struct PgSession {
    client: Option<Client>,
    driver: JoinHandle<()>,
    pid: i32,
}

#[async_trait]
impl SessionHandle for PgSession {
    async fn simple_query(&mut self, sql: &str) -> Result<QueryResult> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| CoordError::ExecutionError("Connection is closed".into()))?;
        let messages = client.simple_query(sql).await?;
        Ok(collect_result(messages))
    }

    fn backend_pid(&self) -> i32 {
        self.pid
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the client queues Terminate; the driver flushes it and exits.
        if self.client.take().is_none() {
            return Ok(());
        }
        if !shut_down(&mut self.driver, DRIVER_SHUTDOWN_GRACE).await {
            warn!(
                "Connection to backend {} did not shut down within {:?}",
                self.pid, DRIVER_SHUTDOWN_GRACE
            );
        }
        Ok(())
    }
}

/// Wait up to `grace` for the connection task to end on its own, aborting it
/// otherwise. Returns whether it ended in time.
async fn shut_down(driver: &mut JoinHandle<()>, grace: Duration) -> bool {
    if tokio::time::timeout(grace, &mut *driver).await.is_ok() {
        return true;
    }
    driver.abort();
    false
}

impl Drop for PgSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Keep the output of the last statement, like psql does.
fn collect_result(messages: Vec<SimpleQueryMessage>) -> QueryResult {
    let mut result = QueryResult::empty();
    let mut current_rows: Vec<Vec<Option<String>>> = Vec::new();
    let mut current_columns: Vec<String> = Vec::new();

    for message in messages {
        match message {
            SimpleQueryMessage::Row(row) => {
                if current_columns.is_empty() {
                    current_columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                let values = (0..row.len())
                    .map(|i| row.get(i).map(str::to_string))
                    .collect();
                current_rows.push(values);
            }
            SimpleQueryMessage::CommandComplete(count) => {
                let rows = std::mem::take(&mut current_rows);
                let columns = std::mem::take(&mut current_columns);
                result = QueryResult::new(columns, rows);
                result.affected = count;
            }
            _ => {}
        }
    }

    result
}
