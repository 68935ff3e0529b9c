use super::{config::ConnectionConfig, Connector, Session};
use crate::core::{CoordError, Result};
use crate::result::QueryResult;
use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Fixed-size pool of sessions against one database
///
/// Every slot is created by `connect` and lives until `close`; there is no
/// growth, eviction or reconnection. A slot's mutex is the ownership token:
/// whoever holds the guard is the only one issuing statements on it.
pub struct ConnectionPool {
    /// Pool configuration
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    /// One session per slot index
    sessions: Vec<Mutex<Session>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Open exactly `config.num_connections` sessions.
    ///
    /// Connections are opened concurrently. If any single connection fails,
    /// every session that did open is closed and no pool is returned.
    pub async fn connect(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Result<Self> {
        config.validate().map_err(CoordError::ConfigError)?;
        let size = config.num_connections;

        let attempts = join_all((0..size).map(|slot| {
            let connector = Arc::clone(&connector);
            let config = &config;
            async move {
                tokio::time::timeout(config.connect_timeout, connector.connect(config))
                    .await
                    .map_err(|_| CoordError::ConnectionError {
                        slot,
                        reason: format!("timed out after {:?}", config.connect_timeout),
                    })?
                    .map_err(|e| CoordError::ConnectionError {
                        slot,
                        reason: e.to_string(),
                    })
            }
        }))
        .await;

        let mut sessions = Vec::with_capacity(size);
        let mut first_error = None;
        for (slot, attempt) in attempts.into_iter().enumerate() {
            match attempt {
                Ok(handle) => sessions.push(Session::new(slot, &config.database, handle)),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            warn!(
                "Failed to open {} connection(s) to {}; closing {} opened session(s)",
                size - sessions.len(),
                config.to_url(),
                sessions.len()
            );
            for session in sessions.iter_mut() {
                let _ = session.close().await;
            }
            return Err(err);
        }

        info!("Opened {} session(s) to {}", size, config.to_url());
        Ok(Self {
            config,
            connector,
            sessions: sessions.into_iter().map(Mutex::new).collect(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.sessions.len()
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open one more session to the pool's database under `application_name`.
    ///
    /// The session belongs to the caller, not to any slot: it never takes part
    /// in pool-wide transactions and the caller closes it. Its slot number is
    /// the pool size, so log lines never collide with a pooled slot.
    pub async fn open_detached(&self, application_name: &str) -> Result<Session> {
        if self.is_closed() {
            return Err(CoordError::PoolClosed);
        }
        let slot = self.sessions.len();
        let config = self.config.clone().application_name(application_name);
        let handle = tokio::time::timeout(config.connect_timeout, self.connector.connect(&config))
            .await
            .map_err(|_| CoordError::ConnectionError {
                slot,
                reason: format!("timed out after {:?}", config.connect_timeout),
            })?
            .map_err(|e| CoordError::ConnectionError {
                slot,
                reason: e.to_string(),
            })?;
        debug!("Opened detached session {} as {}", slot, application_name);
        Ok(Session::new(slot, &config.database, handle))
    }

    /// Take exclusive ownership of one slot.
    pub async fn acquire(&self, slot: usize) -> Result<MutexGuard<'_, Session>> {
        if self.is_closed() {
            return Err(CoordError::PoolClosed);
        }
        let session = self.sessions.get(slot).ok_or(CoordError::InvalidSlot {
            slot,
            size: self.sessions.len(),
        })?;
        Ok(session.lock().await)
    }

    /// Run one statement on one slot.
    pub async fn execute(&self, slot: usize, sql: &str) -> Result<QueryResult> {
        let mut session = self.acquire(slot).await?;
        debug!("Slot {}: {}", slot, sql.trim());
        session.execute(sql).await
    }

    /// Begin a transaction on every slot.
    pub async fn begin_all(&self) -> Result<()> {
        let results = join_all((0..self.size()).map(|slot| async move {
            let mut session = self.acquire(slot).await?;
            session.begin().await
        }))
        .await;
        first_error(results)
    }

    /// Commit the open transaction on every slot that has one.
    pub async fn commit_all(&self) -> Result<()> {
        let results = join_all((0..self.size()).map(|slot| async move {
            let mut session = self.acquire(slot).await?;
            if session.is_in_transaction() {
                session.commit().await
            } else {
                Ok(())
            }
        }))
        .await;
        first_error(results)
    }

    /// Roll back every open transaction.
    pub async fn rollback_all(&self) -> Result<()> {
        let results = join_all((0..self.size()).map(|slot| async move {
            let mut session = self.acquire(slot).await?;
            if session.is_in_transaction() {
                session.rollback().await
            } else {
                Ok(())
            }
        }))
        .await;
        first_error(results)
    }

    /// Close every session.
    ///
    /// Only the first call closes; any later call, and any other operation
    /// after close, fails with `PoolClosed`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(CoordError::PoolClosed);
        }
        let results = join_all(self.sessions.iter().map(|session| async move {
            let mut session = session.lock().await;
            session.close().await
        }))
        .await;
        debug!("Closed {} session(s) to {}", self.size(), self.config.to_url());
        first_error(results)
    }
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().collect::<Result<Vec<_>>>().map(|_| ())
}
