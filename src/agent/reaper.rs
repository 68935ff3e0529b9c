use crate::cluster::FilePathInfo;
use crate::connection::pool::ConnectionPool;
use crate::connection::Session;
use crate::core::{CoordError, Result};
use log::{debug, info, warn};
use std::future::Future;
use std::time::Duration;

/// How long a terminated transfer gets to unwind before it is abandoned.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Which activity-view match found the sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapScope {
    /// Application tag and pipe path, current column names.
    Full,
    /// Application tag and pipe path, pre-9.2 column names.
    Legacy,
    /// Application tag only.
    TagOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    pub terminated: usize,
    pub scope: ReapScope,
}

/// Terminates server sessions stuck in a data transfer for this run.
#[derive(Debug, Clone)]
pub struct HangingSessionReaper {
    paths: FilePathInfo,
    application_tag: String,
    drain_grace: Duration,
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

impl HangingSessionReaper {
    pub fn new(paths: FilePathInfo, application_tag: &str) -> Self {
        Self {
            paths,
            application_tag: application_tag.to_string(),
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Candidate termination queries, most specific first.
    pub fn queries(&self) -> Vec<(ReapScope, String)> {
        let tag = escape_literal(&self.application_tag);
        let pipe = escape_literal(&self.paths.pipe_path_for_copy_command());
        let tag_only = |pid: &str| {
            format!(
                "SELECT pg_terminate_backend({0}) FROM pg_stat_activity WHERE application_name = '{1}' AND {0} <> pg_backend_pid()",
                pid, tag
            )
        };
        vec![
            (
                ReapScope::Full,
                format!(
                    "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE application_name = '{}' AND query LIKE '%{}%' AND state = 'active' AND pid <> pg_backend_pid()",
                    tag, pipe
                ),
            ),
            (
                ReapScope::Legacy,
                format!(
                    "SELECT pg_terminate_backend(procpid) FROM pg_stat_activity WHERE application_name = '{}' AND current_query LIKE '%{}%' AND procpid <> pg_backend_pid()",
                    tag, pipe
                ),
            ),
            (ReapScope::TagOnly, tag_only("pid")),
            (ReapScope::TagOnly, tag_only("procpid")),
        ]
    }

    /// Terminate every matching session from a connection of its own.
    ///
    /// The pool's slots may all be frozen inside transactions, where a
    /// rejected activity query would abort the backup's view. The reaper
    /// connects separately under `<tag>_reaper`, which the tag match never
    /// selects, and closes that connection afterwards.
    pub async fn terminate(&self, pool: &ConnectionPool) -> Result<ReapReport> {
        let name = format!("{}_reaper", self.application_tag);
        let mut session = pool.open_detached(&name).await?;
        let result = self.terminate_on(&mut session).await;
        if let Err(e) = session.close().await {
            warn!("Unable to close reaper session: {}", e);
        }
        result
    }

    /// Terminate every matching session except `session` itself.
    ///
    /// `session` must not be inside a transaction. Finding nothing is
    /// success.
    pub async fn terminate_on(&self, session: &mut Session) -> Result<ReapReport> {
        if session.is_in_transaction() {
            return Err(CoordError::ExecutionError(format!(
                "Session {} is inside a transaction and cannot look for hanging sessions",
                session.slot()
            )));
        }

        let mut last_error = None;
        for (scope, query) in self.queries() {
            match session.execute(&query).await {
                Ok(result) => {
                    let terminated = result.row_count();
                    if terminated > 0 {
                        info!(
                            "Terminated {} hanging session(s) tagged {}",
                            terminated, self.application_tag
                        );
                    } else {
                        debug!("No hanging sessions tagged {}", self.application_tag);
                    }
                    return Ok(ReapReport { terminated, scope });
                }
                Err(e) => {
                    debug!("Activity query ({:?}) rejected: {}", scope, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            CoordError::ExecutionError("no activity query available".to_string())
        }))
    }

    /// Run `transfer`, reaping its sessions if it outlives `timeout`.
    ///
    /// On expiry the matching sessions are terminated (see [`terminate`]),
    /// the transfer gets the drain grace period to unwind, and the call
    /// reports `TransferTimedOut` with the number of sessions terminated.
    ///
    /// [`terminate`]: HangingSessionReaper::terminate
    pub async fn watch<F, T>(
        &self,
        pool: &ConnectionPool,
        timeout: Duration,
        transfer: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::pin!(transfer);
        tokio::select! {
            result = &mut transfer => return result,
            _ = tokio::time::sleep(timeout) => {}
        }

        warn!(
            "Data transfer exceeded {:.1}s; terminating hanging sessions",
            timeout.as_secs_f64()
        );
        let terminated = match self.terminate(pool).await {
            Ok(report) => report.terminated,
            Err(e) => {
                warn!("Unable to terminate hanging sessions: {}", e);
                0
            }
        };

        match tokio::time::timeout(self.drain_grace, &mut transfer).await {
            Ok(Err(e)) => debug!("Transfer ended after termination: {}", e),
            Ok(Ok(_)) => debug!("Transfer completed after termination"),
            Err(_) => warn!("Transfer did not unwind within {:?}", self.drain_grace),
        }

        Err(CoordError::TransferTimedOut {
            timeout_secs: timeout.as_secs_f64(),
            terminated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunFingerprint;

    #[test]
    fn test_queries_carry_tag_and_pipe() {
        let paths = FilePathInfo::new(RunFingerprint::new(77, "20240101000000"));
        let reaper = HangingSessionReaper::new(paths, "o'brien");
        let queries = reaper.queries();
        assert_eq!(queries.len(), 4);
        assert_eq!(queries[0].0, ReapScope::Full);
        assert!(queries[0].1.contains("application_name = 'o''brien'"));
        assert!(queries[0].1.contains("gpbackup_<SEGID>_20240101000000_pipe_77"));
        assert!(queries[1].1.contains("current_query LIKE"));
        assert!(!queries[2].1.contains("LIKE"));
    }
}
