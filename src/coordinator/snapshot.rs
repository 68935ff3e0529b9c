use crate::connection::pool::ConnectionPool;
use crate::connection::Session;
use crate::core::{CoordError, Result};
use futures::future::join_all;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use std::fmt;
use std::str::FromStr;

lazy_static! {
    static ref SNAPSHOT_ID: Regex = Regex::new(r"^[0-9A-Fa-f]+(-[0-9A-Fa-f]+)*-[0-9]+$").unwrap();
}

/// Exported snapshot identifier, `<hex>-<decimal>`.
///
/// Only meaningful while the exporting transaction stays open.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotHandle(String);

impl SnapshotHandle {
    pub fn parse(id: &str) -> Result<Self> {
        let id = id.trim();
        if SNAPSHOT_ID.is_match(id) {
            Ok(Self(id.to_string()))
        } else {
            Err(CoordError::ParseError(format!(
                "Malformed snapshot identifier: {:?}",
                id
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SnapshotHandle {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Export the snapshot of the session's open transaction.
pub async fn export_snapshot(session: &mut Session) -> Result<SnapshotHandle> {
    let slot = session.slot();
    if !session.is_in_transaction() {
        return Err(CoordError::SnapshotExport {
            slot,
            reason: "no open transaction".to_string(),
        });
    }

    let result = session
        .execute("SELECT pg_catalog.pg_export_snapshot()")
        .await
        .map_err(|e| CoordError::SnapshotExport {
            slot,
            reason: e.to_string(),
        })?;
    let id = result.first_value().ok_or_else(|| CoordError::SnapshotExport {
        slot,
        reason: "server returned no snapshot identifier".to_string(),
    })?;
    let handle = SnapshotHandle::parse(id).map_err(|e| CoordError::SnapshotExport {
        slot,
        reason: e.to_string(),
    })?;
    debug!("Slot {}: exported snapshot {}", slot, handle);
    Ok(handle)
}

/// Adopt `handle` as the snapshot of the session's open transaction.
///
/// Must be the first statement of the transaction. Both preconditions are
/// checked here before the server is asked.
pub async fn import_snapshot(session: &mut Session, handle: &SnapshotHandle) -> Result<()> {
    let slot = session.slot();
    let refuse = |reason: String| CoordError::SnapshotImport {
        slot,
        snapshot: handle.to_string(),
        reason,
    };

    match session.statements_in_transaction() {
        None => return Err(refuse("no open transaction".to_string())),
        Some(0) => {}
        Some(n) => {
            return Err(refuse(format!(
                "{} statement(s) already executed in this transaction",
                n
            )));
        }
    }

    session
        .execute(&format!("SET TRANSACTION SNAPSHOT '{}'", handle))
        .await
        .map_err(|e| refuse(e.to_string()))?;
    debug!("Slot {}: imported snapshot {}", slot, handle);
    Ok(())
}

/// Shares one exported snapshot across every session of a pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotCoordinator {
    exporter_slot: usize,
}

impl SnapshotCoordinator {
    pub fn new(exporter_slot: usize) -> Self {
        Self { exporter_slot }
    }

    pub fn exporter_slot(&self) -> usize {
        self.exporter_slot
    }

    /// Export from the exporter slot, beginning its transaction if needed.
    pub async fn export(&self, pool: &ConnectionPool) -> Result<SnapshotHandle> {
        let mut session = pool.acquire(self.exporter_slot).await?;
        session.ensure_transaction().await?;
        match export_snapshot(&mut session).await {
            Ok(handle) => {
                info!("Exported synchronized snapshot {}", handle);
                Ok(handle)
            }
            Err(e) => {
                session.rollback_quietly().await;
                Err(e)
            }
        }
    }

    /// Slots that import, in slot order.
    pub fn importer_slots(&self, pool: &ConnectionPool) -> Vec<usize> {
        (0..pool.size()).filter(|&s| s != self.exporter_slot).collect()
    }

    /// Begin a transaction on every other slot and import `handle` into it.
    ///
    /// Any failure rolls back every importing session; the import is not
    /// retried.
    pub async fn import_all(&self, pool: &ConnectionPool, handle: &SnapshotHandle) -> Result<()> {
        let slots = self.importer_slots(pool);
        let results = join_all(slots.iter().map(|&slot| async move {
            let mut session = pool.acquire(slot).await?;
            session.begin().await?;
            import_snapshot(&mut session, handle).await
        }))
        .await;

        if let Some(err) = results.into_iter().find_map(|r| r.err()) {
            warn!("Snapshot import failed; rolling back {} session(s)", slots.len());
            super::lock::rollback_slots(pool, &slots).await;
            return Err(err);
        }
        info!("Snapshot {} imported on {} session(s)", handle, slots.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_format() {
        assert!(SnapshotHandle::parse("000003A1-1").is_ok());
        assert!(SnapshotHandle::parse("00000003-0000001B-1").is_ok());
        assert_eq!(
            "0000002A-12".parse::<SnapshotHandle>().unwrap().as_str(),
            "0000002A-12"
        );
        assert!(SnapshotHandle::parse("").is_err());
        assert!(SnapshotHandle::parse("abc").is_err());
        assert!(SnapshotHandle::parse("0000002A-1'; DROP TABLE x").is_err());
    }
}
