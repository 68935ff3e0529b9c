use crate::connection::pool::ConnectionPool;
use crate::connection::Session;
use crate::core::{CoordError, Result, TableRef};
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::HashSet;

pub const DEFAULT_LOCK_BATCH_SIZE: usize = 100;

/// Takes ACCESS SHARE locks on a table set across pool sessions.
///
/// Tables are de-duplicated by oid and locked in input order, in batches of
/// `batch_size` per `LOCK TABLE` statement. Every session sees the same
/// statement sequence.
#[derive(Debug, Clone, Copy)]
pub struct TableLocker {
    batch_size: usize,
}

impl Default for TableLocker {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_LOCK_BATCH_SIZE,
        }
    }
}

impl TableLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// De-duplicated tables split into statement-sized batches.
    pub fn batches<'a>(&self, tables: &'a [TableRef]) -> Vec<Vec<&'a TableRef>> {
        let mut seen = HashSet::new();
        let unique: Vec<&TableRef> = tables.iter().filter(|t| seen.insert(t.oid)).collect();
        unique.chunks(self.batch_size).map(|c| c.to_vec()).collect()
    }

    pub fn lock_statement(batch: &[&TableRef]) -> String {
        format!("LOCK TABLE {} IN ACCESS SHARE MODE", fqn_list(batch))
    }

    /// Lock every table on every session of the pool.
    pub async fn lock_tables(&self, pool: &ConnectionPool, tables: &[TableRef]) -> Result<usize> {
        let slots: Vec<usize> = (0..pool.size()).collect();
        self.lock_slots(pool, &slots, tables).await
    }

    /// Lock every table on each of `slots`, concurrently across slots.
    ///
    /// Each session begins a transaction if it has none and keeps it open.
    /// On any failure every participating session is rolled back before the
    /// first error (in slot order) is returned. Returns the number of
    /// distinct tables locked per session.
    pub async fn lock_slots(
        &self,
        pool: &ConnectionPool,
        slots: &[usize],
        tables: &[TableRef],
    ) -> Result<usize> {
        let batches = self.batches(tables);
        let total: usize = batches.iter().map(Vec::len).sum();
        if total == 0 {
            return Ok(0);
        }
        info!(
            "Acquiring ACCESS SHARE locks on {} table(s) across {} session(s)",
            total,
            slots.len()
        );

        let results = join_all(slots.iter().map(|&slot| {
            let batches = &batches;
            async move {
                let mut session = pool.acquire(slot).await?;
                self.lock_session(&mut session, batches, total).await
            }
        }))
        .await;

        let first_error = results.into_iter().find_map(|r| r.err());
        if let Some(err) = first_error {
            warn!("Lock acquisition failed; rolling back {} session(s)", slots.len());
            rollback_slots(pool, slots).await;
            return Err(err);
        }
        Ok(total)
    }

    async fn lock_session(
        &self,
        session: &mut Session,
        batches: &[Vec<&TableRef>],
        total: usize,
    ) -> Result<()> {
        let slot = session.slot();
        session.ensure_transaction().await?;

        let mut acquired = 0;
        for batch in batches {
            let statement = Self::lock_statement(batch);
            if let Err(e) = session.execute(&statement).await {
                return Err(CoordError::LockFailed {
                    slot,
                    tables: fqn_list(batch),
                    reason: e.to_string(),
                });
            }
            acquired += batch.len();
            debug!("Slot {}: locks acquired: {}/{}", slot, acquired, total);
        }
        Ok(())
    }

    /// Try to take an ACCESS SHARE lock without waiting.
    ///
    /// `Ok(false)` means another session holds a conflicting lock. A refused
    /// attempt aborts the session's transaction, so it is rolled back here and
    /// the caller must start a new one.
    pub async fn try_lock_nowait(session: &mut Session, table: &TableRef) -> Result<bool> {
        session.ensure_transaction().await?;
        let statement = format!("LOCK TABLE {} IN ACCESS SHARE MODE NOWAIT", table.fqn());
        debug!("Slot {}: {}", session.slot(), statement);
        match session.execute(&statement).await {
            Ok(_) => Ok(true),
            Err(e) if e.to_string().contains("could not obtain lock") => {
                session.rollback_quietly().await;
                Ok(false)
            }
            Err(e) => {
                session.rollback_quietly().await;
                Err(e)
            }
        }
    }
}

fn fqn_list(batch: &[&TableRef]) -> String {
    batch.iter().map(|t| t.fqn()).collect::<Vec<_>>().join(", ")
}

pub(crate) async fn rollback_slots(pool: &ConnectionPool, slots: &[usize]) {
    join_all(slots.iter().map(|&slot| async move {
        match pool.acquire(slot).await {
            Ok(mut session) => session.rollback_quietly().await,
            Err(e) => warn!("Slot {}: unable to roll back: {}", slot, e),
        }
    }))
    .await;
}
