// ============================================================================
// Transaction bookkeeping for the in-memory engine
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub type Xid = u64;

/// Transaction id owning rows loaded at cluster creation. Always committed.
pub const BOOTSTRAP_XID: Xid = 1;

/// Repeatable-read view of the database.
///
/// `tx_id` is the reader's own transaction; everything else describes which
/// other transactions had committed when the view was taken.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tx_id: Xid,
    pub active: Arc<HashSet<Xid>>,
    pub aborted: Arc<HashSet<Xid>>,
    pub max_tx_id: Xid,
}

impl Snapshot {
    pub fn is_committed(&self, xid: Xid) -> bool {
        if xid >= self.max_tx_id {
            return false;
        }
        if self.active.contains(&xid) {
            return false;
        }
        !self.aborted.contains(&xid)
    }

    /// The same view, read by another transaction.
    pub fn for_transaction(&self, tx_id: Xid) -> Self {
        Self {
            tx_id,
            ..self.clone()
        }
    }
}

struct ExportedSnapshot {
    owner: Xid,
    snapshot: Snapshot,
}

pub struct TransactionManager {
    next_xid: Xid,
    active: HashSet<Xid>,
    aborted: HashSet<Xid>,
    exported: HashMap<String, ExportedSnapshot>,
    export_seq: HashMap<Xid, u32>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_xid: BOOTSTRAP_XID + 1,
            active: HashSet::new(),
            aborted: HashSet::new(),
            exported: HashMap::new(),
            export_seq: HashMap::new(),
        }
    }

    pub fn begin(&mut self) -> Xid {
        let xid = self.next_xid;
        self.next_xid += 1;
        self.active.insert(xid);
        xid
    }

    /// Take a snapshot for `xid`. Transactions still running are invisible.
    pub fn snapshot(&self, xid: Xid) -> Snapshot {
        Snapshot {
            tx_id: xid,
            active: Arc::new(self.active.clone()),
            aborted: Arc::new(self.aborted.clone()),
            max_tx_id: self.next_xid,
        }
    }

    pub fn is_active(&self, xid: Xid) -> bool {
        self.active.contains(&xid)
    }

    pub fn is_aborted(&self, xid: Xid) -> bool {
        self.aborted.contains(&xid)
    }

    pub fn commit(&mut self, xid: Xid) {
        self.active.remove(&xid);
        self.drop_exports(xid);
    }

    pub fn abort(&mut self, xid: Xid) {
        if self.active.remove(&xid) {
            self.aborted.insert(xid);
        }
        self.drop_exports(xid);
    }

    /// Publish a snapshot under a fresh identifier. The identifier stays valid
    /// until the owning transaction ends.
    pub fn export(&mut self, snapshot: &Snapshot) -> String {
        let owner = snapshot.tx_id;
        let seq = self.export_seq.entry(owner).or_insert(0);
        *seq += 1;
        let id = format!("{:08X}-{}", owner, seq);
        self.exported.insert(
            id.clone(),
            ExportedSnapshot {
                owner,
                snapshot: snapshot.clone(),
            },
        );
        id
    }

    pub fn lookup_export(&self, id: &str) -> Option<&Snapshot> {
        self.exported.get(id).map(|e| &e.snapshot)
    }

    fn drop_exports(&mut self, owner: Xid) {
        self.exported.retain(|_, e| e.owner != owner);
        self.export_seq.remove(&owner);
    }
}
