use super::command::LockMode;
use std::collections::HashMap;

/// Relation-level lock table keyed by relation name.
#[derive(Debug, Default)]
pub struct LockManager {
    held: HashMap<String, Vec<(i32, LockMode)>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant the lock unless another backend holds a conflicting one.
    /// Returns the pid of a conflicting holder on failure.
    pub fn try_acquire(&mut self, pid: i32, relation: &str, mode: LockMode) -> Result<(), i32> {
        let holders = self.held.entry(relation.to_string()).or_default();
        if let Some((other, _)) = holders
            .iter()
            .find(|(holder, held)| *holder != pid && held.conflicts_with(mode))
        {
            return Err(*other);
        }
        if !holders.iter().any(|(holder, held)| *holder == pid && *held == mode) {
            holders.push((pid, mode));
        }
        Ok(())
    }

    pub fn release_all(&mut self, pid: i32) {
        for holders in self.held.values_mut() {
            holders.retain(|(holder, _)| *holder != pid);
        }
        self.held.retain(|_, holders| !holders.is_empty());
    }

    pub fn holds(&self, pid: i32, relation: &str) -> Option<LockMode> {
        self.held.get(relation).and_then(|holders| {
            holders
                .iter()
                .filter(|(holder, _)| *holder == pid)
                .map(|(_, mode)| *mode)
                .max_by_key(|mode| matches!(mode, LockMode::AccessExclusive))
        })
    }

    pub fn lock_count(&self, pid: i32) -> usize {
        self.held
            .values()
            .map(|holders| holders.iter().filter(|(holder, _)| *holder == pid).count())
            .sum()
    }
}
