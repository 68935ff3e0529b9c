use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// How loudly statement completion is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressMode {
    #[default]
    None,
    Info,
    Verbose,
}

/// Counts completion events and logs them according to the mode.
#[derive(Debug)]
pub struct ProgressReporter {
    title: String,
    total: usize,
    done: AtomicUsize,
    mode: ProgressMode,
}

impl ProgressReporter {
    pub fn new(title: impl Into<String>, total: usize, mode: ProgressMode) -> Self {
        Self {
            title: title.into(),
            total,
            done: AtomicUsize::new(0),
            mode,
        }
    }

    pub fn increment(&self) -> usize {
        self.add(1)
    }

    pub fn add(&self, n: usize) -> usize {
        let done = self.done.fetch_add(n, Ordering::SeqCst) + n;
        match self.mode {
            ProgressMode::None => {}
            ProgressMode::Info => {
                // Info mode reports roughly every tenth of the work.
                let step = (self.total / 10).max(1);
                if done % step == 0 || done == self.total {
                    info!("{}{}/{}", self.title, done, self.total);
                }
            }
            ProgressMode::Verbose => debug!("{}{}/{}", self.title, done, self.total),
        }
        done
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }

    pub fn finish(&self) {
        if self.mode != ProgressMode::None {
            info!("{}{}/{} (finished)", self.title, self.done(), self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_events() {
        let progress = ProgressReporter::new("Objects restored: ", 3, ProgressMode::Info);
        assert_eq!(progress.increment(), 1);
        assert_eq!(progress.add(2), 3);
        assert_eq!(progress.done(), 3);
        progress.finish();
    }
}
