use crate::cluster::FilePathInfo;
use crate::connection::config::ConnectionConfig;
use crate::core::{Operation, RunFingerprint};
use crate::executor::ErrorPolicy;

/// Run-scoped values handed to every component call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub operation: Operation,
    pub fingerprint: RunFingerprint,
    /// `application_name` carried by every session of this run.
    pub application_tag: String,
    /// Slot that exports the snapshot and issues control statements.
    pub control_slot: usize,
    pub error_policy: ErrorPolicy,
}

impl ExecutionContext {
    pub fn new(operation: Operation, fingerprint: RunFingerprint) -> Self {
        let application_tag = format!("clustersnap_{}_{}", operation, fingerprint);
        Self {
            operation,
            fingerprint,
            application_tag,
            control_slot: 0,
            error_policy: ErrorPolicy::Stop,
        }
    }

    /// Context for the current process and local time.
    pub fn current(operation: Operation) -> Self {
        Self::new(operation, RunFingerprint::current())
    }

    pub fn with_application_tag(mut self, tag: &str) -> Self {
        self.application_tag = tag.to_string();
        self
    }

    pub fn with_control_slot(mut self, slot: usize) -> Self {
        self.control_slot = slot;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Stamp the run's application tag onto a connection configuration.
    pub fn connection_config(&self, base: ConnectionConfig) -> ConnectionConfig {
        base.application_name(&self.application_tag)
    }

    pub fn file_paths(&self) -> FilePathInfo {
        let prefix = match self.operation {
            Operation::Backup => "gpbackup",
            Operation::Restore => "gprestore",
        };
        FilePathInfo::new(self.fingerprint.clone()).with_prefix(prefix)
    }
}
