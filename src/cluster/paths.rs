use super::SegmentNode;
use crate::core::RunFingerprint;
use std::fmt;
use std::path::PathBuf;

/// Placeholder for a segment's data directory, expanded per node.
pub const SEG_DATA_DIR: &str = "<SEG_DATA_DIR>";
/// Placeholder for a segment's content id, expanded per node.
pub const SEGID: &str = "<SEGID>";

pub const DEFAULT_FILE_PREFIX: &str = "gpbackup";

/// A path containing `<SEG_DATA_DIR>` and `<SEGID>` placeholders.
///
/// The unexpanded form is what appears in COPY commands sent through the
/// coordinator; each segment expands it for itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate(String);

impl PathTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn render(&self, node: &SegmentNode) -> PathBuf {
        PathBuf::from(
            self.0
                .replace(SEG_DATA_DIR, &node.data_dir.to_string_lossy())
                .replace(SEGID, &node.content_id.to_string()),
        )
    }

    /// The same template with `suffix` appended to the file name.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self(format!("{}{}", self.0, suffix))
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Names the per-run helper files and pipes on every segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePathInfo {
    prefix: String,
    fingerprint: RunFingerprint,
}

impl FilePathInfo {
    pub fn new(fingerprint: RunFingerprint) -> Self {
        Self {
            prefix: DEFAULT_FILE_PREFIX.to_string(),
            fingerprint,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn fingerprint(&self) -> &RunFingerprint {
        &self.fingerprint
    }

    /// `<SEG_DATA_DIR>/<prefix>_<SEGID>_<timestamp>_<suffix>_<pid>`
    pub fn helper_file_template(&self, suffix: &str) -> PathTemplate {
        PathTemplate(format!(
            "{}/{}_{}_{}_{}_{}",
            SEG_DATA_DIR, self.prefix, SEGID, self.fingerprint.timestamp, suffix, self.fingerprint.pid
        ))
    }

    pub fn oid_file_template(&self) -> PathTemplate {
        self.helper_file_template("oid")
    }

    pub fn script_file_template(&self) -> PathTemplate {
        self.helper_file_template("script")
    }

    /// Pipe path as written into COPY commands; also what the activity view
    /// shows for a transfer session of this run.
    pub fn pipe_path_for_copy_command(&self) -> String {
        self.pipe_template().0
    }

    pub fn pipe_template(&self) -> PathTemplate {
        self.helper_file_template("pipe")
    }

    /// Agents report failures by leaving this file next to the pipe.
    pub fn error_file_template(&self) -> PathTemplate {
        self.pipe_template().with_suffix("_error")
    }
}
