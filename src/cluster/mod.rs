// ============================================================================
// Cluster topology and remote command execution
// ============================================================================

pub mod paths;

use crate::connection::Session;
use crate::core::{CoordError, NodeFailure, Result};
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub use paths::{FilePathInfo, PathTemplate};

pub const COORDINATOR_CONTENT_ID: i32 = -1;

const PRIMARY_SEGMENTS_QUERY: &str =
    "SELECT content, hostname, datadir FROM gp_segment_configuration WHERE role = 'p' ORDER BY content";

/// One primary instance of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentNode {
    pub content_id: i32,
    pub hostname: String,
    pub data_dir: PathBuf,
}

impl SegmentNode {
    pub fn new(content_id: i32, hostname: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            content_id,
            hostname: hostname.into(),
            data_dir: data_dir.into(),
        }
    }
}

/// Coordinator plus primary segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub coordinator: SegmentNode,
    pub segments: Vec<SegmentNode>,
}

impl Cluster {
    pub fn new(coordinator: SegmentNode, mut segments: Vec<SegmentNode>) -> Self {
        segments.sort_by_key(|s| s.content_id);
        Self {
            coordinator,
            segments,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let cluster: Cluster = serde_json::from_str(json)?;
        Ok(Self::new(cluster.coordinator, cluster.segments))
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read the primary instances from the cluster catalog.
    pub async fn discover(session: &mut Session) -> Result<Self> {
        let result = session.execute(PRIMARY_SEGMENTS_QUERY).await?;

        let mut coordinator = None;
        let mut segments = Vec::new();
        for row in &result.rows {
            let field = |idx: usize| {
                row.get(idx).cloned().flatten().ok_or_else(|| {
                    CoordError::ParseError("NULL value in gp_segment_configuration".into())
                })
            };
            let content_id: i32 = field(0)?
                .parse()
                .map_err(|_| CoordError::ParseError("invalid content id".into()))?;
            let node = SegmentNode::new(content_id, field(1)?, field(2)?);
            if content_id == COORDINATOR_CONTENT_ID {
                coordinator = Some(node);
            } else {
                segments.push(node);
            }
        }

        let coordinator = coordinator.ok_or_else(|| {
            CoordError::ExecutionError("coordinator not found in gp_segment_configuration".into())
        })?;
        info!("Discovered {} primary segment(s)", segments.len());
        Ok(Self::new(coordinator, segments))
    }

    pub fn segments(&self) -> &[SegmentNode] {
        &self.segments
    }

    pub fn segment(&self, content_id: i32) -> Option<&SegmentNode> {
        self.segments.iter().find(|s| s.content_id == content_id)
    }

    pub fn host_for_content(&self, content_id: i32) -> Option<&str> {
        if content_id == COORDINATOR_CONTENT_ID {
            return Some(&self.coordinator.hostname);
        }
        self.segment(content_id).map(|s| s.hostname.as_str())
    }

    /// Distinct segment hosts, each represented by its lowest content id.
    pub fn hosts(&self) -> Vec<&SegmentNode> {
        let mut seen = BTreeMap::new();
        for segment in &self.segments {
            seen.entry(segment.hostname.as_str()).or_insert(segment);
        }
        let mut hosts: Vec<_> = seen.into_values().collect();
        hosts.sort_by_key(|s| s.content_id);
        hosts
    }

    /// Run one generated command on every segment concurrently.
    pub async fn execute_per_segment<F>(
        &self,
        executor: &dyn RemoteExecutor,
        description: &str,
        command_for: F,
    ) -> RemoteOutput
    where
        F: Fn(&SegmentNode) -> String,
    {
        run_on(executor, description, self.segments.iter().collect(), command_for).await
    }

    /// Run one generated command once per segment host.
    pub async fn execute_per_host<F>(
        &self,
        executor: &dyn RemoteExecutor,
        description: &str,
        command_for: F,
    ) -> RemoteOutput
    where
        F: Fn(&SegmentNode) -> String,
    {
        run_on(executor, description, self.hosts(), command_for).await
    }
}

async fn run_on<F>(
    executor: &dyn RemoteExecutor,
    description: &str,
    nodes: Vec<&SegmentNode>,
    command_for: F,
) -> RemoteOutput
where
    F: Fn(&SegmentNode) -> String,
{
    info!("{}", description);
    let outputs = join_all(nodes.into_iter().map(|node| {
        let command = command_for(node);
        async move {
            debug!("Segment {} on {}: {}", node.content_id, node.hostname, command);
            let result = executor.execute(&node.hostname, &command).await;
            NodeOutput::new(node, command, result)
        }
    }))
    .await;
    RemoteOutput::new(outputs)
}

/// Exit status and captured streams of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    fn from_process(output: std::process::Output) -> Self {
        Self {
            // Killed by a signal: no exit code.
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// What happened on one node.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub content_id: i32,
    pub host: String,
    pub command: String,
    pub output: std::result::Result<CommandOutput, String>,
}

impl NodeOutput {
    pub fn new(node: &SegmentNode, command: String, result: Result<CommandOutput>) -> Self {
        Self {
            content_id: node.content_id,
            host: node.hostname.clone(),
            command,
            output: result.map_err(|e| e.to_string()),
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(&self.output, Ok(out) if out.success())
    }

    pub fn failure_reason(&self) -> Option<String> {
        match &self.output {
            Ok(out) if out.success() => None,
            Ok(out) => {
                let stderr = out.stderr.trim();
                Some(if stderr.is_empty() {
                    format!("exit status {}", out.status)
                } else {
                    format!("exit status {}: {}", out.status, stderr)
                })
            }
            Err(e) => Some(e.clone()),
        }
    }

    pub fn stdout(&self) -> &str {
        self.output.as_ref().map(|o| o.stdout.as_str()).unwrap_or("")
    }
}

/// Per-node results of a cluster-wide command, keyed by content id.
#[derive(Debug, Clone, Default)]
pub struct RemoteOutput {
    outputs: BTreeMap<i32, NodeOutput>,
}

impl RemoteOutput {
    pub fn new(outputs: impl IntoIterator<Item = NodeOutput>) -> Self {
        Self {
            outputs: outputs.into_iter().map(|o| (o.content_id, o)).collect(),
        }
    }

    pub fn get(&self, content_id: i32) -> Option<&NodeOutput> {
        self.outputs.get(&content_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeOutput> {
        self.outputs.values()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn num_errors(&self) -> usize {
        self.outputs.values().filter(|o| !o.succeeded()).count()
    }

    pub fn failures(&self) -> Vec<NodeFailure> {
        self.outputs
            .values()
            .filter_map(|o| {
                o.failure_reason().map(|reason| NodeFailure {
                    content_id: o.content_id,
                    host: o.host.clone(),
                    reason,
                })
            })
            .collect()
    }

    /// `Distribution` error naming every failed node, or `Ok`.
    pub fn check(&self, message: &str) -> Result<()> {
        let failures = self.failures();
        if failures.is_empty() {
            return Ok(());
        }
        for failure in &failures {
            warn!(
                "{}: segment {} on host {}: {}",
                message, failure.content_id, failure.host, failure.reason
            );
        }
        Err(CoordError::Distribution {
            message: message.to_string(),
            failures,
        })
    }
}

/// Single-quote a path or fixed string for a remote shell.
pub(crate) fn shell_quote(value: impl AsRef<Path>) -> String {
    format!("'{}'", value.as_ref().display().to_string().replace('\'', r"'\''"))
}

/// `scp` target for `remote` on `host`. The remote side parses the path with a shell.
fn scp_destination(host: &str, remote: &Path) -> String {
    format!("{}:{}", host, shell_quote(remote))
}

/// Runs shell commands and copies files on cluster hosts.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput>;

    async fn copy_to(&self, local: &Path, host: &str, remote: &Path) -> Result<CommandOutput>;
}

/// Reaches hosts with `ssh` and `scp`.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    options: Vec<String>,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            options: vec!["-o".into(), "BatchMode=yes".into()],
        }
    }
}

impl SshExecutor {
    pub fn new(options: Vec<String>) -> Self {
        Self { options }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput> {
        let output = Command::new("ssh")
            .args(&self.options)
            .arg(host)
            .arg(command)
            .output()
            .await
            .map_err(|e| CoordError::RemoteError(format!("failed to run ssh to {}: {}", host, e)))?;
        Ok(CommandOutput::from_process(output))
    }

    async fn copy_to(&self, local: &Path, host: &str, remote: &Path) -> Result<CommandOutput> {
        let output = Command::new("scp")
            .args(&self.options)
            .arg(local)
            .arg(scp_destination(host, remote))
            .output()
            .await
            .map_err(|e| CoordError::RemoteError(format!("failed to run scp to {}: {}", host, e)))?;
        Ok(CommandOutput::from_process(output))
    }
}

/// Runs everything on the local machine regardless of host name.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn execute(&self, _host: &str, command: &str) -> Result<CommandOutput> {
        let output = Command::new("bash")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| CoordError::RemoteError(format!("failed to run bash: {}", e)))?;
        Ok(CommandOutput::from_process(output))
    }

    async fn copy_to(&self, local: &Path, _host: &str, remote: &Path) -> Result<CommandOutput> {
        let output = Command::new("cp")
            .arg(local)
            .arg(remote)
            .output()
            .await
            .map_err(|e| CoordError::RemoteError(format!("failed to run cp: {}", e)))?;
        Ok(CommandOutput::from_process(output))
    }
}
