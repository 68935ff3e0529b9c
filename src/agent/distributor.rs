use crate::cluster::{
    shell_quote, Cluster, FilePathInfo, NodeOutput, PathTemplate, RemoteExecutor, RemoteOutput,
    SegmentNode,
};
use crate::core::{CoordError, NodeFailure, OidManifest, Operation, Result};
use futures::future::join_all;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

/// Executable name of the segment agent.
pub const HELPER_NAME: &str = "gpbackup_helper";

/// Pushes oid manifests to segment hosts and cleans up after the agents.
#[derive(Clone)]
pub struct AgentDistributor {
    executor: Arc<dyn RemoteExecutor>,
}

impl AgentDistributor {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    /// Write `manifest` to a local staging file and copy it to the path
    /// `template` renders for every segment, concurrently.
    ///
    /// Every node is attempted; the call fails if any node failed, naming
    /// each failed node.
    pub async fn distribute(
        &self,
        manifest: &OidManifest,
        cluster: &Cluster,
        template: &PathTemplate,
    ) -> Result<RemoteOutput> {
        let staging = tempfile::NamedTempFile::new()?;
        tokio::fs::write(staging.path(), manifest.render()).await?;
        info!(
            "Writing {} oid(s) to {} segment(s)",
            manifest.len(),
            cluster.segments().len()
        );

        let local = staging.path();
        let outputs = join_all(cluster.segments().iter().map(|node| async move {
            let remote = template.render(node);
            let command = format!("copy {} to {}:{}", local.display(), node.hostname, remote.display());
            debug!("Segment {}: {}", node.content_id, command);
            let result = self.executor.copy_to(local, &node.hostname, &remote).await;
            NodeOutput::new(node, command, result)
        }))
        .await;

        let output = RemoteOutput::new(outputs);
        output.check("Unable to write oid list to segments")?;
        Ok(output)
    }

    /// Remove the per-node file `template` renders for every segment.
    pub async fn remove_all(&self, cluster: &Cluster, template: &PathTemplate) -> Result<RemoteOutput> {
        let output = cluster
            .execute_per_segment(self.executor.as_ref(), "Removing oid list from segments", |node| {
                format!("rm -f {}", shell_quote(&template.render(node)))
            })
            .await;
        output.check("Unable to remove oid list from segments")?;
        Ok(output)
    }

    /// Best-effort removal of the agent's error, oid and script files.
    ///
    /// Failures are logged and returned in the output, never raised.
    pub async fn remove_helper_files(&self, cluster: &Cluster, paths: &FilePathInfo) -> RemoteOutput {
        let error_file = paths.error_file_template();
        let oid_file = paths.oid_file_template();
        let script_file = paths.script_file_template();
        let output = cluster
            .execute_per_segment(self.executor.as_ref(), "Cleaning up segment agent files", |node| {
                format!(
                    "rm -f {} && rm -f {} && rm -f {}",
                    shell_quote(&error_file.render(node)),
                    shell_quote(&oid_file.render(node)),
                    shell_quote(&script_file.render(node))
                )
            })
            .await;
        for failure in output.failures() {
            warn!(
                "Unable to clean up agent files on segment {} ({}): {}",
                failure.content_id, failure.host, failure.reason
            );
        }
        output
    }

    /// Kill the run's leftover agent processes on every segment.
    ///
    /// An agent is recognized by its mode flag and by the oid file this run
    /// handed it, so agents of other runs are left alone. Agents that already
    /// exited are not an error.
    pub async fn kill_helper_processes(
        &self,
        cluster: &Cluster,
        paths: &FilePathInfo,
        operation: Operation,
    ) -> Result<RemoteOutput> {
        let mode = shell_quote(format!("{} --{}-agent", HELPER_NAME, operation));
        let oid_file = paths.oid_file_template();
        let output = cluster
            .execute_per_segment(self.executor.as_ref(), "Cleaning up segment agent processes", |node| {
                let oid_arg = shell_quote(format!("--oid-file {}", oid_file.render(node).display()));
                format!(
                    "PIDS=$(ps uxww | grep -F -- {} | grep -F -- {} | grep -v grep | awk '{{print $2}}'); \
                     if [[ -n \"$PIDS\" ]]; then kill $PIDS; fi",
                    mode, oid_arg
                )
            })
            .await;
        output.check("Unable to clean up agent processes")?;
        Ok(output)
    }

    /// Fail if any agent left an error file next to its pipe. The error
    /// files are removed either way.
    pub async fn check_agent_errors(&self, cluster: &Cluster, paths: &FilePathInfo) -> Result<()> {
        let error_file = paths.error_file_template();
        let output = cluster
            .execute_per_segment(self.executor.as_ref(), "Checking for segment agent errors", |node| {
                let file = shell_quote(&error_file.render(node));
                format!("if [[ -f {0} ]]; then echo 'error'; fi; rm -f {0}", file)
            })
            .await;
        output.check("Unable to check for agent errors on segments")?;

        let failures: Vec<NodeFailure> = output
            .iter()
            .filter(|node| node.stdout().trim() == "error")
            .map(|node| NodeFailure {
                content_id: node.content_id,
                host: node.host.clone(),
                reason: "agent reported an error".to_string(),
            })
            .collect();
        if failures.is_empty() {
            return Ok(());
        }
        Err(CoordError::Distribution {
            message: "Error(s) occurred in segment agents".to_string(),
            failures,
        })
    }

    /// Compare `<helper> --version` on every segment host with `expected`.
    pub async fn verify_helper_version(
        &self,
        cluster: &Cluster,
        helper: &Path,
        expected: &str,
    ) -> Result<()> {
        let output = cluster
            .execute_per_host(self.executor.as_ref(), "Verifying agent versions", |_: &SegmentNode| {
                format!("{} --version", shell_quote(helper))
            })
            .await;
        output.check("Unable to query agent version on hosts")?;

        // Output is "<name> <version>".
        let failures: Vec<NodeFailure> = output
            .iter()
            .filter_map(|node| {
                let version = node.stdout().split_whitespace().nth(1).unwrap_or("");
                (version != expected).then(|| NodeFailure {
                    content_id: node.content_id,
                    host: node.host.clone(),
                    reason: format!("version {:?} does not match {:?}", version, expected),
                })
            })
            .collect();
        if failures.is_empty() {
            info!("Agent version {} verified on all hosts", expected);
            return Ok(());
        }
        Err(CoordError::Distribution {
            message: "Agent version mismatch".to_string(),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalExecutor;
    use crate::core::RunFingerprint;
    use std::time::Duration;
    use tempfile::TempDir;

    fn local_cluster(dirs: &[&TempDir]) -> Cluster {
        Cluster::new(
            SegmentNode::new(-1, "localhost", "/unused"),
            dirs.iter()
                .enumerate()
                .map(|(i, d)| SegmentNode::new(i as i32, "localhost", d.path()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_remove_all() {
        let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap()];
        let cluster = local_cluster(&[&dirs[0], &dirs[1]]);
        let paths = FilePathInfo::new(RunFingerprint::new(5, "20240101000000"));
        let template = paths.oid_file_template();
        let distributor = AgentDistributor::new(Arc::new(LocalExecutor));

        distributor
            .distribute(&OidManifest::new([1, 2]), &cluster, &template)
            .await
            .unwrap();
        for node in cluster.segments() {
            assert!(template.render(node).exists());
        }

        distributor.remove_all(&cluster, &template).await.unwrap();
        for node in cluster.segments() {
            assert!(!template.render(node).exists());
        }
    }

    #[tokio::test]
    async fn test_check_agent_errors_names_nodes_and_cleans_up() {
        let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap()];
        let cluster = local_cluster(&[&dirs[0], &dirs[1]]);
        let paths = FilePathInfo::new(RunFingerprint::new(5, "20240101000000"));
        let distributor = AgentDistributor::new(Arc::new(LocalExecutor));

        distributor.check_agent_errors(&cluster, &paths).await.unwrap();

        let error_file = paths.error_file_template().render(&cluster.segments()[1]);
        std::fs::write(&error_file, "").unwrap();
        match distributor.check_agent_errors(&cluster, &paths).await {
            Err(CoordError::Distribution { failures, .. }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].content_id, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!error_file.exists());
        distributor.check_agent_errors(&cluster, &paths).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_helper_files_is_best_effort() {
        let dir = TempDir::new().unwrap();
        let cluster = local_cluster(&[&dir]);
        let paths = FilePathInfo::new(RunFingerprint::new(9, "20240101000000"));
        let oid_file = paths.oid_file_template().render(&cluster.segments()[0]);
        std::fs::write(&oid_file, "1\n").unwrap();

        let output = AgentDistributor::new(Arc::new(LocalExecutor))
            .remove_helper_files(&cluster, &paths)
            .await;
        assert_eq!(output.num_errors(), 0);
        assert!(!oid_file.exists());
    }

    #[tokio::test]
    async fn test_kill_helper_processes_only_touches_this_run() {
        let dir = TempDir::new().unwrap();
        let cluster = local_cluster(&[&dir]);
        let ours = FilePathInfo::new(RunFingerprint::new(31, "20240101000000")).with_prefix("gprestore");
        let theirs = FilePathInfo::new(RunFingerprint::new(32, "20240101000000")).with_prefix("gprestore");
        let helper = dir.path().join(HELPER_NAME);
        std::fs::write(&helper, "sleep 30\n").unwrap();

        let spawn_agent = |paths: &FilePathInfo| {
            tokio::process::Command::new("bash")
                .arg(&helper)
                .args(["--restore-agent", "--toc-file", "toc", "--oid-file"])
                .arg(paths.oid_file_template().render(&cluster.segments()[0]))
                .kill_on_drop(true)
                .spawn()
                .unwrap()
        };
        let mut our_agent = spawn_agent(&ours);
        let mut their_agent = spawn_agent(&theirs);

        let distributor = AgentDistributor::new(Arc::new(LocalExecutor));
        let output = distributor
            .kill_helper_processes(&cluster, &ours, Operation::Restore)
            .await
            .unwrap();
        assert_eq!(output.num_errors(), 0);

        let status = tokio::time::timeout(Duration::from_secs(5), our_agent.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(their_agent.try_wait().unwrap().is_none());

        // Nothing left to kill is still success.
        distributor
            .kill_helper_processes(&cluster, &ours, Operation::Restore)
            .await
            .unwrap();
        assert!(their_agent.try_wait().unwrap().is_none());
        their_agent.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_helper_version() {
        let dir = TempDir::new().unwrap();
        let helper = dir.path().join("gpbackup_helper");
        std::fs::write(&helper, "#!/bin/bash\necho \"gpbackup_helper 1.30.0\"\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let cluster = local_cluster(&[&dir]);
        let distributor = AgentDistributor::new(Arc::new(LocalExecutor));

        distributor
            .verify_helper_version(&cluster, &helper, "1.30.0")
            .await
            .unwrap();
        let err = distributor
            .verify_helper_version(&cluster, &helper, "1.31.0")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Agent version mismatch"));
    }
}
