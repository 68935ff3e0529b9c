use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use clustersnap::agent::{AgentDistributor, HangingSessionReaper};
use clustersnap::cluster::{Cluster, FilePathInfo, SshExecutor};
use clustersnap::connection::postgres::PgConnector;
use clustersnap::core::{OidManifest, RunFingerprint};
use clustersnap::executor::{ErrorPolicy, ProgressMode};
use clustersnap::{
    ConnectionConfig, Coordinator, ExecutionContext, ExecutionMode, ObjectFilter, Operation,
    ParallelExecutor, StatementWithType,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "clustersnap")]
#[command(about = "Backup and restore coordination for sharded database clusters")]
struct Cli {
    /// Connection URL, e.g. postgres://gpadmin@mdw:5432/sales
    #[arg(long, global = true, default_value = "postgres://gpadmin@localhost:5432/postgres")]
    url: String,

    /// Application name for every session (defaults to one derived from the run)
    #[arg(long, global = true)]
    application_name: Option<String>,

    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum OperationArg {
    Backup,
    Restore,
}

impl From<OperationArg> for Operation {
    fn from(value: OperationArg) -> Self {
        match value {
            OperationArg::Backup => Operation::Backup,
            OperationArg::Restore => Operation::Restore,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Fail if a cluster expansion is in progress
    Preflight {
        #[arg(long, value_enum, default_value = "backup")]
        operation: OperationArg,
    },
    /// Run a JSON list of {object_type, statement} objects
    RestoreStatements {
        #[arg(long)]
        file: PathBuf,
        /// Sessions to run on; 1 runs serially
        #[arg(long, default_value_t = 1)]
        jobs: usize,
        #[arg(long)]
        on_error_continue: bool,
        #[arg(long = "include-type")]
        include: Vec<String>,
        #[arg(long = "exclude-type")]
        exclude: Vec<String>,
    },
    /// Copy an oid list to every segment
    DistributeOids {
        /// Manifest with one oid per line
        #[arg(long)]
        oid_file: PathBuf,
        /// Cluster layout as JSON; discovered from the catalog when absent
        #[arg(long)]
        cluster: Option<PathBuf>,
        #[arg(long)]
        timestamp: String,
        #[arg(long)]
        pid: u32,
    },
    /// Terminate hanging transfer sessions of a run
    Reap {
        #[arg(long)]
        timestamp: String,
        #[arg(long)]
        pid: u32,
        #[arg(long, value_enum, default_value = "backup")]
        operation: OperationArg,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let level = if cli.verbose { "debug" } else { "info" };
    let env_filter = match level.parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();

    let config = ConnectionConfig::from_url(&cli.url).map_err(|e| anyhow!(e))?;
    let application_name = cli.application_name.as_deref();

    match cli.command {
        Command::Preflight { operation } => {
            let ctx = context(operation.into(), RunFingerprint::current(), application_name);
            let run = connect(config, ctx, 1).await?;
            let result = run.preflight().await;
            run.close().await?;
            result?;
            info!("No cluster expansion in progress");
            Ok(())
        }
        Command::RestoreStatements {
            file,
            jobs,
            on_error_continue,
            include,
            exclude,
        } => {
            restore_statements(
                config,
                application_name,
                &file,
                jobs,
                on_error_continue,
                ObjectFilter::from_lists(include.as_slice(), exclude.as_slice())?,
            )
            .await
        }
        Command::DistributeOids {
            oid_file,
            cluster,
            timestamp,
            pid,
        } => {
            let text = tokio::fs::read_to_string(&oid_file)
                .await
                .with_context(|| format!("Failed to read '{}'", oid_file.display()))?;
            let manifest = OidManifest::parse(&text)?;
            let cluster = match cluster {
                Some(path) => Cluster::from_file(&path).await?,
                None => {
                    let ctx = context(Operation::Backup, RunFingerprint::current(), application_name);
                    let run = connect(config, ctx, 1).await?;
                    let discovered = Cluster::discover(&mut *run.pool().acquire(0).await?).await;
                    run.close().await?;
                    discovered?
                }
            };

            let paths = FilePathInfo::new(RunFingerprint::new(pid, timestamp));
            let distributor = AgentDistributor::new(Arc::new(SshExecutor::default()));
            distributor
                .distribute(&manifest, &cluster, &paths.oid_file_template())
                .await?;
            info!("Oid list written to {} segment(s)", cluster.segments().len());
            Ok(())
        }
        Command::Reap {
            timestamp,
            pid,
            operation,
        } => {
            let fingerprint = RunFingerprint::new(pid, timestamp);
            let ctx = context(operation.into(), fingerprint, application_name);
            let tag = ctx.application_tag.clone();
            // The pool's own session must not carry the run's tag.
            let run = connect(config, ctx.clone().with_application_tag("clustersnap_reaper"), 1).await?;
            let result = HangingSessionReaper::new(ctx.file_paths(), &tag)
                .terminate(run.pool())
                .await;
            run.close().await?;
            let report = result?;
            info!("Terminated {} session(s) ({:?} match)", report.terminated, report.scope);
            Ok(())
        }
    }
}

fn context(operation: Operation, fingerprint: RunFingerprint, application_name: Option<&str>) -> ExecutionContext {
    let ctx = ExecutionContext::new(operation, fingerprint);
    match application_name {
        Some(name) => ctx.with_application_tag(name),
        None => ctx,
    }
}

async fn connect(config: ConnectionConfig, ctx: ExecutionContext, sessions: usize) -> Result<Coordinator> {
    let config = config.num_connections(sessions);
    Coordinator::connect(Arc::new(PgConnector), config, ctx)
        .await
        .context("Unable to connect")
}

async fn restore_statements(
    config: ConnectionConfig,
    application_name: Option<&str>,
    file: &Path,
    jobs: usize,
    on_error_continue: bool,
    filter: ObjectFilter,
) -> Result<()> {
    let json = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read '{}'", file.display()))?;
    let statements: Vec<StatementWithType> =
        serde_json::from_str(&json).with_context(|| format!("Invalid statement list in '{}'", file.display()))?;

    let policy = if on_error_continue {
        ErrorPolicy::Continue
    } else {
        ErrorPolicy::Stop
    };
    let ctx = context(Operation::Restore, RunFingerprint::current(), application_name).with_error_policy(policy);
    let run = connect(config, ctx, jobs.max(1)).await?;

    let mode = if jobs > 1 {
        ExecutionMode::parallel()
    } else {
        ExecutionMode::default()
    };
    let executor = ParallelExecutor::new(mode)
        .with_filter(filter)
        .with_progress(ProgressMode::Info);
    let result = run.execute_statements(executor, &statements).await;
    run.close().await?;

    let report = result?;
    info!(
        "{} statement(s) completed, {} failed, {} filtered",
        report.completed(),
        report.num_errors(),
        report.filtered()
    );
    if !report.is_success() {
        for failure in &report.failures {
            tracing::error!("{} #{}: {}", failure.object_type, failure.index, failure.error);
        }
        return Err(anyhow!("{} statement(s) failed", report.num_errors()));
    }
    Ok(())
}
