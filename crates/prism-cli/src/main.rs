//! `prism`: runs the scheduler, status aggregator and broadcast server as one process.

mod demo;

use anyhow::Context;
use clap::{Parser, Subcommand};
use prism_broadcast::BroadcastServer;
use prism_core::PrismConfig;
use prism_scheduler::{BatchOptions, Scheduler};
use prism_status::{
    FileSnapshotStore, MemorySnapshotStore, SnapshotStore, StatusAggregator, StatusSummary,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// History entries included in `prism status` output.
const STATUS_HISTORY: usize = 10;

/// How long shutdown waits for the status listener to fold the last events.
const LISTENER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "prism", about = "Prism: concurrent analysis scheduler with live status")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "prism.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the status broadcast server and wait for Ctrl-C
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// First port to try (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Like `serve`, plus one batch of synthetic agents
    Demo {
        /// First port to try (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Shut down once the batch finishes instead of waiting for Ctrl-C
        #[arg(long)]
        once: bool,
    },
    /// Print the persisted status summary
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // stdout is reserved for command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = PrismConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let runtime = Runtime::start(config).await?;
            wait_for_ctrl_c().await?;
            runtime.shutdown().await;
        }
        Commands::Demo { port, once } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            let runtime = Runtime::start(config).await?;
            runtime.run_demo().await?;
            if !once {
                wait_for_ctrl_c().await?;
            }
            runtime.shutdown().await;
        }
        Commands::Status => print_status(&config).await?,
    }

    Ok(())
}

/// Every long-lived component of a `serve` or `demo` process.
struct Runtime {
    config: PrismConfig,
    scheduler: Arc<Scheduler>,
    aggregator: Arc<StatusAggregator>,
    broadcast: BroadcastServer,
    /// Folds scheduler events; ends once the scheduler is dropped.
    listener: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl Runtime {
    async fn start(config: PrismConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn SnapshotStore> = if config.status.persist_enabled {
            Arc::new(FileSnapshotStore::new(config.status.snapshot_path()))
        } else {
            Arc::new(MemorySnapshotStore::new())
        };
        let aggregator = Arc::new(StatusAggregator::new(config.status.clone(), store));
        if aggregator.restore().await {
            info!(session_id = %aggregator.session_id(), "Resumed previous session");
        }

        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));
        let listener = aggregator.spawn_event_listener(scheduler.subscribe());
        let mut background: Vec<JoinHandle<()>> =
            aggregator.spawn_persistence().into_iter().collect();

        let broadcast = BroadcastServer::new(config.server.clone(), Arc::clone(&aggregator));
        let port = broadcast
            .start(config.server.port)
            .await
            .context("starting broadcast server")?;

        if let Some(mut custom) = broadcast.take_custom_messages() {
            background.push(tokio::spawn(async move {
                while let Some(message) = custom.recv().await {
                    info!(
                        connection_id = %message.connection_id,
                        message_type = %message.message_type,
                        "Unhandled client message"
                    );
                }
            }));
        }

        info!(
            host = %config.server.host,
            port,
            max_concurrency = config.scheduler.max_concurrency,
            persist = config.status.persist_enabled,
            "Prism started"
        );

        Ok(Self {
            config,
            scheduler,
            aggregator,
            broadcast,
            listener,
            background,
        })
    }

    async fn run_demo(&self) -> anyhow::Result<()> {
        let agents = demo::agents();
        for agent in &agents {
            self.scheduler.register(Arc::clone(agent))?;
        }
        let session_id = self.aggregator.reset(None);
        info!(session_id = %session_id, agents = agents.len(), "Running demo batch");

        let batch = self
            .scheduler
            .submit_batch(demo::tasks(&agents), BatchOptions::new())
            .await?;
        for result in &batch.results {
            info!(
                agent_id = %result.agent_id,
                outcome = ?result.outcome,
                duration_ms = result.duration_ms(),
                retries = result.retries,
                "Demo task finished"
            );
        }
        println!("{}", serde_json::to_string_pretty(&batch.summary)?);

        let (overall, categories) = demo::score(&batch.results);
        self.aggregator.record_score(overall, categories);
        Ok(())
    }

    /// Stop accepting clients, drain the scheduler, then write the final
    /// snapshot once every scheduler event has been folded in.
    async fn shutdown(self) {
        let Self {
            config,
            scheduler,
            aggregator,
            broadcast,
            listener,
            background,
        } = self;

        info!("Shutting down");
        broadcast.stop().await;
        scheduler.shutdown(None).await;
        for handle in &background {
            handle.abort();
        }

        // Dropping the last scheduler handle closes the event stream.
        drop(scheduler);
        let abort = listener.abort_handle();
        if tokio::time::timeout(LISTENER_DRAIN, listener).await.is_err() {
            warn!("Status listener did not drain in time");
            abort.abort();
        }

        if config.status.persist_enabled && aggregator.persist().await.is_err() {
            error!("Final snapshot could not be written");
        }
        info!("Prism stopped");
    }
}

async fn wait_for_ctrl_c() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;
    Ok(())
}

async fn print_status(config: &PrismConfig) -> anyhow::Result<()> {
    let store = FileSnapshotStore::new(config.status.snapshot_path());
    match store.load().await {
        Ok(Some(snapshot)) => {
            let summary = StatusSummary::from_snapshot(&snapshot, STATUS_HISTORY);
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Ok(None) => {
            println!("No snapshot at {}", store.path().display());
        }
        Err(e) => {
            warn!(error = %e, path = %store.path().display(), "Snapshot unreadable");
            return Err(e.into());
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_serve_overrides() {
        let cli = Cli::try_parse_from(["prism", "serve", "--host", "0.0.0.0", "-p", "4100"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("prism.toml"));
        match cli.command {
            Commands::Serve { host, port } => {
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(4100));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_cli_parses_demo_and_config() {
        let cli = Cli::try_parse_from(["prism", "-c", "other.toml", "demo", "--once"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.toml"));
        assert!(matches!(cli.command, Commands::Demo { port: None, once: true }));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["prism"]).is_err());
    }

    #[tokio::test]
    async fn test_runtime_lifecycle_persists_final_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PrismConfig::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = 0;
        config.status.data_dir = dir.path().to_path_buf();

        let runtime = Runtime::start(config.clone()).await.unwrap();
        assert!(runtime.broadcast.is_running());
        let session_id = runtime.aggregator.session_id();
        runtime.shutdown().await;

        let snapshot = FileSnapshotStore::new(config.status.snapshot_path())
            .load()
            .await
            .unwrap()
            .expect("final snapshot written");
        assert_eq!(snapshot.session_id, session_id);
    }

    struct Idle;

    #[async_trait::async_trait]
    impl prism_scheduler::Agent for Idle {
        fn id(&self) -> &str {
            "idle"
        }

        async fn execute(
            &self,
            _ctx: prism_scheduler::AgentContext,
        ) -> prism_core::PrismResult<serde_json::Value> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_folds_cancelled_batch_into_final_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PrismConfig::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = 0;
        config.scheduler.shutdown_grace_ms = 50;
        config.status.data_dir = dir.path().to_path_buf();

        let runtime = Runtime::start(config.clone()).await.unwrap();
        runtime.scheduler.register(Arc::new(Idle)).unwrap();
        let scheduler = Arc::clone(&runtime.scheduler);
        let batch = tokio::spawn(async move {
            scheduler
                .submit_batch(vec![prism_scheduler::Task::new("idle")], BatchOptions::new())
                .await
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while runtime.scheduler.running() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        runtime.shutdown().await;
        let result = batch.await.unwrap().unwrap();
        assert_eq!(result.summary.failed, 1);

        let snapshot = FileSnapshotStore::new(config.status.snapshot_path())
            .load()
            .await
            .unwrap()
            .expect("final snapshot written");
        assert_eq!(
            snapshot.agents["idle"].state,
            prism_status::AgentState::Failed
        );
        assert!(snapshot.global_status.phase.is_terminal());
    }
}
