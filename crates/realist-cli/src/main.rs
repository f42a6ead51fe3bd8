use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use realist_reconcile::{ReconcileConfig, ReconcileInput, Reconciler};
use realist_storage::{CheckpointStore, FileCheckpointStore, PgOfferStore};
use tokio::sync::watch;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "realist-cli")]
#[command(about = "Reconcile scraped offers into the merged offer store")]
struct Cli {
    #[arg(long, global = true)]
    input: Option<PathBuf>,
    #[arg(long, global = true)]
    checkpoint: Option<PathBuf>,
    /// Starting cursor, used only when no checkpoint exists.
    #[arg(long, global = true)]
    from_id: Option<String>,
    #[arg(long, global = true)]
    processed_offers: Option<u64>,
    #[arg(long, global = true)]
    batch_size: Option<usize>,
    #[arg(long, global = true)]
    merge_concurrency: Option<usize>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Run,
    Status,
    InitSchema,
}

impl Cli {
    fn config(&self) -> Result<ReconcileConfig> {
        let mut config = ReconcileConfig::from_env();
        if let Some(path) = &self.input {
            config.apply_input(ReconcileInput::load(path)?);
        }
        config.apply_input(ReconcileInput {
            checkpoint_path: self.checkpoint.clone(),
            from_id: self.from_id.clone(),
            processed_offers: self.processed_offers,
            batch_size: self.batch_size,
            merge_concurrency: self.merge_concurrency,
            ..ReconcileInput::default()
        });
        Ok(config)
    }
}

async fn connect_stores(config: &ReconcileConfig) -> Result<(PgOfferStore, PgOfferStore)> {
    let source = PgOfferStore::connect(&config.source_database_url, config.max_connections)
        .await
        .context("connecting to source offer store")?;
    let destination =
        PgOfferStore::connect(&config.destination_database_url, config.max_connections)
            .await
            .context("connecting to destination offer store")?;
    Ok((source, destination))
}

/// The first interrupt requests a stop between batches; returns `true` once a
/// second one arrives.
async fn escalate_interrupts<F, Fut>(mut interrupt: F, shutdown: watch::Sender<bool>) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if interrupt().await.is_err() {
        return false;
    }
    warn!("interrupt received; finishing the current batch (interrupt again to abort)");
    let _ = shutdown.send(true);
    interrupt().await.is_ok()
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = cli.config()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let (source, destination) = connect_stores(&config).await?;
            let checkpoints = FileCheckpointStore::new(config.checkpoint_path.clone());

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if escalate_interrupts(tokio::signal::ctrl_c, shutdown_tx).await {
                    error!("second interrupt; aborting without saving the current batch");
                    std::process::exit(130);
                }
            });

            let reconciler = Reconciler::new(
                Arc::new(source),
                Arc::new(destination),
                Arc::new(checkpoints),
                config.options(),
            )
            .with_shutdown(shutdown_rx);
            let summary = reconciler.run(config.cursor_seed()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Status => {
            let checkpoints = FileCheckpointStore::new(config.checkpoint_path.clone());
            match checkpoints.load().await? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => println!("no checkpoint at {}", checkpoints.path().display()),
            }
        }
        Commands::InitSchema => {
            let (source, destination) = connect_stores(&config).await?;
            source.ensure_schema().await.context("preparing source schema")?;
            destination
                .ensure_schema()
                .await
                .context("preparing destination schema")?;
            println!("schema ready on source and destination");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::ready;
    use std::io;

    #[tokio::test]
    async fn first_interrupt_stops_between_batches_and_second_escalates() {
        let (tx, rx) = watch::channel(false);
        let mut received = 0;
        let escalated = escalate_interrupts(
            || {
                received += 1;
                ready(Ok(()))
            },
            tx,
        )
        .await;

        assert!(escalated);
        assert!(*rx.borrow());
        assert_eq!(received, 2);
    }

    #[tokio::test]
    async fn lost_signal_listener_after_first_interrupt_does_not_escalate() {
        let (tx, rx) = watch::channel(false);
        let mut received = 0;
        let escalated = escalate_interrupts(
            || {
                received += 1;
                if received == 1 {
                    ready(Ok(()))
                } else {
                    ready(Err(io::Error::other("listener gone")))
                }
            },
            tx,
        )
        .await;

        assert!(!escalated);
        assert!(*rx.borrow());
    }

    #[test]
    fn flags_override_the_default_command() {
        let cli = Cli::parse_from(["realist-cli", "--batch-size", "50", "status"]);
        assert!(matches!(cli.command, Some(Commands::Status)));
        assert_eq!(cli.batch_size, Some(50));
    }
}
