use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use recsync_clients::{HttpPrimaryClient, HttpSecondaryClient, NameMapper};
use recsync_reconciler::{
    load_name_mapper, validate_mapping, Reconciler, ReconcilerConfig,
};
use recsync_store::{BackoffPolicy, HttpConfig, HttpExecutor, StateStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "recsync")]
#[command(about = "Mirrors active ingest recordings onto a secondary DVR")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the reconciliation loop and the status endpoint.
    Run,
    /// Run a single reconciliation pass and print its summary.
    Tick,
    /// Check the configured mappings against the secondary system.
    Validate,
}

struct Wiring {
    config: ReconcilerConfig,
    mapper: NameMapper,
    http: Arc<HttpExecutor>,
}

async fn wire() -> Result<Wiring> {
    let config = ReconcilerConfig::from_env();
    let mapper = load_name_mapper(&config.mapping_file)
        .await
        .context("loading name mappings")?;
    let http = Arc::new(HttpExecutor::new(HttpConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        backoff: BackoffPolicy::default(),
    })?);
    Ok(Wiring {
        config,
        mapper,
        http,
    })
}

async fn build_reconciler(wiring: &Wiring) -> Reconciler {
    let primary = Arc::new(HttpPrimaryClient::new(
        wiring.http.clone(),
        wiring.config.primary_base_url.clone(),
    ));
    let secondary = Arc::new(HttpSecondaryClient::new(
        wiring.http.clone(),
        wiring.config.secondary_base_url.clone(),
    ));
    let store = StateStore::new(wiring.config.state_file.clone());
    Reconciler::bootstrap(primary, secondary, wiring.mapper.clone(), store).await
}

async fn check_mappings(wiring: &Wiring) {
    let secondary = HttpSecondaryClient::new(
        wiring.http.clone(),
        wiring.config.secondary_base_url.clone(),
    );
    match validate_mapping(&secondary, &wiring.mapper).await {
        Ok(missing) if missing.is_empty() => {
            info!(mappings = wiring.mapper.len(), "all mapped sources known to the secondary system");
        }
        Ok(missing) => {
            warn!(?missing, "mapped source ids the secondary system does not report");
        }
        Err(err) => {
            warn!(error = %err, "could not validate mappings against the secondary system");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let wiring = wire().await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            check_mappings(&wiring).await;

            let reconciler = build_reconciler(&wiring).await;
            let status = reconciler.status();
            let status_port = wiring.config.status_port;
            tokio::spawn(async move {
                if let Err(err) = recsync_web::serve(status, status_port).await {
                    warn!(error = %err, "status endpoint stopped");
                }
            });

            let shutdown = async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "could not listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            };
            reconciler.run(wiring.config.poll_interval, shutdown).await;
            info!("shut down cleanly");
        }
        Commands::Tick => {
            let mut reconciler = build_reconciler(&wiring).await;
            let summary = reconciler.tick().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Validate => {
            check_mappings(&wiring).await;
        }
    }

    Ok(())
}
