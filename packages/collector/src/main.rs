use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mempool_collector::alias::SourceAliases;
use mempool_collector::config::Cli;
use mempool_collector::files::FileManager;
use mempool_collector::logging;
use mempool_collector::metrics::Metrics;
use mempool_collector::processor::Processor;
use mempool_collector::receivers::{ReceiverPool, DEFAULT_RECEIVER_TIMEOUT};
use mempool_collector::server::{self, AppState};
use mempool_collector::sse::SubscriberHub;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_options()).context("failed to install the log subscriber")?;
    cli.validate()?;

    let aliases = SourceAliases::from_env()?;
    let specs = cli.source_specs(&aliases)?;

    let out = cli.out_dir();
    std::fs::create_dir_all(&out).with_context(|| format!("cannot create output directory {}", out.display()))?;
    let files = FileManager::new(&out, cli.uid().map(str::to_string), !cli.no_sourcelog)?;
    info!(
        out = %out.display(),
        uid = %files.uid(),
        sources = specs.len(),
        aliases = aliases.len(),
        sourcelog = !cli.no_sourcelog,
        "starting mempool collector"
    );

    let cancel = CancellationToken::new();
    let hub = Arc::new(SubscriberHub::new());
    let metrics = Metrics::new().context("failed to register metrics")?;

    let server = match cli.server.api_listen_addr.as_deref() {
        Some(addr) => {
            let listener = server::bind(addr).await?;
            let state = AppState {
                hub: hub.clone(),
                metrics: metrics.clone(),
                cancel: cancel.clone(),
            };
            Some(server::spawn(listener, server::router(state, cli.request_timeout()), cancel.clone())?)
        }
        None => None,
    };

    let receivers = ReceiverPool::new(
        cli.receivers.receivers.clone(),
        cli.receivers.receivers_allowed_sources.clone(),
        DEFAULT_RECEIVER_TIMEOUT,
    )?;
    if !receivers.is_empty() {
        info!(receivers = ?receivers.urls(), "forwarding first-seen transactions");
    }

    let processor = Processor::new(files)
        .with_receivers(receivers)
        .with_hub(hub)
        .with_metrics(metrics);

    let (ingress, rx) = mpsc::channel(cli.ingress_capacity);
    let processor_task = tokio::spawn(processor.run(rx, cancel.clone()));

    let mut connectors = JoinSet::new();
    for spec in &specs {
        let connector = spec.connector(ingress.clone())?;
        connectors.spawn(connector.run(cancel.clone()));
    }
    drop(ingress);

    shutdown_signal().await;
    info!("shutdown requested");
    cancel.cancel();

    while let Some(res) = connectors.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "connector task failed");
        }
    }
    processor_task.await.context("processor task failed")?;
    if let Some(server) = server {
        server.shutdown(cli.shutdown_grace()).await?;
    }

    info!("mempool collector stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
