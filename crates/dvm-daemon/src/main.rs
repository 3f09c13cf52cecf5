// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nostr::Keys;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dvm_daemon::{build_services, handler_info_builder};
use dvm_payment::LnurlPayClient;
use dvm_relay::{JobPublisher, RelayGateway};
use dvm_runtime::{reconcile_interrupted, run_sweeper, Orchestrator, ShutdownToken, WorkerPool};
use dvm_service::HttpInference;
use dvm_store::JobStore;

#[derive(Parser, Debug)]
#[command(name = "dvm-daemon", version, about = "Lightning-paid AI compute over Nostr")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the sqlite database path.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings =
        dvm_config::load_settings(args.config.as_deref()).context("load config")?;
    if let Some(db) = args.db {
        settings.db_path = db.display().to_string();
    }

    let filter = if args.debug {
        EnvFilter::new("dvm=debug,dvm.runtime=debug,dvm.relay=debug")
    } else {
        EnvFilter::new(format!("dvm={}", settings.log_level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let warnings = dvm_config::validate_settings(&settings).context("validate config")?;
    for warning in warnings {
        warn!(target: "dvm.daemon", %warning, "config warning");
    }

    let keys = Keys::parse(&settings.nostr_secret_key).context("parse nostr secret key")?;

    let store =
        Arc::new(JobStore::open(Path::new(&settings.db_path)).context("open job store")?);
    let reconciled = reconcile_interrupted(&store).context("reconcile interrupted jobs")?;
    if reconciled > 0 {
        info!(target: "dvm.daemon", count = reconciled, "reconciled interrupted jobs");
    }

    let lnurlp_url = settings
        .lnurlp_url()
        .context("derive lnurlp url from lightning address")?;
    let invoices = Arc::new(LnurlPayClient::new(lnurlp_url));

    let backend = Arc::new(HttpInference::new(
        settings.inference.endpoint.clone(),
        settings.inference.api_key.clone(),
        settings.inference.model.clone(),
    ));
    let registry = Arc::new(build_services(&settings, backend));

    let gateway = Arc::new(
        RelayGateway::connect(keys, &settings.relays)
            .await
            .context("connect to relays")?,
    );
    gateway.subscribe_since_now().await;

    // Capability advertisement is best-effort: a relay hiccup at startup
    // must not keep the agent from serving jobs.
    if let Err(e) = gateway
        .publish_event(handler_info_builder(&settings, &registry))
        .await
    {
        error!(target: "dvm.daemon", error = %e, "handler info publish failed");
    }

    let pool = Arc::new(WorkerPool::new(settings.max_concurrent_jobs));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        invoices,
        Arc::clone(&gateway) as Arc<dyn JobPublisher>,
        pool,
    ));

    let shutdown = ShutdownToken::new();
    let (tx, rx) = mpsc::channel(256);

    let ingress = tokio::spawn({
        let gateway = Arc::clone(&gateway);
        async move { gateway.run(tx).await }
    });
    let runner = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        let shutdown = shutdown.clone();
        async move { orchestrator.run(rx, shutdown).await }
    });
    let sweeper = tokio::spawn(run_sweeper(
        Arc::clone(&store),
        settings.sweep_interval_secs,
        settings.payment_timeout_secs,
        shutdown.clone(),
    ));

    info!(
        target: "dvm.daemon",
        pubkey = %gateway.public_key().to_hex(),
        services = ?registry.kinds(),
        relays = ?settings.relays,
        "agent ready"
    );

    wait_for_signal().await;
    info!(target: "dvm.daemon", "shutdown signal received");

    // Ingress and the sweeper stop first; in-flight executions get a
    // bounded grace period to write a terminal state.
    shutdown.trigger();
    ingress.abort();
    let _ = runner.await;
    let _ = sweeper.await;

    orchestrator
        .drain(Duration::from_secs(settings.payment_timeout_secs))
        .await;
    gateway.disconnect().await;

    info!(target: "dvm.daemon", "agent stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(target: "dvm.daemon", error = %e, "sigterm handler failed");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
