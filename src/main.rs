//! sprint-gate - real-time sprint timing from BLE light gates
//!
//! Module structure:
//! - `domain/` - Core timing types and error taxonomy
//! - `io/` - External interfaces (BLE peripheral, Pushover, console, Prometheus)
//! - `services/` - Timing logic (decoder, engine, stats, dispatcher, supervisor)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use sprint_gate::infra::{Config, Metrics};
use sprint_gate::io::console::{run_event_printer, spawn_stdin_reader, Console};
use sprint_gate::io::{Peripheral, PushoverNotifier, SimulatedPeripheral};
use sprint_gate::services::{
    create_engine, create_notify_worker, ConnectionSupervisor, EngineHandle, EngineSettings,
    NotificationDispatcher, NotifierConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// sprint-gate - sprint timer for BLE timing gates
#[derive(Parser, Debug)]
#[command(name = "sprint-gate", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/sprint-gate.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Use the in-process simulated timing hub instead of Bluetooth
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Logs go to stderr, the console UI owns stdout
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("sprint-gate starting");

    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config);
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        distance = %config.distance(),
        auto_reset = %config.auto_reset(),
        lane = %config.lane(),
        notifications = %config.notifications_enabled(),
        credentials = %(config.pushover_user_key().is_some() && config.pushover_api_token().is_some()),
        decoder_rules = %config.classification().rules().len(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());
    let (events_tx, _) = broadcast::channel(config.event_buffer());

    // Notification path: dispatcher + worker off the engine task
    let notifier_config = NotifierConfig::from_parts(
        config.notifications_enabled(),
        config.pushover_user_key(),
        config.pushover_api_token(),
    )
    .shared();
    let notifier = Arc::new(PushoverNotifier::new(
        config.pushover_api_url(),
        Duration::from_millis(config.notify_timeout_ms()),
    )?);
    let dispatcher =
        Arc::new(NotificationDispatcher::new(notifier, notifier_config.clone(), metrics.clone()));
    let (notify_tx, notify_worker) =
        create_notify_worker(dispatcher.clone(), events_tx.clone(), config.notify_queue_size());
    tokio::spawn(notify_worker.run());

    // Timing engine
    let (engine, timing_engine) = create_engine(
        EngineSettings::from_config(&config),
        metrics.clone(),
        notifier_config,
        Some(notify_tx),
        events_tx,
        config.event_queue_size(),
    );
    tokio::spawn(timing_engine.run());

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = sprint_gate::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "prometheus_metrics_server_error");
            }
        });
    }

    // Start metrics reporter (lock-free reads)
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => reporter_metrics.report().log(),
                changed = reporter_shutdown.changed() => {
                    if changed.is_err() || *reporter_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    tokio::spawn(run_event_printer(engine.subscribe(), shutdown_rx.clone()));

    let simulate = args.simulate || !cfg!(feature = "ble");
    if simulate {
        if !args.simulate {
            warn!("ble_feature_disabled_using_simulator");
        }
        let sim = Arc::new(SimulatedPeripheral::default());
        serve(sim.clone(), Some(sim), engine, dispatcher, &config).await;
    } else {
        #[cfg(feature = "ble")]
        {
            let peripheral = Arc::new(
                sprint_gate::io::btle::BtlePeripheral::new()
                    .await
                    .context("Failed to open Bluetooth adapter")?,
            );
            serve(peripheral, None, engine, dispatcher, &config).await;
        }
    }

    let _ = shutdown_tx.send(true);
    metrics.report().log();
    info!("sprint-gate shutdown complete");
    Ok(())
}

/// Run the console against a peripheral until quit or Ctrl+C
async fn serve<P: Peripheral>(
    peripheral: Arc<P>,
    sim: Option<Arc<SimulatedPeripheral>>,
    engine: EngineHandle,
    dispatcher: Arc<NotificationDispatcher>,
    config: &Config,
) {
    let supervisor = Arc::new(ConnectionSupervisor::new(
        peripheral,
        engine.clone(),
        config.name_keywords().to_vec(),
        Duration::from_secs(config.scan_timeout_secs()),
    ));

    let console = Console { engine, supervisor: supervisor.clone(), dispatcher, sim };
    let lines = spawn_stdin_reader(16);

    tokio::select! {
        _ = console.run(lines) => info!("console_closed"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result.context("Failed to listen for Ctrl+C") {
                warn!(error = %e, "ctrl_c_listener_failed");
            }
            info!("shutdown_signal_received");
        }
    }

    if let Err(e) = supervisor.disconnect().await {
        warn!(error = %e, "disconnect_on_shutdown_failed");
    }
}
