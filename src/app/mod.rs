use crate::config::{Config, FileConfigStore};
use crate::controller::{CycleOutcome, DeviceLocator, ModeController, NetworkLocator};
use crate::directory::{self, DeviceDirectory};
use crate::discovery::{self, DiscoveryOptions};
use crate::host::Notices;
use crate::model::StereoMode;
use crate::session::{Connector, TcpConnector};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
    }

    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "discover" {
            return handle_discover(&config).await;
        }
    }

    let (abort_tx, abort_rx) = watch::channel(false);
    let host = crate::console::console_host(&config, abort_rx.clone());
    let store = Arc::new(FileConfigStore::new(Config::active_path()));
    let connector = TcpConnector::new(
        config.tv.port,
        Duration::from_millis(config.tv.connect_timeout_ms),
    );
    let controller = ModeController::new(
        config.clone(),
        store,
        connector,
        NetworkLocator::new()?,
        host,
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown: ctrl-c");
            let _ = abort_tx.send(true);
        }
    });

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "pair" {
            return handle_pair(&controller).await;
        }
        if command == "send" {
            return handle_send(&controller).await;
        }
        if command == "set-mode" {
            return handle_set_mode(&controller).await;
        }
        return Err(format!("unknown command: {command}").into());
    }

    run_monitor(&controller, config.monitor.poll_secs, abort_rx).await;
    Ok(())
}

/// Follows the live mode until Ctrl-C, then takes the TV out of 3D.
async fn run_monitor<C: Connector, L: DeviceLocator>(
    controller: &ModeController<C, L>,
    poll_secs: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if controller.ensure_device().await.is_none() {
        tracing::warn!("no TV configured yet; will keep trying discovery on mode changes");
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(poll_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(poll_secs, "watching stereoscopic mode");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let outcome = controller.trigger().await;
                if outcome != CycleOutcome::Unchanged {
                    tracing::info!(?outcome, "mode cycle finished");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    match controller.restore_on_exit().await {
        CycleOutcome::Unchanged => {}
        outcome => tracing::info!(?outcome, "exit procedure finished"),
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_discover(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let options = DiscoveryOptions::from_config(&config.tv, &config.discovery);
    let replies = discovery::discover(&options).await?;
    let directory = DeviceDirectory::new(directory::DESCRIPTION_TIMEOUT)?;
    let notices = Notices::new();
    let devices = directory.resolve_all(&replies, &notices).await;
    if let Some(message) = notices.take() {
        tracing::warn!(%message, "name lookup");
    }
    let report = serde_json::json!({
        "replies": replies,
        "devices": devices,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn handle_pair<C: Connector, L: DeviceLocator>(
    controller: &ModeController<C, L>,
) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = controller.pair_only().await.ok_or("no TV reachable")?;
    if !outcome.is_granted() {
        return Err(format!("pairing {}", outcome.phase).into());
    }
    println!("Paired with {}", controller.snapshot().tv.address);
    Ok(())
}

async fn handle_send<C: Connector, L: DeviceLocator>(
    controller: &ModeController<C, L>,
) -> Result<(), Box<dyn std::error::Error>> {
    let sequence = std::env::args()
        .nth(2)
        .ok_or("missing sequence (usage: send <sequence>)")?;
    let report = controller
        .send_sequence(&sequence)
        .await
        .ok_or("sequence not sent: no session")?;
    println!(
        "sent {} key(s), {} failed, skipped {:?}",
        report.keys_sent, report.keys_failed, report.skipped
    );
    if !report.is_clean() {
        return Err("sequence did not complete".into());
    }
    Ok(())
}

async fn handle_set_mode<C: Connector, L: DeviceLocator>(
    controller: &ModeController<C, L>,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::env::args()
        .nth(2)
        .ok_or("missing mode (usage: set-mode <none|top_bottom|side_by_side>)")?;
    let mode = StereoMode::parse(&raw).ok_or_else(|| format!("unknown mode: {raw}"))?;

    match controller.set_mode(mode).await {
        CycleOutcome::Applied { mode, report } => {
            println!("TV switched to {mode} ({} key(s) sent)", report.keys_sent);
            Ok(())
        }
        CycleOutcome::Unchanged | CycleOutcome::Superseded => {
            println!("TV already in {mode}");
            Ok(())
        }
        outcome => Err(format!("mode change failed: {outcome:?}").into()),
    }
}
