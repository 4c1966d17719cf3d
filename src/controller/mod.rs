//! Mode-change cycle: decides whether the TV needs driving, gets a session,
//! pairs, runs the key sequence and commits the new mode.

use crate::auth::{self, AuthOutcome, Authenticator, ClientIdentity};
use crate::config::{Config, ConfigStore, SequenceConfig};
use crate::directory::{self, DeviceDirectory, DirectoryError};
use crate::discovery::{self, DiscoveryOptions};
use crate::host::{AbortSignal, HostServices, NeverAbort, Notices};
use crate::model::{ModeTransition, StereoMode, TvDevice};
use crate::sequencer::{SequenceReport, Sequencer};
use crate::session::{Connector, Transport};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub const CONNECTION_FAILED_NOTICE: &str = "Connection failed";
pub const DISCOVERY_OFF_NOTICE: &str = "Discovery is turned off";
pub const NOT_DETECTED_NOTICE: &str = "Samsung TV is not detected";

const SETUP_HEADING: &str = "Your Samsung TV is not defined yet";
const DISCOVER_PROMPT: &str =
    "If it is connected to your network it can be discovered. Do you want to discover TV now?";
const MANUAL_PROMPT: &str = "Do you want to enter your TV IP address now?";
const ADDRESS_HEADING: &str = "Enter your TV IP address";

/// Finds TVs when the cached address does not answer.
#[allow(async_fn_in_trait)]
pub trait DeviceLocator {
    async fn locate(&self, config: &Config, notices: &Notices) -> Vec<TvDevice>;
}

/// SSDP search followed by description lookups.
#[derive(Debug, Clone)]
pub struct NetworkLocator {
    directory: DeviceDirectory,
}

impl NetworkLocator {
    pub fn new() -> Result<Self, DirectoryError> {
        Ok(Self {
            directory: DeviceDirectory::new(directory::DESCRIPTION_TIMEOUT)?,
        })
    }
}

impl DeviceLocator for NetworkLocator {
    async fn locate(&self, config: &Config, notices: &Notices) -> Vec<TvDevice> {
        let options = DiscoveryOptions::from_config(&config.tv, &config.discovery);
        let replies = match discovery::discover(&options).await {
            Ok(replies) => replies,
            Err(err) => {
                tracing::warn!(error = %err, "discovery failed");
                return Vec::new();
            }
        };
        self.directory.resolve_all(&replies, notices).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle holds the in-progress flag.
    Busy,
    Unchanged,
    ConnectFailed,
    AuthFailed,
    /// The live mode moved back while pairing took its time.
    Superseded,
    Interrupted(SequenceReport),
    Applied {
        mode: StereoMode,
        report: SequenceReport,
    },
}

/// The key sequence for `transition`, bracketed by the begin/end templates.
pub fn compose_sequence(sequences: &SequenceConfig, transition: ModeTransition) -> String {
    let mut parts = vec![sequences.begin.as_str()];
    if transition.crosses_3d_modes() {
        parts.push(sequences.none.as_str());
    }
    parts.push(sequences.for_mode(transition.requested));
    parts.push(sequences.end.as_str());
    parts
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ModeController<C: Connector, L: DeviceLocator> {
    config: Mutex<Config>,
    store: Arc<dyn ConfigStore>,
    connector: C,
    locator: L,
    host: HostServices,
    notices: Notices,
    busy: AtomicBool,
}

impl<C: Connector, L: DeviceLocator> ModeController<C, L> {
    pub fn new(
        config: Config,
        store: Arc<dyn ConfigStore>,
        connector: C,
        locator: L,
        host: HostServices,
    ) -> Self {
        Self {
            config: Mutex::new(config),
            store,
            connector,
            locator,
            host,
            notices: Notices::new(),
            busy: AtomicBool::new(false),
        }
    }

    fn config(&self) -> MutexGuard<'_, Config> {
        match self.config.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn snapshot(&self) -> Config {
        self.config().clone()
    }

    pub fn committed_mode(&self) -> StereoMode {
        self.config().state.current_mode
    }

    fn persist(&self) -> bool {
        let snapshot = self.snapshot();
        match self.store.save(&snapshot) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "config not saved");
                false
            }
        }
    }

    fn flush_notices(&self) {
        if self.notices.is_empty() {
            return;
        }
        let enabled = self.config().behavior.notifications;
        self.notices.flush(self.host.notifications.as_ref(), enabled);
    }

    /// Our pairing identity; a hardware address is generated and saved the
    /// first time one is needed.
    fn identity(&self) -> ClientIdentity {
        let (identity, generated) = {
            let mut config = self.config();
            let generated = config.client.hardware_address.is_none();
            if generated {
                let address = auth::generate_hardware_address(&mut rand::thread_rng());
                tracing::info!(%address, "generated client hardware address");
                config.client.hardware_address = Some(address);
            }
            let raw = config.client.hardware_address.clone().unwrap_or_default();
            let identity = ClientIdentity {
                hardware_address: auth::normalize_hardware_address(&raw).unwrap_or(raw),
                remote_name: config.client.remote_name.clone(),
            };
            (identity, generated)
        };
        if generated {
            self.persist();
        }
        identity
    }

    /// Reaches the TV at its cached address, falling back to discovery.
    async fn open_session(&self) -> Option<(C::Transport, IpAddr)> {
        let config = self.snapshot();
        if let Some(address) = config.tv.ip() {
            match self.connector.connect(address).await {
                Ok(session) => return Some((session, address)),
                Err(err) => {
                    tracing::info!(%address, error = %err, "TV is off or address is outdated")
                }
            }
        }

        if !config.tv.discover {
            tracing::info!("cannot connect, discovery is turned off");
            self.notices.push(DISCOVERY_OFF_NOTICE);
            return None;
        }

        let devices = self.locator.locate(&config, &self.notices).await;
        if devices.is_empty() {
            self.notices.push(NOT_DETECTED_NOTICE);
            return None;
        }
        let device = directory::choose_device(&devices, self.host.dialogs.as_ref())?;
        self.notices
            .push(format!("Discovered TV: {}", device.friendly_name));

        match self.connector.connect(device.address).await {
            Ok(session) => {
                self.config().set_device(&device);
                self.persist();
                Some((session, device.address))
            }
            Err(err) => {
                tracing::info!(address = %device.address, error = %err, "discovered TV did not accept the connection");
                None
            }
        }
    }

    async fn pair(&self, session: &mut C::Transport, address: IpAddr, abort: &dyn AbortSignal) -> AuthOutcome {
        let identity = self.identity();
        let app_string = self.config().client.app_string.clone();
        let authenticator = Authenticator::new(&app_string, self.host.progress.as_ref(), abort);
        authenticator
            .authenticate(&self.connector, address, session, &identity, &self.notices)
            .await
    }

    async fn run_sequence(
        &self,
        session: &mut C::Transport,
        sequence: &str,
        abort: &dyn AbortSignal,
    ) -> SequenceReport {
        let config = self.snapshot();
        let sequencer = Sequencer::new(
            &config.client.app_string,
            &config.behavior,
            self.host.playback.as_ref(),
            self.host.screen.as_ref(),
            abort,
        );
        sequencer.run(session, sequence).await
    }

    /// One cycle towards the live mode.
    pub async fn trigger(&self) -> CycleOutcome {
        let abort = self.host.abort.clone();
        self.run_cycle(None, abort.as_ref()).await
    }

    pub async fn set_mode(&self, mode: StereoMode) -> CycleOutcome {
        let abort = self.host.abort.clone();
        self.run_cycle(Some(mode), abort.as_ref()).await
    }

    /// Brings the TV back out of 3D when the host shuts down. Runs even after
    /// the host abort was raised.
    pub async fn restore_on_exit(&self) -> CycleOutcome {
        if !self.committed_mode().is_3d() {
            return CycleOutcome::Unchanged;
        }
        tracing::info!("exit procedure: switching the TV back to 2D");
        self.run_cycle(Some(StereoMode::None), &NeverAbort).await
    }

    /// Drives the TV towards `target`, or towards the host's live mode when
    /// no target is given.
    pub async fn run_cycle(&self, target: Option<StereoMode>, abort: &dyn AbortSignal) -> CycleOutcome {
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            tracing::debug!("mode change already in progress");
            return CycleOutcome::Busy;
        };

        let requested = target.unwrap_or_else(|| self.host.modes.current_mode());
        let transition = ModeTransition::new(self.committed_mode(), requested);
        if !transition.is_pending() {
            tracing::debug!(mode = %requested, "stereoscopic mode has not changed");
            return CycleOutcome::Unchanged;
        }

        let outcome = match self.open_session().await {
            Some((mut session, address)) => {
                let outcome = self
                    .drive(&mut session, address, transition, target, abort)
                    .await;
                session.close().await;
                outcome
            }
            None => {
                self.notices.push(CONNECTION_FAILED_NOTICE);
                CycleOutcome::ConnectFailed
            }
        };
        self.flush_notices();
        outcome
    }

    async fn drive(
        &self,
        session: &mut C::Transport,
        address: IpAddr,
        mut transition: ModeTransition,
        target: Option<StereoMode>,
        abort: &dyn AbortSignal,
    ) -> CycleOutcome {
        let auth = self.pair(session, address, abort).await;
        if !auth.is_granted() {
            return CycleOutcome::AuthFailed;
        }

        // Pairing may have waited on the user long enough for playback to move on.
        if auth.iterations > 1 && target.is_none() {
            transition.requested = self.host.modes.current_mode();
        }
        if !transition.is_pending() {
            tracing::info!(mode = %transition.current, "stereoscopic mode is the same");
            return CycleOutcome::Superseded;
        }

        tracing::info!(from = %transition.current, to = %transition.requested, "changing TV mode");
        let sequence = {
            let config = self.config();
            compose_sequence(&config.sequences, transition)
        };
        let report = self.run_sequence(session, &sequence, abort).await;
        if report.aborted {
            return CycleOutcome::Interrupted(report);
        }

        self.config().set_current_mode(transition.requested);
        self.persist();
        CycleOutcome::Applied {
            mode: transition.requested,
            report,
        }
    }

    /// Connects and pairs without changing modes.
    pub async fn pair_only(&self) -> Option<AuthOutcome> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let abort = self.host.abort.clone();
        let outcome = match self.open_session().await {
            Some((mut session, address)) => {
                let auth = self.pair(&mut session, address, abort.as_ref()).await;
                session.close().await;
                Some(auth)
            }
            None => {
                self.notices.push(CONNECTION_FAILED_NOTICE);
                None
            }
        };
        self.flush_notices();
        outcome
    }

    /// Runs a raw command sequence; the committed mode is left alone.
    pub async fn send_sequence(&self, sequence: &str) -> Option<SequenceReport> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let abort = self.host.abort.clone();
        let report = match self.open_session().await {
            Some((mut session, address)) => {
                let auth = self.pair(&mut session, address, abort.as_ref()).await;
                let report = if auth.is_granted() {
                    Some(self.run_sequence(&mut session, sequence, abort.as_ref()).await)
                } else {
                    None
                };
                session.close().await;
                report
            }
            None => {
                self.notices.push(CONNECTION_FAILED_NOTICE);
                None
            }
        };
        self.flush_notices();
        report
    }

    /// First-run setup: when no TV address is known, offer discovery and
    /// pairing, then manual entry.
    pub async fn ensure_device(&self) -> Option<IpAddr> {
        let config = self.snapshot();
        if let Some(address) = config.tv.ip() {
            return Some(address);
        }
        let dialogs = self.host.dialogs.clone();

        if config.tv.discover && dialogs.yes_no(SETUP_HEADING, DISCOVER_PROMPT) {
            if let Some(_busy) = BusyGuard::acquire(&self.busy) {
                let abort = self.host.abort.clone();
                if let Some((mut session, address)) = self.open_session().await {
                    self.pair(&mut session, address, abort.as_ref()).await;
                    session.close().await;
                    self.flush_notices();
                    return Some(address);
                }
            }
        }

        let mut address = None;
        if dialogs.yes_no(SETUP_HEADING, MANUAL_PROMPT) {
            if let Some(raw) = dialogs.input_address(ADDRESS_HEADING, &config.tv.address) {
                let parsed = self.config().set_address(&raw);
                match parsed {
                    Ok(ip) => {
                        self.persist();
                        address = Some(ip);
                    }
                    Err(err) => {
                        tracing::warn!(input = %raw, error = %err, "rejected TV address");
                    }
                }
            }
        }
        self.flush_notices();
        address
    }
}
