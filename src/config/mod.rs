use crate::model::{StereoMode, TvDevice};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "TV3D_";
const APP_DIR: &str = "tv3d-bridge";

pub type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub tv: TvConfig,
    pub client: ClientConfig,
    pub behavior: BehaviorConfig,
    pub sequences: SequenceConfig,
    pub discovery: DiscoveryConfig,
    pub monitor: MonitorConfig,
    pub state: StateConfig,
}

/// Service type put in the discovery search request.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SearchTarget {
    All,
    #[default]
    RemoteControlReceiver,
    MultiScreenService,
    DialReceiver,
}

impl SearchTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "ssdp:all",
            Self::RemoteControlReceiver => "urn:samsung.com:device:RemoteControlReceiver:1",
            Self::MultiScreenService => "urn:samsung.com:service:MultiScreenService:1",
            Self::DialReceiver => "urn:dial-multiscreen-org:device:dialreceiver:1",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "all" => Some(Self::All),
            "remote_control_receiver" => Some(Self::RemoteControlReceiver),
            "multi_screen_service" => Some(Self::MultiScreenService),
            "dial_receiver" => Some(Self::DialReceiver),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TvConfig {
    pub address: String,
    pub name: String,
    pub port: u16,
    pub discover: bool,
    pub search_target: SearchTarget,
    pub connect_timeout_ms: u64,
}

impl Default for TvConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            name: String::new(),
            port: crate::session::DEFAULT_CONTROL_PORT,
            discover: true,
            search_target: SearchTarget::default(),
            connect_timeout_ms: 3000,
        }
    }
}

impl TvConfig {
    /// The cached address, if it parses.
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.trim().parse().ok()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub remote_name: String,
    pub app_string: String,
    pub hardware_address: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_name: "3D Enabler".to_string(),
            app_string: "iphone.3DEnabler.iapp.samsung".to_string(),
            hardware_address: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BehaviorConfig {
    pub pause: bool,
    pub black: bool,
    pub notifications: bool,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            pause: true,
            black: true,
            notifications: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SequenceConfig {
    pub begin: String,
    pub end: String,
    pub top_bottom: String,
    pub side_by_side: String,
    pub none: String,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            begin: "BLACKON,PAUSE".to_string(),
            end: "BLACKOFF,PLAY".to_string(),
            top_bottom: "3D,P4000,RIGHT,P1200,RIGHT,P1200,EXIT".to_string(),
            side_by_side: "3D,P4000,RIGHT,P1200,EXIT".to_string(),
            none: "3D,P1200".to_string(),
        }
    }
}

impl SequenceConfig {
    pub fn for_mode(&self, mode: StereoMode) -> &str {
        match mode {
            StereoMode::None => &self.none,
            StereoMode::TopBottom => &self.top_bottom,
            StereoMode::SideBySide => &self.side_by_side,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub timeout_ms: u64,
    pub retries: u32,
    pub mx: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            retries: 1,
            mx: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_secs: u64,
    pub mode_file: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_secs: 5,
            mode_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct StateConfig {
    pub current_mode: StereoMode,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = active_config_path();
        let mut config = Self::read_file(&config_path)?.unwrap_or_default();

        config.apply_env_overrides()?;

        config.validate()?;
        Ok(config)
    }

    /// Parses the file at `path`. A missing file is `None`; a file that does
    /// not parse is an error, since saving state later would overwrite it.
    fn read_file(path: &Path) -> Result<Option<Self>, Box<dyn std::error::Error>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "no config file, using defaults");
                return Ok(None);
            }
        };
        let config = toml::from_str::<Config>(&raw)
            .map_err(|err| format!("invalid config {}: {err}", path.display()))?;
        Ok(Some(config))
    }

    fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Ok(val) = env::var(format!("{}TV_ADDRESS", ENV_PREFIX)) {
            self.tv.address = val;
        }
        if let Ok(val) = env::var(format!("{}TV_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.tv.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}DISCOVER", ENV_PREFIX)) {
            self.tv.discover = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var(format!("{}SEARCH_TARGET", ENV_PREFIX)) {
            self.tv.search_target = SearchTarget::parse(&val)
                .ok_or_else(|| format!("unknown search target: {val}"))?;
        }

        if let Ok(val) = env::var(format!("{}HARDWARE_ADDRESS", ENV_PREFIX)) {
            self.set_hardware_address(&val)?;
        }

        if let Ok(val) = env::var(format!("{}PAUSE", ENV_PREFIX)) {
            self.behavior.pause = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var(format!("{}BLACK", ENV_PREFIX)) {
            self.behavior.black = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var(format!("{}NOTIFICATIONS", ENV_PREFIX)) {
            self.behavior.notifications = val.parse().unwrap_or(true);
        }

        if let Ok(val) = env::var(format!("{}DISCOVERY_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.discovery.timeout_ms = ms;
            }
        }

        if let Ok(val) = env::var(format!("{}POLL_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.monitor.poll_secs = secs;
            }
        }
        if let Ok(val) = env::var(format!("{}MODE_FILE", ENV_PREFIX)) {
            self.monitor.mode_file = Some(val);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.tv.port == 0 {
            return Err("tv.port must be non-zero".into());
        }
        if !self.tv.address.trim().is_empty() && self.tv.ip().is_none() {
            return Err(format!("tv.address is not an IP address: {}", self.tv.address).into());
        }
        if self.tv.connect_timeout_ms == 0 {
            return Err("tv.connect_timeout_ms must be non-zero".into());
        }
        if self.client.app_string.trim().is_empty() {
            return Err("client.app_string must be set".into());
        }
        if let Some(addr) = self.client.hardware_address.as_deref() {
            if crate::auth::normalize_hardware_address(addr).is_none() {
                return Err(format!("client.hardware_address is malformed: {addr}").into());
            }
        }
        if self.discovery.timeout_ms < 100 {
            return Err("discovery.timeout_ms must be >= 100".into());
        }
        if self.discovery.retries == 0 {
            return Err("discovery.retries must be >= 1".into());
        }
        if self.monitor.poll_secs == 0 {
            return Err("monitor.poll_secs must be non-zero".into());
        }
        Ok(())
    }

    pub fn set_device(&mut self, device: &TvDevice) {
        self.tv.address = device.address.to_string();
        self.tv.name = device.friendly_name.clone();
    }

    /// Accepts a manually entered address; rejects anything that is not an IP.
    pub fn set_address(&mut self, raw: &str) -> Result<IpAddr, Box<dyn std::error::Error>> {
        let ip: IpAddr = raw.trim().parse()?;
        self.tv.address = ip.to_string();
        Ok(ip)
    }

    pub fn set_current_mode(&mut self, mode: StereoMode) {
        self.state.current_mode = mode;
    }

    pub fn set_hardware_address(&mut self, raw: &str) -> Result<(), Box<dyn std::error::Error>> {
        let normalized = crate::auth::normalize_hardware_address(raw)
            .ok_or_else(|| format!("malformed hardware address: {raw}"))?;
        self.client.hardware_address = Some(normalized);
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        write_toml(path.as_ref(), &Config::default()).map_err(|err| -> Box<dyn std::error::Error> { err })
    }

    pub fn save_to(&self, path: &Path) -> Result<(), AnyError> {
        self.validate().map_err(|err| err.to_string())?;
        write_toml(path, self)
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }

    pub fn active_path() -> PathBuf {
        active_config_path()
    }
}

fn write_toml(path: &Path, config: &Config) -> Result<(), AnyError> {
    let data = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, data)?;
    Ok(())
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let base = env::var("XDG_CONFIG_HOME")
        .or_else(|_| env::var("APPDATA"))
        .unwrap_or_else(|_| ".".to_string());
    Path::new(&base).join(APP_DIR).join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

/// Where committed state goes once a cycle succeeds.
pub trait ConfigStore: Send + Sync {
    fn save(&self, config: &Config) -> Result<(), AnyError>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ConfigStore for FileConfigStore {
    fn save(&self, config: &Config) -> Result<(), AnyError> {
        config.save_to(&self.path)?;
        tracing::debug!(path = %self.path.display(), "config saved");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryConfigStore;
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [tv]
            address = "192.168.1.20"
            search_target = "multi_screen_service"

            [state]
            current_mode = "side_by_side"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.tv.ip(), Some("192.168.1.20".parse().unwrap()));
        assert_eq!(parsed.tv.port, 55000);
        assert_eq!(parsed.tv.search_target, SearchTarget::MultiScreenService);
        assert_eq!(parsed.state.current_mode, StereoMode::SideBySide);
        assert_eq!(parsed.sequences.none, "3D,P1200");
    }

    #[test]
    fn unparsable_file_is_an_error_and_left_untouched() {
        let path = std::env::temp_dir().join(format!("tv3d-bad-config-{}.toml", std::process::id()));
        let raw = "[tv]\naddress = \"10.0.0.5\"\nport = \"oops\"\n\n[sequences]\ntop_bottom = \"MY,CUSTOM\"\n";
        fs::write(&path, raw).unwrap();

        let err = Config::read_file(&path).unwrap_err();

        assert!(err.to_string().contains("invalid config"));
        assert_eq!(fs::read_to_string(&path).unwrap(), raw);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("tv3d-no-config-{}.toml", std::process::id()));
        let _ = fs::remove_file(&path);
        assert!(Config::read_file(&path).unwrap().is_none());
    }

    #[test]
    fn validate_rejects_zero_port_and_bad_address() {
        let mut cfg = Config::default();
        cfg.tv.port = 0;
        assert!(cfg.validate().is_err());
        cfg.tv.port = 55000;
        cfg.tv.address = "living-room".to_string();
        assert!(cfg.validate().is_err());
        cfg.tv.address = "10.0.0.7".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_malformed_hardware_address() {
        let mut cfg = Config::default();
        cfg.client.hardware_address = Some("not-a-mac".to_string());
        assert!(cfg.validate().is_err());
        cfg.client.hardware_address = Some("02-00-00-AB-CD-EF".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn setters_update_fields() {
        let mut cfg = Config::default();
        cfg.set_device(&TvDevice {
            address: "10.0.0.9".parse().unwrap(),
            friendly_name: "Den".to_string(),
        });
        assert_eq!(cfg.tv.address, "10.0.0.9");
        assert_eq!(cfg.tv.name, "Den");

        assert!(cfg.set_address("not an ip").is_err());
        assert_eq!(cfg.tv.address, "10.0.0.9");
        cfg.set_address(" 10.0.0.10 ").unwrap();
        assert_eq!(cfg.tv.address, "10.0.0.10");

        cfg.set_current_mode(StereoMode::TopBottom);
        assert_eq!(cfg.state.current_mode, StereoMode::TopBottom);

        cfg.set_hardware_address("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(cfg.client.hardware_address.as_deref(), Some("AA-BB-CC-DD-EE-FF"));
    }

    #[test]
    fn sequences_are_keyed_by_mode() {
        let seq = SequenceConfig::default();
        assert_eq!(seq.for_mode(StereoMode::SideBySide), "3D,P4000,RIGHT,P1200,EXIT");
        assert_eq!(seq.for_mode(StereoMode::None), "3D,P1200");
    }

    #[test]
    fn file_store_round_trips_through_disk() {
        let dir = env::temp_dir().join(format!("tv3d-bridge-test-{}", std::process::id()));
        let path = dir.join("config.toml");
        let store = FileConfigStore::new(path.clone());

        let mut cfg = Config::default();
        cfg.set_current_mode(StereoMode::TopBottom);
        store.save(&cfg).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let loaded: Config = toml::from_str(&raw).unwrap();
        assert_eq!(loaded.state.current_mode, StereoMode::TopBottom);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn memory_store_reports_failure() {
        let store = MemoryConfigStore {
            fail: true,
            ..Default::default()
        };
        assert!(store.save(&Config::default()).is_err());
        assert!(store.last_saved().is_none());
    }
}
