use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Stereoscopic rendering mode of the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StereoMode {
    #[default]
    None,
    TopBottom,
    SideBySide,
}

impl StereoMode {
    /// Maps the media host's stereoscopic mode name. Anything that is not a
    /// split layout counts as no 3D.
    pub fn from_host_name(name: &str) -> Self {
        match name.trim() {
            "split_horizontal" => Self::TopBottom,
            "split_vertical" => Self::SideBySide,
            _ => Self::None,
        }
    }

    pub fn is_3d(self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Some(Self::None),
            "top_bottom" | "tab" | "split_horizontal" => Some(Self::TopBottom),
            "side_by_side" | "sbs" | "split_vertical" => Some(Self::SideBySide),
            _ => None,
        }
    }
}

impl fmt::Display for StereoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::TopBottom => write!(f, "top_bottom"),
            Self::SideBySide => write!(f, "side_by_side"),
        }
    }
}

/// A pending change from the last committed mode to the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTransition {
    pub current: StereoMode,
    pub requested: StereoMode,
}

impl ModeTransition {
    pub fn new(current: StereoMode, requested: StereoMode) -> Self {
        Self { current, requested }
    }

    pub fn is_pending(&self) -> bool {
        self.current != self.requested
    }

    /// Both ends are 3D, so the TV has to pass through "none" first.
    pub fn crosses_3d_modes(&self) -> bool {
        self.current.is_3d() && self.requested.is_3d()
    }
}

/// One reply collected during a discovery round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub location: String,
    pub service_type: Option<String>,
    pub usn: Option<String>,
    pub cache_seconds: Option<u32>,
}

/// A controllable TV resolved from a discovery reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TvDevice {
    pub address: IpAddr,
    pub friendly_name: String,
}

impl TvDevice {
    pub fn label(&self) -> String {
        format!("{} @ {}", self.friendly_name, self.address)
    }
}
