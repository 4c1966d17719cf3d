//! Turns discovery replies into named, addressable TVs.

use crate::host::{DialogPrompter, Notices};
use crate::model::{DiscoveredDevice, TvDevice};
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

pub const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(3);
/// Shown when the TV refuses to describe itself; remote access is off.
pub const ACCESS_DENIED_NAME: &str = "Access Denied. Check Permissions";
pub const UNKNOWN_NAME: &str = "Unknown";
pub const SELECT_HEADING: &str = "Select your TV device";

#[derive(Debug)]
pub enum DirectoryError {
    Http(reqwest::Error),
    Status(StatusCode),
    MissingName,
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(err) => write!(f, "http error: {err}"),
            Self::Status(status) => write!(f, "HTTP Error {}", status.as_u16()),
            Self::MissingName => write!(f, "description has no friendlyName"),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// Text of the first `<friendlyName>` element.
pub fn extract_friendly_name(xml: &str) -> Option<String> {
    let open_tag = "<friendlyName>";
    let close_tag = "</friendlyName>";
    let start = xml.find(open_tag)? + open_tag.len();
    let end = xml[start..].find(close_tag)? + start;
    let value = xml[start..end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Host part of a description URL, when it is a literal IP address.
pub fn address_from_location(location: &str) -> Option<IpAddr> {
    let url = Url::parse(location.trim()).ok()?;
    let host = url.host_str()?;
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

#[derive(Debug, Clone)]
pub struct DeviceDirectory {
    http: Client,
}

impl DeviceDirectory {
    pub fn new(timeout: Duration) -> Result<Self, DirectoryError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DirectoryError::Http)?;
        Ok(Self { http })
    }

    pub async fn fetch_name(&self, location: &str) -> Result<String, DirectoryError> {
        let resp = self
            .http
            .get(location)
            .send()
            .await
            .map_err(DirectoryError::Http)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DirectoryError::Status(status));
        }
        let body = resp.text().await.map_err(DirectoryError::Http)?;
        tracing::debug!(%location, bytes = body.len(), "description fetched");
        extract_friendly_name(&body).ok_or(DirectoryError::MissingName)
    }

    /// Names the device behind `device`. Lookup failures fall back to a
    /// placeholder name; only an unusable location yields `None`.
    pub async fn resolve(&self, device: &DiscoveredDevice, notices: &Notices) -> Option<TvDevice> {
        let Some(address) = address_from_location(&device.location) else {
            tracing::debug!(location = %device.location, "no IP address in location");
            return None;
        };
        let friendly_name = match self.fetch_name(&device.location).await {
            Ok(name) => name,
            Err(DirectoryError::Status(StatusCode::UNAUTHORIZED)) => {
                tracing::info!(%address, "TV denied access to its description");
                ACCESS_DENIED_NAME.to_string()
            }
            Err(err) => {
                tracing::warn!(%address, error = %err, "cannot read TV name");
                notices.push(format!("Error getting TV name: {err}"));
                UNKNOWN_NAME.to_string()
            }
        };
        Some(TvDevice {
            address,
            friendly_name,
        })
    }

    /// Resolves every reply, keeping the first device seen per address.
    pub async fn resolve_all(&self, devices: &[DiscoveredDevice], notices: &Notices) -> Vec<TvDevice> {
        let mut resolved: Vec<TvDevice> = Vec::new();
        for device in devices {
            let Some(address) = address_from_location(&device.location) else {
                continue;
            };
            if resolved.iter().any(|tv| tv.address == address) {
                continue;
            }
            if let Some(tv) = self.resolve(device, notices).await {
                resolved.push(tv);
            }
        }
        tracing::info!(count = resolved.len(), "devices resolved");
        resolved
    }
}

/// One device is taken as is; several are offered to the user.
pub fn choose_device(devices: &[TvDevice], dialogs: &dyn DialogPrompter) -> Option<TvDevice> {
    match devices {
        [] => None,
        [only] => Some(only.clone()),
        many => {
            let labels: Vec<String> = many.iter().map(TvDevice::label).collect();
            let index = dialogs.select(SELECT_HEADING, &labels)?;
            many.get(index).cloned()
        }
    }
}
