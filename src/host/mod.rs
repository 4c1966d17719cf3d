//! Capabilities the media host provides to the controller.
//!
//! Every method must return promptly; long waits belong to the caller.

use crate::model::StereoMode;
use std::sync::{Arc, Mutex};

pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str);
}

pub trait DialogPrompter: Send + Sync {
    /// Index of the chosen option, `None` when dismissed.
    fn select(&self, heading: &str, options: &[String]) -> Option<usize>;

    fn yes_no(&self, heading: &str, message: &str) -> bool;

    fn input_address(&self, heading: &str, current: &str) -> Option<String>;
}

pub trait ProgressReporter: Send + Sync {
    fn open(&self, heading: &str, message: &str);
    fn update(&self, percent: u32);
    fn is_cancelled(&self) -> bool;
    fn close(&self);
}

pub trait AbortSignal: Send + Sync {
    fn is_aborted(&self) -> bool;
}

pub trait PlaybackControl: Send + Sync {
    fn is_playing_video(&self) -> bool;
    fn is_paused(&self) -> bool;
    /// Pauses when playing, resumes when paused.
    fn toggle_pause(&self);
}

pub trait BlackScreen: Send + Sync {
    fn show(&self);
    fn hide(&self);
}

pub trait StereoModeSource: Send + Sync {
    fn current_mode(&self) -> StereoMode;
}

/// Abort signal for work that must run to completion, such as restoring the
/// TV on shutdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverAbort;

impl AbortSignal for NeverAbort {
    fn is_aborted(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct HostServices {
    pub notifications: Arc<dyn NotificationSink>,
    pub dialogs: Arc<dyn DialogPrompter>,
    pub progress: Arc<dyn ProgressReporter>,
    pub abort: Arc<dyn AbortSignal>,
    pub playback: Arc<dyn PlaybackControl>,
    pub screen: Arc<dyn BlackScreen>,
    pub modes: Arc<dyn StereoModeSource>,
}

/// User-facing messages gathered during one cycle and shown together.
#[derive(Debug, Default)]
pub struct Notices {
    messages: Mutex<Vec<String>>,
}

impl Notices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: impl Into<String>) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.into());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().map(|m| m.is_empty()).unwrap_or(true)
    }

    /// Drains the accumulated messages into one line.
    pub fn take(&self) -> Option<String> {
        let mut messages = self.messages.lock().ok()?;
        if messages.is_empty() {
            return None;
        }
        let joined = messages.join(". ");
        messages.clear();
        Some(joined)
    }

    /// Logs the pending messages and, when enabled, hands them to the sink.
    pub fn flush(&self, sink: &dyn NotificationSink, enabled: bool) {
        let Some(message) = self.take() else {
            return;
        };
        tracing::info!(message = %message, "notify");
        if enabled {
            sink.notify(&message);
        }
    }
}
