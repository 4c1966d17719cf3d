//! Command language for driving the TV.
//!
//! A sequence is a comma-separated list of tokens, executed left to right:
//! named keys (`3D`, `RIGHT`, ...), raw key codes (`KEY_*`), `PAUSE`/`PLAY`,
//! timed waits (`P<ms>`) and `BLACKON`/`BLACKOFF`.

use crate::codec;
use crate::config::BehaviorConfig;
use crate::host::{AbortSignal, BlackScreen, PlaybackControl};
use crate::session::{self, SessionError, Transport};
use std::time::Duration;

/// Longest uninterrupted sleep inside a wait; aborts are noticed between slices.
const WAIT_SLICE: Duration = Duration::from_millis(100);

const KEY_MAP: &[(&str, &str)] = &[
    ("3D", "KEY_PANNEL_CHDOWN"),
    ("RIGHT", "KEY_RIGHT"),
    ("LEFT", "KEY_LEFT"),
    ("UP", "KEY_UP"),
    ("DOWN", "KEY_DOWN"),
    ("EXIT", "KEY_EXIT"),
    ("ENTER", "KEY_ENTER"),
];

pub fn key_code_for(name: &str) -> Option<&'static str> {
    KEY_MAP
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, code)| *code)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandToken {
    NamedKey { name: String, code: &'static str },
    RawKeyCode(String),
    Pause,
    Play,
    Wait(Duration),
    ScreenBlackOn,
    ScreenBlackOff,
    Unknown(String),
}

impl CommandToken {
    pub fn parse(raw: &str) -> Self {
        let token = raw.trim().to_uppercase();
        if let Some(code) = key_code_for(&token) {
            return Self::NamedKey { name: token, code };
        }
        if token.starts_with("KEY") {
            return Self::RawKeyCode(token);
        }
        match token.as_str() {
            "PAUSE" => return Self::Pause,
            "PLAY" => return Self::Play,
            _ => {}
        }
        if let Some(ms) = token.strip_prefix('P') {
            return match ms.parse::<u64>() {
                Ok(ms) => Self::Wait(Duration::from_millis(ms)),
                Err(_) => Self::Unknown(token),
            };
        }
        match token.as_str() {
            "BLACKON" => Self::ScreenBlackOn,
            "BLACKOFF" => Self::ScreenBlackOff,
            _ => Self::Unknown(token),
        }
    }

    /// The key code this token sends, if it sends one.
    pub fn key_code(&self) -> Option<&str> {
        match self {
            Self::NamedKey { code, .. } => Some(*code),
            Self::RawKeyCode(code) => Some(code.as_str()),
            _ => None,
        }
    }
}

pub fn parse_sequence(sequence: &str) -> Vec<CommandToken> {
    sequence.split(',').map(CommandToken::parse).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceReport {
    pub keys_sent: usize,
    pub keys_failed: usize,
    pub skipped: Vec<String>,
    pub waited: Duration,
    pub aborted: bool,
}

impl SequenceReport {
    pub fn is_clean(&self) -> bool {
        self.keys_failed == 0 && !self.aborted
    }
}

pub struct Sequencer<'a> {
    app_string: &'a str,
    behavior: &'a BehaviorConfig,
    playback: &'a dyn PlaybackControl,
    screen: &'a dyn BlackScreen,
    abort: &'a dyn AbortSignal,
}

impl<'a> Sequencer<'a> {
    pub fn new(
        app_string: &'a str,
        behavior: &'a BehaviorConfig,
        playback: &'a dyn PlaybackControl,
        screen: &'a dyn BlackScreen,
        abort: &'a dyn AbortSignal,
    ) -> Self {
        Self {
            app_string,
            behavior,
            playback,
            screen,
            abort,
        }
    }

    /// Executes `sequence` over `transport`. A failed key is logged and the
    /// run carries on; only the abort signal stops it early. An aborted run
    /// still lifts the black screen and resumes the pause it set.
    pub async fn run<T: Transport>(&self, transport: &mut T, sequence: &str) -> SequenceReport {
        let mut report = SequenceReport::default();
        let mut paused_by_us = false;
        let mut blacked_by_us = false;

        for token in parse_sequence(sequence) {
            if self.abort.is_aborted() {
                tracing::info!("sequence aborted");
                report.aborted = true;
                break;
            }
            match &token {
                CommandToken::NamedKey { .. } | CommandToken::RawKeyCode(_) => {
                    let Some(code) = token.key_code() else {
                        continue;
                    };
                    if self.send_key(transport, code).await {
                        report.keys_sent += 1;
                    } else {
                        report.keys_failed += 1;
                    }
                }
                CommandToken::Pause => {
                    if self.behavior.pause
                        && self.playback.is_playing_video()
                        && !self.playback.is_paused()
                    {
                        tracing::debug!("pausing playback");
                        self.playback.toggle_pause();
                        paused_by_us = true;
                    }
                }
                CommandToken::Play => {
                    if self.behavior.pause
                        && self.playback.is_playing_video()
                        && self.playback.is_paused()
                        && paused_by_us
                    {
                        tracing::debug!("resuming playback");
                        self.playback.toggle_pause();
                        paused_by_us = false;
                    }
                }
                CommandToken::Wait(duration) => {
                    tracing::debug!(ms = duration.as_millis() as u64, "waiting");
                    let slept = self.wait(*duration).await;
                    report.waited += slept;
                    if slept < *duration {
                        report.aborted = true;
                        break;
                    }
                }
                CommandToken::ScreenBlackOn => {
                    if self.behavior.black {
                        tracing::debug!("screen to black");
                        self.screen.show();
                        blacked_by_us = true;
                    }
                }
                CommandToken::ScreenBlackOff => {
                    if self.behavior.black {
                        tracing::debug!("screen from black");
                        self.screen.hide();
                        blacked_by_us = false;
                    }
                }
                CommandToken::Unknown(raw) => {
                    tracing::warn!(token = %raw, "unknown command, skipping");
                    report.skipped.push(raw.clone());
                }
            }
        }

        if report.aborted {
            self.unwind(paused_by_us, blacked_by_us);
        }

        tracing::info!(
            sent = report.keys_sent,
            failed = report.keys_failed,
            skipped = report.skipped.len(),
            "sequence done"
        );
        report
    }

    async fn send_key<T: Transport>(&self, transport: &mut T, code: &str) -> bool {
        tracing::debug!(key = code, "sending key");
        let payload = match codec::key_payload(code) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(key = code, error = %err, "cannot encode key");
                return false;
            }
        };
        match session::exchange(
            transport,
            self.app_string,
            &payload,
            session::REPLY_TIMEOUT,
            self.abort,
        )
        .await
        {
            Ok(_) => true,
            Err(SessionError::Aborted) => {
                tracing::debug!(key = code, "key sent, reply wait aborted");
                true
            }
            Err(err) => {
                tracing::warn!(key = code, error = %err, "key not delivered");
                false
            }
        }
    }

    /// Undoes the begin bracket of a run that stopped before its end.
    fn unwind(&self, paused_by_us: bool, blacked_by_us: bool) {
        if blacked_by_us {
            tracing::debug!("screen from black after abort");
            self.screen.hide();
        }
        if paused_by_us && self.playback.is_paused() {
            tracing::debug!("resuming playback after abort");
            self.playback.toggle_pause();
        }
    }

    /// Sleeps for `duration` in slices, returning early on abort.
    async fn wait(&self, duration: Duration) -> Duration {
        let mut slept = Duration::ZERO;
        while slept < duration {
            if self.abort.is_aborted() {
                break;
            }
            let slice = (duration - slept).min(WAIT_SLICE);
            tokio::time::sleep(slice).await;
            slept += slice;
        }
        slept
    }
}
