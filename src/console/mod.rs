//! Terminal host: the capability implementations used by the CLI.

use crate::config::Config;
use crate::host::{
    AbortSignal, BlackScreen, DialogPrompter, HostServices, NotificationSink, PlaybackControl,
    ProgressReporter, StereoModeSource,
};
use crate::model::StereoMode;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;

const APP_LABEL: &str = "3D Enabler";

pub fn console_host(config: &Config, abort: watch::Receiver<bool>) -> HostServices {
    HostServices {
        notifications: Arc::new(ConsoleNotifier),
        dialogs: Arc::new(LinePrompter::new(
            io::BufReader::new(io::stdin()),
            WatchAbort(abort.clone()),
        )),
        progress: Arc::new(LogProgress::default()),
        abort: Arc::new(WatchAbort(abort)),
        playback: Arc::new(NoPlayback),
        screen: Arc::new(NoScreen),
        modes: Arc::new(FileModeSource::new(
            config.monitor.mode_file.as_deref().map(PathBuf::from),
        )),
    }
}

pub struct ConsoleNotifier;

impl NotificationSink for ConsoleNotifier {
    fn notify(&self, message: &str) {
        println!("[{APP_LABEL}] {message}");
    }
}

/// Answers dialogs from line-oriented input. End of input dismisses, and
/// so does a raised abort.
///
/// A read blocks until a full line arrives. On a multi-thread runtime it is
/// moved off the async workers so the Ctrl-C handler keeps running; the
/// prompt after the abort is not asked at all.
pub struct LinePrompter<R> {
    input: Mutex<R>,
    abort: WatchAbort,
}

impl<R: BufRead + Send> LinePrompter<R> {
    pub fn new(input: R, abort: WatchAbort) -> Self {
        Self {
            input: Mutex::new(input),
            abort,
        }
    }

    fn ask(&self, prompt: &str) -> Option<String> {
        if self.abort.is_aborted() {
            tracing::debug!(%prompt, "prompt dismissed after abort");
            return None;
        }
        print!("{prompt} ");
        let _ = io::stdout().flush();
        let line = blocking(|| self.read_line())?;
        if self.abort.is_aborted() {
            return None;
        }
        Some(line)
    }

    fn read_line(&self) -> Option<String> {
        let mut line = String::new();
        let mut input = self.input.lock().ok()?;
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    }
}

fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn parse_choice(answer: &str, count: usize) -> Option<usize> {
    let picked: usize = answer.trim().parse().ok()?;
    (1..=count).contains(&picked).then(|| picked - 1)
}

fn parse_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

impl<R: BufRead + Send> DialogPrompter for LinePrompter<R> {
    fn select(&self, heading: &str, options: &[String]) -> Option<usize> {
        println!("{heading}:");
        for (i, option) in options.iter().enumerate() {
            println!("  {}) {option}", i + 1);
        }
        let answer = self.ask(&format!("Choose 1-{}:", options.len()))?;
        parse_choice(&answer, options.len())
    }

    fn yes_no(&self, heading: &str, message: &str) -> bool {
        println!("{heading}");
        self.ask(&format!("{message} [y/N]"))
            .map(|answer| parse_yes(&answer))
            .unwrap_or(false)
    }

    fn input_address(&self, heading: &str, current: &str) -> Option<String> {
        let answer = if current.is_empty() {
            self.ask(&format!("{heading}:"))?
        } else {
            self.ask(&format!("{heading} [{current}]:"))?
        };
        if answer.is_empty() {
            None
        } else {
            Some(answer)
        }
    }
}

/// Progress that only logs; it logs at every tenth of the way.
#[derive(Debug, Default)]
pub struct LogProgress {
    last_logged: AtomicU32,
}

impl ProgressReporter for LogProgress {
    fn open(&self, heading: &str, message: &str) {
        self.last_logged.store(0, Ordering::SeqCst);
        tracing::info!(%heading, "{message}");
    }

    fn update(&self, percent: u32) {
        let step = percent / 10;
        if step > self.last_logged.swap(step, Ordering::SeqCst) {
            tracing::info!(percent, "still waiting");
        }
    }

    fn is_cancelled(&self) -> bool {
        false
    }

    fn close(&self) {
        tracing::debug!("progress closed");
    }
}

pub struct WatchAbort(pub watch::Receiver<bool>);

impl AbortSignal for WatchAbort {
    fn is_aborted(&self) -> bool {
        *self.0.borrow()
    }
}

/// No media player attached to the console.
pub struct NoPlayback;

impl PlaybackControl for NoPlayback {
    fn is_playing_video(&self) -> bool {
        false
    }

    fn is_paused(&self) -> bool {
        false
    }

    fn toggle_pause(&self) {}
}

pub struct NoScreen;

impl BlackScreen for NoScreen {
    fn show(&self) {
        tracing::debug!("black screen requested");
    }

    fn hide(&self) {
        tracing::debug!("black screen released");
    }
}

/// Reads the live mode from a file holding a host mode name
/// (`off`, `split_horizontal`, `split_vertical`).
pub struct FileModeSource {
    path: Option<PathBuf>,
}

impl FileModeSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl StereoModeSource for FileModeSource {
    fn current_mode(&self) -> StereoMode {
        let Some(path) = self.path.as_ref() else {
            return StereoMode::None;
        };
        match fs::read_to_string(path) {
            Ok(raw) => StereoMode::parse(&raw).unwrap_or_else(|| StereoMode::from_host_name(&raw)),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "mode file unreadable");
                StereoMode::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn prompter(input: &str) -> LinePrompter<Cursor<Vec<u8>>> {
        let (_tx, rx) = watch::channel(false);
        LinePrompter::new(Cursor::new(input.as_bytes().to_vec()), WatchAbort(rx))
    }

    #[test]
    fn choices_are_one_based() {
        assert_eq!(parse_choice("2", 3), Some(1));
        assert_eq!(parse_choice("0", 3), None);
        assert_eq!(parse_choice("4", 3), None);
        assert_eq!(parse_choice("x", 3), None);
    }

    #[test]
    fn prompter_reads_answers_in_order() {
        let dialogs = prompter("yes\n2\n10.0.0.4\n");
        assert!(dialogs.yes_no("Setup", "Discover now?"));
        let options = vec!["Den @ 10.0.0.2".to_string(), "Bedroom @ 10.0.0.3".to_string()];
        assert_eq!(dialogs.select("Pick", &options), Some(1));
        assert_eq!(
            dialogs.input_address("Address", "").as_deref(),
            Some("10.0.0.4")
        );
    }

    #[test]
    fn end_of_input_dismisses() {
        let dialogs = prompter("");
        assert!(!dialogs.yes_no("Setup", "Discover now?"));
        assert_eq!(dialogs.select("Pick", &["a".to_string()]), None);
        assert_eq!(dialogs.input_address("Address", "10.0.0.1"), None);
    }

    #[test]
    fn raised_abort_dismisses_prompts_without_reading() {
        let (tx, rx) = watch::channel(false);
        let dialogs = LinePrompter::new(Cursor::new(b"yes\n".to_vec()), WatchAbort(rx));
        tx.send(true).unwrap();

        assert!(!dialogs.yes_no("Setup", "Discover now?"));
        assert_eq!(dialogs.input_address("Address", ""), None);
        assert_eq!(dialogs.input.lock().unwrap().position(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prompt_reads_inside_a_multi_thread_runtime() {
        let dialogs = prompter("10.0.0.9\n");
        assert_eq!(
            dialogs.input_address("Address", "").as_deref(),
            Some("10.0.0.9")
        );
    }

    #[test]
    fn mode_file_accepts_host_and_own_names() {
        let path = std::env::temp_dir().join(format!("tv3d-mode-{}", std::process::id()));
        let source = FileModeSource::new(Some(path.clone()));

        fs::write(&path, "split_vertical\n").unwrap();
        assert_eq!(source.current_mode(), StereoMode::SideBySide);
        fs::write(&path, "top_bottom").unwrap();
        assert_eq!(source.current_mode(), StereoMode::TopBottom);
        fs::write(&path, "anaglyph_cyan_red").unwrap();
        assert_eq!(source.current_mode(), StereoMode::None);

        let _ = fs::remove_file(&path);
        assert_eq!(source.current_mode(), StereoMode::None);
        assert_eq!(FileModeSource::new(None).current_mode(), StereoMode::None);
    }

    #[test]
    fn watch_abort_follows_channel() {
        let (tx, rx) = watch::channel(false);
        let abort = WatchAbort(rx);
        assert!(!abort.is_aborted());
        tx.send(true).unwrap();
        assert!(abort.is_aborted());
    }
}
