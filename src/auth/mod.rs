use crate::codec::{self, hex, ResponseMarker};
use crate::host::{AbortSignal, Notices, ProgressReporter};
use crate::session::{self, Connector, SessionError, Transport};
use rand::Rng;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// One poll of the pairing loop. The TV gives the user about a minute.
pub const POLL_INTERVAL: Duration = Duration::from_millis(610);
pub const MAX_POLL_ITERATIONS: u32 = 100;

pub const AUTH_FAILED_NOTICE: &str = "Authentication failed";
const PROGRESS_HEADING: &str = "Authentication";
const PROGRESS_MESSAGE: &str = "Your TV is asking for permission. Please allow access";

/// Terminal state of one pairing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Granted,
    Denied,
    /// The TV stopped waiting for the user.
    TimedOut,
    /// The TV dropped the pairing session.
    Disconnected,
    /// Our poll limit ran out before the TV answered.
    Expired,
    Cancelled,
    Aborted,
    /// The request got no recognisable reply at all.
    Unanswered,
    TransportFailed,
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::TimedOut => "timed out on the TV",
            Self::Disconnected => "disconnected",
            Self::Expired => "no answer within the poll limit",
            Self::Cancelled => "cancelled by user",
            Self::Aborted => "aborted",
            Self::Unanswered => "unanswered",
            Self::TransportFailed => "transport failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOutcome {
    pub phase: AuthPhase,
    /// Poll iterations spent waiting for approval, across retries.
    pub iterations: u32,
}

impl AuthOutcome {
    pub fn is_granted(&self) -> bool {
        self.phase == AuthPhase::Granted
    }
}

/// What the TV is told about us when pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub hardware_address: String,
    pub remote_name: String,
}

/// Canonical `AA-BB-CC-DD-EE-FF` form, accepting `:` or `-` separators.
pub fn normalize_hardware_address(raw: &str) -> Option<String> {
    let cleaned = raw.trim().replace(':', "-").to_uppercase();
    let parts: Vec<String> = cleaned
        .split('-')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut seg = segment.to_string();
            if seg.len() == 1 {
                seg.insert(0, '0');
            }
            seg
        })
        .collect();

    if parts.len() != 6 {
        return None;
    }
    if parts
        .iter()
        .any(|seg| seg.len() != 2 || !seg.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(parts.join("-"))
}

/// A random, locally administered unicast address.
pub fn generate_hardware_address<R: Rng>(rng: &mut R) -> String {
    let mut octets: [u8; 6] = rng.gen();
    octets[0] = (octets[0] & 0xFC) | 0x02;
    octets
        .iter()
        .map(|o| format!("{o:02X}"))
        .collect::<Vec<_>>()
        .join("-")
}

fn markers(reply: &[u8]) -> Vec<ResponseMarker> {
    let mut payloads = codec::decode_frames(reply);
    let found: Vec<ResponseMarker> = payloads.by_ref().map(ResponseMarker::classify).collect();
    if payloads.is_truncated() {
        tracing::warn!(tail = %hex(payloads.remainder()), "dropping truncated frame");
    }
    found
}

/// Drives the pairing handshake over an open session.
pub struct Authenticator<'a> {
    app_string: &'a str,
    progress: &'a dyn ProgressReporter,
    abort: &'a dyn AbortSignal,
}

impl<'a> Authenticator<'a> {
    pub fn new(
        app_string: &'a str,
        progress: &'a dyn ProgressReporter,
        abort: &'a dyn AbortSignal,
    ) -> Self {
        Self {
            app_string,
            progress,
            abort,
        }
    }

    /// One pairing attempt. Never blocks longer than the reply wait plus
    /// [`MAX_POLL_ITERATIONS`] polls.
    pub async fn handshake<T: Transport>(
        &self,
        transport: &mut T,
        identity: &ClientIdentity,
    ) -> AuthOutcome {
        let client_ip = transport
            .local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        let payload = match codec::auth_payload(
            &client_ip,
            &identity.hardware_address,
            &identity.remote_name,
        ) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "cannot build auth request");
                return AuthOutcome {
                    phase: AuthPhase::TransportFailed,
                    iterations: 0,
                };
            }
        };

        let reply = match session::exchange(
            transport,
            self.app_string,
            &payload,
            session::REPLY_TIMEOUT,
            self.abort,
        )
        .await
        {
            Ok(reply) => reply,
            Err(SessionError::Aborted) => {
                return AuthOutcome {
                    phase: AuthPhase::Aborted,
                    iterations: 0,
                }
            }
            Err(_) => {
                return AuthOutcome {
                    phase: AuthPhase::TransportFailed,
                    iterations: 0,
                }
            }
        };

        let mut latest = markers(&reply);
        let mut iterations = 0;
        let mut progress_open = false;
        let mut exit = None;

        if latest.iter().any(|m| m.is_pending()) {
            tracing::info!("waiting for the user to allow access on the TV");
            loop {
                if latest
                    .iter()
                    .any(|m| m.is_verdict() || *m == ResponseMarker::Disconnected)
                {
                    break;
                }
                if iterations >= MAX_POLL_ITERATIONS {
                    exit = Some(AuthPhase::Expired);
                    break;
                }
                iterations += 1;
                if !progress_open {
                    self.progress.open(PROGRESS_HEADING, PROGRESS_MESSAGE);
                    progress_open = true;
                }
                self.progress.update(iterations * 100 / MAX_POLL_ITERATIONS);

                match transport.recv_timeout(POLL_INTERVAL).await {
                    Ok(Some(bytes)) => {
                        tracing::debug!(reply = %hex(&bytes), iterations, "pairing update");
                        latest = markers(&bytes);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "session lost while pairing");
                        exit = Some(AuthPhase::TransportFailed);
                        break;
                    }
                }
                if self.progress.is_cancelled() {
                    exit = Some(AuthPhase::Cancelled);
                    break;
                }
                if self.abort.is_aborted() {
                    exit = Some(AuthPhase::Aborted);
                    break;
                }
            }
        }

        if progress_open {
            self.progress.close();
        }

        let phase = if latest.contains(&ResponseMarker::Disconnected) {
            AuthPhase::Disconnected
        } else if latest.contains(&ResponseMarker::Granted) {
            AuthPhase::Granted
        } else if latest.contains(&ResponseMarker::Denied) {
            AuthPhase::Denied
        } else if latest.contains(&ResponseMarker::Timeout) {
            AuthPhase::TimedOut
        } else {
            exit.unwrap_or(AuthPhase::Unanswered)
        };
        tracing::debug!(%phase, iterations, "handshake finished");
        AuthOutcome { phase, iterations }
    }

    /// Pairs over `session`, reconnecting once if the TV drops the pairing
    /// session. A fresh session replaces `session` on reconnect.
    pub async fn authenticate<C: Connector>(
        &self,
        connector: &C,
        address: IpAddr,
        session: &mut C::Transport,
        identity: &ClientIdentity,
        notices: &Notices,
    ) -> AuthOutcome {
        let mut outcome = self.handshake(session, identity).await;
        if outcome.phase == AuthPhase::Disconnected {
            tracing::info!(%address, "TV dropped the pairing session, reconnecting once");
            session.close().await;
            match connector.connect(address).await {
                Ok(fresh) => {
                    *session = fresh;
                    let retry = self.handshake(session, identity).await;
                    outcome = AuthOutcome {
                        phase: retry.phase,
                        iterations: outcome.iterations + retry.iterations,
                    };
                }
                Err(err) => tracing::warn!(error = %err, "reconnect failed"),
            }
        }

        if outcome.is_granted() {
            tracing::info!(iterations = outcome.iterations, "authenticated");
        } else {
            tracing::warn!(phase = %outcome.phase, "authentication failed");
            notices.push(AUTH_FAILED_NOTICE);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::{FlagAbort, RecordingProgress};
    use crate::host::NeverAbort;
    use crate::session::testing::{marker_frame, ScriptedConnector, ScriptedTransport};
    use base64::{engine::general_purpose, Engine as _};
    use std::sync::atomic::Ordering;

    fn identity() -> ClientIdentity {
        ClientIdentity {
            hardware_address: "02-11-22-33-44-55".to_string(),
            remote_name: "3D Enabler".to_string(),
        }
    }

    fn reply(marker: ResponseMarker) -> Option<Vec<u8>> {
        Some(marker_frame(marker))
    }

    #[tokio::test]
    async fn three_waits_then_granted_takes_three_polls() {
        let progress = RecordingProgress::default();
        let auth = Authenticator::new("app", &progress, &NeverAbort);
        let mut transport = ScriptedTransport::with_replies([
            reply(ResponseMarker::Waiting),
            reply(ResponseMarker::Waiting),
            reply(ResponseMarker::Waiting),
            reply(ResponseMarker::Granted),
        ]);

        let outcome = auth.handshake(&mut transport, &identity()).await;

        assert!(outcome.is_granted());
        assert_eq!(outcome.iterations, 3);
        assert_eq!(progress.opens.load(Ordering::SeqCst), 1);
        assert_eq!(progress.updates.load(Ordering::SeqCst), 3);
        assert_eq!(progress.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn silence_after_waiting_gives_up_after_poll_limit() {
        let progress = RecordingProgress::default();
        let auth = Authenticator::new("app", &progress, &NeverAbort);
        let mut transport = ScriptedTransport::with_replies([reply(ResponseMarker::Waiting)]);

        let outcome = auth.handshake(&mut transport, &identity()).await;

        assert_eq!(outcome.phase, AuthPhase::Expired);
        assert_eq!(outcome.iterations, MAX_POLL_ITERATIONS);
        assert_eq!(transport.recv_calls, 1 + MAX_POLL_ITERATIONS as usize);
        assert_eq!(progress.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_pending_marker_means_no_polling() {
        let progress = RecordingProgress::default();
        let auth = Authenticator::new("app", &progress, &NeverAbort);
        let mut transport = ScriptedTransport::default();

        let outcome = auth.handshake(&mut transport, &identity()).await;

        assert_eq!(outcome.phase, AuthPhase::Unanswered);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(progress.opens.load(Ordering::SeqCst), 0);
        assert_eq!(progress.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn immediate_grant_skips_progress() {
        let progress = RecordingProgress::default();
        let auth = Authenticator::new("app", &progress, &NeverAbort);
        let mut transport = ScriptedTransport::with_replies([reply(ResponseMarker::Granted)]);

        let outcome = auth.handshake(&mut transport, &identity()).await;

        assert!(outcome.is_granted());
        assert_eq!(progress.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_carries_identity_in_app_frame() {
        let progress = RecordingProgress::default();
        let auth = Authenticator::new("iphone.3DEnabler.iapp.samsung", &progress, &NeverAbort);
        let mut transport = ScriptedTransport::with_replies([reply(ResponseMarker::Granted)]);

        auth.handshake(&mut transport, &identity()).await;

        let frame = &transport.sent[0];
        let payload = codec::decode_frames(frame).next().unwrap();
        let expected = codec::auth_payload("192.168.1.50", "02-11-22-33-44-55", "3D Enabler").unwrap();
        assert_eq!(payload, &expected[..]);
        let mac64 = general_purpose::STANDARD.encode("02-11-22-33-44-55");
        assert!(payload.windows(mac64.len()).any(|w| w == mac64.as_bytes()));
    }

    #[tokio::test]
    async fn denial_and_tv_timeout_are_terminal() {
        for (marker, phase) in [
            (ResponseMarker::Denied, AuthPhase::Denied),
            (ResponseMarker::Timeout, AuthPhase::TimedOut),
        ] {
            let progress = RecordingProgress::default();
            let auth = Authenticator::new("app", &progress, &NeverAbort);
            let mut transport = ScriptedTransport::with_replies([
                reply(ResponseMarker::Requested),
                reply(marker),
            ]);
            let outcome = auth.handshake(&mut transport, &identity()).await;
            assert_eq!(outcome.phase, phase);
            assert_eq!(outcome.iterations, 1);
        }
    }

    #[tokio::test]
    async fn user_cancel_stops_polling() {
        let progress = RecordingProgress {
            cancel_after: Some(2),
            ..Default::default()
        };
        let auth = Authenticator::new("app", &progress, &NeverAbort);
        let mut transport = ScriptedTransport::with_replies([reply(ResponseMarker::Waiting)]);

        let outcome = auth.handshake(&mut transport, &identity()).await;

        assert_eq!(outcome.phase, AuthPhase::Cancelled);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(progress.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn host_abort_stops_polling() {
        let progress = RecordingProgress::default();
        let abort = FlagAbort::default();
        abort.0.store(true, Ordering::SeqCst);
        let auth = Authenticator::new("app", &progress, &abort);
        let mut transport = ScriptedTransport::with_replies([reply(ResponseMarker::Waiting)]);

        let outcome = auth.handshake(&mut transport, &identity()).await;

        assert_eq!(outcome.phase, AuthPhase::Aborted);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(progress.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_reconnects_and_retries_once() {
        let progress = RecordingProgress::default();
        let auth = Authenticator::new("app", &progress, &NeverAbort);
        let address: IpAddr = "10.0.0.2".parse().unwrap();
        let connector = ScriptedConnector::new(
            vec![address],
            vec![ScriptedTransport::with_replies([reply(ResponseMarker::Granted)])],
        );
        let mut session = ScriptedTransport::with_replies([
            reply(ResponseMarker::Waiting),
            reply(ResponseMarker::Disconnected),
        ]);
        let notices = Notices::new();

        let outcome = auth
            .authenticate(&connector, address, &mut session, &identity(), &notices)
            .await;

        assert!(outcome.is_granted());
        assert_eq!(outcome.iterations, 1);
        assert_eq!(connector.attempts(), 1);
        assert_eq!(session.sent.len(), 1);
        assert!(notices.is_empty());
    }

    #[tokio::test]
    async fn second_disconnect_is_not_retried() {
        let progress = RecordingProgress::default();
        let auth = Authenticator::new("app", &progress, &NeverAbort);
        let address: IpAddr = "10.0.0.2".parse().unwrap();
        let connector = ScriptedConnector::new(
            vec![address],
            vec![
                ScriptedTransport::with_replies([reply(ResponseMarker::Disconnected)]),
                ScriptedTransport::with_replies([reply(ResponseMarker::Granted)]),
            ],
        );
        let mut session = ScriptedTransport::with_replies([reply(ResponseMarker::Disconnected)]);
        let notices = Notices::new();

        let outcome = auth
            .authenticate(&connector, address, &mut session, &identity(), &notices)
            .await;

        assert_eq!(outcome.phase, AuthPhase::Disconnected);
        assert_eq!(connector.attempts(), 1);
        assert_eq!(notices.take().as_deref(), Some(AUTH_FAILED_NOTICE));
    }

    #[test]
    fn hardware_address_normalizes_separators() {
        assert_eq!(
            normalize_hardware_address("a:b:c:d:e:f").as_deref(),
            Some("0A-0B-0C-0D-0E-0F")
        );
        assert_eq!(
            normalize_hardware_address("aa-bb-cc-dd-ee-ff").as_deref(),
            Some("AA-BB-CC-DD-EE-FF")
        );
        assert!(normalize_hardware_address("aa-bb-cc").is_none());
        assert!(normalize_hardware_address("zz-bb-cc-dd-ee-ff").is_none());
    }

    #[test]
    fn generated_address_is_local_unicast() {
        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            let addr = generate_hardware_address(&mut rng);
            assert_eq!(normalize_hardware_address(&addr).as_deref(), Some(addr.as_str()));
            let first = u8::from_str_radix(&addr[..2], 16).unwrap();
            assert_eq!(first & 0x03, 0x02);
        }
    }
}
