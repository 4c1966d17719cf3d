use crate::codec::{self, hex};
use crate::host::AbortSignal;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const DEFAULT_CONTROL_PORT: u16 = 55000;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_BUFFER_SIZE: usize = 4096;
const ABORT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum SessionError {
    Connect { addr: SocketAddr, source: io::Error },
    ConnectTimeout(SocketAddr),
    Io(io::Error),
    Closed,
    Encode(codec::CodecError),
    Aborted,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { addr, source } => write!(f, "connect to {addr} failed: {source}"),
            Self::ConnectTimeout(addr) => write!(f, "connect to {addr} timed out"),
            Self::Io(err) => write!(f, "session io error: {err}"),
            Self::Closed => write!(f, "session closed by peer"),
            Self::Encode(err) => write!(f, "frame encode failed: {err}"),
            Self::Aborted => write!(f, "reply wait aborted"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<codec::CodecError> for SessionError {
    fn from(err: codec::CodecError) -> Self {
        Self::Encode(err)
    }
}

/// Byte pipe to the TV's control port.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Address of our end of the connection, as the TV sees it.
    fn local_ip(&self) -> Option<IpAddr>;

    async fn send(&mut self, bytes: &[u8]) -> Result<(), SessionError>;

    /// Waits at most `wait` for data. `Ok(None)` means nothing arrived.
    async fn recv_timeout(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, SessionError>;

    async fn close(&mut self);
}

/// Opens transports to a TV address.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Transport: Transport;

    async fn connect(&self, address: IpAddr) -> Result<Self::Transport, SessionError>;
}

/// Wraps `payload` in a frame tagged with the client application string,
/// sends it and waits up to `wait` for a reply.
///
/// Silence comes back as an empty reply; the caller decides whether it
/// matters. Send and receive failures are logged and returned as errors, and
/// a raised `abort` cuts the wait short with [`SessionError::Aborted`].
pub async fn exchange<T: Transport>(
    transport: &mut T,
    app_string: &str,
    payload: &[u8],
    wait: Duration,
    abort: &dyn AbortSignal,
) -> Result<Vec<u8>, SessionError> {
    let frame = codec::encode_frame(app_string.as_bytes(), payload)?;
    if let Err(err) = transport.send(&frame).await {
        tracing::error!(error = %err, frame = %hex(&frame), "send failed");
        return Err(err);
    }
    let received = tokio::select! {
        biased;
        received = transport.recv_timeout(wait) => received,
        _ = abort_raised(abort) => {
            tracing::info!("reply wait aborted");
            return Err(SessionError::Aborted);
        }
    };
    match received {
        Ok(Some(reply)) => {
            tracing::debug!(reply = %hex(&reply), "reply received");
            Ok(reply)
        }
        Ok(None) => Ok(Vec::new()),
        Err(err) => {
            tracing::warn!(error = %err, "no reply");
            Err(err)
        }
    }
}

async fn abort_raised(abort: &dyn AbortSignal) {
    while !abort.is_aborted() {
        tokio::time::sleep(ABORT_CHECK_INTERVAL).await;
    }
}

#[derive(Debug)]
pub struct TcpSession {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpSession {
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self, SessionError> {
        tracing::debug!(%addr, "connecting");
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(SessionError::Connect { addr, source }),
            Err(_) => return Err(SessionError::ConnectTimeout(addr)),
        };
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer: addr })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpSession {
    fn local_ip(&self) -> Option<IpAddr> {
        self.stream.local_addr().ok().map(|addr| addr.ip())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv_timeout(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, SessionError> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        match timeout(wait, self.stream.read(&mut buf)).await {
            Ok(Ok(0)) => Err(SessionError::Closed),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Ok(Err(err)) => Err(SessionError::Io(err)),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.shutdown().await {
            tracing::debug!(error = %err, peer = %self.peer, "shutdown failed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    type Transport = TcpSession;

    async fn connect(&self, address: IpAddr) -> Result<TcpSession, SessionError> {
        let session =
            TcpSession::connect(SocketAddr::new(address, self.port), self.connect_timeout).await?;
        tracing::debug!(peer = %session.peer(), "session open");
        Ok(session)
    }
}
