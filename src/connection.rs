use std::{
    fmt, io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use log::{debug, error};
use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};

use crate::error::{CloseCause, ConnectError, ErrorKind};

/// Pool-assigned connection identifier. Ids are allocated monotonically and
/// never reused within a run; the scheduler tie-breaks on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Byte-stream seam the harness drips into. Plain TCP ships; a TLS wrapper
/// only has to implement this.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Non-blocking probe of the read side. The OS keeps accepting writes
    /// after the peer half-closes, so a FIN is only visible here.
    fn peer_closed(&mut self) -> io::Result<bool>;

    async fn shutdown(&mut self) -> io::Result<()>;
}

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub async fn connect(addr: SocketAddr, limit: Duration) -> Result<Self, ConnectError> {
        let stream = match timeout(limit, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(ConnectError::classify(err)),
            Err(_) => return Err(ConnectError::Timeout),
        };
        if dotenvy::var("NO_NODELAY").is_err() {
            if let Err(e) = stream.set_nodelay(true) {
                error!("Failed to set TCP_NODELAY: {e}");
            }
        }
        Ok(Self { stream })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await
    }

    fn peer_closed(&mut self) -> io::Result<bool> {
        let mut scratch = [0u8; 64];
        loop {
            match self.stream.try_read(&mut scratch) {
                Ok(0) => return Ok(true),
                // Response bytes ahead of the close (e.g. a 408) are drained
                // and discarded; the request is never going to complete.
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// Why the harness closed a connection from its own side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Run duration elapsed with the connection still open.
    RunComplete,
    /// Operator stop or harness-level abort.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    PeerClosed { cause: CloseCause, alive: Duration },
    HarnessClosed { reason: CloseReason },
    Errored { kind: ErrorKind },
}

impl ConnState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Connecting | Self::Open)
    }
}

/// One slow client. State only ever moves forward:
/// `Connecting -> Open -> (PeerClosed | HarnessClosed | Errored)`, and every
/// terminal transition releases the transport.
pub struct Connection {
    id: ConnId,
    transport: Option<Box<dyn Transport>>,
    state: ConnState,
    created_at: Instant,
    last_write_at: Option<Instant>,
    bytes_sent: u64,
    drip_interval: Duration,
    seq: u64,
}

impl Connection {
    pub fn new(id: ConnId, drip_interval: Duration) -> Self {
        Self {
            id,
            transport: None,
            state: ConnState::Connecting,
            created_at: Instant::now(),
            last_write_at: None,
            bytes_sent: 0,
            drip_interval,
            seq: 0,
        }
    }

    /// Constructs an already-open connection over a caller-supplied
    /// transport. This is the seam a TLS (or in-test scripted) transport
    /// plugs into.
    pub fn with_transport(
        id: ConnId,
        drip_interval: Duration,
        transport: Box<dyn Transport>,
    ) -> Self {
        let mut conn = Self::new(id, drip_interval);
        conn.transport = Some(transport);
        conn.state = ConnState::Open;
        conn
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn drip_interval(&self) -> Duration {
        self.drip_interval
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn last_write_at(&self) -> Option<Instant> {
        self.last_write_at
    }

    pub async fn open(
        &mut self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<(), ConnectError> {
        match TcpTransport::connect(addr, connect_timeout).await {
            Ok(transport) => {
                self.transport = Some(Box::new(transport));
                self.state = ConnState::Open;
                Ok(())
            }
            Err(err) => {
                debug!("connection {} failed to open: {err}", self.id);
                self.state = ConnState::Errored { kind: err.kind() };
                Err(err)
            }
        }
    }

    /// Writes the request line and the keep-alive headers. The terminating
    /// blank line is withheld for the lifetime of the connection; that is
    /// the entire point of the harness.
    pub async fn send_preamble(
        &mut self,
        method: &str,
        path: &str,
        host: &str,
        write_timeout: Duration,
    ) {
        let preamble =
            format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\nConnection: keep-alive\r\n");
        self.write_slow(preamble.as_bytes(), write_timeout).await;
    }

    /// One incremental header line, preceded by an EOF probe so a peer that
    /// already hung up is recorded as such instead of as a write error.
    pub async fn drip(&mut self, label: &str, write_timeout: Duration) {
        if !matches!(self.state, ConnState::Open) {
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match transport.peer_closed() {
            Ok(true) => {
                self.enter_peer_closed(CloseCause::Eof);
                return;
            }
            Ok(false) => {}
            Err(err) => {
                self.absorb_io_error(err);
                return;
            }
        }
        self.seq += 1;
        let line = format!("{label}: {}\r\n", self.seq);
        self.write_slow(line.as_bytes(), write_timeout).await;
    }

    /// `Open -> HarnessClosed`; idempotent once terminal.
    pub async fn close(&mut self, reason: CloseReason) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.shutdown().await;
        }
        self.state = ConnState::HarnessClosed { reason };
    }

    /// Non-awaiting teardown for when the shutdown grace period is spent.
    pub fn abort(&mut self, reason: CloseReason) {
        if self.state.is_terminal() {
            return;
        }
        self.transport = None;
        self.state = ConnState::HarnessClosed { reason };
    }

    async fn write_slow(&mut self, buf: &[u8], limit: Duration) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match timeout(limit, transport.send(buf)).await {
            Ok(Ok(())) => {
                self.bytes_sent += buf.len() as u64;
                self.last_write_at = Some(Instant::now());
            }
            Ok(Err(err)) => self.absorb_io_error(err),
            Err(_) => self.fail(ErrorKind::WriteTimeout),
        }
    }

    fn absorb_io_error(&mut self, err: io::Error) {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => self.enter_peer_closed(CloseCause::Reset),
            io::ErrorKind::UnexpectedEof => self.enter_peer_closed(CloseCause::Eof),
            _ => {
                debug!("connection {} errored: {err}", self.id);
                self.fail(ErrorKind::Io);
            }
        }
    }

    fn enter_peer_closed(&mut self, cause: CloseCause) {
        let alive = self.created_at.elapsed();
        self.transport = None;
        self.state = ConnState::PeerClosed { cause, alive };
        debug!(
            "connection {} closed by peer ({cause:?}) after {}ms",
            self.id,
            alive.as_millis()
        );
    }

    fn fail(&mut self, kind: ErrorKind) {
        self.transport = None;
        self.state = ConnState::Errored { kind };
    }
}
