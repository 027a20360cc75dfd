//! Per-session mutable state: peer identity, negotiated options, block
//! counters, the retained last packet, and transfer metrics.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::protocol::{DEF_BLKSIZE, OptionPair, Packet};
use crate::stream::{FileOps, Sink, Source, read_block};

/// Per-session receive timeout when none is configured.
pub const DEF_TIMEOUT: Duration = Duration::from_secs(5);

/// Retransmissions allowed per session when none is configured.
pub const DEF_RETRIES: u32 = 3;

/// Which side of which transfer direction this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Client fetching a file: sends RRQ, receives DATA.
    ClientDownload,
    /// Client pushing a file: sends WRQ, sends DATA.
    ClientUpload,
    /// Server answering an RRQ: sends DATA.
    ServerSending,
    /// Server answering a WRQ: receives DATA.
    ServerReceiving,
}

impl Role {
    pub(crate) fn is_client(self) -> bool {
        matches!(self, Self::ClientDownload | Self::ClientUpload)
    }
}

/// A cloneable cancellation flag for an in-flight transfer.
///
/// The session checks it immediately before every receive and after every
/// decoded packet; once set, the session sends ERROR 0 "Cancelled" to the
/// peer and stops.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters and timing for one transfer, reported to the caller on success.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    /// Payload bytes moved in the intended direction.
    pub bytes: u64,
    /// Bytes sent again due to timeouts or duplicate ACKs.
    pub resent_bytes: u64,
    /// Duplicate packets received from the peer.
    pub duplicates: u32,
    pub packets_sent: u32,
    pub packets_received: u32,
    started: Option<Instant>,
    finished: Option<Instant>,
}

impl Metrics {
    pub(crate) fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub(crate) fn finish(&mut self) {
        if self.finished.is_none() {
            self.finished = Some(Instant::now());
        }
    }

    /// Wall-clock time between session start and termination.
    pub fn duration(&self) -> Duration {
        match (self.started, self.finished) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Average throughput in kilobits per second, 0.0 when unmeasurable.
    pub fn kbps(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / secs / 1024.0
    }
}

/// Everything the state machine reads and updates while driving one transfer.
pub(crate) struct SessionContext<'a> {
    pub peer_ip: IpAddr,
    /// The peer's port: the well-known server port until the first reply
    /// arrives (client side), the peer's TID thereafter.
    pub peer_port: u16,
    pub tid_frozen: bool,
    pub role: Role,
    pub filename: Vec<u8>,
    pub source: Option<Source<'a>>,
    pub sink: Option<Sink<'a>>,
    /// Stream opener for server roles; `None` on the client, which brings its
    /// own streams.
    pub fs: Option<Box<dyn FileOps + 'a>>,
    /// Options we sent (client) or received (server) with the request.
    pub requested: Vec<OptionPair>,
    /// Options acknowledged in the OACK exchange; empty for plain RFC 1350.
    pub negotiated: Vec<OptionPair>,
    pub blksize: usize,
    pub tsize: Option<u64>,
    pub last_block_sent: u16,
    pub last_block_acked: u16,
    /// Set once the short (or empty) final DATA has been sent; the ACK for it
    /// ends the transfer.
    pub pending_complete: bool,
    /// The last packet we put on the wire, kept verbatim for retransmission.
    pub last_outbound: Option<Packet>,
    pub timeout: Duration,
    /// Configured retransmission budget; `retries_left` refills to this on
    /// every forward-progress event.
    pub retry_budget: u32,
    pub retries_left: u32,
    pub metrics: Metrics,
    pub hook: Option<&'a mut (dyn FnMut(&Packet) + Send)>,
    pub cancel: CancelHandle,
}

impl<'a> SessionContext<'a> {
    pub(crate) fn new(role: Role, peer: SocketAddr, timeout: Duration, retries: u32) -> Self {
        Self {
            peer_ip: peer.ip(),
            peer_port: peer.port(),
            // The server learns the peer TID from the very first datagram;
            // a client only learns it from the first reply.
            tid_frozen: !role.is_client(),
            role,
            filename: Vec::new(),
            source: None,
            sink: None,
            fs: None,
            requested: Vec::new(),
            negotiated: Vec::new(),
            blksize: DEF_BLKSIZE,
            tsize: None,
            last_block_sent: 0,
            last_block_acked: 0,
            pending_complete: false,
            last_outbound: None,
            timeout,
            retry_budget: retries,
            retries_left: retries,
            metrics: Metrics::default(),
            hook: None,
            cancel: CancelHandle::new(),
        }
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        SocketAddr::new(self.peer_ip, self.peer_port)
    }

    pub(crate) fn freeze_tid(&mut self, port: u16) {
        self.peer_port = port;
        self.tid_frozen = true;
    }

    pub(crate) fn reset_retries(&mut self) {
        self.retries_left = self.retry_budget;
    }

    /// Read the next block from the upload source.
    pub(crate) fn read_next_block(&mut self) -> io::Result<Vec<u8>> {
        match self.source.as_mut() {
            Some(src) => read_block(src.as_mut(), self.blksize),
            None => Err(io::Error::other("session has no source stream")),
        }
    }

    /// Append a received payload to the download sink.
    pub(crate) fn write_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.write_all(payload),
            None => Err(io::Error::other("session has no sink stream")),
        }
    }

    /// Flush the sink, if any. Called once on termination.
    pub(crate) fn flush_sink(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }

    /// Invoke the packet hook. A panicking hook is contained and must not
    /// disturb the session.
    pub(crate) fn run_hook(&mut self, pkt: &Packet) {
        if let Some(hook) = self.hook.as_mut()
            && catch_unwind(AssertUnwindSafe(|| hook(pkt))).is_err()
        {
            warn!("packet hook panicked on {pkt}");
        }
    }
}
