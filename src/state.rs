//! The per-session state machine.
//!
//! States are plain data and every transition runs through [`step`], which
//! takes the current state, one event, and the session context, and returns
//! the next state plus at most one packet to put on the wire. Keeping the
//! whole transition table in one function makes the lock-step discipline
//! auditable: no state ever produces more than one outbound packet.

use tracing::{debug, info, warn};

use crate::context::{Role, SessionContext};
use crate::error::TftpError;
use crate::options::{negotiate, validate_oack};
use crate::protocol::{DEF_BLKSIZE, ErrorCode, Packet, Request};

/// The session states. `Finished` and `Errored` are terminal.
#[derive(Debug)]
pub(crate) enum State {
    /// Nothing sent or received yet.
    Start,
    /// Client sent RRQ, awaiting DATA, OACK or ERROR.
    SentRrq,
    /// Client sent WRQ, awaiting ACK(0), OACK or ERROR.
    SentWrq,
    /// Server accepted an RRQ and must open with an OACK or the first DATA.
    ReceivedRrq,
    /// Server accepted a WRQ and must open with an OACK or ACK(0).
    ReceivedWrq,
    /// Downloader awaiting the next DATA.
    ExpectData,
    /// Uploader awaiting the ACK for the last DATA sent.
    ExpectAck,
    Finished,
    Errored(TftpError),
}

impl State {
    /// Transitory server states must immediately produce their opening packet
    /// without waiting for further input.
    pub(crate) fn needs_kick(&self) -> bool {
        matches!(self, Self::ReceivedRrq | Self::ReceivedWrq)
    }
}

/// What drives a transition: session startup, a decoded packet from the
/// frozen-TID peer, or an expired receive wait.
pub(crate) enum Event<'p> {
    Start,
    Packet(&'p Packet),
    Timeout,
}

/// The outcome of one step: the next state and at most one packet to send to
/// the peer.
pub(crate) struct Transition {
    pub next: State,
    pub reply: Option<Packet>,
    /// True when `reply` is a retransmission rather than new traffic.
    pub resend: bool,
}

impl Transition {
    fn to(next: State) -> Self {
        Self {
            next,
            reply: None,
            resend: false,
        }
    }

    fn send(next: State, reply: Packet) -> Self {
        Self {
            next,
            reply: Some(reply),
            resend: false,
        }
    }
}

/// Drive one transition of the session state machine.
pub(crate) fn step(state: State, event: Event<'_>, ctx: &mut SessionContext<'_>) -> Transition {
    match (state, event) {
        (State::Start, Event::Start) => start_client(ctx),
        (State::Start, Event::Packet(pkt)) => accept_first(pkt, ctx),
        (State::ReceivedRrq, Event::Start) => begin_sending(ctx),
        (State::ReceivedWrq, Event::Start) => begin_receiving(ctx),

        (State::SentRrq, Event::Packet(pkt)) => on_sent_rrq(pkt, ctx),
        (State::SentWrq, Event::Packet(pkt)) => on_sent_wrq(pkt, ctx),
        (State::ExpectData, Event::Packet(pkt)) => on_expect_data(pkt, ctx),
        (State::ExpectAck, Event::Packet(pkt)) => on_expect_ack(pkt, ctx),

        (state, Event::Timeout) => on_timeout(state, ctx),

        (state, _) => {
            // The session loop never feeds startup events into a running
            // session or packets into terminal states.
            Transition::to(State::Errored(TftpError::Protocol {
                code: ErrorCode::NotDefined,
                reason: format!("event not handled in state {state:?}"),
                peer: ctx.peer(),
            }))
        }
    }
}

/// Send ERROR `code` to the peer and end the session, blaming the peer.
fn halt(ctx: &mut SessionContext<'_>, code: ErrorCode, reason: String) -> Transition {
    warn!("aborting transfer with {}: {}", ctx.peer(), reason);
    Transition {
        reply: Some(Packet::error(code, reason.as_bytes())),
        next: State::Errored(TftpError::Protocol {
            code,
            reason,
            peer: ctx.peer(),
        }),
        resend: false,
    }
}

/// Send ERROR `code` to the peer and end the session because the request
/// cannot be satisfied locally.
fn reject(ctx: &mut SessionContext<'_>, code: ErrorCode, reason: String) -> Transition {
    info!("rejecting request from {}: {}", ctx.peer(), reason);
    Transition {
        reply: Some(Packet::error(code, reason.as_bytes())),
        next: State::Errored(TftpError::Rejected {
            code,
            reason,
            peer: ctx.peer(),
        }),
        resend: false,
    }
}

/// End the session on an ERROR packet from the peer. Never answered.
fn peer_error(ctx: &mut SessionContext<'_>, code: ErrorCode, message: &[u8]) -> Transition {
    let message = String::from_utf8_lossy(message).into_owned();
    warn!("peer {} reported error {}: {}", ctx.peer(), code, message);
    Transition::to(State::Errored(TftpError::Peer {
        code,
        message,
        peer: ctx.peer(),
    }))
}

/// Client startup: put the request on the wire.
fn start_client(ctx: &mut SessionContext<'_>) -> Transition {
    let request = Request::new(ctx.filename.clone(), ctx.requested.clone());
    let (next, pkt) = match ctx.role {
        Role::ClientDownload => (State::SentRrq, Packet::Rrq(request)),
        Role::ClientUpload => (State::SentWrq, Packet::Wrq(request)),
        _ => {
            return Transition::to(State::Errored(TftpError::Protocol {
                code: ErrorCode::NotDefined,
                reason: "startup event on a server session".into(),
                peer: ctx.peer(),
            }));
        }
    };
    info!(
        "requesting {} of {} from {}",
        if matches!(next, State::SentRrq) { "download" } else { "upload" },
        String::from_utf8_lossy(&ctx.filename),
        ctx.peer(),
    );
    Transition::send(next, pkt)
}

/// Server: the dispatcher delivered the first packet of a new session.
fn accept_first(pkt: &Packet, ctx: &mut SessionContext<'_>) -> Transition {
    match pkt {
        Packet::Rrq(req) => accept_request(req, true, ctx),
        Packet::Wrq(req) => accept_request(req, false, ctx),
        Packet::Error { code, message } => peer_error(ctx, *code, message),
        other => halt(
            ctx,
            ErrorCode::IllegalOperation,
            format!("session must begin with RRQ or WRQ, not {}", other.opcode()),
        ),
    }
}

fn accept_request(req: &Request, is_read: bool, ctx: &mut SessionContext<'_>) -> Transition {
    ctx.role = if is_read { Role::ServerSending } else { Role::ServerReceiving };
    ctx.filename = req.filename.clone();
    ctx.requested = req.options.clone();

    match req.mode() {
        Some(mode) if mode.is_supported() => {}
        _ => {
            return halt(
                ctx,
                ErrorCode::IllegalOperation,
                format!("only octet mode is supported, not {:?}", String::from_utf8_lossy(&req.mode)),
            );
        }
    }

    let Some(fs) = ctx.fs.as_mut() else {
        return halt(
            ctx,
            ErrorCode::NotDefined,
            "server session has no file backend".into(),
        );
    };

    let read_size = if is_read {
        match fs.open_read(&req.filename) {
            Ok((source, size)) => {
                ctx.source = Some(source);
                Some(size)
            }
            Err((code, reason)) => return reject(ctx, code, reason),
        }
    } else {
        match fs.open_write(&req.filename) {
            Ok(sink) => {
                ctx.sink = Some(sink);
                None
            }
            Err((code, reason)) => return reject(ctx, code, reason),
        }
    };

    let outcome = negotiate(&req.options, read_size);
    ctx.blksize = outcome.blksize;
    ctx.tsize = outcome.tsize;
    ctx.negotiated = outcome.reply;

    info!(
        "{} {} for {} (blksize {}, {} option(s) granted)",
        if is_read { "serving" } else { "receiving" },
        req.filename_lossy(),
        ctx.peer(),
        ctx.blksize,
        ctx.negotiated.len(),
    );

    Transition::to(if is_read { State::ReceivedRrq } else { State::ReceivedWrq })
}

/// Server open for a read: OACK if options were granted, otherwise the first
/// DATA block straight away.
fn begin_sending(ctx: &mut SessionContext<'_>) -> Transition {
    if ctx.negotiated.is_empty() {
        send_data(ctx, 1)
    } else {
        ctx.last_block_sent = 0;
        Transition::send(
            State::ExpectAck,
            Packet::Oack {
                options: ctx.negotiated.clone(),
            },
        )
    }
}

/// Server open for a write: OACK if options were granted, otherwise ACK(0).
fn begin_receiving(ctx: &mut SessionContext<'_>) -> Transition {
    ctx.last_block_acked = 0;
    let reply = if ctx.negotiated.is_empty() {
        Packet::Ack { block: 0 }
    } else {
        Packet::Oack {
            options: ctx.negotiated.clone(),
        }
    };
    Transition::send(State::ExpectData, reply)
}

/// Read the next block from the source and send it as `block`.
fn send_data(ctx: &mut SessionContext<'_>, block: u16) -> Transition {
    let payload = match ctx.read_next_block() {
        Ok(payload) => payload,
        Err(err) => {
            return Transition {
                reply: Some(Packet::error(ErrorCode::NotDefined, "failed to read source")),
                next: State::Errored(TftpError::Io(err)),
                resend: false,
            };
        }
    };

    ctx.pending_complete = payload.len() < ctx.blksize;
    ctx.last_block_sent = block;
    ctx.metrics.bytes += payload.len() as u64;
    debug!("sending DATA block {block} ({} bytes)", payload.len());

    Transition::send(State::ExpectAck, Packet::Data { block, payload })
}

/// Write an in-sequence payload, acknowledge it, and finish on a short block.
fn accept_data(ctx: &mut SessionContext<'_>, block: u16, payload: &[u8]) -> Transition {
    if let Err(err) = ctx.write_payload(payload) {
        return Transition {
            reply: Some(Packet::error_with_default(ErrorCode::DiskFull)),
            next: State::Errored(TftpError::Io(err)),
            resend: false,
        };
    }

    ctx.last_block_acked = block;
    ctx.metrics.bytes += payload.len() as u64;
    ctx.reset_retries();

    let next = if payload.len() < ctx.blksize {
        info!("received final block {block}");
        State::Finished
    } else {
        State::ExpectData
    };
    Transition::send(next, Packet::Ack { block })
}

/// Send the retained last packet again.
fn resend_last(ctx: &mut SessionContext<'_>, next: State) -> Transition {
    match ctx.last_outbound.clone() {
        Some(pkt) => Transition {
            next,
            reply: Some(pkt),
            resend: true,
        },
        // Awaiting states always have a retained packet; reaching this means
        // the session loop skipped a send.
        None => Transition::to(State::Errored(TftpError::Protocol {
            code: ErrorCode::NotDefined,
            reason: "nothing retained to retransmit".into(),
            peer: ctx.peer(),
        })),
    }
}

fn on_sent_rrq(pkt: &Packet, ctx: &mut SessionContext<'_>) -> Transition {
    match pkt {
        Packet::Oack { options } => match validate_oack(options, &ctx.requested) {
            Ok(applied) => {
                if let Some(blksize) = applied.blksize {
                    ctx.blksize = blksize;
                }
                if let Some(tsize) = applied.tsize {
                    info!("server reports transfer size of {tsize} bytes");
                    ctx.tsize = Some(tsize);
                }
                ctx.negotiated = options.clone();
                ctx.last_block_acked = 0;
                ctx.reset_retries();
                Transition::send(State::ExpectData, Packet::Ack { block: 0 })
            }
            Err(reason) => {
                warn!("rejecting OACK from {}: {}", ctx.peer(), reason);
                Transition {
                    reply: Some(Packet::error(ErrorCode::OptionNegotiation, reason.as_bytes())),
                    next: State::Errored(TftpError::Negotiation {
                        reason,
                        peer: ctx.peer(),
                    }),
                    resend: false,
                }
            }
        },
        Packet::Data { block, payload } => {
            if *block != 1 {
                return halt(
                    ctx,
                    ErrorCode::IllegalOperation,
                    format!("first DATA block is {block}, expected 1"),
                );
            }
            // The server ignored our options; fall back to the defaults.
            if !ctx.requested.is_empty() {
                debug!("server declined options, using blksize {DEF_BLKSIZE}");
            }
            ctx.negotiated.clear();
            ctx.blksize = DEF_BLKSIZE;
            ctx.tsize = None;
            accept_data(ctx, *block, payload)
        }
        Packet::Error { code, message } => peer_error(ctx, *code, message),
        other => halt(
            ctx,
            ErrorCode::IllegalOperation,
            format!("expected OACK or DATA after RRQ, got {}", other.opcode()),
        ),
    }
}

fn on_sent_wrq(pkt: &Packet, ctx: &mut SessionContext<'_>) -> Transition {
    match pkt {
        Packet::Oack { options } => match validate_oack(options, &ctx.requested) {
            Ok(applied) => {
                if let Some(blksize) = applied.blksize {
                    ctx.blksize = blksize;
                }
                if let Some(tsize) = applied.tsize {
                    ctx.tsize = Some(tsize);
                }
                ctx.negotiated = options.clone();
                ctx.reset_retries();
                send_data(ctx, 1)
            }
            Err(reason) => {
                warn!("rejecting OACK from {}: {}", ctx.peer(), reason);
                Transition {
                    reply: Some(Packet::error(ErrorCode::OptionNegotiation, reason.as_bytes())),
                    next: State::Errored(TftpError::Negotiation {
                        reason,
                        peer: ctx.peer(),
                    }),
                    resend: false,
                }
            }
        },
        Packet::Ack { block: 0 } => {
            // The server ignored our options; fall back to the defaults.
            if !ctx.requested.is_empty() {
                debug!("server declined options, using blksize {DEF_BLKSIZE}");
            }
            ctx.negotiated.clear();
            ctx.blksize = DEF_BLKSIZE;
            ctx.tsize = None;
            ctx.reset_retries();
            send_data(ctx, 1)
        }
        Packet::Ack { block } => {
            warn!("discarding ACK for block {block} while awaiting the reply to our WRQ");
            Transition::to(State::SentWrq)
        }
        Packet::Error { code, message } => peer_error(ctx, *code, message),
        other => halt(
            ctx,
            ErrorCode::IllegalOperation,
            format!("expected OACK or ACK after WRQ, got {}", other.opcode()),
        ),
    }
}

fn on_expect_data(pkt: &Packet, ctx: &mut SessionContext<'_>) -> Transition {
    match pkt {
        Packet::Data { block, payload } => {
            let expected = ctx.last_block_acked.wrapping_add(1);
            if *block == expected {
                accept_data(ctx, *block, payload)
            } else if *block == ctx.last_block_acked {
                // The peer missed our ACK; repeat it. Costs no retries.
                ctx.metrics.duplicates += 1;
                debug!("duplicate DATA block {block}, acknowledging again");
                Transition::send(State::ExpectData, Packet::Ack { block: *block })
            } else {
                halt(
                    ctx,
                    ErrorCode::IllegalOperation,
                    format!("DATA block {block} out of sequence, expected {expected}"),
                )
            }
        }
        Packet::Error { code, message } => peer_error(ctx, *code, message),
        other => halt(
            ctx,
            ErrorCode::IllegalOperation,
            format!("expected DATA, got {}", other.opcode()),
        ),
    }
}

fn on_expect_ack(pkt: &Packet, ctx: &mut SessionContext<'_>) -> Transition {
    match pkt {
        Packet::Ack { block } => {
            if *block == ctx.last_block_sent {
                ctx.reset_retries();
                if ctx.pending_complete {
                    info!("final block {block} acknowledged");
                    Transition::to(State::Finished)
                } else {
                    send_data(ctx, ctx.last_block_sent.wrapping_add(1))
                }
            } else if *block == ctx.last_block_sent.wrapping_sub(1) {
                // The peer missed our DATA; send it again. Costs no retries.
                ctx.metrics.duplicates += 1;
                debug!("duplicate ACK for block {block}, resending DATA");
                resend_last(ctx, State::ExpectAck)
            } else {
                halt(
                    ctx,
                    ErrorCode::IllegalOperation,
                    format!("ACK for block {block}, expected {}", ctx.last_block_sent),
                )
            }
        }
        Packet::Error { code, message } => peer_error(ctx, *code, message),
        other => halt(
            ctx,
            ErrorCode::IllegalOperation,
            format!("expected ACK, got {}", other.opcode()),
        ),
    }
}

fn on_timeout(state: State, ctx: &mut SessionContext<'_>) -> Transition {
    match state {
        State::SentRrq | State::SentWrq | State::ExpectData | State::ExpectAck => {
            if ctx.retries_left > 0 {
                ctx.retries_left -= 1;
                warn!(
                    "timeout waiting for {}, resending ({} retries left)",
                    ctx.peer(),
                    ctx.retries_left
                );
                resend_last(ctx, state)
            } else {
                warn!("retry budget exhausted waiting for {}", ctx.peer());
                Transition::to(State::Errored(TftpError::TimedOut { peer: ctx.peer() }))
            }
        }
        // Terminal and transitory states have nothing to wait for.
        other => Transition::to(other),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::protocol::OptionPair;
    use crate::stream::{FileOps, Sink, Source, memory_source};

    const PEER: &str = "127.0.0.1:49152";

    /// A sink the test keeps visibility into after moving it in.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// A file backend with one readable file and an always-writable sink.
    struct OneFileFs {
        name: &'static [u8],
        content: Vec<u8>,
        written: SharedBuf,
    }

    impl FileOps for OneFileFs {
        fn open_read(&mut self, filename: &[u8]) -> Result<(Source<'static>, u64), (ErrorCode, String)> {
            if filename == self.name {
                let size = self.content.len() as u64;
                Ok((memory_source(self.content.clone()), size))
            } else {
                Err((ErrorCode::FileNotFound, "File not found".into()))
            }
        }

        fn open_write(&mut self, _filename: &[u8]) -> Result<Sink<'static>, (ErrorCode, String)> {
            Ok(Box::new(self.written.clone()))
        }
    }

    fn server_ctx(fs: OneFileFs) -> SessionContext<'static> {
        let mut ctx = SessionContext::new(
            Role::ServerSending,
            PEER.parse().unwrap(),
            Duration::from_secs(5),
            3,
        );
        ctx.fs = Some(Box::new(fs));
        ctx
    }

    fn client_ctx(role: Role) -> SessionContext<'static> {
        let mut ctx = SessionContext::new(role, "127.0.0.1:69".parse().unwrap(), Duration::from_secs(5), 3);
        ctx.filename = b"foo".to_vec();
        ctx
    }

    /// Emulate the session loop for one event: step, then retain the reply
    /// the way the loop would.
    fn drive_step(ctx: &mut SessionContext<'_>, state: State, event: Event<'_>) -> (State, Option<Packet>) {
        let tr = step(state, event, ctx);
        if let Some(pkt) = &tr.reply {
            ctx.last_outbound = Some(pkt.clone());
        }
        (tr.next, tr.reply)
    }

    fn rrq(filename: &[u8], options: &[(&str, &str)]) -> Packet {
        Packet::Rrq(Request::new(
            filename,
            options.iter().map(|(n, v)| OptionPair::new(*n, *v)).collect(),
        ))
    }

    #[test]
    fn server_serves_small_file_without_options() {
        let fs = OneFileFs {
            name: b"foo",
            content: vec![7u8; 600],
            written: SharedBuf::default(),
        };
        let mut ctx = server_ctx(fs);

        let first = rrq(b"foo", &[]);
        let (state, reply) = drive_step(&mut ctx, State::Start, Event::Packet(&first));
        assert!(matches!(state, State::ReceivedRrq));
        assert!(reply.is_none());

        // The opening kick emits DATA(1) with a full default-size block.
        let (state, reply) = drive_step(&mut ctx, state, Event::Start);
        assert!(matches!(state, State::ExpectAck));
        match reply.unwrap() {
            Packet::Data { block: 1, payload } => assert_eq!(payload.len(), 512),
            other => panic!("unexpected reply {other}"),
        }

        let ack1 = Packet::Ack { block: 1 };
        let (state, reply) = drive_step(&mut ctx, state, Event::Packet(&ack1));
        assert!(matches!(state, State::ExpectAck));
        match reply.unwrap() {
            Packet::Data { block: 2, payload } => assert_eq!(payload.len(), 88),
            other => panic!("unexpected reply {other}"),
        }
        assert!(ctx.pending_complete);

        let ack2 = Packet::Ack { block: 2 };
        let (state, reply) = drive_step(&mut ctx, state, Event::Packet(&ack2));
        assert!(matches!(state, State::Finished));
        assert!(reply.is_none());
        assert_eq!(ctx.metrics.bytes, 600);
    }

    #[test]
    fn server_oacks_blksize_and_tsize() {
        let fs = OneFileFs {
            name: b"foo",
            content: vec![1u8; 2000],
            written: SharedBuf::default(),
        };
        let mut ctx = server_ctx(fs);

        let first = rrq(b"foo", &[("blksize", "1024"), ("tsize", "0")]);
        let (state, _) = drive_step(&mut ctx, State::Start, Event::Packet(&first));
        let (state, reply) = drive_step(&mut ctx, state, Event::Start);
        assert!(matches!(state, State::ExpectAck));
        match reply.unwrap() {
            Packet::Oack { options } => {
                assert_eq!(options[0], OptionPair::new("blksize", "1024"));
                assert_eq!(options[1], OptionPair::new("tsize", "2000"));
            }
            other => panic!("unexpected reply {other}"),
        }
        assert_eq!(ctx.blksize, 1024);
        assert_eq!(ctx.last_block_sent, 0);

        // ACK(0) answers the OACK, then data flows at the new block size.
        let ack0 = Packet::Ack { block: 0 };
        let (state, reply) = drive_step(&mut ctx, state, Event::Packet(&ack0));
        assert!(matches!(state, State::ExpectAck));
        match reply.unwrap() {
            Packet::Data { block: 1, payload } => assert_eq!(payload.len(), 1024),
            other => panic!("unexpected reply {other}"),
        }
    }

    #[test]
    fn server_rejects_missing_file() {
        let fs = OneFileFs {
            name: b"foo",
            content: Vec::new(),
            written: SharedBuf::default(),
        };
        let mut ctx = server_ctx(fs);

        let first = rrq(b"nope", &[]);
        let tr = step(State::Start, Event::Packet(&first), &mut ctx);
        match &tr.reply {
            Some(Packet::Error { code, .. }) => assert_eq!(*code, ErrorCode::FileNotFound),
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(matches!(
            tr.next,
            State::Errored(TftpError::Rejected {
                code: ErrorCode::FileNotFound,
                ..
            })
        ));
    }

    #[test]
    fn server_rejects_netascii() {
        let fs = OneFileFs {
            name: b"foo",
            content: Vec::new(),
            written: SharedBuf::default(),
        };
        let mut ctx = server_ctx(fs);

        let mut req = Request::new("foo", Vec::new());
        req.mode = b"netascii".to_vec();
        let first = Packet::Rrq(req);
        let tr = step(State::Start, Event::Packet(&first), &mut ctx);
        match &tr.reply {
            Some(Packet::Error { code, .. }) => assert_eq!(*code, ErrorCode::IllegalOperation),
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(matches!(tr.next, State::Errored(_)));
    }

    #[test]
    fn server_receives_write_with_ack0() {
        let written = SharedBuf::default();
        let fs = OneFileFs {
            name: b"foo",
            content: Vec::new(),
            written: written.clone(),
        };
        let mut ctx = server_ctx(fs);

        let first = Packet::Wrq(Request::new("up.bin", Vec::new()));
        let (state, _) = drive_step(&mut ctx, State::Start, Event::Packet(&first));
        assert!(matches!(state, State::ReceivedWrq));

        let (state, reply) = drive_step(&mut ctx, state, Event::Start);
        assert!(matches!(state, State::ExpectData));
        assert_eq!(reply.unwrap(), Packet::Ack { block: 0 });

        let data = Packet::Data {
            block: 1,
            payload: vec![9u8; 100],
        };
        let (state, reply) = drive_step(&mut ctx, state, Event::Packet(&data));
        assert!(matches!(state, State::Finished));
        assert_eq!(reply.unwrap(), Packet::Ack { block: 1 });
        assert_eq!(written.contents(), vec![9u8; 100]);
    }

    #[test]
    fn client_download_handles_declined_options() {
        let mut ctx = client_ctx(Role::ClientDownload);
        ctx.requested = vec![OptionPair::new("blksize", "8192")];
        ctx.blksize = 8192;

        let (state, reply) = drive_step(&mut ctx, State::Start, Event::Start);
        assert!(matches!(state, State::SentRrq));
        assert!(matches!(reply.unwrap(), Packet::Rrq(_)));

        let sink = SharedBuf::default();
        ctx.sink = Some(Box::new(sink.clone()));

        // Server answers DATA(1) directly: options are discarded, 512 rules.
        let data = Packet::Data {
            block: 1,
            payload: vec![3u8; 512],
        };
        let (state, reply) = drive_step(&mut ctx, state, Event::Packet(&data));
        assert!(matches!(state, State::ExpectData));
        assert_eq!(reply.unwrap(), Packet::Ack { block: 1 });
        assert_eq!(ctx.blksize, 512);

        let last = Packet::Data {
            block: 2,
            payload: vec![3u8; 40],
        };
        let (state, _) = drive_step(&mut ctx, state, Event::Packet(&last));
        assert!(matches!(state, State::Finished));
        assert_eq!(sink.contents().len(), 552);
    }

    #[test]
    fn client_download_acks_oack() {
        let mut ctx = client_ctx(Role::ClientDownload);
        ctx.requested = vec![OptionPair::new("blksize", "1024"), OptionPair::new("tsize", "0")];

        let (state, _) = drive_step(&mut ctx, State::Start, Event::Start);
        let oack = Packet::Oack {
            options: vec![OptionPair::new("blksize", "1024"), OptionPair::new("tsize", "4000")],
        };
        let (state, reply) = drive_step(&mut ctx, state, Event::Packet(&oack));
        assert!(matches!(state, State::ExpectData));
        assert_eq!(reply.unwrap(), Packet::Ack { block: 0 });
        assert_eq!(ctx.blksize, 1024);
        assert_eq!(ctx.tsize, Some(4000));
    }

    #[test]
    fn client_rejects_unrequested_oack_option() {
        let mut ctx = client_ctx(Role::ClientDownload);
        ctx.requested = vec![OptionPair::new("blksize", "1024")];

        let (state, _) = drive_step(&mut ctx, State::Start, Event::Start);
        let oack = Packet::Oack {
            options: vec![OptionPair::new("timeout", "3")],
        };
        let tr = step(state, Event::Packet(&oack), &mut ctx);
        match &tr.reply {
            Some(Packet::Error { code, .. }) => assert_eq!(*code, ErrorCode::OptionNegotiation),
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(matches!(tr.next, State::Errored(TftpError::Negotiation { .. })));
    }

    #[test]
    fn client_upload_sends_first_data_after_ack0() {
        let mut ctx = client_ctx(Role::ClientUpload);
        ctx.source = Some(memory_source(vec![5u8; 700]));

        let (state, reply) = drive_step(&mut ctx, State::Start, Event::Start);
        assert!(matches!(state, State::SentWrq));
        assert!(matches!(reply.unwrap(), Packet::Wrq(_)));

        let ack0 = Packet::Ack { block: 0 };
        let (state, reply) = drive_step(&mut ctx, state, Event::Packet(&ack0));
        assert!(matches!(state, State::ExpectAck));
        match reply.unwrap() {
            Packet::Data { block: 1, payload } => assert_eq!(payload.len(), 512),
            other => panic!("unexpected reply {other}"),
        }
        assert!(!ctx.pending_complete);
    }

    #[test]
    fn duplicate_data_is_reacked_without_advancing() {
        let mut ctx = client_ctx(Role::ClientDownload);
        let sink = SharedBuf::default();
        ctx.sink = Some(Box::new(sink.clone()));
        ctx.last_block_acked = 3;

        let dup = Packet::Data {
            block: 3,
            payload: vec![1u8; 512],
        };
        let retries_before = ctx.retries_left;
        let (state, reply) = drive_step(&mut ctx, State::ExpectData, Event::Packet(&dup));
        assert!(matches!(state, State::ExpectData));
        assert_eq!(reply.unwrap(), Packet::Ack { block: 3 });
        assert_eq!(ctx.last_block_acked, 3);
        assert_eq!(ctx.retries_left, retries_before);
        // The duplicate payload is never written.
        assert!(sink.contents().is_empty());
        assert_eq!(ctx.metrics.duplicates, 1);
    }

    #[test]
    fn future_data_block_is_fatal() {
        let mut ctx = client_ctx(Role::ClientDownload);
        ctx.sink = Some(Box::new(SharedBuf::default()));
        ctx.last_block_acked = 3;

        let future = Packet::Data {
            block: 7,
            payload: vec![0u8; 10],
        };
        let tr = step(State::ExpectData, Event::Packet(&future), &mut ctx);
        match &tr.reply {
            Some(Packet::Error { code, .. }) => assert_eq!(*code, ErrorCode::IllegalOperation),
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(matches!(tr.next, State::Errored(_)));
    }

    #[test]
    fn duplicate_ack_triggers_data_resend() {
        let mut ctx = client_ctx(Role::ClientUpload);
        ctx.source = Some(memory_source(vec![0u8; 2000]));
        ctx.last_block_sent = 4;
        let sent = Packet::Data {
            block: 4,
            payload: vec![0u8; 512],
        };
        ctx.last_outbound = Some(sent.clone());

        let dup = Packet::Ack { block: 3 };
        let retries_before = ctx.retries_left;
        let tr = step(State::ExpectAck, Event::Packet(&dup), &mut ctx);
        assert!(tr.resend);
        assert_eq!(tr.reply.unwrap(), sent);
        assert_eq!(ctx.retries_left, retries_before);
        assert!(matches!(tr.next, State::ExpectAck));
    }

    #[test]
    fn timeout_resends_until_budget_is_gone() {
        let mut ctx = client_ctx(Role::ClientDownload);
        ctx.retry_budget = 2;
        ctx.retries_left = 2;
        ctx.last_outbound = Some(Packet::Ack { block: 5 });
        ctx.last_block_acked = 5;

        let tr = step(State::ExpectData, Event::Timeout, &mut ctx);
        assert!(tr.resend);
        assert_eq!(ctx.retries_left, 1);

        let tr = step(State::ExpectData, Event::Timeout, &mut ctx);
        assert!(tr.resend);
        assert_eq!(ctx.retries_left, 0);

        let tr = step(State::ExpectData, Event::Timeout, &mut ctx);
        assert!(tr.reply.is_none());
        assert!(matches!(tr.next, State::Errored(TftpError::TimedOut { .. })));
    }

    #[test]
    fn peer_error_terminates_without_reply() {
        let mut ctx = client_ctx(Role::ClientDownload);
        let err = Packet::error_with_default(ErrorCode::DiskFull);
        let tr = step(State::ExpectData, Event::Packet(&err), &mut ctx);
        assert!(tr.reply.is_none());
        assert!(matches!(
            tr.next,
            State::Errored(TftpError::Peer {
                code: ErrorCode::DiskFull,
                ..
            })
        ));
    }

    #[test]
    fn block_counter_wraps_to_zero() {
        let mut ctx = client_ctx(Role::ClientUpload);
        // Enough for the wrap block plus a short tail.
        ctx.source = Some(memory_source(vec![0u8; 520]));
        ctx.last_block_sent = 65535;
        ctx.pending_complete = false;

        let ack = Packet::Ack { block: 65535 };
        let (state, reply) = drive_step(&mut ctx, State::ExpectAck, Event::Packet(&ack));
        match reply.unwrap() {
            Packet::Data { block: 0, payload } => assert_eq!(payload.len(), 512),
            other => panic!("unexpected reply {other}"),
        }
        assert!(matches!(state, State::ExpectAck));
        assert_eq!(ctx.last_block_sent, 0);

        // And the receiving side expects 0 after 65535 too.
        let mut rx = client_ctx(Role::ClientDownload);
        rx.sink = Some(Box::new(SharedBuf::default()));
        rx.last_block_acked = 65535;
        let data = Packet::Data {
            block: 0,
            payload: vec![2u8; 100],
        };
        let (state, reply) = drive_step(&mut rx, State::ExpectData, Event::Packet(&data));
        assert_eq!(reply.unwrap(), Packet::Ack { block: 0 });
        assert!(matches!(state, State::Finished));
    }

    #[test]
    fn exact_multiple_upload_ends_with_empty_block() {
        let mut ctx = client_ctx(Role::ClientUpload);
        ctx.source = Some(memory_source(vec![0u8; 1024]));
        ctx.negotiated.clear();

        let ack0 = Packet::Ack { block: 0 };
        let (state, _) = drive_step(&mut ctx, State::SentWrq, Event::Packet(&ack0));
        assert!(!ctx.pending_complete);

        let (state, _) = drive_step(&mut ctx, state, Event::Packet(&Packet::Ack { block: 1 }));
        assert!(!ctx.pending_complete);

        // Block 3 is the empty terminator.
        let (state, reply) = drive_step(&mut ctx, state, Event::Packet(&Packet::Ack { block: 2 }));
        match reply.unwrap() {
            Packet::Data { block: 3, payload } => assert!(payload.is_empty()),
            other => panic!("unexpected reply {other}"),
        }
        assert!(ctx.pending_complete);

        let (state, reply) = drive_step(&mut ctx, state, Event::Packet(&Packet::Ack { block: 3 }));
        assert!(matches!(state, State::Finished));
        assert!(reply.is_none());
    }
}
