//! The session event loop.
//!
//! One session is one logical thread of control: it blocks on the endpoint
//! receive, feeds whatever happens (packet, timeout, cancellation) through the
//! state machine, puts the machine's reply on the wire, and repeats until a
//! terminal state. Stray-TID handling and the cancel checks live here so the
//! state machine itself stays a pure packet-in/packet-out function.

use tracing::{debug, info, warn};

use crate::context::{Metrics, Role, SessionContext};
use crate::endpoint::Endpoint;
use crate::error::TftpError;
use crate::protocol::{ErrorCode, Packet};
use crate::state::{Event, State, Transition, step};

/// Run a session over `endpoint` until it terminates.
///
/// Client sessions pass `None` and open with their own request; server
/// sessions pass the dispatcher-delivered first packet.
pub(crate) async fn drive<E: Endpoint>(
    endpoint: &E,
    ctx: &mut SessionContext<'_>,
    first_packet: Option<&Packet>,
) -> Result<Metrics, TftpError> {
    ctx.metrics.start();
    let outcome = run_loop(endpoint, ctx, first_packet).await;
    ctx.metrics.finish();

    let flushed = ctx.flush_sink();
    match outcome {
        Ok(()) => {
            flushed?;
            if matches!(ctx.role, Role::ClientDownload)
                && let Some(expected) = ctx.tsize
                && expected != ctx.metrics.bytes
            {
                warn!(
                    "received {} bytes but the server announced {expected}",
                    ctx.metrics.bytes
                );
            }
            info!(
                "transfer of {} with {} finished: {} bytes in {:?} ({:.1} kbps)",
                String::from_utf8_lossy(&ctx.filename),
                ctx.peer(),
                ctx.metrics.bytes,
                ctx.metrics.duration(),
                ctx.metrics.kbps(),
            );
            Ok(ctx.metrics.clone())
        }
        Err(err) => Err(err),
    }
}

async fn run_loop<E: Endpoint>(
    endpoint: &E,
    ctx: &mut SessionContext<'_>,
    first_packet: Option<&Packet>,
) -> Result<(), TftpError> {
    let mut state = match first_packet {
        Some(pkt) => {
            ctx.metrics.packets_received += 1;
            ctx.run_hook(pkt);
            let tr = step(State::Start, Event::Packet(pkt), ctx);
            apply(endpoint, ctx, tr).await?
        }
        None => {
            let tr = step(State::Start, Event::Start, ctx);
            apply(endpoint, ctx, tr).await?
        }
    };

    loop {
        // Transitory server states owe the peer an opening packet.
        while state.needs_kick() {
            let tr = step(state, Event::Start, ctx);
            state = apply(endpoint, ctx, tr).await?;
        }

        match state {
            State::Finished => return Ok(()),
            State::Errored(err) => return Err(err),
            _ => {}
        }

        if ctx.cancel.is_cancelled() {
            return bail_cancelled(endpoint, ctx).await;
        }

        let Some((datagram, from)) = endpoint.receive(ctx.timeout).await? else {
            let tr = step(state, Event::Timeout, ctx);
            state = apply(endpoint, ctx, tr).await?;
            continue;
        };

        if from.ip() != ctx.peer_ip {
            warn!("discarding datagram from unexpected host {from}");
            continue;
        }

        if ctx.tid_frozen && from.port() != ctx.peer_port {
            // Same host, wrong TID: answer that port, leave the session alone.
            let stray = Packet::error_with_default(ErrorCode::UnknownTransferId);
            let _ = endpoint.send(&stray.to_bytes(), from).await;
            warn!("answered stray datagram from {from} with an unknown-TID error");
            continue;
        }

        ctx.metrics.packets_received += 1;

        let pkt = match Packet::from_bytes(&datagram) {
            Ok(pkt) => pkt,
            Err(reason) => {
                let reply = Packet::error(ErrorCode::IllegalOperation, reason.to_string());
                let _ = endpoint.send(&reply.to_bytes(), from).await;
                return Err(TftpError::Malformed { reason, peer: from });
            }
        };

        if !ctx.tid_frozen {
            ctx.freeze_tid(from.port());
            debug!("peer transfer ID fixed at port {}", from.port());
        }

        ctx.run_hook(&pkt);

        if ctx.cancel.is_cancelled() {
            return bail_cancelled(endpoint, ctx).await;
        }

        debug!("handling {pkt}");
        let tr = step(state, Event::Packet(&pkt), ctx);
        state = apply(endpoint, ctx, tr).await?;
    }
}

/// Put a transition's reply on the wire and retain it for retransmission.
async fn apply<E: Endpoint>(
    endpoint: &E,
    ctx: &mut SessionContext<'_>,
    tr: Transition,
) -> Result<State, TftpError> {
    if let Some(reply) = tr.reply {
        let bytes = reply.to_bytes();
        endpoint.send(&bytes, ctx.peer()).await?;
        ctx.metrics.packets_sent += 1;
        if tr.resend {
            ctx.metrics.resent_bytes += bytes.len() as u64;
        }
        ctx.run_hook(&reply);
        ctx.last_outbound = Some(reply);
    }
    Ok(tr.next)
}

async fn bail_cancelled<E: Endpoint>(endpoint: &E, ctx: &mut SessionContext<'_>) -> Result<(), TftpError> {
    info!("transfer with {} cancelled locally", ctx.peer());
    let reply = Packet::error(ErrorCode::NotDefined, "Cancelled");
    let _ = endpoint.send(&reply.to_bytes(), ctx.peer()).await;
    Err(TftpError::Cancelled { peer: ctx.peer() })
}
