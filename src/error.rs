//! The structured failure type surfaced to session callers.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::protocol::{DecodeError, ErrorCode};

/// Why a transfer ended in failure.
///
/// Every variant that involves a peer carries its address; variants that
/// correspond to a wire ERROR carry the code that was sent or received.
#[derive(Debug)]
pub enum TftpError {
    /// The peer sent an ERROR packet.
    Peer {
        code: ErrorCode,
        message: String,
        peer: SocketAddr,
    },
    /// The retry budget ran out waiting for a reply. Nothing is sent on the
    /// wire for this.
    TimedOut { peer: SocketAddr },
    /// The peer sent a datagram that does not decode as a TFTP packet. We
    /// answer with ERROR 4 and give up.
    Malformed {
        reason: DecodeError,
        peer: SocketAddr,
    },
    /// An OACK carried an unknown or unrequested option. We answer with
    /// ERROR 8 and give up.
    Negotiation { reason: String, peer: SocketAddr },
    /// The peer violated the protocol in a decodable way, e.g. a block number
    /// from the future. Carries the code we answered with.
    Protocol {
        code: ErrorCode,
        reason: String,
        peer: SocketAddr,
    },
    /// A request could not be satisfied locally (file missing, access denied,
    /// disk full); we answered with the mapped wire ERROR.
    Rejected {
        code: ErrorCode,
        reason: String,
        peer: SocketAddr,
    },
    /// The session was cancelled locally.
    Cancelled { peer: SocketAddr },
    /// The datagram endpoint or a stream failed.
    Io(io::Error),
}

impl TftpError {
    /// The wire error code associated with this failure, if any.
    pub fn wire_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Peer { code, .. } | Self::Protocol { code, .. } | Self::Rejected { code, .. } => Some(*code),
            Self::Malformed { .. } => Some(ErrorCode::IllegalOperation),
            Self::Negotiation { .. } => Some(ErrorCode::OptionNegotiation),
            Self::TimedOut { .. } | Self::Cancelled { .. } | Self::Io(_) => None,
        }
    }

    /// The peer this session was talking to, when known.
    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            Self::Peer { peer, .. }
            | Self::TimedOut { peer }
            | Self::Malformed { peer, .. }
            | Self::Negotiation { peer, .. }
            | Self::Protocol { peer, .. }
            | Self::Rejected { peer, .. }
            | Self::Cancelled { peer } => Some(*peer),
            Self::Io(_) => None,
        }
    }
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer { code, message, peer } => {
                write!(f, "peer {peer} sent error {code}: {message}")
            }
            Self::TimedOut { peer } => write!(f, "timed out waiting for {peer}"),
            Self::Malformed { reason, peer } => {
                write!(f, "malformed packet from {peer}: {reason}")
            }
            Self::Negotiation { reason, peer } => {
                write!(f, "option negotiation with {peer} failed: {reason}")
            }
            Self::Protocol { code, reason, peer } => {
                write!(f, "protocol violation by {peer} ({code}): {reason}")
            }
            Self::Rejected { code, reason, peer } => {
                write!(f, "request from {peer} rejected ({code}): {reason}")
            }
            Self::Cancelled { peer } => write!(f, "transfer with {peer} cancelled"),
            Self::Io(err) => write!(f, "endpoint I/O failure: {err}"),
        }
    }
}

impl std::error::Error for TftpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Malformed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl From<io::Error> for TftpError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
