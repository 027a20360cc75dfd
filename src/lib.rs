//! TFTP (Trivial File Transfer Protocol) client and server library.
//!
//! Implements RFC 1350 with the option extensions of RFC 2347, block size
//! negotiation (RFC 2348), and transfer size reporting (RFC 2349, `tsize`).
//! Transfers run in octet mode only and strictly lock-step: one packet is
//! outstanding at a time, with timeouts, retransmission and transfer-ID
//! enforcement handled per session.
//!
//! # Downloading a file
//!
//! ```rust,no_run
//! use tftp::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tftp::TftpError> {
//!     let mut client = Client::new("203.0.113.9:69".parse().unwrap()).with_blksize(1400);
//!     let sink = tftp::file_sink("boot.img")?;
//!     let metrics = client.download("boot.img", sink).await?;
//!     println!("{} bytes in {:?}", metrics.bytes, metrics.duration());
//!     Ok(())
//! }
//! ```
//!
//! # Serving a directory
//!
//! ```rust,no_run
//! use tftp::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = Server::with_root("0.0.0.0:69", "/srv/tftp");
//!     server.run().await
//! }
//! ```

mod client;
mod context;
mod endpoint;
mod error;
mod options;
mod protocol;
mod server;
mod session;
mod state;
mod stream;

pub use client::Client;
pub use context::{CancelHandle, DEF_RETRIES, DEF_TIMEOUT, Metrics};
pub use endpoint::{Endpoint, UdpEndpoint};
pub use error::TftpError;
pub use protocol::{
    DEF_BLKSIZE, DecodeError, ErrorCode, MAX_BLKSIZE, MAX_DATAGRAM, MIN_BLKSIZE, Opcode, OptionPair, Packet, Request,
    TransferMode, find_option,
};
pub use server::{Server, ServerConfig, ServerSession};
pub use stream::{FileOps, Sink, Source, file_sink, file_source, memory_source, stdin_source, stdout_sink};
