//! The datagram endpoint a session sends and receives through.
//!
//! Sessions are generic over [`Endpoint`] so the protocol engine can be
//! driven by a real UDP socket or by a scripted endpoint in tests. Receiving
//! is the only suspension point in a session, and a timeout there is an
//! ordinary outcome, not an error.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::debug;

use crate::protocol::MAX_DATAGRAM;

/// An abstract datagram endpoint.
pub trait Endpoint: Send + Sync {
    /// Send one datagram to `peer`.
    fn send(&self, buf: &[u8], peer: SocketAddr) -> impl Future<Output = io::Result<()>> + Send;

    /// Wait up to `wait` for one datagram. `Ok(None)` means the wait elapsed
    /// with nothing to deliver.
    fn receive(&self, wait: Duration) -> impl Future<Output = io::Result<Option<(Vec<u8>, SocketAddr)>>> + Send;

    /// The local address the endpoint is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// An [`Endpoint`] backed by a tokio UDP socket.
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    /// Bind an ephemeral-port socket suitable for talking to `peer`,
    /// matching its address family, optionally pinned to a local interface
    /// address.
    pub async fn bind_for(peer: SocketAddr, local_ip: Option<IpAddr>) -> io::Result<Self> {
        let bind_addr = match local_ip {
            Some(IpAddr::V4(v4)) => format!("{v4}:0"),
            Some(IpAddr::V6(v6)) => format!("[{v6}]:0"),
            None => match peer {
                SocketAddr::V4(_) => "0.0.0.0:0".to_string(),
                SocketAddr::V6(_) => "[::]:0".to_string(),
            },
        };

        let socket = UdpSocket::bind(&bind_addr).await?;
        debug!("session socket bound to {}", socket.local_addr()?);
        Ok(Self { socket })
    }
}

impl From<UdpSocket> for UdpEndpoint {
    fn from(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl Endpoint for UdpEndpoint {
    async fn send(&self, buf: &[u8], peer: SocketAddr) -> io::Result<()> {
        self.socket.send_to(buf, peer).await.map(|_| ())
    }

    async fn receive(&self, wait: Duration) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match tokio::time::timeout(wait, self.socket.recv_from(&mut buf)).await {
            Err(_elapsed) => Ok(None),
            Ok(Ok((n, src))) => {
                buf.truncate(n);
                Ok(Some((buf, src)))
            }
            Ok(Err(err)) => Err(err),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
