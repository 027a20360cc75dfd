//! The TFTP client.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::context::{CancelHandle, DEF_RETRIES, DEF_TIMEOUT, Metrics, Role, SessionContext};
use crate::endpoint::UdpEndpoint;
use crate::error::TftpError;
use crate::options::{OPT_BLKSIZE, OPT_TSIZE};
use crate::protocol::{MAX_BLKSIZE, MIN_BLKSIZE, OptionPair, Packet};
use crate::session::drive;

/// A TFTP client bound to one server address.
///
/// Each transfer binds its own ephemeral UDP socket; the server's reply
/// fixes the transfer ID for the rest of that session.
///
/// ```rust,no_run
/// use tftp::Client;
///
/// # async fn demo() -> Result<(), tftp::TftpError> {
/// let mut client = Client::new("203.0.113.9:69".parse().unwrap())
///     .with_blksize(1400)
///     .with_tsize(0);
///
/// let mut image = Vec::new();
/// let metrics = client.download("boot.img", &mut image).await?;
/// println!("{} bytes at {:.1} kbps", metrics.bytes, metrics.kbps());
/// # Ok(())
/// # }
/// ```
pub struct Client {
    server: SocketAddr,
    local_ip: Option<IpAddr>,
    blksize: Option<usize>,
    tsize: Option<u64>,
    timeout: Duration,
    retries: u32,
    cancel: CancelHandle,
    hook: Option<Box<dyn FnMut(&Packet) + Send>>,
}

impl Client {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            local_ip: None,
            blksize: None,
            tsize: None,
            timeout: DEF_TIMEOUT,
            retries: DEF_RETRIES,
            cancel: CancelHandle::new(),
            hook: None,
        }
    }

    /// Request a block size for transfers, clamped into the legal range.
    pub fn with_blksize(mut self, blksize: usize) -> Self {
        self.blksize = Some(blksize.clamp(MIN_BLKSIZE, MAX_BLKSIZE));
        self
    }

    /// Request the `tsize` option. Pass the size of the data when uploading;
    /// pass 0 when downloading to ask the server for the file size.
    pub fn with_tsize(mut self, size: u64) -> Self {
        self.tsize = Some(size);
        self
    }

    /// Per-session receive timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retransmissions allowed before a transfer is abandoned.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Pin the local address transfers bind to.
    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.local_ip = Some(ip);
        self
    }

    /// Observe every packet this client sends and receives. A panicking hook
    /// is contained and does not affect the transfer.
    pub fn packet_hook(mut self, hook: impl FnMut(&Packet) + Send + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// A handle that aborts in-flight transfers when triggered.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Fetch `filename` from the server into `sink`.
    pub async fn download(&mut self, filename: &str, sink: impl Write + Send) -> Result<Metrics, TftpError> {
        let endpoint = UdpEndpoint::bind_for(self.server, self.local_ip).await?;
        let mut ctx = self.session_ctx(Role::ClientDownload, filename);
        ctx.sink = Some(Box::new(sink));
        drive(&endpoint, &mut ctx, None).await
    }

    /// Send the contents of `source` to the server as `filename`.
    pub async fn upload(&mut self, filename: &str, source: impl Read + Send) -> Result<Metrics, TftpError> {
        let endpoint = UdpEndpoint::bind_for(self.server, self.local_ip).await?;
        let mut ctx = self.session_ctx(Role::ClientUpload, filename);
        ctx.source = Some(Box::new(source));
        drive(&endpoint, &mut ctx, None).await
    }

    fn session_ctx(&mut self, role: Role, filename: &str) -> SessionContext<'_> {
        let mut ctx = SessionContext::new(role, self.server, self.timeout, self.retries);
        ctx.filename = filename.as_bytes().to_vec();
        ctx.requested = self.request_options();
        ctx.cancel = self.cancel.clone();
        ctx.hook = self
            .hook
            .as_deref_mut()
            .map(|h| h as &mut (dyn FnMut(&Packet) + Send));
        ctx
    }

    fn request_options(&self) -> Vec<OptionPair> {
        let mut options = Vec::new();
        if let Some(blksize) = self.blksize {
            options.push(OptionPair::new(OPT_BLKSIZE, blksize.to_string()));
        }
        if let Some(tsize) = self.tsize {
            options.push(OptionPair::new(OPT_TSIZE, tsize.to_string()));
        }
        options
    }
}
