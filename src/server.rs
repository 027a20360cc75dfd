//! The TFTP server: a listening dispatcher and per-session transfer tasks.
//!
//! The listening socket only ever sees the first packet of each session. Every
//! request gets its own tokio task with its own ephemeral-port socket, so
//! concurrent transfers never share state beyond the listener.

use std::fs::File;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::context::{CancelHandle, DEF_RETRIES, DEF_TIMEOUT, Metrics, Role, SessionContext};
use crate::endpoint::{Endpoint, UdpEndpoint};
use crate::error::TftpError;
use crate::protocol::{ErrorCode, Packet};
use crate::session::drive;
use crate::stream::{FileOps, Sink, Source};

/// Server-wide transfer settings, shared by every session.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory requests are confined to.
    pub root_dir: PathBuf,
    /// Per-session receive timeout.
    pub timeout: Duration,
    /// Retransmissions allowed per session.
    pub retries: u32,
    /// Local address session sockets bind to, when pinned.
    pub local_ip: Option<IpAddr>,
    /// Create missing parent directories for uploads.
    pub create_dirs: bool,
    /// Let uploads replace existing files; refused with ERROR 6 otherwise.
    pub overwrite: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./tftp_root"),
            timeout: DEF_TIMEOUT,
            retries: DEF_RETRIES,
            local_ip: None,
            create_dirs: true,
            overwrite: true,
        }
    }
}

/// The accept loop: binds the well-known port and hands each new request to
/// its own [`ServerSession`].
pub struct Server {
    bind_address: String,
    config: ServerConfig,
    socket: Option<UdpSocket>,
}

impl Server {
    pub fn new(bind_address: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            bind_address: bind_address.into(),
            config,
            socket: None,
        }
    }

    /// A server with default settings rooted at `root_dir`.
    pub fn with_root(bind_address: impl Into<String>, root_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            bind_address,
            ServerConfig {
                root_dir: root_dir.into(),
                ..Default::default()
            },
        )
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    /// The listening address once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the listening socket, returning the actual listening address.
    /// Useful when binding to port 0 for tests.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.socket.is_none() {
            let socket = UdpSocket::bind(&self.bind_address)
                .await
                .context("failed to bind TFTP listening socket")?;
            self.socket = Some(socket);
        }
        self.local_addr().context("failed to read listening address")
    }

    /// Bind the listening socket if needed and serve requests until failure.
    pub async fn run(&mut self) -> Result<()> {
        let local = self.bind().await?;
        info!(
            "TFTP server listening on {}, serving files from {}",
            local,
            self.config.root_dir.display()
        );
        self.serve().await
    }

    async fn serve(&self) -> Result<()> {
        let socket = self.socket.as_ref().expect("server must be bound before serving");
        let mut buf = vec![0u8; 2048];

        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            if len < 2 {
                debug!("ignoring runt datagram from {peer}");
                continue;
            }

            let first = buf[..len].to_vec();
            let config = self.config.clone();
            tokio::spawn(async move {
                match connect_session(peer, config).await {
                    Ok(session) => {
                        if let Err(err) = session.run(&first, peer).await {
                            warn!("transfer with {peer} failed: {err}");
                        }
                    }
                    Err(err) => warn!("could not open a session socket for {peer}: {err}"),
                }
            });
        }
    }
}

async fn connect_session(peer: SocketAddr, config: ServerConfig) -> io::Result<ServerSession<UdpEndpoint>> {
    let endpoint = UdpEndpoint::bind_for(peer, config.local_ip).await?;
    Ok(ServerSession::new(endpoint, config))
}

/// One server-side transfer, driven by the first packet the dispatcher read
/// off the listening socket.
pub struct ServerSession<E: Endpoint> {
    endpoint: E,
    config: ServerConfig,
    cancel: CancelHandle,
    file_ops: Option<Box<dyn FileOps>>,
    hook: Option<Box<dyn FnMut(&Packet) + Send>>,
}

impl<E: Endpoint> ServerSession<E> {
    pub fn new(endpoint: E, config: ServerConfig) -> Self {
        Self {
            endpoint,
            config,
            cancel: CancelHandle::new(),
            file_ops: None,
            hook: None,
        }
    }

    /// Replace the rooted filesystem backend, e.g. to serve generated
    /// content or screen upload destinations.
    pub fn with_file_ops(mut self, ops: Box<dyn FileOps>) -> Self {
        self.file_ops = Some(ops);
        self
    }

    /// Observe every packet this session sends and receives. A panicking
    /// hook is contained and does not affect the transfer.
    pub fn with_packet_hook(mut self, hook: impl FnMut(&Packet) + Send + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// A handle that aborts this session when triggered.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run the transfer to completion.
    pub async fn run(mut self, first_packet: &[u8], peer: SocketAddr) -> Result<Metrics, TftpError> {
        let first = match Packet::from_bytes(first_packet) {
            Ok(pkt) => pkt,
            Err(reason) => {
                let reply = Packet::error(ErrorCode::IllegalOperation, reason.to_string());
                let _ = self.endpoint.send(&reply.to_bytes(), peer).await;
                return Err(TftpError::Malformed { reason, peer });
            }
        };

        let file_ops = self.file_ops.take().unwrap_or_else(|| {
            Box::new(RootFs {
                root: self.config.root_dir.clone(),
                create_dirs: self.config.create_dirs,
                overwrite: self.config.overwrite,
            })
        });

        // The role placeholder is corrected as soon as the state machine
        // inspects the request opcode.
        let mut ctx = SessionContext::new(Role::ServerSending, peer, self.config.timeout, self.config.retries);
        ctx.cancel = self.cancel.clone();
        ctx.fs = Some(file_ops);
        ctx.hook = self
            .hook
            .as_deref_mut()
            .map(|h| h as &mut (dyn FnMut(&Packet) + Send));

        drive(&self.endpoint, &mut ctx, Some(&first)).await
    }
}

/// The default file backend: every request resolves strictly beneath the
/// configured root directory.
struct RootFs {
    root: PathBuf,
    create_dirs: bool,
    overwrite: bool,
}

impl RootFs {
    /// Map a requested filename onto the root. Leading slashes are treated as
    /// relative to the root; any path that would step outside it is refused.
    fn resolve(&self, filename: &[u8]) -> Result<PathBuf, (ErrorCode, String)> {
        let Ok(name) = std::str::from_utf8(filename) else {
            return Err((ErrorCode::AccessViolation, "filename is not valid UTF-8".into()));
        };

        let relative = Path::new(name.trim_start_matches('/'));
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe || relative.as_os_str().is_empty() {
            return Err((ErrorCode::AccessViolation, "path escapes the server root".into()));
        }

        Ok(self.root.join(relative))
    }
}

impl FileOps for RootFs {
    fn open_read(&mut self, filename: &[u8]) -> Result<(Source<'static>, u64), (ErrorCode, String)> {
        let path = self.resolve(filename)?;

        // Resolve links before the containment check, the root may itself be
        // reached through one.
        let root = self.root.canonicalize().map_err(map_io)?;
        let path = path.canonicalize().map_err(map_io)?;
        if !path.starts_with(&root) {
            return Err((ErrorCode::AccessViolation, "path escapes the server root".into()));
        }

        let file = File::open(&path).map_err(map_io)?;
        let size = file.metadata().map(|m| m.len()).map_err(map_io)?;
        Ok((Box::new(file), size))
    }

    fn open_write(&mut self, filename: &[u8]) -> Result<Sink<'static>, (ErrorCode, String)> {
        let path = self.resolve(filename)?;

        if path.exists() {
            if !self.overwrite {
                return Err((
                    ErrorCode::FileAlreadyExists,
                    ErrorCode::FileAlreadyExists.default_message().into(),
                ));
            }
            warn!("overwriting existing file {}", path.display());
        }

        if self.create_dirs
            && let Some(parent) = path.parent()
        {
            std::fs::create_dir_all(parent).map_err(map_io)?;
        }

        let file = File::create(&path).map_err(map_io)?;
        Ok(Box::new(file))
    }
}

fn map_io(err: io::Error) -> (ErrorCode, String) {
    let code = match err.kind() {
        io::ErrorKind::NotFound => ErrorCode::FileNotFound,
        io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => ErrorCode::DiskFull,
        io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
        _ => ErrorCode::NotDefined,
    };
    (code, err.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.root_dir, PathBuf::from("./tftp_root"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.retries, 3);
        assert!(config.overwrite);
    }

    #[test]
    fn root_fs_rejects_traversal() {
        let dir = tempdir().unwrap();
        let fs = RootFs {
            root: dir.path().to_path_buf(),
            create_dirs: true,
            overwrite: true,
        };

        for bad in [&b"../../etc/passwd"[..], b"a/../../b", b"..", b""] {
            let (code, _) = fs.resolve(bad).unwrap_err();
            assert_eq!(code, ErrorCode::AccessViolation, "{:?} should be refused", bad);
        }

        // Leading slashes are relative to the root, as classic tftpd has it.
        let resolved = fs.resolve(b"/boot/image").unwrap();
        assert_eq!(resolved, dir.path().join("boot/image"));
    }

    #[test]
    fn root_fs_read_and_write() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("present"), b"contents").unwrap();

        let mut fs = RootFs {
            root: dir.path().to_path_buf(),
            create_dirs: true,
            overwrite: true,
        };

        let (_, size) = fs.open_read(b"present").unwrap();
        assert_eq!(size, 8);

        let (code, _) = match fs.open_read(b"absent") {
            Err(e) => e,
            Ok(_) => panic!("expected open_read(\"absent\") to fail"),
        };
        assert_eq!(code, ErrorCode::FileNotFound);

        // Upload paths get their directories created beneath the root.
        let mut sink = fs.open_write(b"nested/dir/upload").unwrap();
        sink.write_all(b"x").unwrap();
        sink.flush().unwrap();
        drop(sink);
        assert_eq!(std::fs::read(dir.path().join("nested/dir/upload")).unwrap(), b"x");
    }

    #[test]
    fn root_fs_refuses_overwrite_when_configured() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("present"), b"old").unwrap();

        let mut fs = RootFs {
            root: dir.path().to_path_buf(),
            create_dirs: false,
            overwrite: false,
        };
        let (code, _) = match fs.open_write(b"present") {
            Err(e) => e,
            Ok(_) => panic!("expected open_write(\"present\") to fail"),
        };
        assert_eq!(code, ErrorCode::FileAlreadyExists);
    }

    #[tokio::test]
    async fn server_binds_and_reports_address() {
        let dir = tempdir().unwrap();
        let mut server = Server::with_root("127.0.0.1:0", dir.path());
        assert!(server.local_addr().is_none());

        let handle = tokio::spawn(async move { server.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.abort();
        assert!(handle.await.is_err());
    }
}
