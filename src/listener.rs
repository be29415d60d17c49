//! Listener Bootstrap
//!
//! Binds the local endpoint a relay serves on: TCP (`host:port`) or a Unix
//! domain socket (`/path`). Unix sockets get the historical daemon
//! treatment: a leftover socket file is unlinked, any other kind of file at
//! the path refuses the start, and the bound socket is chmod'd to 0777 so
//! every local user can reach the relay.

use crate::config::Addr;
use crate::conn::Stream;
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::{TcpListener, UnixListener};
use tracing::warn;

/// A bound listener, TCP or Unix.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Binds `addr`, applying the Unix-socket preflight checks.
    pub async fn bind(addr: &Addr) -> Result<Listener> {
        match addr {
            Addr::Tcp(hostport) => {
                let listener = TcpListener::bind(hostport)
                    .await
                    .with_context(|| format!("listening on {}", hostport))?;
                Ok(Listener::Tcp(listener))
            }
            Addr::Unix(path) => {
                prepare_socket_path(path)?;
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("listening on {}", path.display()))?;
                // Make sure it is accessible for everyone.
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
                    .with_context(|| format!("chmod {}", path.display()))?;
                Ok(Listener::Unix(listener, path.clone()))
            }
        }
    }

    /// Accepts one connection, boxed so TCP and Unix flow through the same
    /// dispatch code.
    pub async fn accept(&self) -> std::io::Result<(Box<dyn Stream>, String)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
            Listener::Unix(l, path) => {
                let (stream, _) = l.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
        }
    }

    /// The bound TCP address; `None` for Unix listeners. Tests bind to
    /// `127.0.0.1:0` and read the ephemeral port back through this.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Unix(..) => None,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to unlink socket");
            }
        }
    }
}

/// Refuses to start over a non-socket file; unlinks a stale socket.
fn prepare_socket_path(path: &Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_socket() {
                warn!(path = %path.display(), "Removing existing socket");
                std::fs::remove_file(path)
                    .with_context(|| format!("removing stale socket {}", path.display()))?;
                Ok(())
            } else {
                bail!("{} exists and it's not a Unix socket", path.display());
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("stat {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_bind_and_accept() {
        let listener = Listener::bind(&Addr::Tcp("127.0.0.1:0".to_string()))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_unix_bind_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!("flashrelay-test-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let listener = Listener::bind(&Addr::Unix(path.clone())).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unix_refuses_non_socket_path() {
        let path = std::env::temp_dir().join(format!("flashrelay-file-{}", std::process::id()));
        std::fs::write(&path, b"not a socket").unwrap();

        let err = Listener::bind(&Addr::Unix(path.clone())).await.unwrap_err();
        assert!(err.to_string().contains("not a Unix socket"));

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_unix_replaces_stale_socket() {
        let path = std::env::temp_dir().join(format!("flashrelay-stale-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let first = Listener::bind(&Addr::Unix(path.clone())).await.unwrap();
        // Simulate a crashed process leaving the socket file behind.
        std::mem::forget(first);

        let second = Listener::bind(&Addr::Unix(path.clone())).await.unwrap();
        drop(second);
        let _ = std::fs::remove_file(&path);
    }
}
