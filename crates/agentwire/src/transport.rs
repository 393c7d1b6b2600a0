//! TCP and Unix-domain transports behind one stream type.

use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, info, warn};

use agentwire_common::{PeerName, RpcError, RpcResult};

/// Byte stream a connection runs over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A bound listening socket.
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind and start listening on `peer`.
    ///
    /// A stale socket file left behind at a Unix path is removed first.
    pub async fn bind(peer: &PeerName) -> RpcResult<Self> {
        match peer {
            PeerName::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(|e| {
                    RpcError::ConnectionFailed(format!("Failed to bind to {}: {}", addr, e))
                })?;
                info!(address = %addr, "Listener bound");
                Ok(Listener::Tcp(listener))
            }
            PeerName::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path).map_err(|e| {
                        RpcError::ConnectionFailed(format!(
                            "Failed to remove existing socket {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                }
                let listener = UnixListener::bind(path).map_err(|e| {
                    RpcError::ConnectionFailed(format!(
                        "Failed to bind to {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                info!(path = %path.display(), "Listener bound");
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// Address peers should connect to.
    ///
    /// For TCP this is the resolved address, so binding port 0 reports the
    /// port actually chosen.
    pub fn local_name(&self) -> RpcResult<PeerName> {
        match self {
            Listener::Tcp(listener) => Ok(PeerName::Tcp(listener.local_addr()?)),
            Listener::Unix { path, .. } => Ok(PeerName::Unix(path.clone())),
        }
    }

    /// Accept the next connection.
    ///
    /// Unix peers are unnamed, so they are reported under the listening path.
    pub async fn accept(&self) -> RpcResult<(BoxedStream, PeerName)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                }
                Ok((Box::new(stream), PeerName::Tcp(addr)))
            }
            Listener::Unix { listener, path } => {
                let (stream, _addr) = listener.accept().await?;
                Ok((Box::new(stream), PeerName::Unix(path.clone())))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                debug!(path = %path.display(), error = %e, "Failed to remove socket file on drop");
            }
        }
    }
}

/// Open a stream to `peer`, giving up after `timeout`.
pub async fn connect(peer: &PeerName, timeout: Duration) -> RpcResult<BoxedStream> {
    let attempt = async {
        match peer {
            PeerName::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                }
                Ok::<BoxedStream, std::io::Error>(Box::new(stream))
            }
            PeerName::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?) as BoxedStream),
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(stream)) => {
            debug!(peer = %peer, "Connected");
            Ok(stream)
        }
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "Connect failed");
            Err(RpcError::ConnectionFailed(format!("{}: {}", peer, e)))
        }
        Err(_) => {
            warn!(peer = %peer, timeout_ms = timeout.as_millis() as u64, "Connect timed out");
            Err(RpcError::ConnectTimeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_bind_accept_connect() {
        let listener = Listener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_name().unwrap();
        assert!(!addr.is_unix());

        let server = tokio::spawn(async move {
            let (mut stream, peer) = listener.accept().await.unwrap();
            assert!(!peer.is_unix());
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = connect(&addr, Duration::from_secs(1)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_unix_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        std::fs::write(&path, b"stale").unwrap();

        let peer = PeerName::unix(&path);
        let listener = Listener::bind(&peer).await.unwrap();
        assert_eq!(listener.local_name().unwrap(), peer);

        let accept = tokio::spawn(async move {
            let (_stream, peer) = listener.accept().await.unwrap();
            drop(listener);
            peer
        });
        let _stream = connect(&peer, Duration::from_secs(1)).await.unwrap();
        assert_eq!(accept.await.unwrap(), peer);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_failed() {
        let dir = tempfile::tempdir().unwrap();
        let peer = PeerName::unix(dir.path().join("missing.sock"));
        let err = connect(&peer, Duration::from_secs(1)).await.err().unwrap();
        assert!(matches!(err, RpcError::ConnectionFailed(_)));
        assert!(err.is_transport());
    }
}
