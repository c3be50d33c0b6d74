//! Socket transport.
//!
//! Connects by walking every resolved address until one accepts, with an
//! optional TLS layer that verifies the peer against a PEM trust file (or
//! the platform store when none is configured). A plain-TCP transport can
//! be *captured* into a [`RestartHint`] instead of shut down: the raw
//! descriptor survives an in-place exec and [`Transport::reinstate`]
//! reattaches to it, recovering the peer by a reverse lookup on the fd.

use std::io::BufReader;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Boxed read half handed to the reader task.
pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half retained by the multiplexer.
pub type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// TLS settings for an instance.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM bundle of trust anchors; platform roots when absent.
    pub trust_file: Option<PathBuf>,
}

/// A captured connection surviving process replacement.
#[derive(Debug)]
pub struct RestartHint {
    fd: RawFd,
}

impl RestartHint {
    /// The raw descriptor held open.
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

/// One live connection, plain or TLS.
#[derive(Debug)]
pub enum Transport {
    /// Plain TCP.
    Tcp(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Connect to `host:port`, trying every resolved address in order.
    ///
    /// A `tls` config wraps the stream after the TCP connect and fails the
    /// whole connection when certificate verification fails.
    pub async fn connect(
        host: &str,
        port: u16,
        tls: Option<&TlsConfig>,
    ) -> Result<Self, TransportError> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|_| TransportError::Resolve {
                host: host.to_string(),
                port,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(TransportError::Resolve {
                host: host.to_string(),
                port,
            });
        }

        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(s) => {
                    debug!(%addr, "connected");
                    stream = Some(s);
                    break;
                }
                Err(err) => {
                    debug!(%addr, %err, "connect failed, trying next address");
                    last_err = Some(err);
                }
            }
        }

        let stream = match stream {
            Some(s) => s,
            None => {
                return Err(TransportError::Connect {
                    host: host.to_string(),
                    port,
                    source: last_err
                        .unwrap_or_else(|| std::io::Error::other("no address connected")),
                })
            }
        };

        match tls {
            None => Ok(Transport::Tcp(stream)),
            Some(config) => {
                let connector = tls_connector(config).map_err(|source| TransportError::Tls {
                    host: host.to_string(),
                    source,
                })?;
                let name = ServerName::try_from(host.to_string()).map_err(|_| {
                    TransportError::ServerName {
                        host: host.to_string(),
                    }
                })?;
                let tls_stream =
                    connector
                        .connect(name, stream)
                        .await
                        .map_err(|source| TransportError::Tls {
                            host: host.to_string(),
                            source,
                        })?;
                Ok(Transport::Tls(Box::new(tls_stream)))
            }
        }
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> (BoxRead, BoxWrite) {
        match self {
            Transport::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (Box::new(read), Box::new(write))
            }
            Transport::Tls(stream) => {
                let (read, write) = tokio::io::split(*stream);
                (Box::new(read), Box::new(write))
            }
        }
    }

    /// Whether this transport is TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Capture the raw descriptor instead of shutting the socket down.
    ///
    /// TLS sessions hold handshake state that cannot survive an exec, so
    /// they refuse capture.
    pub fn capture(self) -> Result<RestartHint, TransportError> {
        match self {
            Transport::Tcp(stream) => {
                let std_stream = stream.into_std().map_err(TransportError::Reinstate)?;
                Ok(RestartHint {
                    fd: std_stream.into_raw_fd(),
                })
            }
            Transport::Tls(_) => Err(TransportError::CaptureTls),
        }
    }

    /// Reattach to a captured descriptor, recovering the peer address.
    pub async fn reinstate(hint: RestartHint) -> Result<(Self, SocketAddr), TransportError> {
        // Ownership of the fd transfers back here.
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(hint.fd) };
        std_stream
            .set_nonblocking(true)
            .map_err(TransportError::Reinstate)?;
        let peer = std_stream.peer_addr().map_err(TransportError::Reinstate)?;
        let stream = TcpStream::from_std(std_stream).map_err(TransportError::Reinstate)?;
        Ok((Transport::Tcp(stream), peer))
    }
}

/// An accepting socket, for control surfaces that dial in.
pub struct Listener {
    inner: tokio::net::TcpListener,
}

impl Listener {
    /// Bind on every interface at `port` (0 picks a free port).
    pub async fn bind(port: u16) -> Result<Self, TransportError> {
        let inner = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| TransportError::Connect {
                host: "0.0.0.0".to_string(),
                port,
                source,
            })?;
        Ok(Self { inner })
    }

    /// The bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner.local_addr().map_err(TransportError::Reinstate)
    }

    /// Accept one connection as a plain transport.
    pub async fn accept(&self) -> Result<(Transport, SocketAddr), TransportError> {
        let (stream, peer) = self
            .inner
            .accept()
            .await
            .map_err(TransportError::Reinstate)?;
        Ok((Transport::Tcp(stream), peer))
    }
}

fn tls_connector(config: &TlsConfig) -> Result<TlsConnector, std::io::Error> {
    let mut roots = RootCertStore::empty();

    match &config.trust_file {
        Some(path) => {
            for cert in read_trust_file(path)? {
                roots
                    .add(cert)
                    .map_err(|e| std::io::Error::other(format!("bad trust anchor: {e}")))?;
            }
        }
        None => {
            let result = rustls_native_certs::load_native_certs();
            for err in &result.errors {
                warn!(%err, "skipping unreadable platform certificate");
            }
            for cert in result.certs {
                // Tolerate odd platform entries the way browsers do
                let _ = roots.add(cert);
            }
        }
    }

    if roots.is_empty() {
        return Err(std::io::Error::other("no usable trust anchors"));
    }

    let client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(client)))
}

fn read_trust_file(
    path: &Path,
) -> Result<Vec<tokio_rustls::rustls::pki_types::CertificateDer<'static>>, std::io::Error> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_and_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let transport = Transport::connect("127.0.0.1", addr.port(), None)
            .await
            .unwrap();
        assert!(!transport.is_tls());

        let (mut read, mut write) = transport.split();
        write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_and_reinstate() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"ok").await.unwrap();
        });

        let transport = Transport::connect("127.0.0.1", addr.port(), None)
            .await
            .unwrap();
        let hint = transport.capture().unwrap();
        assert!(hint.fd() >= 0);

        let (transport, peer) = Transport::reinstate(hint).await.unwrap();
        assert_eq!(peer, addr);

        let (mut read, mut write) = transport.split();
        write.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_accepts() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = tokio::spawn(async move {
            let transport = Transport::connect("127.0.0.1", port, None).await.unwrap();
            let (_, mut write) = transport.split();
            write.write_all(b"hello").await.unwrap();
        });

        let (accepted, peer) = listener.accept().await.unwrap();
        assert!(peer.ip().is_loopback());
        let (mut read, _) = accepted.split();
        let mut buf = [0u8; 5];
        read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is virtually never listening.
        let err = Transport::connect("127.0.0.1", 1, None).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
