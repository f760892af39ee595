//! Relay connection management
//!
//! Opens the TLS socket to the relay, follows redirects by replacing it, and
//! closes it on stop. Reconnection only happens when asked for.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::error::ConnectionError;

/// Any byte stream the relay protocol can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Opens handshake-complete streams to a relay host.
///
/// A stream returned by `connect` must be ready for application data; for
/// TLS this means the handshake has finished.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn AsyncStream>, ConnectionError>;
}

/// TLS connector backed by the platform TLS library
pub struct TlsConnector {
    inner: tokio_native_tls::TlsConnector,
}

impl TlsConnector {
    pub fn new() -> Result<Self, native_tls::Error> {
        let connector = native_tls::TlsConnector::new()?;
        Ok(TlsConnector {
            inner: tokio_native_tls::TlsConnector::from(connector),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn AsyncStream>, ConnectionError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|source| ConnectionError::Connect {
                host: host.to_string(),
                port,
                source,
            })?;
        tcp.set_nodelay(true)?;

        let tls = self
            .inner
            .connect(host, tcp)
            .await
            .map_err(|source| ConnectionError::Tls {
                host: host.to_string(),
                source,
            })?;
        Ok(Box::new(tls))
    }
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn AsyncStream>, ConnectionError> {
        (**self).connect(host, port).await
    }
}

struct Connection {
    host: String,
    stream: Box<dyn AsyncStream>,
}

/// Owns at most one relay socket at a time
pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    port: u16,
    connection: Option<Connection>,
}

impl ConnectionManager {
    pub fn new(connector: Box<dyn Connector>, port: u16) -> Self {
        ConnectionManager {
            connector,
            port,
            connection: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn host(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.host.as_str())
    }

    /// Open a socket to `host`, replacing any existing one.
    pub async fn connect(&mut self, host: &str) -> Result<(), ConnectionError> {
        self.disconnect().await;
        log::debug!("Connecting to {}:{}", host, self.port);
        let stream = self.connector.connect(host, self.port).await?;
        log::info!("[Nexus] Connected to {}:{}", host, self.port);
        self.connection = Some(Connection {
            host: host.to_string(),
            stream,
        });
        Ok(())
    }

    /// Follow a relay redirect.
    pub async fn redirect(&mut self, new_host: &str) -> Result<(), ConnectionError> {
        log::info!("[Nexus] Redirecting connection to {}", new_host);
        self.connect(new_host).await
    }

    /// Close the socket. Does nothing when already closed.
    pub async fn disconnect(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        if let Err(e) = connection.stream.shutdown().await {
            log::debug!("Error closing connection to {}: {}", connection.host, e);
        }
        log::info!("[Nexus] Connection to {} closed", connection.host);
    }

    /// Read the next chunk. Pending forever while disconnected, so it can sit
    /// in a `select!` next to other event sources.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        match self.connection.as_mut() {
            Some(connection) => Ok(connection.stream.read(buf).await?),
            None => std::future::pending().await,
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(ConnectionError::NotConnected)?;
        connection.stream.write_all(bytes).await?;
        connection.stream.flush().await?;
        Ok(())
    }

    /// Forget the socket after the peer closed it or it failed.
    pub fn drop_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            log::info!("[Nexus] Lost connection to {}", connection.host);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{duplex, DuplexStream};

    /// Hands out in-memory streams and keeps the relay ends
    struct MemoryConnector {
        peers: Mutex<Vec<(String, DuplexStream)>>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(
            &self,
            host: &str,
            _port: u16,
        ) -> Result<Box<dyn AsyncStream>, ConnectionError> {
            if host == "unreachable" {
                return Err(ConnectionError::NotConnected);
            }
            let (client, relay) = duplex(1024);
            self.peers.lock().unwrap().push((host.to_string(), relay));
            Ok(Box::new(client))
        }
    }

    fn manager() -> (ConnectionManager, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector {
            peers: Mutex::new(Vec::new()),
        });
        (
            ConnectionManager::new(Box::new(connector.clone()), 1443),
            connector,
        )
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (mut manager, connector) = manager();
        manager.connect("relay-a").await.unwrap();
        assert_eq!(manager.host(), Some("relay-a"));

        manager.write(&[1, 2, 3]).await.unwrap();
        let (_, mut relay) = connector.peers.lock().unwrap().pop().unwrap();
        let mut buf = [0u8; 3];
        relay.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3]);

        relay.write_all(&[9, 8]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = manager.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[9, 8]);
    }

    #[tokio::test]
    async fn test_redirect_replaces_socket() {
        let (mut manager, connector) = manager();
        manager.connect("relay-a").await.unwrap();
        manager.redirect("relay-b").await.unwrap();
        assert_eq!(manager.host(), Some("relay-b"));

        let mut peers = connector.peers.lock().unwrap();
        let (host, mut old_relay) = peers.remove(0);
        assert_eq!(host, "relay-a");
        drop(peers);

        // The first socket was shut down
        let mut buf = [0u8; 1];
        assert_eq!(old_relay.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (mut manager, _connector) = manager();
        manager.disconnect().await;
        manager.connect("relay-a").await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;
        assert!(!manager.is_connected());
        assert!(matches!(
            manager.write(&[1]).await,
            Err(ConnectionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_manager_disconnected() {
        let (mut manager, _connector) = manager();
        manager.connect("relay-a").await.unwrap();
        assert!(manager.connect("unreachable").await.is_err());
        assert!(!manager.is_connected());
    }
}
