// QUIC transport configuration and primitives.
use anyhow::{Context, Result, anyhow};
use quinn::{ClientConfig, Connection, ConnectionError, Endpoint, RecvStream, SendStream,
            ServerConfig, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Transport-level tuning shared by server and client endpoints.
///
/// ```
/// use rill_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_streams > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_streams: u32,
    pub idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_streams: 1024,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    fn quinn_transport_config(&self) -> Result<quinn::TransportConfig> {
        let mut config = quinn::TransportConfig::default();
        let streams = VarInt::from_u32(self.max_streams);
        config.max_concurrent_bidi_streams(streams);
        config.max_concurrent_uni_streams(streams);
        let idle = quinn::IdleTimeout::try_from(self.idle_timeout)
            .context("idle timeout out of range")?;
        config.max_idle_timeout(Some(idle));
        Ok(config)
    }
}

/// Server endpoint wrapper; accepts [`QuicConnection`]s.
#[derive(Debug)]
pub struct QuicServer {
    endpoint: Endpoint,
}

impl QuicServer {
    pub fn bind(
        addr: SocketAddr,
        mut server_config: ServerConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config()?;
        server_config.transport_config(Arc::new(quinn_transport));
        let endpoint = Endpoint::server(server_config, addr).context("bind QUIC server")?;
        Ok(Self { endpoint })
    }

    pub async fn accept(&self) -> Result<QuicConnection> {
        let connecting = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| anyhow!("QUIC endpoint closed"))?;
        let connection = connecting.await.context("accept QUIC connection")?;
        Ok(QuicConnection::new(connection))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("read QUIC local address")
    }

    /// Close the endpoint; pending and future accepts fail.
    pub fn close(&self, code: u32, reason: &[u8]) {
        self.endpoint.close(VarInt::from_u32(code), reason);
    }

    pub async fn wait_idle(&self) {
        self.endpoint.wait_idle().await;
    }
}

/// Client endpoint wrapper; dials [`QuicConnection`]s.
#[derive(Debug)]
pub struct QuicClient {
    endpoint: Endpoint,
}

impl QuicClient {
    pub fn bind(
        addr: SocketAddr,
        mut client_config: ClientConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config()?;
        client_config.transport_config(Arc::new(quinn_transport));
        let mut endpoint = Endpoint::client(addr).context("bind QUIC client")?;
        endpoint.set_default_client_config(client_config);
        Ok(Self { endpoint })
    }

    pub async fn connect(&self, addr: SocketAddr, server_name: &str) -> Result<QuicConnection> {
        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .context("initiate QUIC connection")?;
        let connection = connecting.await.context("establish QUIC connection")?;
        Ok(QuicConnection::new(connection))
    }
}

/// Live QUIC connection with stream helpers.
///
/// Cloning is cheap and shares the underlying connection, so accept loops,
/// control streams, and the broker can hold their own handles.
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
}

impl QuicConnection {
    fn new(connection: Connection) -> Self {
        Self { inner: connection }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.open_bi().await.context("open bidi stream")
    }

    pub async fn open_uni(&self) -> Result<SendStream> {
        self.inner.open_uni().await.context("open uni stream")
    }

    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.accept_bi().await.context("accept bidi stream")
    }

    pub async fn accept_uni(&self) -> Result<RecvStream> {
        self.inner.accept_uni().await.context("accept uni stream")
    }

    /// Close with an application error code; the reason reaches the peer.
    pub fn close(&self, code: u64, reason: &str) {
        let code = VarInt::from_u64(code).unwrap_or(VarInt::from_u32(0));
        self.inner.close(code, reason.as_bytes());
    }

    /// Resolve once the connection is fully closed, from either side.
    pub async fn closed(&self) -> ConnectionError {
        self.inner.closed().await
    }
}
