//! Peer-side client for the rill broker.
//!
//! # Purpose
//! Dials the broker, authenticates on the control stream, and then either
//! produces tagged unidirectional streams or observes tags and accepts the
//! streams the broker opens back.
pub mod config;
mod control;
mod wire;

pub use config::ClientConfig;

use anyhow::Context;
use quinn::{RecvStream, SendStream};
use rill_auth::Credential;
use rill_metadata::Md;
use rill_transport::{QuicClient, QuicConnection};
use rill_wire::Frame;
use std::net::SocketAddr;
use tokio::sync::Mutex;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    /// The server refused the credential; the reason is the server's text.
    #[error("{reason}")]
    AuthenticationFailed { reason: String },
    /// A well-formed frame arrived where the protocol does not allow it.
    #[error("read unexpected frame, frame read: {frame_type}")]
    UnexpectedFrame { frame_type: &'static str },
    /// Malformed bytes on the control stream.
    #[error("frame decode failed")]
    Decode(#[from] rill_wire::Error),
    /// Underlying QUIC failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// A connected, authenticated peer.
pub struct Client {
    conn: QuicConnection,
    control: Mutex<SendStream>,
    id: String,
}

impl Client {
    /// Dial the broker, open the control stream, and authenticate.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        config: ClientConfig,
    ) -> Result<Self> {
        let bind_addr: SocketAddr = "0.0.0.0:0".parse().expect("wildcard bind addr");
        let client = QuicClient::bind(bind_addr, config.quinn, config.transport)?;
        let conn = client.connect(addr, server_name).await?;
        let (mut send, recv) = conn.open_bi().await.context("open control stream")?;
        let credential = Credential::parse(&config.credential);
        let id = control::authenticate(
            &conn,
            &mut send,
            recv,
            &credential,
            config.max_frame_bytes,
        )
        .await?;
        tracing::debug!(id, "authenticated");
        Ok(Self {
            conn,
            control: Mutex::new(send),
            id,
        })
    }

    /// The server-assigned connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ask the broker to deliver producer streams for `tag` to this peer.
    pub async fn observe(&self, tag: &str) -> Result<()> {
        let mut send = self.control.lock().await;
        wire::write_frame(
            &mut send,
            &Frame::Observe {
                tag: tag.to_string(),
            },
        )
        .await
    }

    /// Accept the next stream the broker opened toward this peer. The bytes
    /// are a single producer's payload, verbatim, until EOF.
    pub async fn accept_stream(&self) -> Result<RecvStream> {
        Ok(self.conn.accept_uni().await?)
    }

    /// Open a producer stream: writes the tag preamble and returns the send
    /// half for payload bytes. Finishing the stream ends the producer.
    pub async fn open_stream(
        &self,
        stream_id: &str,
        tag: &str,
        metadata: Option<&Md>,
    ) -> Result<SendStream> {
        let mut send = self.conn.open_uni().await?;
        let frame = Frame::OpenStream {
            id: stream_id.to_string(),
            tag: tag.to_string(),
            metadata: metadata.map(|md| md.encode()).unwrap_or_default().into(),
        };
        wire::write_frame(&mut send, &frame).await?;
        Ok(send)
    }

    /// Orderly close of the whole connection.
    pub fn close(&self, code: u64, reason: &str) {
        self.conn.close(code, reason);
    }
}
