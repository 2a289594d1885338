// Per-connection driver: control stream, producer stream intake, and the
// bridge from observe requests to the broker.
use crate::codec;
use crate::control::ServerControlStream;
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use quinn::RecvStream;
use rill_auth::AuthRegistry;
use rill_broker::{Broker, ByteWriter, ObserverLink, TaggedObserver, TaggedReader};
use rill_metadata::Md;
use rill_transport::QuicConnection;
use rill_wire::{Frame, SERVER_CLOSE_CODE};
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// Server-side record of an authenticated peer.
pub struct ConnectionRecord {
    pub id: String,
    pub metadata: Option<Md>,
    pub remote_addr: SocketAddr,
    observed: RwLock<HashSet<String>>,
}

impl ConnectionRecord {
    pub fn observed_tags(&self) -> Vec<String> {
        let observed = self.observed.read().expect("observed lock");
        observed.iter().cloned().collect()
    }

    fn record_observe(&self, tag: &str) {
        let mut observed = self.observed.write().expect("observed lock");
        observed.insert(tag.to_string());
    }
}

// The broker only ever needs to open streams back to the peer; hand it that
// capability, not the connection.
struct ConnLink(QuicConnection);

impl ObserverLink for ConnLink {
    fn open_uni(&self) -> Pin<Box<dyn Future<Output = Result<ByteWriter>> + Send + '_>> {
        Box::pin(async move {
            let send = self.0.open_uni().await?;
            Ok(Box::new(send) as ByteWriter)
        })
    }
}

/// Drive one accepted QUIC connection until it closes.
pub async fn handle_connection(
    broker: Broker,
    conn: QuicConnection,
    registry: AuthRegistry,
    conn_id: String,
    max_frame_bytes: usize,
) -> Result<()> {
    let (send, recv) = conn.accept_bi().await.context("accept control stream")?;
    let control = ServerControlStream::new(conn_id, conn.clone(), send, recv, max_frame_bytes);
    let authed = match control
        .verify_authentication(Box::new(|name, payload| {
            rill_auth::authenticate(&registry, Some((name, payload)))
        }))
        .await
    {
        Ok(authed) => authed,
        Err(err) => {
            // Rejections already closed the connection; a raw read failure
            // has not, so close it here either way (repeat closes are no-ops).
            tracing::info!(remote = %conn.remote_addr(), error = %err, "connection rejected");
            conn.close(u64::from(SERVER_CLOSE_CODE), "authentication failed");
            return Ok(());
        }
    };

    let record = Arc::new(ConnectionRecord {
        id: authed.id,
        metadata: authed.metadata,
        remote_addr: conn.remote_addr(),
        observed: RwLock::new(HashSet::new()),
    });
    metrics::counter!("rilld_connections_total").increment(1);
    tracing::info!(conn_id = %record.id, remote = %record.remote_addr, "peer connected");

    // Keep the control send half open for the connection's lifetime.
    let _control_send = authed.send;
    let mut observe_rx = authed.observe_rx;

    let accept_task = tokio::spawn(accept_streams(
        conn.clone(),
        broker.clone(),
        max_frame_bytes,
    ));

    let link: Arc<dyn ObserverLink> = Arc::new(ConnLink(conn.clone()));
    let forward_observes = async {
        while let Some(tag) = observe_rx.recv().await {
            record.record_observe(&tag);
            metrics::counter!("rilld_observes_total").increment(1);
            tracing::debug!(conn_id = %record.id, tag, "observe registered");
            let observer = TaggedObserver {
                tag,
                conn_id: record.id.clone(),
                link: Arc::clone(&link),
            };
            if broker.submit_observer(observer).await.is_err() {
                tracing::debug!(conn_id = %record.id, "broker closed; dropping observe");
                break;
            }
        }
    };

    tokio::select! {
        _ = forward_observes => {
            // Control stream ended (EOF or read error): the connection is
            // done signaling, so tear it down.
            conn.close(u64::from(SERVER_CLOSE_CODE), "control stream closed");
        }
        err = conn.closed() => {
            tracing::info!(conn_id = %record.id, reason = %err, "connection closed");
        }
    }
    accept_task.abort();
    Ok(())
}

// Intake loop for producer streams: strip the preamble, hand the positioned
// reader to the broker.
async fn accept_streams(conn: QuicConnection, broker: Broker, max_frame_bytes: usize) {
    loop {
        let mut recv = match conn.accept_uni().await {
            Ok(recv) => recv,
            Err(err) => {
                tracing::debug!(error = %err, "uni stream accept ended");
                return;
            }
        };
        let (stream_id, tag, metadata) = match drain_reader(&mut recv, max_frame_bytes).await {
            Ok(preamble) => preamble,
            Err(err) => {
                // A producer stream without a valid preamble has no routing
                // information; drop it and keep the connection.
                tracing::warn!(error = %err, "producer stream dropped");
                continue;
            }
        };
        if !metadata.is_empty() {
            tracing::debug!(stream_id, tag, metadata_len = metadata.len(), "producer metadata");
        }
        metrics::counter!("rilld_producer_streams_total").increment(1);
        let reader = TaggedReader {
            stream_id,
            tag,
            reader: Box::new(recv),
        };
        if broker.submit_reader(reader).await.is_err() {
            tracing::debug!("broker closed; stopping stream intake");
            return;
        }
    }
}

// Read and strip the OpenStream preamble, leaving the reader at payload
// start.
async fn drain_reader(
    recv: &mut RecvStream,
    max_frame_bytes: usize,
) -> Result<(String, String, Bytes)> {
    match codec::read_frame(recv, max_frame_bytes).await? {
        Some(Frame::OpenStream { id, tag, metadata }) => Ok((id, tag, metadata)),
        Some(frame) => bail!(
            "expected OpenStream preamble, read {}",
            frame.frame_type()
        ),
        None => bail!("producer stream closed before preamble"),
    }
}
