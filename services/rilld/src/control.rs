// Server half of the control-stream protocol.
//
// Per connection: read the Authentication frame, verify it, answer with an
// ack carrying the assigned connection id, then keep reading Observe frames
// into a channel until the stream dies. Rejections carry a protocol code on
// the stream and close the whole connection with the server close code.
use crate::codec;
use anyhow::{Result, anyhow};
use quinn::{RecvStream, SendStream};
use rill_metadata::Md;
use rill_transport::QuicConnection;
use rill_wire::{
    Frame, REJECTED_CODE_CREDENTIAL, REJECTED_CODE_UNEXPECTED_FRAME, SERVER_CLOSE_CODE,
};
use std::time::Duration;
use tokio::sync::mpsc;

// How long to let a rejection frame drain before the connection close races
// it off the wire.
const REJECT_DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

/// The control stream before authentication has finished.
pub struct ServerControlStream {
    id: String,
    conn: QuicConnection,
    send: SendStream,
    recv: RecvStream,
    max_frame_bytes: usize,
}

/// Verifier supplied by the server: credential name + payload in, metadata
/// and verdict out.
pub type VerifyFn<'a> = Box<dyn FnOnce(&str, &str) -> (Option<Md>, bool) + Send + 'a>;

/// Result of a successful handshake. Dropping `send` would reset the
/// stream under the peer, so the connection manager keeps it alive.
pub struct AuthenticatedControl {
    pub id: String,
    pub metadata: Option<Md>,
    pub observe_rx: mpsc::Receiver<String>,
    pub send: SendStream,
}

impl ServerControlStream {
    pub fn new(
        id: String,
        conn: QuicConnection,
        send: SendStream,
        recv: RecvStream,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            id,
            conn,
            send,
            recv,
            max_frame_bytes,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drive the handshake to completion or rejection.
    pub async fn verify_authentication(mut self, verify: VerifyFn<'_>) -> Result<AuthenticatedControl> {
        let first = codec::read_frame(&mut self.recv, self.max_frame_bytes)
            .await?
            .ok_or_else(|| anyhow!("control stream closed before authentication"))?;

        let (auth_name, auth_payload) = match first {
            Frame::Authentication {
                auth_name,
                auth_payload,
            } => (auth_name, auth_payload),
            other => {
                let message = format!(
                    "authentication failed: read unexpected frame, frame read: {}",
                    other.frame_type()
                );
                self.reject_with_close(REJECTED_CODE_UNEXPECTED_FRAME, &message)
                    .await;
                return Err(anyhow!(message));
            }
        };

        let (metadata, ok) = verify(&auth_name, &auth_payload);
        if !ok {
            let message =
                format!("authentication failed: client credential name is {auth_name}");
            self.reject_with_close(REJECTED_CODE_CREDENTIAL, &message)
                .await;
            return Err(anyhow!(message));
        }

        codec::write_frame(
            &mut self.send,
            &Frame::AuthenticationAck {
                id: self.id.clone(),
            },
        )
        .await?;

        let (observe_tx, observe_rx) = mpsc::channel(1);
        tokio::spawn(read_frame_loop(self.recv, observe_tx, self.max_frame_bytes));
        Ok(AuthenticatedControl {
            id: self.id,
            metadata,
            observe_rx,
            send: self.send,
        })
    }

    async fn reject_with_close(&mut self, code: u64, message: &str) {
        metrics::counter!("rilld_rejected_total").increment(1);
        let frame = Frame::Rejected {
            code,
            message: message.to_string(),
        };
        if let Err(err) = codec::write_frame(&mut self.send, &frame).await {
            tracing::debug!(error = %err, "write rejected frame failed");
        }
        let _ = self.send.finish();
        let _ = tokio::time::timeout(REJECT_DRAIN_TIMEOUT, self.send.stopped()).await;
        self.conn.close(u64::from(SERVER_CLOSE_CODE), message);
    }
}

// Consume frames for the rest of the connection's life. Only Observe is
// meaningful here; anything else is logged and ignored. Dropping the sender
// on exit closes the observe channel, which the connection manager treats as
// end of signaling.
async fn read_frame_loop(
    mut recv: RecvStream,
    observe_tx: mpsc::Sender<String>,
    max_frame_bytes: usize,
) {
    loop {
        match codec::read_frame(&mut recv, max_frame_bytes).await {
            Ok(Some(Frame::Observe { tag })) => {
                if observe_tx.send(tag).await.is_err() {
                    return;
                }
            }
            Ok(Some(frame)) => {
                tracing::debug!(
                    frame_type = frame.frame_type().as_str(),
                    "control stream read unexpected frame"
                );
            }
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(error = %err, "control stream read failed");
                return;
            }
        }
    }
}
