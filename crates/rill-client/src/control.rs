// Client half of the control-stream protocol.
use crate::wire::{read_frame, write_frame};
use crate::{ClientError, Result};
use quinn::{RecvStream, SendStream};
use rill_auth::Credential;
use rill_transport::QuicConnection;
use rill_wire::{Frame, SERVER_CLOSE_CODE};

/// Send the credential and wait for the server's verdict.
///
/// On success the server's assigned connection id is returned and a
/// background task keeps draining the control stream for late rejections.
pub(crate) async fn authenticate(
    conn: &QuicConnection,
    send: &mut SendStream,
    mut recv: RecvStream,
    credential: &Credential,
    max_frame_bytes: usize,
) -> Result<String> {
    write_frame(
        send,
        &Frame::Authentication {
            auth_name: credential.name().to_string(),
            auth_payload: credential.payload().to_string(),
        },
    )
    .await?;

    let reply = match read_frame(&mut recv, max_frame_bytes).await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            return Err(ClientError::Transport(anyhow::anyhow!(
                "control stream closed during authentication"
            )));
        }
        Err(err) => {
            // The server may close the connection before the rejection frame
            // is readable; surface the close reason if it names auth.
            if let Some(reason) = auth_close_reason(&err) {
                return Err(ClientError::AuthenticationFailed { reason });
            }
            return Err(err);
        }
    };

    let id = match reply {
        Frame::AuthenticationAck { id } => id,
        Frame::Rejected { message, .. } => {
            return Err(ClientError::AuthenticationFailed { reason: message });
        }
        other => {
            return Err(ClientError::UnexpectedFrame {
                frame_type: other.frame_type().as_str(),
            });
        }
    };

    let conn = conn.clone();
    tokio::spawn(read_frame_loop(conn, recv, max_frame_bytes));
    Ok(id)
}

// Drain the control stream after authentication. The only frame the server
// sends here is Rejected, which terminates the connection with its code.
async fn read_frame_loop(conn: QuicConnection, mut recv: RecvStream, max_frame_bytes: usize) {
    loop {
        match read_frame(&mut recv, max_frame_bytes).await {
            Ok(Some(Frame::Rejected { code, message })) => {
                tracing::info!(code, message, "server rejected connection");
                conn.close(code, &message);
                return;
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
                conn.close(u64::from(SERVER_CLOSE_CODE), "control stream read failed");
                return;
            }
        }
    }
}

// Dig a QUIC application-close reason out of a transport error chain when it
// carries the server's authentication verdict.
fn auth_close_reason(err: &ClientError) -> Option<String> {
    let ClientError::Transport(err) = err else {
        return None;
    };
    for cause in err.chain() {
        let close = if let Some(read_err) = cause.downcast_ref::<quinn::ReadError>() {
            match read_err {
                quinn::ReadError::ConnectionLost(quinn::ConnectionError::ApplicationClosed(
                    close,
                )) => Some(close),
                _ => None,
            }
        } else if let Some(conn_err) = cause.downcast_ref::<quinn::ConnectionError>() {
            match conn_err {
                quinn::ConnectionError::ApplicationClosed(close) => Some(close),
                _ => None,
            }
        } else {
            None
        };
        if let Some(close) = close {
            let reason = String::from_utf8_lossy(&close.reason).into_owned();
            if reason.starts_with("authentication failed") {
                return Some(reason);
            }
        }
    }
    None
}
