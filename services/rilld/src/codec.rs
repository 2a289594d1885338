// Server-side frame I/O over QUIC streams.
use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use quinn::{ReadExactError, RecvStream, SendStream};
use rill_wire::{Frame, PacketHeader};

pub async fn write_frame(send: &mut SendStream, frame: &Frame) -> Result<()> {
    let packet = frame.encode_packet();
    send.write_all(&packet).await.context("write frame")?;
    Ok(())
}

/// Read one packet-framed control frame. Clean EOF before the first header
/// byte yields `None`; the length cap is enforced before allocating.
pub async fn read_frame(recv: &mut RecvStream, max_frame_bytes: usize) -> Result<Option<Frame>> {
    let mut header_bytes = [0u8; PacketHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(ReadExactError::FinishedEarly(_)) => {
            return Err(anyhow!("stream ended inside a frame header"));
        }
        Err(ReadExactError::ReadError(err)) => {
            return Err(err).context("read frame header");
        }
    }
    let header = PacketHeader::decode(&header_bytes).context("decode frame header")?;
    let length = header.length as usize;
    if length > max_frame_bytes {
        return Err(anyhow!(
            "frame too large: {length} bytes (cap {max_frame_bytes}); refusing"
        ));
    }
    let mut payload = vec![0u8; length];
    match recv.read_exact(&mut payload).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(_)) => {
            return Err(anyhow!("stream ended inside a frame payload"));
        }
        Err(ReadExactError::ReadError(err)) => {
            return Err(err).context("read frame payload");
        }
    }
    let frame =
        Frame::decode(header.frame_type, Bytes::from(payload)).context("decode frame")?;
    Ok(Some(frame))
}
