// Frame I/O over the control stream.
use crate::{ClientError, Result};
use bytes::Bytes;
use quinn::{ReadExactError, RecvStream, SendStream};
use rill_wire::{Error as WireError, Frame, PacketHeader};

pub(crate) async fn write_frame(send: &mut SendStream, frame: &Frame) -> Result<()> {
    let packet = frame.encode_packet();
    send.write_all(&packet)
        .await
        .map_err(|err| transport(err, "write frame"))?;
    Ok(())
}

// Clean EOF before the first header byte returns None; EOF anywhere else is
// a truncated frame.
pub(crate) async fn read_frame(
    recv: &mut RecvStream,
    max_frame_bytes: usize,
) -> Result<Option<Frame>> {
    let mut header_bytes = [0u8; PacketHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(ReadExactError::FinishedEarly(_)) => return Err(ClientError::Decode(WireError::Truncated)),
        Err(ReadExactError::ReadError(err)) => return Err(transport(err, "read frame header")),
    }
    let header = PacketHeader::decode(&header_bytes)?;
    let length = header.length as usize;
    if length > max_frame_bytes {
        return Err(ClientError::Decode(WireError::FrameTooLarge));
    }
    let mut payload = vec![0u8; length];
    match recv.read_exact(&mut payload).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(_)) => {
            return Err(ClientError::Decode(WireError::Truncated));
        }
        Err(ReadExactError::ReadError(err)) => return Err(transport(err, "read frame payload")),
    }
    Ok(Some(Frame::decode(header.frame_type, Bytes::from(payload))?))
}

fn transport(err: impl std::error::Error + Send + Sync + 'static, what: &'static str) -> ClientError {
    ClientError::Transport(anyhow::Error::new(err).context(what))
}
