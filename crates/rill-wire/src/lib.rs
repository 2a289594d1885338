// Wire format for the rill control protocol.
//
// Two layers:
// - packet codec: `type(u8) | length(u32 BE) | payload` pairs on a byte stream.
// - frame codec: the closed set of control frames encoded into packet payloads.
//
// Both layers are pure transformations over `Bytes`; async I/O lives at the
// call sites so the codec stays trivially testable.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Rejection code sent when the presented credential is refused.
pub const REJECTED_CODE_CREDENTIAL: u64 = 223;
/// Rejection code sent when the first control frame is not Authentication.
pub const REJECTED_CODE_UNEXPECTED_FRAME: u64 = 224;
/// QUIC application error code for server-initiated closes.
pub const SERVER_CLOSE_CODE: u32 = 0xDF;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("truncated frame payload")]
    Truncated,
    #[error("frame too large")]
    FrameTooLarge,
    #[error("invalid utf-8 in frame field")]
    InvalidUtf8,
}

/// Frame discriminants as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Authentication = 0x03,
    AuthenticationAck = 0x11,
    Observe = 0x2f,
    OpenStream = 0x30,
    Rejected = 0x39,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x03 => Ok(Self::Authentication),
            0x11 => Ok(Self::AuthenticationAck),
            0x2f => Ok(Self::Observe),
            0x30 => Ok(Self::OpenStream),
            0x39 => Ok(Self::Rejected),
            other => Err(Error::UnknownType(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    // Diagnostic name used in logs and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "Authentication",
            Self::AuthenticationAck => "AuthenticationAck",
            Self::Observe => "Observe",
            Self::OpenStream => "OpenStream",
            Self::Rejected => "Rejected",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet header prefixed to every frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_type: u8,
    pub length: u32,
}

impl PacketHeader {
    pub const LEN: usize = 5;

    pub fn new(frame_type: u8, length: u32) -> Self {
        Self { frame_type, length }
    }

    pub fn encode_into(&self, buf: &mut [u8; Self::LEN]) {
        buf[0] = self.frame_type;
        buf[1..].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < Self::LEN {
            return Err(Error::Truncated);
        }
        let mut length = [0u8; 4];
        length.copy_from_slice(&input[1..Self::LEN]);
        Ok(Self {
            frame_type: input[0],
            length: u32::from_be_bytes(length),
        })
    }
}

/// Control frame as carried on the wire.
///
/// ```
/// use rill_wire::Frame;
///
/// let frame = Frame::Observe { tag: "sensors".to_string() };
/// let payload = frame.encode_payload();
/// let decoded = Frame::decode(frame.frame_type().as_byte(), payload).expect("decode");
/// assert_eq!(decoded, Frame::Observe { tag: "sensors".to_string() });
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Peer -> server, once, first frame on the control stream.
    Authentication { auth_name: String, auth_payload: String },
    /// Server -> peer; carries the broker-assigned connection id.
    AuthenticationAck { id: String },
    /// Peer -> server on the control stream.
    Observe { tag: String },
    /// Preamble on a producer's unidirectional stream.
    OpenStream { id: String, tag: String, metadata: Bytes },
    /// Server -> peer, terminal on the control stream.
    Rejected { code: u64, message: String },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Authentication { .. } => FrameType::Authentication,
            Self::AuthenticationAck { .. } => FrameType::AuthenticationAck,
            Self::Observe { .. } => FrameType::Observe,
            Self::OpenStream { .. } => FrameType::OpenStream,
            Self::Rejected { .. } => FrameType::Rejected,
        }
    }

    // Encode only the packet payload; the packet header is written separately.
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Authentication {
                auth_name,
                auth_payload,
            } => {
                put_str(&mut buf, auth_name);
                put_str(&mut buf, auth_payload);
            }
            Self::AuthenticationAck { id } => put_str(&mut buf, id),
            Self::Observe { tag } => put_str(&mut buf, tag),
            Self::OpenStream { id, tag, metadata } => {
                put_str(&mut buf, id);
                put_str(&mut buf, tag);
                put_bytes(&mut buf, metadata);
            }
            Self::Rejected { code, message } => {
                buf.put_u64(*code);
                put_str(&mut buf, message);
            }
        }
        buf.freeze()
    }

    /// Encode header and payload as one buffer, ready to write.
    pub fn encode_packet(&self) -> Bytes {
        let payload = self.encode_payload();
        let mut buf = BytesMut::with_capacity(PacketHeader::LEN + payload.len());
        buf.put_u8(self.frame_type().as_byte());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        buf.freeze()
    }

    pub fn decode(frame_type: u8, mut payload: Bytes) -> Result<Self> {
        match FrameType::from_byte(frame_type)? {
            FrameType::Authentication => {
                let auth_name = get_str(&mut payload)?;
                let auth_payload = get_str(&mut payload)?;
                Ok(Self::Authentication {
                    auth_name,
                    auth_payload,
                })
            }
            FrameType::AuthenticationAck => Ok(Self::AuthenticationAck {
                id: get_str(&mut payload)?,
            }),
            FrameType::Observe => Ok(Self::Observe {
                tag: get_str(&mut payload)?,
            }),
            FrameType::OpenStream => {
                let id = get_str(&mut payload)?;
                let tag = get_str(&mut payload)?;
                let metadata = get_bytes(&mut payload)?;
                Ok(Self::OpenStream { id, tag, metadata })
            }
            FrameType::Rejected => {
                if payload.remaining() < 8 {
                    return Err(Error::Truncated);
                }
                let code = payload.get_u64();
                let message = get_str(&mut payload)?;
                Ok(Self::Rejected { code, message })
            }
        }
    }
}

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.extend_from_slice(value);
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(Error::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::Truncated);
    }
    Ok(buf.copy_to_bytes(len))
}

fn get_str(buf: &mut Bytes) -> Result<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidUtf8)
}
