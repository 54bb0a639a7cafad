use crate::error::Error;
use bytes::{BufMut, BytesMut};

/// The longest possible frame header: 2 base bytes, 8 bytes of extended
/// payload length and 4 mask bytes.
pub(crate) const MAX_HEADER_SIZE: usize = 14;

/// Control frames are only allowed to carry up to 125 payload bytes.
pub(crate) const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A parsed frame header. The payload itself is consumed separately, possibly
/// across several reads.
#[derive(Debug, Clone)]
pub(crate) struct FrameHeader {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub payload_len: u64,
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Total header size in bytes, judged from the first two. Callers prefetch
    /// two bytes, ask for the full size, then prefetch the remainder before
    /// calling [`FrameHeader::parse`].
    pub fn size_from_prefix(prefix: [u8; 2]) -> usize {
        let masked = prefix[1] & 0b1000_0000 != 0;
        let extra = match prefix[1] & 0b0111_1111 {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        2 + extra + if masked { 4 } else { 0 }
    }

    /// Parse a complete header. `bytes` must hold exactly the size reported by
    /// [`FrameHeader::size_from_prefix`]. Validates the reserved bits, the
    /// opcode and the control-frame constraints.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        // The first bit of the first byte tells whether this frame is the
        // final fragment of a message, the last 4 bits carry the opcode
        let final_fragment = (bytes[0] & 0b1000_0000) != 0;

        // RSV bits are only meaningful under a negotiated extension, and this
        // engine never negotiates one. Non-zero RSV fails the connection.
        if bytes[0] & 0b0111_0000 != 0 {
            return Err(Error::RSVNotZero);
        }

        let opcode = OpCode::from(bytes[0] & 0b0000_1111)?;

        // Control opcodes (close, ping, pong) can't be fragmented
        if opcode.is_control() && !final_fragment {
            return Err(Error::ControlFramesFragmented);
        }

        let masked = (bytes[1] & 0b1000_0000) != 0;
        let length_bits = bytes[1] & 0b0111_1111;

        // 126 and 127 announce an extended length, which control frames are
        // not allowed to use either
        if opcode.is_control() && length_bits > 125 {
            return Err(Error::ControlFramePayloadSize);
        }

        let (payload_len, mask_at) = match length_bits {
            126 => (u64::from(u16::from_be_bytes([bytes[2], bytes[3]])), 4),
            127 => (
                u64::from_be_bytes([
                    bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9],
                ]),
                10,
            ),
            direct => (u64::from(direct), 2),
        };

        let mask = if masked {
            Some([
                bytes[mask_at],
                bytes[mask_at + 1],
                bytes[mask_at + 2],
                bytes[mask_at + 3],
            ])
        } else {
            None
        };

        Ok(FrameHeader {
            final_fragment,
            opcode,
            payload_len,
            mask,
        })
    }

    /// Serialize a header announcing `payload_len` payload bytes into `dst`.
    /// The mask key, when present, is written but not applied; payload
    /// masking happens in the send buffer afterwards.
    pub fn encode(
        dst: &mut BytesMut,
        opcode: OpCode,
        final_fragment: bool,
        mask: Option<[u8; 4]>,
        payload_len: usize,
    ) {
        dst.put_u8((final_fragment as u8) << 7 | opcode.as_u8());

        // The mask bit rides on top of the 7-bit length field. Lengths up to
        // 125 are stored directly, larger ones escape to a 16-bit or 64-bit
        // big-endian extension.
        let mask_bit = if mask.is_some() { 0b1000_0000 } else { 0 };
        if payload_len <= 125 {
            dst.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= 65535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(payload_len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(payload_len as u64);
        }

        if let Some(mask) = mask {
            dst.put_slice(&mask);
        }
    }
}

/// Close status code, as carried in the first two payload bytes of a Close
/// frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    NormalClosure,
    GoingAway,
    ProtocolError,
    UnsupportedData,
    InvalidFramePayloadData,
    PolicyViolation,
    MessageTooBig,
    MandatoryExtension,
    InternalServerError,
    /// Registered for use by libraries and frameworks, 3000-3999.
    Library(u16),
    /// Reserved for private use, 4000-4999.
    Private(u16),
    /// Anything else, including the codes that must never appear on the wire.
    Reserved(u16),
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        match value {
            1000 => CloseCode::NormalClosure,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1007 => CloseCode::InvalidFramePayloadData,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::InternalServerError,
            3000..=3999 => CloseCode::Library(value),
            4000..=4999 => CloseCode::Private(value),
            _ => CloseCode::Reserved(value),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::NormalClosure => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::InvalidFramePayloadData => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalServerError => 1011,
            CloseCode::Library(value) | CloseCode::Private(value) | CloseCode::Reserved(value) => {
                value
            }
        }
    }
}

impl CloseCode {
    /// Whether the code may legally appear in a Close frame. 1005 and 1006
    /// are reporting-only, the rest of [1000, 2999] outside the registered
    /// set is reserved, and [3000, 4999] is unconditionally valid.
    pub fn is_allowed(self) -> bool {
        matches!(u16::from(self), 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

/// Peer close details: the status code plus an optional UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

/// Build the payload of an egress Close frame: 2-byte big-endian status
/// followed by the UTF-8 reason, within the control-frame size limit.
pub(crate) fn encode_close_payload(code: CloseCode, reason: &str) -> Result<Vec<u8>, Error> {
    if !code.is_allowed() {
        return Err(Error::InvalidCloseCode(code.into()));
    }
    if reason.len() > MAX_CONTROL_PAYLOAD - 2 {
        return Err(Error::CloseReasonTooLong);
    }

    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&u16::from(code).to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    Ok(payload)
}

/// Decode the payload of an ingress Close frame. An empty payload stands for
/// a normal closure, a single byte can't carry a status code, and the reason
/// is decoded strictly: broken UTF-8 fails the connection.
pub(crate) fn parse_close_payload(payload: &[u8]) -> Result<CloseFrame, Error> {
    match payload.len() {
        0 => Ok(CloseFrame {
            code: CloseCode::NormalClosure,
            reason: String::new(),
        }),
        1 => Err(Error::InvalidClosePayload),
        _ => {
            let raw = u16::from_be_bytes([payload[0], payload[1]]);
            let code = CloseCode::from(raw);
            if !code.is_allowed() {
                return Err(Error::InvalidCloseCode(raw));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| Error::InvalidCloseReason)?
                .to_owned();
            Ok(CloseFrame { code, reason })
        }
    }
}
