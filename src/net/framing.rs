use arrayvec::ArrayVec;

use crate::error::FrameError;

/// Largest header: 2 fixed bytes, 8 extended length bytes, 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const TOO_BIG: u16 = 1009;

    /// Codes a peer may legally put on the wire (RFC 6455 section 7.4).
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(bits: u8) -> Result<Self, FrameError> {
        match bits {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A decoded frame. `payload` is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub payload: Vec<u8>,
}

/// XORs `payload` in place with the cycling 4-byte key. Masking and
/// unmasking are the same operation.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` once a full frame is buffered,
/// `Ok(None)` if more data is needed (incomplete), and `Err` for frames that
/// can never become valid. Header checks run before the payload arrives so a
/// hostile length is refused without buffering it.
pub fn decode_frame(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first_byte = buf[0];
    let second_byte = buf[1];

    let fin = (first_byte & 0x80) != 0;
    if first_byte & 0x70 != 0 {
        return Err(FrameError::ReservedBits);
    }
    let opcode = OpCode::from_u8(first_byte & 0x0F)?;

    let masked = (second_byte & 0x80) != 0;
    let len7 = second_byte & 0x7F;

    if opcode.is_control() {
        if !fin {
            return Err(FrameError::FragmentedControl);
        }
        if u64::from(len7) > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlTooLarge(u64::from(len7)));
        }
    }

    let mut header_len = 2;
    let payload_len = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            header_len += 2;
            u64::from(u16::from_be_bytes([buf[2], buf[3]]))
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&buf[2..10]);
            header_len += 8;
            let len = u64::from_be_bytes(len_bytes);
            if len >> 63 != 0 {
                return Err(FrameError::InvalidLength(len));
            }
            len
        }
        short => u64::from(short),
    };

    if payload_len > max_payload as u64 {
        return Err(FrameError::TooLarge {
            len: payload_len,
            max: max_payload,
        });
    }
    // Bounded by max_payload above, so this fits in usize.
    let payload_len = payload_len as usize;
    let too_large = || FrameError::TooLarge {
        len: payload_len as u64,
        max: max_payload,
    };

    let mut mask_key = [0u8; 4];
    if masked {
        if buf.len() < header_len + 4 {
            return Ok(None);
        }
        mask_key.copy_from_slice(&buf[header_len..header_len + 4]);
        header_len += 4;
    }

    let total_len = header_len.checked_add(payload_len).ok_or_else(too_large)?;
    if buf.len() < total_len {
        return Ok(None);
    }

    log::trace!("frame header {}", hex::encode(&buf[..header_len]));

    let mut payload = buf[header_len..total_len].to_vec();
    if masked {
        apply_mask(&mut payload, mask_key);
    }

    Ok(Some((
        Frame {
            fin,
            opcode,
            masked,
            payload,
        },
        total_len,
    )))
}

fn encode_header(opcode: OpCode, payload_len: usize, mask_key: Option<[u8; 4]>) -> ArrayVec<u8, MAX_HEADER_LEN> {
    let mut header = ArrayVec::new();
    header.push(0x80 | opcode.as_u8());

    let mask_bit = if mask_key.is_some() { 0x80 } else { 0x00 };
    if payload_len < 126 {
        header.push(mask_bit | payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        header.push(mask_bit | 126);
        header.extend((payload_len as u16).to_be_bytes());
    } else {
        header.push(mask_bit | 127);
        header.extend((payload_len as u64).to_be_bytes());
    }

    if let Some(key) = mask_key {
        header.extend(key);
    }
    header
}

/// Encodes a single unmasked, unfragmented server-to-client frame.
pub fn encode_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let header = encode_header(opcode, payload.len(), None);
    let mut out = Vec::with_capacity(header.len() + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    out
}

pub fn encode_text(text: &str) -> Vec<u8> {
    encode_frame(OpCode::Text, text.as_bytes())
}

/// Encodes a masked frame the way a client must send it.
pub fn encode_masked_frame(opcode: OpCode, fin: bool, payload: &[u8], mask_key: [u8; 4]) -> Vec<u8> {
    let mut header = encode_header(opcode, payload.len(), Some(mask_key));
    if !fin {
        header[0] &= 0x7F;
    }
    let mut out = Vec::with_capacity(header.len() + payload.len());
    out.extend_from_slice(&header);
    let start = out.len();
    out.extend_from_slice(payload);
    apply_mask(&mut out[start..], mask_key);
    out
}

/// Status code and reason carried by a Close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: &str) -> Self {
        Self {
            code: Some(code),
            reason: reason.to_string(),
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        match payload.len() {
            0 => Ok(Self {
                code: None,
                reason: String::new(),
            }),
            1 => Err(FrameError::InvalidClosePayload),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !close_code::is_sendable(code) {
                    return Err(FrameError::InvalidClosePayload);
                }
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| FrameError::InvalidClosePayload)?;
                Ok(Self {
                    code: Some(code),
                    reason: reason.to_string(),
                })
            }
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let Some(code) = self.code else {
            return Vec::new();
        };
        let mut payload = code.to_be_bytes().to_vec();
        let mut reason = self.reason.as_str();
        // Keep the whole control frame within 125 bytes, cutting on a char boundary.
        while reason.len() > MAX_CONTROL_PAYLOAD as usize - 2 {
            let mut cut = reason.len() - 1;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason = &reason[..cut];
        }
        payload.extend_from_slice(reason.as_bytes());
        payload
    }
}
