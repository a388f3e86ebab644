use crate::error::Error;

/// A WebSocket frame's 4-bit opcode.
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
    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            // 3-7 and 11-15 are reserved for future non-control/control
            // extensions and must be rejected as a protocol violation.
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

    pub fn is_data(&self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

/// The RSV1 bit used by permessage-deflate to mark a message as compressed.
pub const COMPRESSION_RSV: u8 = 0b100;

/// One parsed (or about-to-be-encoded) WebSocket frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    /// Whether RSV1 is set on this frame, i.e. the message this frame
    /// belongs to is permessage-deflate compressed. Only meaningful on the
    /// first frame of a message; continuation frames carry RSV 0 and the
    /// flag is tracked separately by the assembler.
    pub compressed: bool,
}

impl Frame {
    pub fn new(final_fragment: bool, opcode: OpCode, payload: Vec<u8>, compressed: bool) -> Self {
        Self {
            final_fragment,
            opcode,
            payload,
            compressed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrips_through_byte() {
        for (byte, opcode) in [
            (0x0, OpCode::Continue),
            (0x1, OpCode::Text),
            (0x2, OpCode::Binary),
            (0x8, OpCode::Close),
            (0x9, OpCode::Ping),
            (0xA, OpCode::Pong),
        ] {
            let parsed = OpCode::from_byte(byte).unwrap();
            assert_eq!(parsed, opcode);
            assert_eq!(parsed.as_u8(), byte);
        }
    }

    #[test]
    fn reserved_opcodes_are_rejected() {
        for byte in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
            assert!(OpCode::from_byte(byte).is_err());
        }
    }

    #[test]
    fn control_classification() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(!OpCode::Continue.is_control());
    }
}
