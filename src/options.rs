//! Immutable connection configuration and the RFC 6455 close-code table.

/// Role a connection plays on the wire: which side masks payloads.
///
/// Per RFC 6455, the initiator (client) masks every frame it sends; the
/// responder (server) never masks. A connection's role never changes over
/// its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub(crate) fn masks_outbound(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// Immutable, constructed-once connection configuration.
///
/// There is no builder in the teacher's sense because every field here has a
/// sane default; construct with `Options { frame_size_limit: ..., ..Options::default() }`
/// the way the teacher constructs `WebSocketConfig`.
#[derive(Debug, Clone)]
pub struct Options {
    /// Max bytes of a single inbound frame payload.
    pub frame_size_limit: usize,
    /// Max bytes of a reassembled inbound message.
    pub message_size_limit: usize,
    /// Outbound payloads larger than this are fragmented into multiple frames.
    pub frame_split_threshold: usize,
    /// Bytes buffered during `stream()`/inbound assembly before a chunk is
    /// emitted to the message body consumer.
    pub stream_threshold: usize,
    /// Enables the idle-ping heartbeat scheduler for this connection.
    pub heartbeat_enabled: bool,
    /// Idle period, in seconds, before a ping is sent.
    pub heartbeat_period_secs: u64,
    /// Max unanswered pings tolerated before the connection is force-closed.
    pub queued_ping_limit: u32,
    /// How long to wait for the peer's echoing CLOSE frame after we send ours.
    pub close_period_secs: u64,
    /// Inbound frame-count throttle, reset every scheduler tick.
    pub frames_per_second_limit: Option<u32>,
    /// Inbound byte-count throttle, reset every scheduler tick.
    pub bytes_per_second_limit: Option<u64>,
    /// Enforce UTF-8 validity on TEXT messages and CLOSE reasons.
    pub validate_utf8: bool,
    /// Reject BIN opcodes outright.
    pub text_only: bool,
    /// Minimum outbound payload size, in bytes, before compression is applied.
    pub compression_threshold: usize,
    /// Enables permessage-deflate when both sides would otherwise not
    /// negotiate it (negotiation itself is out of this core's scope; this
    /// flag stands in for "the caller already negotiated it upstream").
    pub compression_enabled: bool,
    /// Whether the compression context's sliding window persists across
    /// messages (`true`) or is reset after each message (`false`).
    pub compression_context_takeover: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            frame_size_limit: 16 << 20,
            message_size_limit: 64 << 20,
            frame_split_threshold: 64 * 1024,
            stream_threshold: 16 * 1024,
            heartbeat_enabled: true,
            heartbeat_period_secs: 30,
            queued_ping_limit: 3,
            close_period_secs: 5,
            frames_per_second_limit: None,
            bytes_per_second_limit: None,
            validate_utf8: true,
            text_only: false,
            compression_threshold: 860,
            compression_enabled: false,
            compression_context_takeover: true,
        }
    }
}

/// Well-known RFC 6455 close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NONE: CloseCode = CloseCode(1005);
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const UNACCEPTABLE_TYPE: CloseCode = CloseCode(1003);
    pub const ABNORMAL: CloseCode = CloseCode(1006);
    pub const INCONSISTENT_FRAME_DATA_TYPE: CloseCode = CloseCode(1007);
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    pub const MESSAGE_TOO_LARGE: CloseCode = CloseCode(1009);
    pub const UNEXPECTED_SERVER_ERROR: CloseCode = CloseCode(1011);

    /// Whether this code is legal to put on the wire in a CLOSE frame.
    ///
    /// RFC-aligned range, excluding the reserved 1004-1006 block (which can
    /// only be observed locally, never sent) and 1014-1016, per this crate's
    /// resolution of the spec's close-code-range open question (see
    /// DESIGN.md).
    pub fn is_valid_wire_code(self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1013 | 3000..=4999)
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_codes_are_valid_except_none_and_abnormal() {
        assert!(CloseCode::NORMAL.is_valid_wire_code());
        assert!(CloseCode::PROTOCOL_ERROR.is_valid_wire_code());
        assert!(CloseCode::MESSAGE_TOO_LARGE.is_valid_wire_code());
        assert!(!CloseCode::NONE.is_valid_wire_code());
        assert!(!CloseCode::ABNORMAL.is_valid_wire_code());
    }

    #[test]
    fn reserved_and_out_of_range_codes_are_invalid() {
        assert!(!CloseCode(1004).is_valid_wire_code());
        assert!(!CloseCode(1014).is_valid_wire_code());
        assert!(!CloseCode(1999).is_valid_wire_code());
        assert!(!CloseCode(2999).is_valid_wire_code());
        assert!(!CloseCode(5000).is_valid_wire_code());
    }

    #[test]
    fn application_band_is_valid() {
        assert!(CloseCode(3000).is_valid_wire_code());
        assert!(CloseCode(4999).is_valid_wire_code());
    }
}
