use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

use crate::options::CloseCode;

/// All failure modes the connection core can produce.
///
/// Protocol, policy, size, type and UTF-8 violations are never propagated to
/// a background task: the connection core catches them internally and turns
/// them into a local `close()` call. They only reach a caller wrapped in
/// [`ClosedError`], via a pending `send`/`stream`/`ping` future that was
/// still in flight when the close happened.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    #[error("channel communication error")]
    CommunicationError,

    // Framing errors
    #[error("Invalid Opcode")]
    InvalidOpcode,

    #[error("RSV bits set without a matching extension")]
    RSVNotZero,

    #[error("Control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("Control frame with invalid payload size, can't be greater than 125")]
    ControlFramePayloadSize,

    #[error("Payload mask error")]
    PayloadMaskError,

    #[error("Max frame size reached")]
    MaxFrameSize,

    #[error("Max message size reached")]
    MaxMessageSize,

    #[error("negative extended payload length")]
    NegativeLength,

    // Fragmentation errors
    #[error("Invalid frame while there is a fragmented message in progress")]
    InvalidFrameFragmentation,

    #[error("Incoming fragmented message but there is one already in progress")]
    FragmentedInProgress,

    #[error("Invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    // Type / content errors
    #[error("Binary messages are rejected by text_only configuration")]
    UnacceptableType,

    #[error("Invalid TEXT data; UTF-8 required")]
    InvalidUtf8,

    #[error("Close reason must be valid UTF-8")]
    InvalidCloseReasonUtf8,

    #[error("Close code must be two bytes")]
    CloseCodeMustBeTwoBytes,

    #[error("Invalid close code")]
    InvalidCloseCode,

    #[error("Malformed PONG payload")]
    MalformedPong,

    // Compression errors
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    // Misuse, raised synchronously to the caller, never closes the connection
    #[error("receive() called while a previous call is still pending")]
    ReceiveAlreadyInProgress,

    #[error("close_code accessed before the connection reached CLOSED")]
    NotYetClosed,
}

/// Returned to a caller whose outstanding operation was cut short by a close
/// (locally requested, peer-initiated, or caused by a transport failure).
#[derive(Error, Debug, Clone)]
#[error("connection closed: {close_code:?} {close_reason:?}")]
pub struct ClosedError {
    pub close_code: CloseCode,
    pub close_reason: String,
}

impl ClosedError {
    pub fn new(close_code: CloseCode, close_reason: impl Into<String>) -> Self {
        Self {
            close_code,
            close_reason: close_reason.into(),
        }
    }
}

/// Returned by [`crate::Connection::send`].
///
/// `InvalidUtf8` is a synchronous misuse error, raised before anything is
/// written to the wire: the caller passed a non-UTF-8 payload to the
/// text-sending method. It carries no close information because the
/// connection is untouched — unlike [`ClosedError`], it does not mean the
/// connection is gone.
#[derive(Error, Debug, Clone)]
pub enum SendError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error(transparent)]
    Closed(#[from] ClosedError),
}
