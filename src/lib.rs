//! A full-duplex, message-oriented [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455)
//! WebSocket core for an already-connected, async byte stream.
//!
//! This crate does not perform the opening HTTP handshake or TLS: it takes
//! any `AsyncRead + AsyncWrite` stream the caller has already upgraded to
//! WebSocket framing and drives the data plane from there — frame codec,
//! message assembly and fragmentation, permessage-deflate, ping/pong
//! heartbeats, rate limiting and the close handshake. Wiring up the
//! handshake (Sec-WebSocket-Key, TLS, routing) is the embedding
//! application's job.
//!
//! The entry point is [`Connection`]: construct one over a stream with a
//! [`Role`] and [`Options`], then call [`Connection::receive`] in a loop and
//! [`Connection::send`]/[`Connection::send_binary`] to write.

mod codec;
mod compression;
mod connection;
mod error;
mod frame;
mod message;
mod metadata;
mod options;
mod scheduler;

pub use connection::Connection;
pub use error::{ClosedError, Error, SendError};
pub use frame::OpCode;
pub use message::{ChunkResult, Message, MessageBody};
pub use metadata::{ConnectionInfo, CryptoInfo};
pub use options::{CloseCode, Options, Role};
