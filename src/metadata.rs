//! Per-connection counters and the snapshot handed out by `get_info()`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Generates a process-wide unique connection id.
///
/// A plain counter, not a UUID: the data model calls for "a unique int",
/// and nothing here crosses process boundaries where collision resistance
/// would matter.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Opaque info about the peer's certificate, when the underlying stream is
/// TLS. The core never inspects this; it is supplied by the caller at
/// connection construction time and handed back verbatim through
/// `get_info()`/`crypto_info()`.
#[derive(Debug, Clone)]
pub struct CryptoInfo {
    pub protocol: String,
    pub cipher_suite: String,
}

/// By-value snapshot of a connection's counters, as returned by
/// `Connection::get_info()`. Copying out of the live `ConnectionMetadata`
/// avoids ever handing callers a reference that could tear mid-read.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub crypto_info: Option<CryptoInfo>,
    pub connected_at: Instant,
    pub closed_at: Option<Instant>,
    pub close_code: Option<u16>,
    pub close_reason: String,
    pub peer_initiated_close: bool,
    pub bytes_read: u64,
    pub bytes_sent: u64,
    pub frames_read: u64,
    pub frames_sent: u64,
    pub messages_read: u64,
    pub messages_sent: u64,
    pub ping_count: u64,
    pub pong_count: u64,
    pub last_read_at: Option<Instant>,
    pub last_data_read_at: Option<Instant>,
    pub last_sent_at: Option<Instant>,
    pub last_data_sent_at: Option<Instant>,
    pub last_heartbeat_at: Option<Instant>,
}

/// Mutable, single-writer counters for one connection. Only the connection
/// task that owns this connection ever mutates it; `get_info()` copies it
/// out for any other reader.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub id: u64,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub crypto_info: Option<CryptoInfo>,
    pub connected_at: Instant,
    pub closed_at: Option<Instant>,
    pub close_code: Option<u16>,
    pub close_reason: String,
    pub peer_initiated_close: bool,
    pub bytes_read: u64,
    pub bytes_sent: u64,
    pub frames_read: u64,
    pub frames_sent: u64,
    pub messages_read: u64,
    pub messages_sent: u64,
    pub ping_count: u64,
    pub pong_count: u64,
    pub last_read_at: Option<Instant>,
    pub last_data_read_at: Option<Instant>,
    pub last_sent_at: Option<Instant>,
    pub last_data_sent_at: Option<Instant>,
    pub last_heartbeat_at: Option<Instant>,
}

impl ConnectionMetadata {
    pub fn new(
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        crypto_info: Option<CryptoInfo>,
    ) -> Self {
        Self {
            id: next_connection_id(),
            local_addr,
            remote_addr,
            crypto_info,
            connected_at: Instant::now(),
            closed_at: None,
            close_code: None,
            close_reason: String::new(),
            peer_initiated_close: false,
            bytes_read: 0,
            bytes_sent: 0,
            frames_read: 0,
            frames_sent: 0,
            messages_read: 0,
            messages_sent: 0,
            ping_count: 0,
            pong_count: 0,
            last_read_at: None,
            last_data_read_at: None,
            last_sent_at: None,
            last_data_sent_at: None,
            last_heartbeat_at: None,
        }
    }

    pub fn record_read(&mut self, bytes: u64, now: Instant) {
        self.bytes_read += bytes;
        self.frames_read += 1;
        self.last_read_at = Some(now);
    }

    pub fn record_data_read(&mut self, now: Instant) {
        self.last_data_read_at = Some(now);
    }

    pub fn record_sent(&mut self, bytes: u64, now: Instant) {
        self.bytes_sent += bytes;
        self.frames_sent += 1;
        self.last_sent_at = Some(now);
    }

    pub fn record_data_sent(&mut self, now: Instant) {
        self.last_data_sent_at = Some(now);
    }

    /// Sets `pong_count` to `min(ping_count, parsed)`, the guard against a
    /// peer inflating its pong replies to starve the idle-close heuristic.
    pub fn record_pong(&mut self, parsed: u64) {
        self.pong_count = self.pong_count.max(parsed.min(self.ping_count));
    }

    pub fn record_ping(&mut self) {
        self.ping_count += 1;
    }

    pub fn snapshot(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            crypto_info: self.crypto_info.clone(),
            connected_at: self.connected_at,
            closed_at: self.closed_at,
            close_code: self.close_code,
            close_reason: self.close_reason.clone(),
            peer_initiated_close: self.peer_initiated_close,
            bytes_read: self.bytes_read,
            bytes_sent: self.bytes_sent,
            frames_read: self.frames_read,
            frames_sent: self.frames_sent,
            messages_read: self.messages_read,
            messages_sent: self.messages_sent,
            ping_count: self.ping_count,
            pong_count: self.pong_count,
            last_read_at: self.last_read_at,
            last_data_read_at: self.last_data_read_at,
            last_sent_at: self.last_sent_at,
            last_data_sent_at: self.last_data_sent_at,
            last_heartbeat_at: self.last_heartbeat_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_count_never_exceeds_ping_count() {
        let mut meta = ConnectionMetadata::new(None, None, None);
        meta.record_ping();
        meta.record_ping();
        meta.record_pong(100);
        assert_eq!(meta.pong_count, 2);
    }

    #[test]
    fn pong_count_is_monotonically_non_decreasing() {
        let mut meta = ConnectionMetadata::new(None, None, None);
        for _ in 0..5 {
            meta.record_ping();
        }
        meta.record_pong(3);
        assert_eq!(meta.pong_count, 3);
        meta.record_pong(1);
        assert_eq!(meta.pong_count, 3);
        meta.record_pong(5);
        assert_eq!(meta.pong_count, 5);
    }

    #[test]
    fn connection_ids_are_unique_and_increasing() {
        let a = ConnectionMetadata::new(None, None, None);
        let b = ConnectionMetadata::new(None, None, None);
        assert!(b.id > a.id);
    }
}
