//! permessage-deflate compression context.
//!
//! Wraps a `flate2` compressor/decompressor pair behind the narrow contract
//! the connection core needs: compress a slice honoring context-takeover,
//! decompress a full message's accumulated payload, and report which RSV bit
//! and size threshold apply.

use bytes::BytesMut;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::Error;
use crate::frame::COMPRESSION_RSV;

const DEFLATE_TRAILER: [u8; 4] = [0, 0, 255, 255];

fn calculate_buffer_size(payload_size: usize) -> usize {
    if payload_size <= 4096 {
        4096
    } else if payload_size <= 65536 {
        16384
    } else {
        65536
    }
}

/// A per-connection compressor/decompressor pair.
///
/// `context_takeover` controls whether the sliding window persists between
/// messages (`true`) or is reset to a blank state before each message
/// (`false`); RFC 7692 allows the two directions to pick independently, but
/// this core uses one flag for both, matching `Options::compression_context_takeover`.
pub struct CompressionContext {
    compressor: Compress,
    decompressor: Decompress,
    context_takeover: bool,
    threshold: usize,
}

impl CompressionContext {
    pub fn new(context_takeover: bool, threshold: usize, window_bits: u8) -> Self {
        Self {
            compressor: Compress::new_with_window_bits(Compression::default(), false, window_bits),
            decompressor: Decompress::new_with_window_bits(false, window_bits),
            context_takeover,
            threshold,
        }
    }

    pub fn compression_threshold(&self) -> usize {
        self.threshold
    }

    /// RSV1 is the bit permessage-deflate claims on the wire.
    pub fn rsv_bit(&self) -> u8 {
        COMPRESSION_RSV
    }

    /// Compresses `payload`, returning a DEFLATE block with the final
    /// empty-block marker trimmed per RFC 7692 §7.2.1. `final_block` marks
    /// the last slice of a (possibly fragmented) outbound message; it
    /// triggers the context reset when context-takeover is disabled.
    pub fn compress(&mut self, payload: &[u8], final_block: bool) -> Result<Vec<u8>, Error> {
        if !self.context_takeover {
            self.compressor.reset();
        }

        let buffer_size = calculate_buffer_size(payload.len());
        let mut out = BytesMut::with_capacity(buffer_size.max(payload.len()));
        let mut buf = vec![0u8; buffer_size];

        let before_in = self.compressor.total_in();
        let before_out = self.compressor.total_out();

        while (self.compressor.total_in() - before_in) < payload.len() as u64 {
            let offset = (self.compressor.total_in() - before_in) as usize;
            let input = &payload[offset..];
            let flush = if final_block {
                FlushCompress::Sync
            } else {
                FlushCompress::None
            };
            let produced_before = self.compressor.total_out();
            let status = self
                .compressor
                .compress(input, &mut buf, flush)
                .map_err(|e| Error::DecompressionFailed(e.to_string()))?;
            let produced = (self.compressor.total_out() - produced_before) as usize;
            out.extend_from_slice(&buf[..produced]);
            if status == Status::BufError {
                break;
            }
        }
        let _ = before_out;

        let mut out = out.to_vec();
        if final_block && out.ends_with(&DEFLATE_TRAILER) {
            out.truncate(out.len() - DEFLATE_TRAILER.len());
        }
        Ok(out)
    }

    /// Decompresses a complete, accumulated (across all fragments) message
    /// payload. `final_message` is always `true` for the accumulate-then-
    /// decompress path the connection core uses; it is accepted here to
    /// mirror the spec's interface and to allow a future per-fragment
    /// implementation to drive the same context-reset logic.
    ///
    /// `size_limit` bounds the *decompressed* total, not the wire size: a
    /// small compressed frame can inflate into an arbitrarily large buffer,
    /// so the limit is checked after every `decompress` call rather than
    /// only once at the end, keeping a decompression bomb from ever fully
    /// materializing in memory.
    pub fn decompress(
        &mut self,
        payload: &[u8],
        final_message: bool,
        size_limit: usize,
    ) -> Result<Vec<u8>, Error> {
        if !self.context_takeover {
            self.decompressor.reset(false);
        }

        let mut input = BytesMut::from(payload);
        if final_message {
            input.extend_from_slice(&DEFLATE_TRAILER);
        }

        let buffer_size = calculate_buffer_size(input.len());
        let mut decompressed = BytesMut::with_capacity(buffer_size);
        let mut buf = vec![0u8; buffer_size];

        let before_in = self.decompressor.total_in();
        loop {
            let consumed = (self.decompressor.total_in() - before_in) as usize;
            if consumed >= input.len() {
                break;
            }
            let chunk = &input[consumed..];
            let status = self
                .decompressor
                .decompress(chunk, &mut buf, FlushDecompress::Sync)
                .map_err(|e| Error::DecompressionFailed(e.to_string()))?;
            let produced = self.decompressor.total_out() as usize - decompressed.len();
            decompressed.extend_from_slice(&buf[..produced]);
            if decompressed.len() > size_limit {
                return Err(Error::MaxMessageSize);
            }
            if status == Status::StreamEnd {
                break;
            }
        }

        Ok(decompressed.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_then_decompress_roundtrips() {
        let mut tx = CompressionContext::new(true, 860, 15);
        let mut rx = CompressionContext::new(true, 860, 15);

        let payload = b"the quick brown fox jumps over the lazy dog, repeated! ".repeat(20);
        let compressed = tx.compress(&payload, true).unwrap();
        let decompressed = rx.decompress(&compressed, true, 1 << 20).unwrap();

        assert_eq!(decompressed, payload);
    }

    #[test]
    fn no_context_takeover_roundtrips_each_message_independently() {
        let mut tx = CompressionContext::new(false, 860, 15);
        let mut rx = CompressionContext::new(false, 860, 15);

        for msg in ["first message", "second message", "a third, different one"] {
            let compressed = tx.compress(msg.as_bytes(), true).unwrap();
            let decompressed = rx.decompress(&compressed, true, 1 << 20).unwrap();
            assert_eq!(decompressed, msg.as_bytes());
        }
    }

    #[test]
    fn decompression_bomb_is_rejected_once_it_exceeds_the_message_size_limit() {
        let mut tx = CompressionContext::new(true, 860, 15);
        let mut rx = CompressionContext::new(true, 860, 15);

        let payload = vec![b'a'; 1 << 20];
        let compressed = tx.compress(&payload, true).unwrap();
        assert!(compressed.len() < 4096, "payload should compress down sharply");

        let err = rx.decompress(&compressed, true, 4096).unwrap_err();
        assert!(matches!(err, Error::MaxMessageSize));
    }
}
