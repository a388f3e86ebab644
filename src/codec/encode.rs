use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::frame::Frame;
use crate::options::Role;

/// Encodes one frame to its wire representation.
///
/// `set_rsv1` is passed separately from `frame.compressed` because RSV1 is
/// only ever set on the *first* frame of a compressed, possibly-fragmented
/// message — the caller (the connection core's outbound pipeline) decides
/// that per-call, not per-frame.
pub fn encode_frame(frame: &Frame, role: Role, set_rsv1: bool) -> Vec<u8> {
    match role {
        Role::Initiator => encode_masked(frame, set_rsv1),
        Role::Responder => encode_unmasked(frame, set_rsv1),
    }
}

fn header_first_byte(frame: &Frame, set_rsv1: bool) -> u8 {
    let mut first_byte = (frame.final_fragment as u8) << 7 | frame.opcode.as_u8();
    if set_rsv1 {
        first_byte |= 0b0100_0000;
    }
    first_byte
}

fn encode_unmasked(frame: &Frame, set_rsv1: bool) -> Vec<u8> {
    let first_byte = header_first_byte(frame, set_rsv1);
    let payload_len = frame.payload.len();

    let mut out = Vec::with_capacity(payload_len + 10);
    out.push(first_byte);

    if payload_len <= 125 {
        out.push(payload_len as u8);
    } else if payload_len <= 65535 {
        out.push(126);
        out.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }

    out.extend_from_slice(&frame.payload);
    out
}

fn encode_masked(frame: &Frame, set_rsv1: bool) -> Vec<u8> {
    let mut rng = StdRng::from_rng(rand::thread_rng());
    let mask: [u8; 4] = [rng.random(), rng.random(), rng.random(), rng.random()];

    let first_byte = header_first_byte(frame, set_rsv1);
    let payload_len = frame.payload.len();

    let mut out = Vec::with_capacity(payload_len + 14);
    out.push(first_byte);

    if payload_len <= 125 {
        out.push(0b1000_0000 | payload_len as u8);
    } else if payload_len <= 65535 {
        out.push(0b1000_0000 | 126);
        out.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        out.push(0b1000_0000 | 127);
        out.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }
    out.extend_from_slice(&mask);

    apply_mask(&frame.payload, &mask, &mut out);
    out
}

/// XORs `payload` against the 4-byte repeating `mask`, appending the result
/// to `out`. Applied in 4-byte-aligned words where possible rather than
/// byte-by-byte, since the mask period is 4 and a u32 XOR covers a whole
/// period in one instruction.
fn apply_mask(payload: &[u8], mask: &[u8; 4], out: &mut Vec<u8>) {
    let mask_word = u32::from_ne_bytes(*mask);
    let start = out.len();
    out.extend_from_slice(payload);
    let masked = &mut out[start..];

    let mut chunks = masked.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let xored = (word ^ mask_word).to_ne_bytes();
        chunk.copy_from_slice(&xored);
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;

    #[test]
    fn responder_echo_text_matches_rfc_example() {
        let frame = Frame::new(true, OpCode::Text, b"Hi".to_vec(), false);
        let encoded = encode_frame(&frame, Role::Responder, false);
        assert_eq!(encoded, vec![0x81, 0x02, 0x48, 0x69]);
    }

    #[test]
    fn length_markers_use_correct_form_at_boundaries() {
        for (len, expect_marker) in [(125usize, 125u8), (126, 126), (65535, 126), (65536, 127)] {
            let frame = Frame::new(true, OpCode::Binary, vec![0u8; len], false);
            let encoded = encode_frame(&frame, Role::Responder, false);
            assert_eq!(encoded[1], expect_marker);
        }
    }

    #[test]
    fn initiator_frames_are_masked_and_unmask_back_to_original() {
        let payload = b"round trip payload, checking the mask".to_vec();
        let frame = Frame::new(true, OpCode::Binary, payload.clone(), false);
        let encoded = encode_frame(&frame, Role::Initiator, false);

        assert_eq!(encoded[1] & 0b1000_0000, 0b1000_0000);
        let mask = [encoded[2], encoded[3], encoded[4], encoded[5]];
        let masked_payload = &encoded[6..];
        let mut unmasked = masked_payload.to_vec();
        for (i, byte) in unmasked.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
        assert_eq!(unmasked, payload);
    }

    #[test]
    fn rsv1_set_only_when_requested() {
        let frame = Frame::new(true, OpCode::Text, b"x".to_vec(), true);
        let encoded = encode_frame(&frame, Role::Responder, true);
        assert_eq!(encoded[0] & 0b0100_0000, 0b0100_0000);
    }
}
