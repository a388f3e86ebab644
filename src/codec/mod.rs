//! Pure byte-level frame encoding and a resumable, chunk-fed frame parser.

mod decode;
mod encode;

pub use decode::FrameDecoder;
pub use encode::encode_frame;
