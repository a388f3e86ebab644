//! The value handed to callers by `Connection::receive`: a binary flag plus
//! a lazy, finite, single-consume sequence of body chunks.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ClosedError;

/// One chunk of a message body, or the terminal signal that the connection
/// closed before the message finished arriving.
pub type ChunkResult = Result<Vec<u8>, ClosedError>;

/// A message's body: a finite stream of byte chunks. Reading it to
/// completion (or dropping it) consumes it; it cannot be restarted.
///
/// Chunk boundaries follow `Options::stream_threshold`/frame boundaries, not
/// application-level semantics — a caller that wants the whole message as one
/// buffer should drain the stream into a `Vec<u8>`.
pub struct MessageBody {
    rx: ReceiverStream<ChunkResult>,
}

impl MessageBody {
    pub(crate) fn new(rx: mpsc::Receiver<ChunkResult>) -> Self {
        Self {
            rx: ReceiverStream::new(rx),
        }
    }

    /// Convenience for callers that want the whole body buffered at once.
    pub async fn collect(mut self) -> Result<Vec<u8>, ClosedError> {
        use futures::StreamExt;
        let mut buf = Vec::new();
        while let Some(chunk) = self.rx.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf)
    }
}

impl Stream for MessageBody {
    type Item = ChunkResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll_next(cx)
    }
}

/// The producer side used internally by the connection core to feed a
/// `MessageBody`. The bounded channel of capacity 1 is what implements the
/// spec's backpressure requirement: a send only completes once the consumer
/// has pulled the previous chunk, so the inbound read loop naturally
/// suspends until the body is being drained.
pub(crate) struct MessageBodySender {
    tx: mpsc::Sender<ChunkResult>,
}

impl MessageBodySender {
    pub(crate) fn channel() -> (Self, MessageBody) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, MessageBody::new(rx))
    }

    pub(crate) async fn send_chunk(&self, chunk: Vec<u8>) -> bool {
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    pub(crate) async fn fail(&self, err: ClosedError) {
        let _ = self.tx.send(Err(err)).await;
    }
}

/// A fully opened inbound message: its type flag plus its streamed body.
pub struct Message {
    binary: bool,
    body: MessageBody,
}

impl Message {
    pub(crate) fn new(binary: bool, body: MessageBody) -> Self {
        Self { binary, body }
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    pub fn is_text(&self) -> bool {
        !self.binary
    }

    /// Consumes the handle, yielding the body stream. Only one consumer may
    /// ever read a given `Message`'s body.
    pub fn into_body(self) -> MessageBody {
        self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn body_delivers_chunks_in_order() {
        let (sender, body) = MessageBodySender::channel();
        tokio::spawn(async move {
            assert!(sender.send_chunk(b"hel".to_vec()).await);
            assert!(sender.send_chunk(b"lo".to_vec()).await);
        });

        let collected = body.collect().await.unwrap();
        assert_eq!(collected, b"hello");
    }

    #[tokio::test]
    async fn body_surfaces_close_error_to_consumer() {
        let (sender, mut body) = MessageBodySender::channel();
        tokio::spawn(async move {
            sender
                .fail(ClosedError::new(
                    crate::options::CloseCode::ABNORMAL,
                    "writing to the client failed",
                ))
                .await;
        });

        let next = body.next().await.unwrap();
        assert!(next.is_err());
    }
}
