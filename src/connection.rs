//! The connection core: owns the stream, serializes outbound writes, and
//! drives a background inbound-assembly task.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::timeout;

use crate::codec::{encode_frame, FrameDecoder};
use crate::compression::CompressionContext;
use crate::error::{ClosedError, Error, SendError};
use crate::frame::{Frame, OpCode};
use crate::message::{Message, MessageBodySender};
use crate::metadata::{ConnectionInfo, ConnectionMetadata, CryptoInfo};
use crate::options::{CloseCode, Options, Role};
use crate::scheduler::{self, BoxFuture, Scheduler, SchedulerTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Open,
    Closing,
    Closed,
}

struct CloseState {
    lifecycle: LifecycleState,
    code: CloseCode,
    reason: String,
    peer_initiated: bool,
}

struct Throttle {
    frames_limit: Option<u32>,
    bytes_limit: Option<u64>,
    frames_this_tick: AtomicU32,
    bytes_this_tick: AtomicU64,
    notify: Notify,
}

impl Throttle {
    fn new(frames_limit: Option<u32>, bytes_limit: Option<u64>) -> Self {
        Self {
            frames_limit,
            bytes_limit,
            frames_this_tick: AtomicU32::new(0),
            bytes_this_tick: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn record_frame(&self) {
        self.frames_this_tick.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bytes(&self, n: u64) {
        self.bytes_this_tick.fetch_add(n, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.frames_this_tick.store(0, Ordering::Relaxed);
        self.bytes_this_tick.store(0, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    async fn wait_if_needed(&self) {
        loop {
            let over_frames = self
                .frames_limit
                .is_some_and(|limit| self.frames_this_tick.load(Ordering::Relaxed) >= limit);
            let over_bytes = self
                .bytes_limit
                .is_some_and(|limit| self.bytes_this_tick.load(Ordering::Relaxed) >= limit);
            if !over_frames && !over_bytes {
                return;
            }
            self.notify.notified().await;
        }
    }
}

struct Writer<S> {
    write_half: WriteHalf<S>,
    compression: Option<CompressionContext>,
}

/// One fragmented inbound message currently being assembled by the reader
/// task. Lives entirely on that task's stack; never shared.
struct Assembly {
    opcode: OpCode,
    compressed: bool,
    sender: MessageBodySender,
    raw: Vec<u8>,
    pending: Vec<u8>,
    utf8_stash: Vec<u8>,
    accumulated_len: usize,
}

type OnClose = Box<dyn FnOnce(ConnectionInfo) + Send>;

struct Inner<S> {
    id: u64,
    role: Role,
    options: Options,
    metadata: StdMutex<ConnectionMetadata>,
    writer: Mutex<Writer<S>>,
    receive_rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    receive_tx: mpsc::UnboundedSender<Message>,
    receive_in_progress: AtomicBool,
    close_state: StdMutex<CloseState>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    peer_close_notify: Notify,
    on_close: StdMutex<Vec<OnClose>>,
    throttle: Throttle,
    scheduler: Arc<Scheduler>,
    ping_counter: AtomicU64,
}

impl<S> Inner<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn is_closed(&self) -> bool {
        matches!(
            self.close_state.lock().unwrap().lifecycle,
            LifecycleState::Closed
        )
    }

    /// True once CLOSING or CLOSED — i.e. once the local or peer-initiated
    /// close frame has gone out and no further outbound frames are allowed.
    fn is_closed_or_closing(&self) -> bool {
        !matches!(self.close_state.lock().unwrap().lifecycle, LifecycleState::Open)
    }

    fn closed_error(&self) -> ClosedError {
        let state = self.close_state.lock().unwrap();
        ClosedError::new(state.code, state.reason.clone())
    }

    /// Moves the connection to CLOSING if it is currently OPEN. Returns
    /// `true` only for the call that performed the transition, so the two
    /// paths that can race to close (local `close()` and a peer CLOSE frame)
    /// agree on which of them echoes the close frame.
    ///
    /// Deregisters from the heartbeat scheduler immediately, not only once
    /// CLOSED: the close-wait for the peer's echoing CLOSE can take up to
    /// `close_period_secs`, and the connection must not still be a candidate
    /// for a scheduler-issued PING during that window (only the single close
    /// frame may be emitted outbound past this point).
    async fn begin_closing(&self, code: CloseCode, reason: String, peer_initiated: bool) -> bool {
        {
            let mut state = self.close_state.lock().unwrap();
            if state.lifecycle != LifecycleState::Open {
                return false;
            }
            state.lifecycle = LifecycleState::Closing;
            state.code = code;
            state.reason = reason.clone();
            state.peer_initiated = peer_initiated;
        }

        {
            let mut meta = self.metadata.lock().unwrap();
            meta.closed_at = Some(Instant::now());
            meta.close_code = Some(code.0);
            meta.close_reason = reason;
            meta.peer_initiated_close = peer_initiated;
        }
        // No further Messages will open; resolve a pending receive() with
        // "none" by dropping the send side once every in-flight sender is
        // gone. The unbounded channel already does this on the final drop,
        // which happens when the reader task itself exits.
        self.scheduler.deregister(self.id).await;
        true
    }

    async fn finish_closing(&self) {
        {
            let mut state = self.close_state.lock().unwrap();
            if state.lifecycle == LifecycleState::Closed {
                return;
            }
            state.lifecycle = LifecycleState::Closed;
        }
        let snapshot = self.metadata.lock().unwrap().snapshot();
        let callbacks = std::mem::take(&mut *self.on_close.lock().unwrap());
        for callback in callbacks {
            callback(snapshot.clone());
        }
        let _ = self.closed_tx.send(true);
    }

    async fn write_control_frame(&self, opcode: OpCode, payload: Vec<u8>) -> Result<usize, Error> {
        let frame = Frame::new(true, opcode, payload, false);
        let mut writer = self.writer.lock().await;
        let encoded = encode_frame(&frame, self.role, false);
        let len = encoded.len();
        writer.write_half.write_all(&encoded).await?;
        writer.write_half.flush().await?;
        drop(writer);

        let mut meta = self.metadata.lock().unwrap();
        meta.record_sent(len as u64, Instant::now());
        Ok(len)
    }

    async fn handle_write_failure(&self) {
        warn!("connection {}: write failed, closing abnormally", self.id);
        self.close(
            CloseCode::ABNORMAL,
            "Writing to the client failed".to_string(),
        )
        .await;
    }

    /// Local or peer-driven close. Idempotent: a call after CLOSING/CLOSED
    /// is a no-op.
    async fn close(&self, code: CloseCode, reason: String) -> usize {
        if !self.begin_closing(code, reason.clone(), false).await {
            return 0;
        }

        // 1005/1006 (and any other non-wire code) are local-only markers for
        // "no code was given" / "the transport died"; RFC 6455 §7.4.1
        // forbids putting them on the wire, so there is no close frame to
        // send or echo to wait for.
        if !code.is_valid_wire_code() {
            self.finish_closing().await;
            return 0;
        }

        let payload = build_close_payload(code, &reason);
        let written = self
            .write_control_frame(OpCode::Close, payload)
            .await
            .unwrap_or(0);

        let _ = timeout(
            Duration::from_secs(self.options.close_period_secs),
            self.peer_close_notify.notified(),
        )
        .await;
        self.finish_closing().await;
        written
    }

    async fn handle_peer_close(&self, code: CloseCode, reason: String, raw_payload: Vec<u8>) {
        let first = self.begin_closing(code, reason, true).await;
        if first {
            let _ = self.write_control_frame(OpCode::Close, raw_payload).await;
        }
        self.peer_close_notify.notify_waiters();
        self.finish_closing().await;
    }

    fn announce_message(&self, message: Message) {
        let _ = self.receive_tx.send(message);
    }

    async fn do_ping(&self) {
        // Once CLOSING/CLOSED, the only outbound frame allowed is the single
        // close frame that initiated it; a heartbeat that expires while the
        // peer's echo is still pending must not write a PING on top of that.
        if self.is_closed_or_closing() {
            return;
        }
        let n = self.ping_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if self
            .write_control_frame(OpCode::Ping, n.to_string().into_bytes())
            .await
            .is_ok()
        {
            let mut meta = self.metadata.lock().unwrap();
            meta.record_ping();
            meta.last_heartbeat_at = Some(Instant::now());
        } else {
            self.handle_write_failure().await;
        }
    }

    async fn send_payload(&self, opcode: OpCode, payload: Vec<u8>) -> Result<usize, ClosedError> {
        if self.is_closed_or_closing() {
            return Err(self.closed_error());
        }

        let threshold = self.options.frame_split_threshold.max(1);
        let slices: Vec<&[u8]> = if payload.len() > threshold {
            payload.chunks(threshold).collect()
        } else {
            vec![payload.as_slice()]
        };
        let total = slices.len();

        let mut writer = self.writer.lock().await;
        let should_compress = writer
            .compression
            .as_ref()
            .is_some_and(|ctx| payload.len() > ctx.compression_threshold());

        let mut bytes_written = 0usize;
        for (i, slice) in slices.into_iter().enumerate() {
            let is_last = i == total - 1;
            let frame_opcode = if i == 0 { opcode } else { OpCode::Continue };
            let set_rsv1 = should_compress && i == 0;

            let out_payload = if should_compress {
                let ctx = writer.compression.as_mut().expect("checked above");
                match ctx.compress(slice, is_last) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        drop(writer);
                        warn!("connection {}: compression failed: {err}", self.id);
                        self.handle_write_failure().await;
                        return Err(self.closed_error());
                    }
                }
            } else {
                slice.to_vec()
            };

            let frame = Frame::new(is_last, frame_opcode, out_payload, set_rsv1);
            let encoded = encode_frame(&frame, self.role, set_rsv1);
            let len = encoded.len();

            if let Err(err) = writer.write_half.write_all(&encoded).await {
                drop(writer);
                warn!("connection {}: write_all failed: {err}", self.id);
                self.handle_write_failure().await;
                return Err(self.closed_error());
            }
            bytes_written += len;
        }

        if let Err(err) = writer.write_half.flush().await {
            drop(writer);
            warn!("connection {}: flush failed: {err}", self.id);
            self.handle_write_failure().await;
            return Err(self.closed_error());
        }
        drop(writer);

        let now = Instant::now();
        let mut meta = self.metadata.lock().unwrap();
        meta.record_sent(bytes_written as u64, now);
        meta.record_data_sent(now);
        meta.messages_sent += 1;
        Ok(bytes_written)
    }

    async fn stream_payload<R>(&self, mut source: R, binary: bool) -> Result<usize, ClosedError>
    where
        R: AsyncRead + Unpin,
    {
        if self.is_closed_or_closing() {
            return Err(self.closed_error());
        }

        let opcode = if binary { OpCode::Binary } else { OpCode::Text };
        let threshold = self.options.stream_threshold.max(1);
        let mut buf = vec![0u8; threshold];
        let mut bytes_written = 0usize;
        let mut first = true;
        let mut carry: Vec<u8> = Vec::new();

        loop {
            let n = source
                .read(&mut buf)
                .await
                .map_err(|err| ClosedError::new(CloseCode::UNEXPECTED_SERVER_ERROR, err.to_string()))?;

            carry.extend_from_slice(&buf[..n]);
            let is_eof = n == 0;

            if !is_eof && carry.len() < threshold {
                continue;
            }

            let chunk = std::mem::take(&mut carry);
            let frame_opcode = if first { opcode } else { OpCode::Continue };
            let frame = Frame::new(is_eof, frame_opcode, chunk, false);
            let encoded = encode_frame(&frame, self.role, false);
            let len = encoded.len();

            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.write_half.write_all(&encoded).await {
                drop(writer);
                warn!("connection {}: stream write failed: {err}", self.id);
                self.handle_write_failure().await;
                return Err(self.closed_error());
            }
            if is_eof {
                if let Err(err) = writer.write_half.flush().await {
                    drop(writer);
                    self.handle_write_failure().await;
                    return Err(ClosedError::new(CloseCode::ABNORMAL, err.to_string()));
                }
            }
            drop(writer);

            bytes_written += len;
            first = false;

            let now = Instant::now();
            let mut meta = self.metadata.lock().unwrap();
            meta.record_sent(len as u64, now);
            meta.record_data_sent(now);

            if is_eof {
                meta.messages_sent += 1;
                return Ok(bytes_written);
            }
        }
    }
}

impl<S> SchedulerTarget for Inner<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn unanswered_pings(&self) -> u64 {
        let meta = self.metadata.lock().unwrap();
        meta.ping_count.saturating_sub(meta.pong_count)
    }

    fn send_ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.do_ping())
    }

    fn force_close(&self, code: CloseCode, reason: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.close(code, reason).await;
        })
    }

    fn reset_throttle(&self) {
        self.throttle.reset();
    }
}

fn build_close_payload(code: CloseCode, reason: &str) -> Vec<u8> {
    if code == CloseCode::NONE {
        return Vec::new();
    }
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.0.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

fn parse_close_payload(
    payload: &[u8],
    validate_utf8: bool,
) -> Result<(CloseCode, String), (CloseCode, String)> {
    if payload.is_empty() {
        return Ok((CloseCode::NONE, String::new()));
    }
    if payload.len() == 1 {
        return Err((CloseCode::PROTOCOL_ERROR, "Close code must be two bytes".into()));
    }
    let code = CloseCode(u16::from_be_bytes([payload[0], payload[1]]));
    if !code.is_valid_wire_code() {
        return Err((CloseCode::PROTOCOL_ERROR, "Invalid close code".into()));
    }
    let reason_bytes = &payload[2..];
    let reason = if validate_utf8 {
        String::from_utf8(reason_bytes.to_vec()).map_err(|_| {
            (
                CloseCode::INCONSISTENT_FRAME_DATA_TYPE,
                "Close reason must be valid UTF-8".to_string(),
            )
        })?
    } else {
        String::from_utf8_lossy(reason_bytes).into_owned()
    };
    Ok((code, reason))
}

fn parse_pong_payload(payload: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(payload).ok()?;
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<u64>().ok()
}

fn protocol_error_to_close(err: &Error) -> (CloseCode, String) {
    use Error::*;
    match err {
        MaxFrameSize | MaxMessageSize => (CloseCode::MESSAGE_TOO_LARGE, err.to_string()),
        UnacceptableType => (CloseCode::UNACCEPTABLE_TYPE, err.to_string()),
        InvalidUtf8 | InvalidCloseReasonUtf8 => {
            (CloseCode::INCONSISTENT_FRAME_DATA_TYPE, err.to_string())
        }
        MalformedPong => (CloseCode::POLICY_VIOLATION, err.to_string()),
        IOError { .. } | FromUtf8Error { .. } | CommunicationError => {
            (CloseCode::ABNORMAL, err.to_string())
        }
        _ => (CloseCode::PROTOCOL_ERROR, err.to_string()),
    }
}

enum FrameOutcome {
    Continue,
    Stop,
}

async fn append_fragment<S>(
    inner: &Arc<Inner<S>>,
    assembly: &mut Assembly,
    rx_compression: &mut Option<CompressionContext>,
    payload: Vec<u8>,
    final_fragment: bool,
) -> Result<(), (CloseCode, String)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    assembly.raw.extend_from_slice(&payload);

    let ready = if assembly.compressed {
        if !final_fragment {
            return Ok(());
        }
        let ctx = rx_compression.as_mut().ok_or_else(|| {
            (
                CloseCode::PROTOCOL_ERROR,
                "RSV bits set without a matching extension".to_string(),
            )
        })?;
        let decompressed = ctx
            .decompress(&assembly.raw, true, inner.options.message_size_limit)
            .map_err(|err| match err {
                crate::error::Error::MaxMessageSize => {
                    (CloseCode::MESSAGE_TOO_LARGE, "Max message size reached".to_string())
                }
                other => (CloseCode::PROTOCOL_ERROR, format!("decompression failed: {other}")),
            })?;
        assembly.raw.clear();
        decompressed
    } else {
        std::mem::take(&mut assembly.raw)
    };

    if assembly.opcode == OpCode::Text && inner.options.validate_utf8 {
        let mut combined = std::mem::take(&mut assembly.utf8_stash);
        combined.extend_from_slice(&ready);
        match std::str::from_utf8(&combined) {
            Ok(_) => deliver_chunk(inner, assembly, combined, final_fragment).await,
            Err(e) if e.error_len().is_some() => Err((
                CloseCode::INCONSISTENT_FRAME_DATA_TYPE,
                "Invalid TEXT data; UTF-8 required".to_string(),
            )),
            Err(e) if final_fragment => {
                let _ = e;
                Err((
                    CloseCode::INCONSISTENT_FRAME_DATA_TYPE,
                    "Invalid TEXT data; UTF-8 required".to_string(),
                ))
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                let rest = combined.split_off(valid_up_to);
                let valid = combined;
                assembly.utf8_stash = rest;
                deliver_chunk(inner, assembly, valid, false).await
            }
        }
    } else {
        deliver_chunk(inner, assembly, ready, final_fragment).await
    }
}

async fn deliver_chunk<S>(
    inner: &Arc<Inner<S>>,
    assembly: &mut Assembly,
    bytes: Vec<u8>,
    final_fragment: bool,
) -> Result<(), (CloseCode, String)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    assembly.pending.extend_from_slice(&bytes);
    if final_fragment || assembly.pending.len() >= inner.options.stream_threshold {
        let chunk = std::mem::take(&mut assembly.pending);
        if !chunk.is_empty() || final_fragment {
            assembly.sender.send_chunk(chunk).await;
        }
    }
    Ok(())
}

async fn process_frame<S>(
    inner: &Arc<Inner<S>>,
    assembly: &mut Option<Assembly>,
    rx_compression: &mut Option<CompressionContext>,
    frame: Frame,
) -> Result<FrameOutcome, (CloseCode, String)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match frame.opcode {
        OpCode::Text | OpCode::Binary => {
            if assembly.is_some() {
                return Err((
                    CloseCode::PROTOCOL_ERROR,
                    "Invalid frame while there is a fragmented message in progress".to_string(),
                ));
            }
            if frame.payload.len() > inner.options.message_size_limit {
                return Err((CloseCode::MESSAGE_TOO_LARGE, "Max message size reached".to_string()));
            }

            let binary = frame.opcode == OpCode::Binary;
            let (sender, body) = MessageBodySender::channel();
            inner.announce_message(Message::new(binary, body));

            let mut new_assembly = Assembly {
                opcode: frame.opcode,
                compressed: frame.compressed,
                sender,
                raw: Vec::new(),
                pending: Vec::new(),
                utf8_stash: Vec::new(),
                accumulated_len: frame.payload.len(),
            };
            let final_fragment = frame.final_fragment;
            if let Err((code, reason)) =
                append_fragment(inner, &mut new_assembly, rx_compression, frame.payload, final_fragment).await
            {
                new_assembly
                    .sender
                    .fail(ClosedError::new(code, reason.clone()))
                    .await;
                return Err((code, reason));
            }

            if final_fragment {
                inner.metadata.lock().unwrap().messages_read += 1;
            } else {
                *assembly = Some(new_assembly);
            }
        }
        OpCode::Continue => {
            let Some(mut current) = assembly.take() else {
                return Err((
                    CloseCode::PROTOCOL_ERROR,
                    "Invalid continuation frame: no fragmented message to continue".to_string(),
                ));
            };
            current.accumulated_len += frame.payload.len();
            if current.accumulated_len > inner.options.message_size_limit {
                current
                    .sender
                    .fail(ClosedError::new(
                        CloseCode::MESSAGE_TOO_LARGE,
                        "Max message size reached",
                    ))
                    .await;
                return Err((CloseCode::MESSAGE_TOO_LARGE, "Max message size reached".to_string()));
            }
            let final_fragment = frame.final_fragment;
            if let Err((code, reason)) =
                append_fragment(inner, &mut current, rx_compression, frame.payload, final_fragment).await
            {
                current.sender.fail(ClosedError::new(code, reason.clone())).await;
                return Err((code, reason));
            }

            if final_fragment {
                inner.metadata.lock().unwrap().messages_read += 1;
            } else {
                *assembly = Some(current);
            }
        }
        OpCode::Ping => {
            let _ = inner.write_control_frame(OpCode::Pong, frame.payload).await;
        }
        OpCode::Pong => match parse_pong_payload(&frame.payload) {
            Some(parsed) => inner.metadata.lock().unwrap().record_pong(parsed),
            None => {
                return Err((CloseCode::POLICY_VIOLATION, "Malformed PONG payload".to_string()))
            }
        },
        OpCode::Close => {
            let (code, reason) = parse_close_payload(&frame.payload, inner.options.validate_utf8)?;
            fail_pending_assembly(assembly, CloseCode::NORMAL, "connection closing").await;
            inner
                .handle_peer_close(code, reason, frame.payload)
                .await;
            return Ok(FrameOutcome::Stop);
        }
    }
    Ok(FrameOutcome::Continue)
}

async fn fail_pending_assembly(assembly: &mut Option<Assembly>, code: CloseCode, reason: &str) {
    if let Some(pending) = assembly.take() {
        pending.sender.fail(ClosedError::new(code, reason.to_string())).await;
    }
}

async fn run_reader_loop<S>(inner: Arc<Inner<S>>, mut read_half: ReadHalf<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut decoder = FrameDecoder::new(inner.role);
    let mut rx_compression = inner.options.compression_enabled.then(|| {
        CompressionContext::new(inner.options.compression_context_takeover, inner.options.compression_threshold, 15)
    });
    let mut assembly: Option<Assembly> = None;
    let mut read_buf = vec![0u8; 8192];

    loop {
        if inner.is_closed() {
            return;
        }
        inner.throttle.wait_if_needed().await;

        let n = match read_half.read(&mut read_buf).await {
            Ok(0) => {
                debug!("connection {}: peer closed without a handshake", inner.id);
                fail_pending_assembly(&mut assembly, CloseCode::ABNORMAL, "Connection reset without a close handshake").await;
                inner
                    .close(CloseCode::ABNORMAL, "Connection reset without a close handshake".to_string())
                    .await;
                return;
            }
            Ok(n) => n,
            Err(err) => {
                warn!("connection {}: read error: {err}", inner.id);
                fail_pending_assembly(&mut assembly, CloseCode::ABNORMAL, &err.to_string()).await;
                inner.close(CloseCode::ABNORMAL, format!("read error: {err}")).await;
                return;
            }
        };

        decoder.feed(&read_buf[..n]);
        {
            let mut meta = inner.metadata.lock().unwrap();
            let now = Instant::now();
            meta.record_data_read(now);
        }
        inner.throttle.record_bytes(n as u64);
        inner.scheduler.touch(inner.id).await;

        loop {
            match decoder.poll_frame(inner.options.frame_size_limit, inner.options.text_only) {
                Ok(Some(frame)) => {
                    trace!("connection {}: parsed frame opcode {:?}", inner.id, frame.opcode);
                    inner.throttle.record_frame();
                    {
                        let mut meta = inner.metadata.lock().unwrap();
                        meta.record_read(frame.payload.len() as u64, Instant::now());
                    }
                    match process_frame(&inner, &mut assembly, &mut rx_compression, frame).await {
                        Ok(FrameOutcome::Continue) => {}
                        Ok(FrameOutcome::Stop) => return,
                        Err((code, reason)) => {
                            fail_pending_assembly(&mut assembly, code, &reason).await;
                            inner.close(code, reason).await;
                            return;
                        }
                    }
                    if inner.is_closed() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let (code, reason) = protocol_error_to_close(&err);
                    warn!("connection {}: {reason}", inner.id);
                    fail_pending_assembly(&mut assembly, code, &reason).await;
                    inner.close(code, reason).await;
                    return;
                }
            }
        }
    }
}

/// A full-duplex WebSocket connection over an already-connected byte stream.
///
/// Cheap to clone: it is a thin handle around the shared state; the
/// background reader task and the outbound write path both hold their own
/// reference to the same state.
pub struct Connection<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Connection<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub async fn new(stream: S, role: Role, options: Options) -> Self {
        Self::with_metadata(stream, role, options, None, None, None).await
    }

    pub async fn with_metadata(
        stream: S,
        role: Role,
        options: Options,
        local_addr: Option<std::net::SocketAddr>,
        remote_addr: Option<std::net::SocketAddr>,
        crypto_info: Option<CryptoInfo>,
    ) -> Self {
        let metadata = ConnectionMetadata::new(local_addr, remote_addr, crypto_info);
        let id = metadata.id;

        let (read_half, write_half) = split(stream);
        let tx_compression = options.compression_enabled.then(|| {
            CompressionContext::new(options.compression_context_takeover, options.compression_threshold, 15)
        });

        let (receive_tx, receive_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let scheduler = scheduler::acquire();

        let inner = Arc::new(Inner {
            id,
            role,
            options: options.clone(),
            metadata: StdMutex::new(metadata),
            writer: Mutex::new(Writer {
                write_half,
                compression: tx_compression,
            }),
            receive_rx: Mutex::new(receive_rx),
            receive_tx,
            receive_in_progress: AtomicBool::new(false),
            close_state: StdMutex::new(CloseState {
                lifecycle: LifecycleState::Open,
                code: CloseCode::NONE,
                reason: String::new(),
                peer_initiated: false,
            }),
            closed_tx,
            closed_rx,
            peer_close_notify: Notify::new(),
            on_close: StdMutex::new(Vec::new()),
            throttle: Throttle::new(options.frames_per_second_limit, options.bytes_per_second_limit),
            scheduler,
            ping_counter: AtomicU64::new(0),
        });

        if options.heartbeat_enabled {
            let target: Arc<dyn SchedulerTarget> = inner.clone();
            inner
                .scheduler
                .register(
                    id,
                    target,
                    Duration::from_secs(options.heartbeat_period_secs),
                    options.queued_ping_limit,
                )
                .await;
        }

        tokio::spawn(run_reader_loop(inner.clone(), read_half));

        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.metadata.lock().unwrap().local_addr
    }

    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.metadata.lock().unwrap().remote_addr
    }

    pub fn crypto_info(&self) -> Option<CryptoInfo> {
        self.inner.metadata.lock().unwrap().crypto_info.clone()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.is_closed()
    }

    pub fn close_code(&self) -> Result<Option<u16>, Error> {
        let state = self.inner.close_state.lock().unwrap();
        if state.lifecycle != LifecycleState::Closed {
            return Err(Error::NotYetClosed);
        }
        Ok(Some(state.code.0))
    }

    pub fn close_reason(&self) -> Result<String, Error> {
        let state = self.inner.close_state.lock().unwrap();
        if state.lifecycle != LifecycleState::Closed {
            return Err(Error::NotYetClosed);
        }
        Ok(state.reason.clone())
    }

    pub fn peer_initiated_close(&self) -> Result<bool, Error> {
        let state = self.inner.close_state.lock().unwrap();
        if state.lifecycle != LifecycleState::Closed {
            return Err(Error::NotYetClosed);
        }
        Ok(state.peer_initiated)
    }

    pub fn get_info(&self) -> ConnectionInfo {
        self.inner.metadata.lock().unwrap().snapshot()
    }

    /// Registers a hook fired with the final connection info once the
    /// connection reaches CLOSED. If it is already closed, fires
    /// immediately.
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce(ConnectionInfo) + Send + 'static,
    {
        let already_closed = self.inner.is_closed();
        if already_closed {
            callback(self.get_info());
            return;
        }
        self.inner.on_close.lock().unwrap().push(Box::new(callback));
        if self.inner.is_closed() {
            if let Some(cb) = self.inner.on_close.lock().unwrap().pop() {
                cb(self.get_info());
            }
        }
    }

    /// Yields the next fully opened message, or `None` once the connection
    /// is closed and no further messages will arrive. Overlapping calls are
    /// rejected as misuse rather than queued.
    pub async fn receive(&self) -> Result<Option<Message>, Error> {
        if self
            .inner
            .receive_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::ReceiveAlreadyInProgress);
        }
        let mut rx = self.inner.receive_rx.lock().await;
        let mut closed_rx = self.inner.closed_rx.clone();

        // A message queued before this call (even on an already-closed
        // connection) is always delivered first; only once the buffer is
        // drained does a closed connection resolve to `None`. `closed_rx` is
        // cloned fresh per call, so checking its current value here (rather
        // than relying solely on `changed()`, which only fires on a future
        // transition) covers the case where close happened before we were
        // called.
        let result = match rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(_) if *closed_rx.borrow() => None,
            Err(_) => tokio::select! {
                biased;
                msg = rx.recv() => msg,
                _ = closed_rx.changed() => rx.try_recv().ok(),
            },
        };
        drop(rx);
        self.inner.receive_in_progress.store(false, Ordering::SeqCst);
        Ok(result)
    }

    /// Sends `text` as a TEXT message. Rejects a non-UTF-8 payload
    /// synchronously as misuse — the connection is left untouched, not
    /// closed — distinct from [`SendError::Closed`], which means the
    /// connection itself is gone.
    pub async fn send(&self, text: Vec<u8>) -> Result<usize, SendError> {
        if String::from_utf8(text.clone()).is_err() {
            return Err(SendError::InvalidUtf8);
        }
        Ok(self.inner.send_payload(OpCode::Text, text).await?)
    }

    pub async fn send_text(&self, text: String) -> Result<usize, ClosedError> {
        self.inner.send_payload(OpCode::Text, text.into_bytes()).await
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<usize, ClosedError> {
        self.inner.send_payload(OpCode::Binary, data).await
    }

    pub async fn stream<R>(&self, source: R, binary: bool) -> Result<usize, ClosedError>
    where
        R: AsyncRead + Unpin,
    {
        self.inner.stream_payload(source, binary).await
    }

    pub async fn ping(&self) -> usize {
        if self.inner.is_closed_or_closing() {
            return 0;
        }
        let n = self.inner.ping_counter.fetch_add(1, Ordering::Relaxed) + 1;
        match self
            .inner
            .write_control_frame(OpCode::Ping, n.to_string().into_bytes())
            .await
        {
            Ok(len) => {
                self.inner.metadata.lock().unwrap().record_ping();
                len
            }
            Err(_) => {
                self.inner.handle_write_failure().await;
                0
            }
        }
    }

    pub async fn close(&self, code: CloseCode, reason: impl Into<String>) -> usize {
        self.inner.close(code, reason.into()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use futures::StreamExt;
    use tokio::io::duplex;

    async fn pair(options: Options) -> (Connection<tokio::io::DuplexStream>, Connection<tokio::io::DuplexStream>) {
        let (client_stream, server_stream) = duplex(64 * 1024);
        let client = Connection::new(client_stream, Role::Initiator, options.clone()).await;
        let server = Connection::new(server_stream, Role::Responder, options).await;
        (client, server)
    }

    #[tokio::test]
    async fn echo_round_trip_single_text_frame() {
        let mut options = Options::default();
        options.heartbeat_enabled = false;
        let (client, server) = pair(options).await;

        client.send_text("Hello".to_string()).await.unwrap();

        let message = server.receive().await.unwrap().unwrap();
        assert!(message.is_text());
        let body = message.into_body().collect().await.unwrap();
        assert_eq!(body, b"Hello");
    }

    #[tokio::test]
    async fn fragmented_binary_send_produces_expected_frame_count() {
        let mut options = Options::default();
        options.heartbeat_enabled = false;
        options.frame_split_threshold = 3;
        let (client, server) = pair(options).await;

        client.send_binary(b"ABCDE".to_vec()).await.unwrap();

        let message = server.receive().await.unwrap().unwrap();
        assert!(message.is_binary());
        let body = message.into_body().collect().await.unwrap();
        assert_eq!(body, b"ABCDE");
    }

    #[tokio::test]
    async fn peer_close_is_observed_with_code_and_reason() {
        let mut options = Options::default();
        options.heartbeat_enabled = false;
        let (client, server) = pair(options).await;

        client.close(CloseCode::NORMAL, "bye").await;

        let message = server.receive().await.unwrap();
        assert!(message.is_none());
        assert!(server.peer_initiated_close().unwrap());
        assert_eq!(server.close_code().unwrap(), Some(1000));
        assert_eq!(server.close_reason().unwrap(), "bye");
    }

    #[tokio::test]
    async fn invalid_utf8_text_closes_with_1007() {
        let mut options = Options::default();
        options.heartbeat_enabled = false;
        let (client, server) = pair(options).await;

        // Bypass send()'s own UTF-8 guard to exercise the wire-level check.
        client
            .inner
            .send_payload(OpCode::Text, vec![0xFF])
            .await
            .unwrap();

        let message = server.receive().await.unwrap();
        assert!(message.is_none());
        assert_eq!(server.close_code().unwrap(), Some(1007));
    }

    #[tokio::test]
    async fn receive_resolves_to_none_after_close_without_hanging() {
        let mut options = Options::default();
        options.heartbeat_enabled = false;
        let (client, _server) = pair(options).await;

        client.close(CloseCode::NORMAL, "bye").await;

        // The peer's own reader task has already seen the echoed CLOSE and
        // torn the connection down by the time `client.close` returns, so
        // this call starts after closure and must resolve promptly rather
        // than block on the never-dropped sender half.
        let result = tokio::time::timeout(Duration::from_secs(1), client.receive())
            .await
            .expect("receive() must not hang once the connection is closed")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn ping_pong_heartbeat_updates_metadata() {
        let mut options = Options::default();
        options.heartbeat_enabled = false;
        let (client, server) = pair(options).await;

        client.ping().await;

        // The server's reader task answers PING with PONG automatically;
        // drive it by polling receive() with a short timeout until the
        // client's pong counter reflects the reply.
        let _ = tokio::time::timeout(Duration::from_millis(200), server.receive()).await;
        let _ = tokio::time::timeout(Duration::from_millis(200), client.receive()).await;

        assert_eq!(client.get_info().ping_count, 1);
        assert_eq!(client.get_info().pong_count, 1);
    }

    #[tokio::test]
    async fn oversize_message_closes_with_1009() {
        let mut options = Options::default();
        options.heartbeat_enabled = false;
        options.message_size_limit = 10;
        options.frame_split_threshold = 5;
        let (client, server) = pair(options).await;

        client.send_binary(vec![0u8; 11]).await.ok();

        let _ = server.receive().await;
        assert_eq!(server.close_code().unwrap(), Some(1009));
    }

    #[tokio::test]
    async fn send_rejects_invalid_utf8_as_misuse_without_closing() {
        let mut options = Options::default();
        options.heartbeat_enabled = false;
        let (client, _server) = pair(options).await;

        let err = client.send(vec![0xFF]).await.unwrap_err();
        assert!(matches!(err, crate::error::SendError::InvalidUtf8));
        assert!(client.is_connected());
        assert!(client.close_code().is_err());
    }

    #[tokio::test]
    async fn ping_after_close_is_a_no_op() {
        let mut options = Options::default();
        options.heartbeat_enabled = false;
        let (client, _server) = pair(options).await;

        client.close(CloseCode::NORMAL, "bye").await;

        assert_eq!(client.ping().await, 0);
    }
}
