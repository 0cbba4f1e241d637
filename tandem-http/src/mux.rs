//! HTTP/2 stream multiplexer.
//!
//! One [`Multiplexer`] owns one HTTP/2 connection. Callers open streams,
//! write frames, and pull what the peer sent from a per-stream inbox. A
//! background receive task reads the socket, reassembles header blocks,
//! decodes them with the connection's HPACK decoder in arrival order and
//! routes the results to inboxes.
//!
//! ```text
//!  caller tasks                              receive task
//!  ------------                              ------------
//!  create_stream ──┐                ┌── read socket
//!  send_headers ───┤  writer lock   │   unpack frames
//!  send_data ──────┤  (HPACK enc)   │   HPACK decode (arrival order)
//!                  ▼                ▼
//!               socket  <────────> socket
//!                                   │
//!  get_response  <── inbox[id] <────┘  SETTINGS / PING / WINDOW_UPDATE
//!                                      handled in place
//! ```
//!
//! Writes are serialized through one async lock that also owns the HPACK
//! encoder, so the peer sees header blocks in the same order the encoder's
//! dynamic table changed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tandem_h2::flowcontrol::DEFAULT_WINDOW_SIZE;
use tandem_h2::frame::{DEFAULT_MAX_FRAME_SIZE, FrameKind, MAX_STREAM_ID};
use tandem_h2::hpack::{DEFAULT_TABLE_SIZE, Decoder, Encoder};
use tandem_h2::{
    CONNECTION_PREFACE, ErrorCode, Frame, H2Error, HeaderField, HeaderList, RawFrame, Settings,
    Window,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::H2Config;
use crate::error::HttpError;
use crate::flow::FlowControl;
use crate::metrics::{FRAMES_RECEIVED, FRAMES_SENT, STREAMS_OPENED, STREAMS_RESET};

pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Read buffer growth step.
const READ_CHUNK: usize = 16 * 1024;

/// Lifecycle of a client-initiated stream (RFC 7540 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    /// The peer reset the stream. Terminal.
    Reset,
}

/// What the receive loop delivers to a stream's inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// A complete, decoded header block (response headers or trailers).
    Headers {
        headers: HeaderList,
        end_stream: bool,
    },
    Data {
        data: Bytes,
        end_stream: bool,
    },
    /// RST_STREAM from the peer, or a refusal after GOAWAY.
    Reset(ErrorCode),
}

impl StreamFrame {
    pub fn is_end_stream(&self) -> bool {
        matches!(
            self,
            StreamFrame::Headers {
                end_stream: true,
                ..
            } | StreamFrame::Data {
                end_stream: true,
                ..
            }
        )
    }
}

struct StreamEntry {
    state: StreamState,
    inbox: VecDeque<StreamFrame>,
    wake: Arc<Notify>,
}

struct StreamTable {
    entries: HashMap<u32, StreamEntry>,
    next_id: u32,
    /// Shut down locally; every inbox is gone.
    closed: bool,
    /// The peer's side ended (EOF or read error). Queued frames stay
    /// readable, nothing new arrives.
    peer_gone: bool,
    /// Last stream id the peer promised to process, once GOAWAY arrived.
    goaway: Option<u32>,
}

/// Frames are queued into `buf` and written on `flush`.
struct FrameWriter {
    io: BoxWrite,
    encoder: Encoder,
    buf: BytesMut,
}

impl FrameWriter {
    fn queue(&mut self, frame: &Frame) -> Result<(), HttpError> {
        frame.encode(&mut self.buf)?;
        FRAMES_SENT.increment();
        trace!(
            stream_id = frame.stream_id(),
            frame_type = ?frame.kind(),
            "frame queued"
        );
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), HttpError> {
        if !self.buf.is_empty() {
            let out = self.buf.split();
            self.io.write_all(&out).await?;
        }
        self.io.flush().await?;
        Ok(())
    }
}

struct Shared {
    streams: Mutex<StreamTable>,
    flow: FlowControl,
    writer: tokio::sync::Mutex<FrameWriter>,
    /// Peer's SETTINGS_MAX_FRAME_SIZE.
    peer_max_frame: AtomicU32,
    config: H2Config,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, StreamTable> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn write(&self, frames: &[Frame]) -> Result<(), HttpError> {
        let mut writer = self.writer.lock().await;
        for frame in frames {
            writer.queue(frame)?;
        }
        writer.flush().await
    }

    /// Push `item` to the inbox of `id`. Returns false when the stream is
    /// unknown or can no longer receive, in which case the item is dropped.
    fn deliver(&self, id: u32, item: StreamFrame) -> bool {
        let mut table = self.table();
        let Some(entry) = table.entries.get_mut(&id) else {
            trace!(stream_id = id, "dropping frame for unknown stream");
            return false;
        };
        if matches!(
            entry.state,
            StreamState::HalfClosedRemote | StreamState::Closed | StreamState::Reset
        ) {
            trace!(stream_id = id, state = ?entry.state, "dropping frame for closed stream");
            return false;
        }
        if item.is_end_stream() {
            entry.state = match entry.state {
                StreamState::HalfClosedLocal => StreamState::Closed,
                _ => StreamState::HalfClosedRemote,
            };
        }
        entry.inbox.push_back(item);
        entry.wake.notify_waiters();
        true
    }

    /// Terminate `id` with `code`, leaving the reset in its inbox.
    fn reset(&self, id: u32, code: ErrorCode) {
        {
            let mut table = self.table();
            let Some(entry) = table.entries.get_mut(&id) else {
                trace!(stream_id = id, "reset for unknown stream");
                return;
            };
            if matches!(entry.state, StreamState::HalfClosedRemote | StreamState::Closed) {
                // The response is complete; only our sending side is cut off.
                trace!(stream_id = id, error_code = ?code, "reset after remote end");
                entry.state = StreamState::Closed;
                if entry.inbox.is_empty() {
                    table.entries.remove(&id);
                }
                drop(table);
                self.flow.remove_stream(id);
                return;
            }
            entry.state = StreamState::Reset;
            entry.inbox.push_back(StreamFrame::Reset(code));
            entry.wake.notify_waiters();
        }
        STREAMS_RESET.increment();
        self.flow.remove_stream(id);
    }

    /// Mark the local side of `id` finished.
    fn end_local(&self, id: u32) {
        let mut table = self.table();
        let Some(entry) = table.entries.get_mut(&id) else {
            return;
        };
        entry.state = match entry.state {
            StreamState::HalfClosedRemote => StreamState::Closed,
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            other => other,
        };
        if entry.state == StreamState::Closed && entry.inbox.is_empty() {
            table.entries.remove(&id);
            drop(table);
            self.flow.remove_stream(id);
        }
    }

    fn check_sendable(&self, id: u32) -> Result<(), HttpError> {
        let table = self.table();
        if table.closed || table.peer_gone {
            return Err(HttpError::ConnectionClosed);
        }
        match table.entries.get(&id).map(|e| e.state) {
            None => Err(HttpError::Protocol(format!("unknown stream {id}"))),
            Some(StreamState::Reset) => Err(HttpError::Protocol(format!("stream {id} reset"))),
            Some(StreamState::HalfClosedLocal | StreamState::Closed) => Err(HttpError::Protocol(
                format!("stream {id} already finished sending"),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Drop every inbox and fail all current and future waits.
    fn shutdown(&self) {
        {
            let mut table = self.table();
            if table.closed {
                return;
            }
            table.closed = true;
            for (_, entry) in table.entries.drain() {
                entry.wake.notify_waiters();
            }
        }
        self.flow.close();
        debug!("connection shut down");
    }

    /// The receive side is finished. Streams whose response already ended
    /// keep their queued frames; the rest fail once their inbox runs dry.
    fn peer_closed(&self) {
        {
            let mut table = self.table();
            if table.closed || table.peer_gone {
                return;
            }
            table.peer_gone = true;
            table.entries.retain(|_, entry| {
                entry.wake.notify_waiters();
                !entry.inbox.is_empty()
                    || !matches!(entry.state, StreamState::HalfClosedRemote | StreamState::Closed)
            });
        }
        self.flow.close();
        debug!("peer closed the connection");
    }
}

/// An HTTP/2 connection carrying concurrent client streams.
pub struct Multiplexer {
    shared: Arc<Shared>,
    reader: Mutex<Option<BoxRead>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Wrap a connected byte stream. Nothing is written until
    /// [`handshake`](Self::handshake).
    pub fn new<T>(io: T, config: H2Config) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::from_halves(Box::new(reader), Box::new(writer), config)
    }

    /// Wrap separate read and write halves.
    pub fn from_halves(reader: BoxRead, writer: BoxWrite, config: H2Config) -> Self {
        let mut encoder = Encoder::default();
        encoder.set_max_table_size(
            (config.header_table_size as usize).min(DEFAULT_TABLE_SIZE),
        );
        let shared = Arc::new(Shared {
            streams: Mutex::new(StreamTable {
                entries: HashMap::new(),
                next_id: 1,
                closed: false,
                peer_gone: false,
                goaway: None,
            }),
            flow: FlowControl::new(Settings::default().initial_window_size),
            writer: tokio::sync::Mutex::new(FrameWriter {
                io: writer,
                encoder,
                buf: BytesMut::with_capacity(READ_CHUNK),
            }),
            peer_max_frame: AtomicU32::new(DEFAULT_MAX_FRAME_SIZE),
            config,
        });
        Self {
            shared,
            reader: Mutex::new(Some(reader)),
            task: Mutex::new(None),
        }
    }

    /// Send the client connection preface: the magic string, our SETTINGS
    /// (push disabled) and, if we asked for a larger receive window, a
    /// connection-level WINDOW_UPDATE.
    pub async fn handshake(&self) -> Result<(), HttpError> {
        let config = &self.shared.config;
        let mut writer = self.shared.writer.lock().await;
        writer.buf.extend_from_slice(CONNECTION_PREFACE);
        writer.queue(&Frame::Settings {
            ack: false,
            settings: config.settings(),
        })?;
        let extra = i64::from(config.initial_window_size) - DEFAULT_WINDOW_SIZE;
        if extra > 0 {
            writer.queue(&Frame::WindowUpdate {
                stream_id: 0,
                increment: extra as u32,
            })?;
        }
        writer.flush().await?;
        debug!("connection preface sent");
        Ok(())
    }

    /// Spawn the background receive task.
    pub fn start_receiving(&self) -> Result<(), HttpError> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| HttpError::Protocol("receive loop already started".into()))?;
        let config = &self.shared.config;
        let conn_target =
            i64::from(config.initial_window_size).max(DEFAULT_WINDOW_SIZE);
        let receiver = ReceiveLoop {
            shared: self.shared.clone(),
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            decoder: Decoder::new(config.header_table_size as usize),
            max_frame_size: config.max_frame_size,
            peer: Settings::default(),
            recv_connection: Window::new(conn_target),
            conn_target,
            recv_streams: HashMap::new(),
            continuation: None,
        };
        let handle = tokio::spawn(receiver.run());
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Stop the receive task and shut the connection down. Every pending
    /// and future `get_response` or window wait fails with
    /// [`HttpError::ConnectionClosed`].
    pub fn stop_receiving(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.shared.shutdown();
    }

    /// True once the connection can no longer carry new streams.
    pub fn is_closed(&self) -> bool {
        let table = self.shared.table();
        table.closed || table.peer_gone || table.goaway.is_some()
    }

    /// Allocate the next client stream id and register it with flow control.
    pub fn create_stream(&self) -> Result<u32, HttpError> {
        let id = {
            let mut table = self.shared.table();
            if table.closed || table.peer_gone || table.goaway.is_some() {
                return Err(HttpError::ConnectionClosed);
            }
            let id = table.next_id;
            if id > MAX_STREAM_ID {
                return Err(HttpError::Protocol("stream ids exhausted".into()));
            }
            table.next_id += 2;
            table.entries.insert(
                id,
                StreamEntry {
                    state: StreamState::Idle,
                    inbox: VecDeque::new(),
                    wake: Arc::new(Notify::new()),
                },
            );
            id
        };
        self.shared.flow.add_stream(id);
        STREAMS_OPENED.increment();
        debug!(stream_id = id, "stream created");
        Ok(id)
    }

    pub fn stream_state(&self, id: u32) -> Option<StreamState> {
        self.shared.table().entries.get(&id).map(|e| e.state)
    }

    /// Current send window of `id` (0 for the connection).
    pub fn send_window(&self, id: u32) -> Option<i64> {
        self.shared.flow.window(id)
    }

    /// HPACK-encode `headers` and send them on `id`, split into HEADERS and
    /// CONTINUATION frames when the block exceeds the peer's frame size.
    pub async fn send_headers(
        &self,
        id: u32,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), HttpError> {
        self.shared.check_sendable(id)?;
        {
            let mut writer = self.shared.writer.lock().await;
            let mut block = BytesMut::new();
            writer.encoder.encode(headers, &mut block);
            let max = self.shared.peer_max_frame.load(Ordering::Acquire) as usize;
            let mut rest = block.freeze();
            let mut first = true;
            loop {
                let chunk = rest.split_to(rest.len().min(max));
                let end_headers = rest.is_empty();
                let frame = if first {
                    Frame::Headers {
                        stream_id: id,
                        block: chunk,
                        end_stream,
                        end_headers,
                        priority: None,
                    }
                } else {
                    Frame::Continuation {
                        stream_id: id,
                        block: chunk,
                        end_headers,
                    }
                };
                writer.queue(&frame)?;
                first = false;
                if end_headers {
                    break;
                }
            }
            writer.flush().await?;
        }
        self.mark_sent(id, end_stream);
        Ok(())
    }

    /// Send a body on `id`, waiting for flow control credit and splitting
    /// it into frames no larger than the peer allows.
    pub async fn send_data(&self, id: u32, data: Bytes, end_stream: bool) -> Result<(), HttpError> {
        if data.is_empty() {
            if end_stream {
                return self
                    .send_frame(Frame::Data {
                        stream_id: id,
                        payload: data,
                        end_stream,
                    })
                    .await;
            }
            return Ok(());
        }
        let mut rest = data;
        while !rest.is_empty() {
            self.shared.check_sendable(id)?;
            let max = self.shared.peer_max_frame.load(Ordering::Acquire) as usize;
            let want = rest.len().min(max) as u32;
            let granted = self.shared.flow.acquire_up_to(id, want).await?;
            let chunk = rest.split_to(granted as usize);
            let frame = Frame::Data {
                stream_id: id,
                payload: chunk,
                end_stream: end_stream && rest.is_empty(),
            };
            self.shared.write(std::slice::from_ref(&frame)).await?;
        }
        if end_stream {
            self.shared.end_local(id);
        }
        Ok(())
    }

    /// Write one frame. DATA first waits for the full payload to fit the
    /// send windows. END_STREAM finishes the local side of the stream.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), HttpError> {
        let id = frame.stream_id();
        match &frame {
            Frame::Data { payload, .. } => {
                self.shared.check_sendable(id)?;
                if !payload.is_empty() {
                    self.shared.flow.acquire(id, payload.len() as u32).await?;
                }
            }
            Frame::Headers { .. } | Frame::Continuation { .. } => {
                self.shared.check_sendable(id)?;
            }
            _ => {}
        }
        self.shared.write(std::slice::from_ref(&frame)).await?;
        if matches!(frame, Frame::Headers { .. } | Frame::Data { .. }) {
            self.mark_sent(id, frame.is_end_stream());
        }
        Ok(())
    }

    /// Abort a stream locally with RST_STREAM.
    pub async fn reset_stream(&self, id: u32, code: ErrorCode) -> Result<(), HttpError> {
        self.shared
            .write(&[Frame::RstStream {
                stream_id: id,
                error_code: code,
            }])
            .await?;
        if let Some(entry) = self.shared.table().entries.remove(&id) {
            entry.wake.notify_waiters();
        }
        self.shared.flow.remove_stream(id);
        Ok(())
    }

    fn mark_sent(&self, id: u32, end_stream: bool) {
        if end_stream {
            self.shared.end_local(id);
            return;
        }
        if let Some(entry) = self.shared.table().entries.get_mut(&id)
            && entry.state == StreamState::Idle
        {
            entry.state = StreamState::Open;
        }
    }

    /// Take the next item from the inbox of `id`, waiting up to `timeout`.
    ///
    /// A reset stream yields a single protocol error and is then removed.
    pub async fn get_response(&self, id: u32, timeout: Duration) -> Result<StreamFrame, HttpError> {
        tokio::time::timeout(timeout, self.next_frame(id))
            .await
            .unwrap_or(Err(HttpError::Timeout))
    }

    async fn next_frame(&self, id: u32) -> Result<StreamFrame, HttpError> {
        loop {
            let wake = {
                let table = self.shared.table();
                if table.closed {
                    return Err(HttpError::ConnectionClosed);
                }
                match table.entries.get(&id) {
                    Some(entry) => entry.wake.clone(),
                    None => return Err(HttpError::Protocol(format!("unknown stream {id}"))),
                }
            };
            let notified = wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.pop_inbox(id) {
                return result;
            }
            notified.await;
        }
    }

    fn pop_inbox(&self, id: u32) -> Option<Result<StreamFrame, HttpError>> {
        let mut table = self.shared.table();
        if table.closed {
            return Some(Err(HttpError::ConnectionClosed));
        }
        let peer_gone = table.peer_gone;
        let Some(entry) = table.entries.get_mut(&id) else {
            return Some(Err(HttpError::Protocol(format!("unknown stream {id}"))));
        };
        let Some(item) = entry.inbox.pop_front() else {
            if !peer_gone {
                return None;
            }
            table.entries.remove(&id);
            drop(table);
            self.shared.flow.remove_stream(id);
            return Some(Err(HttpError::ConnectionClosed));
        };
        let finished = match item {
            StreamFrame::Reset(_) => true,
            _ => {
                entry.inbox.is_empty()
                    && match entry.state {
                        StreamState::Closed => true,
                        StreamState::HalfClosedRemote => peer_gone,
                        _ => false,
                    }
            }
        };
        if finished {
            table.entries.remove(&id);
            drop(table);
            self.shared.flow.remove_stream(id);
        }
        Some(match item {
            StreamFrame::Reset(code) => {
                debug!(stream_id = id, error_code = ?code, "stream reset by peer");
                Err(HttpError::Protocol(format!("stream {id} reset: {code:?}")))
            }
            other => Ok(other),
        })
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.stop_receiving();
    }
}

/// A header block split across HEADERS and CONTINUATION frames.
struct PendingBlock {
    stream_id: u32,
    end_stream: bool,
    block: BytesMut,
}

/// State owned by the background receive task.
struct ReceiveLoop {
    shared: Arc<Shared>,
    reader: BoxRead,
    buf: BytesMut,
    decoder: Decoder,
    /// Our SETTINGS_MAX_FRAME_SIZE.
    max_frame_size: u32,
    /// Peer SETTINGS as merged so far.
    peer: Settings,
    recv_connection: Window,
    conn_target: i64,
    recv_streams: HashMap<u32, Window>,
    continuation: Option<PendingBlock>,
}

impl ReceiveLoop {
    async fn run(mut self) {
        match self.read_frames().await {
            Ok(()) => trace!("end of stream"),
            Err(e) => {
                warn!(error = %e, "receive loop stopped");
                if let Some(code) = goaway_code(&e) {
                    // No server-initiated streams are ever accepted.
                    let _ = self
                        .shared
                        .write(&[Frame::GoAway {
                            last_stream_id: 0,
                            error_code: code,
                            debug_data: Bytes::new(),
                        }])
                        .await;
                }
            }
        }
        self.shared.peer_closed();
    }

    async fn read_frames(&mut self) -> Result<(), HttpError> {
        loop {
            while let Some(raw) = RawFrame::decode(&mut self.buf, self.max_frame_size)? {
                self.handle(raw).await?;
            }
            self.buf.reserve(READ_CHUNK);
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, raw: RawFrame) -> Result<(), HttpError> {
        FRAMES_RECEIVED.increment();
        trace!(
            stream_id = raw.stream_id,
            frame_type = ?raw.kind,
            len = raw.payload.len(),
            "frame received"
        );

        if let Some(pending) = &self.continuation
            && (raw.kind != FrameKind::Continuation || raw.stream_id != pending.stream_id)
        {
            return Err(H2Error::ProtocolError("expected CONTINUATION".into()).into());
        }
        let settings_payload = (raw.kind == FrameKind::Settings).then(|| raw.payload.clone());
        // Padding counts against flow control (RFC 7540 Section 6.9.1).
        let flow_len = raw.payload.len() as u32;

        let frame = match Frame::parse(raw, self.max_frame_size) {
            Err(H2Error::StreamError(id, code)) => return self.on_stream_error(id, code).await,
            parsed => parsed?,
        };
        match frame {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => {
                self.on_data(stream_id, payload, end_stream, flow_len)
                    .await?
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                ..
            } => {
                if end_headers {
                    self.on_header_block(stream_id, &block, end_stream)?;
                } else {
                    self.continuation = Some(PendingBlock {
                        stream_id,
                        end_stream,
                        block: BytesMut::from(&block[..]),
                    });
                }
            }
            Frame::Continuation {
                block,
                end_headers,
                ..
            } => {
                let mut pending = self
                    .continuation
                    .take()
                    .ok_or_else(|| H2Error::ProtocolError("unexpected CONTINUATION".into()))?;
                pending.block.extend_from_slice(&block);
                if end_headers {
                    self.on_header_block(pending.stream_id, &pending.block, pending.end_stream)?;
                } else {
                    self.continuation = Some(pending);
                }
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                self.recv_streams.remove(&stream_id);
                self.shared.reset(stream_id, error_code);
            }
            Frame::Settings { ack: true, .. } => debug!("settings acknowledged"),
            Frame::Settings { ack: false, .. } => {
                self.on_settings(settings_payload.unwrap_or_default())
                    .await?
            }
            Frame::Ping {
                ack: false,
                opaque_data,
            } => {
                self.shared
                    .write(&[Frame::Ping {
                        ack: true,
                        opaque_data,
                    }])
                    .await?
            }
            Frame::Ping { ack: true, .. } => {}
            Frame::GoAway {
                last_stream_id,
                error_code,
                ..
            } => {
                self.on_goaway(last_stream_id, error_code);
                if error_code != ErrorCode::NoError {
                    return Err(H2Error::ConnectionError(error_code).into());
                }
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                if let Err(e) = self.shared.flow.update_window(stream_id, increment) {
                    if stream_id == 0 {
                        return Err(e);
                    }
                    self.on_stream_error(stream_id, ErrorCode::FlowControlError)
                        .await?;
                }
            }
            Frame::PushPromise { .. } => {
                return Err(H2Error::ProtocolError("PUSH_PROMISE with push disabled".into()).into());
            }
            Frame::Priority { .. } | Frame::Unknown(_) => {}
        }
        Ok(())
    }

    /// Reset one stream and keep the connection going.
    async fn on_stream_error(&mut self, id: u32, code: ErrorCode) -> Result<(), HttpError> {
        warn!(stream_id = id, error_code = ?code, "stream error");
        self.shared
            .write(&[Frame::RstStream {
                stream_id: id,
                error_code: code,
            }])
            .await?;
        self.recv_streams.remove(&id);
        self.shared.reset(id, code);
        Ok(())
    }

    fn on_header_block(&mut self, id: u32, block: &[u8], end_stream: bool) -> Result<(), HttpError> {
        // Decode even for streams we dropped so the table stays in sync.
        let headers = self.decoder.decode(block)?;
        if end_stream {
            self.recv_streams.remove(&id);
        }
        self.shared.deliver(
            id,
            StreamFrame::Headers {
                headers,
                end_stream,
            },
        );
        Ok(())
    }

    async fn on_data(
        &mut self,
        id: u32,
        data: Bytes,
        end_stream: bool,
        len: u32,
    ) -> Result<(), HttpError> {
        self.recv_connection
            .consume(len)
            .map_err(|_| HttpError::FlowControl)?;

        let config = &self.shared.config;
        let stream_target = i64::from(config.initial_window_size);
        let stream_threshold = threshold_for(config, stream_target);
        let conn_threshold = threshold_for(config, self.conn_target);

        let mut updates = Vec::new();
        if let Some(increment) = self
            .recv_connection
            .reclaim(self.conn_target, conn_threshold)
        {
            updates.push(Frame::WindowUpdate {
                stream_id: 0,
                increment,
            });
        }

        let delivered = self.shared.deliver(id, StreamFrame::Data { data, end_stream });
        if delivered && end_stream {
            self.recv_streams.remove(&id);
        } else if delivered {
            let window = self
                .recv_streams
                .entry(id)
                .or_insert_with(|| Window::new(stream_target));
            window.consume(len).map_err(|_| HttpError::FlowControl)?;
            if let Some(increment) = window.reclaim(stream_target, stream_threshold) {
                updates.push(Frame::WindowUpdate {
                    stream_id: id,
                    increment,
                });
            }
        }
        if !updates.is_empty() {
            self.shared.write(&updates).await?;
        }
        Ok(())
    }

    async fn on_settings(&mut self, payload: Bytes) -> Result<(), HttpError> {
        let peer = self.peer.clone().merge(&payload)?;
        if peer.initial_window_size != self.peer.initial_window_size {
            self.shared.flow.adjust_initial(peer.initial_window_size)?;
        }
        self.shared
            .peer_max_frame
            .store(peer.max_frame_size, Ordering::Release);
        {
            let mut writer = self.shared.writer.lock().await;
            let table_size = (peer.header_table_size as usize)
                .min(self.shared.config.header_table_size as usize);
            writer.encoder.set_max_table_size(table_size);
            writer.queue(&Frame::Settings {
                ack: true,
                settings: Settings::default(),
            })?;
            writer.flush().await?;
        }
        debug!(
            initial_window_size = peer.initial_window_size,
            max_frame_size = peer.max_frame_size,
            header_table_size = peer.header_table_size,
            "peer settings applied"
        );
        self.peer = peer;
        Ok(())
    }

    fn on_goaway(&mut self, last_stream_id: u32, code: ErrorCode) {
        debug!(last_stream_id, error_code = ?code, "GOAWAY received");
        let refused: Vec<u32> = {
            let mut table = self.shared.table();
            table.goaway = Some(last_stream_id);
            table
                .entries
                .keys()
                .copied()
                .filter(|&id| id > last_stream_id)
                .collect()
        };
        for id in refused {
            self.shared.reset(id, ErrorCode::RefusedStream);
        }
    }
}

/// Refill a receive window once it drops below half of its target, or
/// below the configured threshold if that is higher.
fn threshold_for(config: &H2Config, target: i64) -> i64 {
    i64::from(config.window_update_threshold).max(target / 2)
}

/// GOAWAY error code for a connection-fatal receive error, if the peer
/// should be told.
fn goaway_code(e: &HttpError) -> Option<ErrorCode> {
    match e {
        HttpError::H2(H2Error::CompressionError) => Some(ErrorCode::CompressionError),
        HttpError::H2(H2Error::FrameSizeError | H2Error::Frame(_)) => {
            Some(ErrorCode::FrameSizeError)
        }
        HttpError::H2(H2Error::FlowControlError) | HttpError::FlowControl => {
            Some(ErrorCode::FlowControlError)
        }
        // The peer already said goodbye.
        HttpError::H2(H2Error::ConnectionError(_)) => None,
        HttpError::H2(_) | HttpError::Protocol(_) => Some(ErrorCode::ProtocolError),
        _ => None,
    }
}
