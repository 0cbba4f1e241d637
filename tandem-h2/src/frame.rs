//! HTTP/2 frame encoding/decoding (RFC 7540 Section 4).
//!
//! HTTP/2 frames have a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                    |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+------...------+
//! |R|                 Stream Identifier (31)       |
//! +-+---------------------------------------------+
//! |                   Frame Payload ...            |
//! +-----------------------------------------------+
//! ```
//!
//! Two layers live here. [`RawFrame`] is the untyped wire unit (`pack` /
//! `unpack`), and [`Frame`] is the tagged view over the known frame types
//! with an `Unknown` variant for extension frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorCode, FrameError, H2Error};
use crate::settings::Settings;

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 9;

/// Largest stream identifier representable in 31 bits.
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Largest payload representable in the 24-bit length field.
pub const MAX_PAYLOAD_LEN: usize = 0x00ff_ffff;

/// Initial SETTINGS_MAX_FRAME_SIZE (RFC 7540 Section 6.5.2).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Frame flag bits.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// Frame type byte (RFC 7540 Section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    /// Extension or future frame type. Must be ignored by receivers.
    Unknown(u8),
}

impl FrameKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Data => 0x0,
            Self::Headers => 0x1,
            Self::Priority => 0x2,
            Self::RstStream => 0x3,
            Self::Settings => 0x4,
            Self::PushPromise => 0x5,
            Self::Ping => 0x6,
            Self::GoAway => 0x7,
            Self::WindowUpdate => 0x8,
            Self::Continuation => 0x9,
            Self::Unknown(v) => v,
        }
    }
}

impl From<u8> for FrameKind {
    fn from(v: u8) -> Self {
        Self::from_u8(v)
    }
}

// -- Raw frames --

/// Decoded 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: FrameKind,
    pub flags: u8,
    pub stream_id: u32,
}

/// Decode a 9-byte frame header from the start of `buf`.
/// Returns `None` if the buffer is too short.
pub fn decode_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let mut b = &buf[..FRAME_HEADER_LEN];
    let length = (u32::from(b.get_u16()) << 8) | u32::from(b.get_u8());
    let kind = FrameKind::from_u8(b.get_u8());
    let flags = b.get_u8();
    // Receivers must ignore the reserved bit.
    let stream_id = b.get_u32() & MAX_STREAM_ID;
    Some(FrameHeader {
        length,
        kind,
        flags,
        stream_id,
    })
}

/// An untyped frame as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: FrameKind,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn new(kind: FrameKind, flags: u8, stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            flags,
            stream_id,
            payload: payload.into(),
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Size of the frame on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// Serialize header + payload into a fresh buffer.
    pub fn pack(&self) -> Result<Bytes, H2Error> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.pack_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Serialize header + payload, appending to `buf`.
    pub fn pack_into(&self, buf: &mut BytesMut) -> Result<(), H2Error> {
        if self.stream_id > MAX_STREAM_ID {
            return Err(FrameError::StreamIdOverflow(self.stream_id).into());
        }
        let len = self.payload.len();
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(len).into());
        }
        buf.reserve(FRAME_HEADER_LEN + len);
        buf.put_u16((len >> 8) as u16);
        buf.put_u8(len as u8);
        buf.put_u8(self.kind.as_u8());
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Parse the leading frame of `buf`, returning it with the unconsumed
    /// remainder.
    ///
    /// Fails with [`FrameError::Truncated`] when `buf` ends before the
    /// declared frame does; callers read more and retry with the same bytes.
    pub fn unpack(buf: &[u8]) -> Result<(RawFrame, &[u8]), H2Error> {
        let header = decode_frame_header(buf).ok_or(FrameError::Truncated {
            needed: FRAME_HEADER_LEN,
            available: buf.len(),
        })?;
        let total = FRAME_HEADER_LEN + header.length as usize;
        if buf.len() < total {
            return Err(FrameError::Truncated {
                needed: total,
                available: buf.len(),
            }
            .into());
        }
        let payload = Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..total]);
        let frame = RawFrame {
            kind: header.kind,
            flags: header.flags,
            stream_id: header.stream_id,
            payload,
        };
        Ok((frame, &buf[total..]))
    }

    /// Split the leading frame off an accumulating receive buffer.
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold a complete frame.
    /// The payload shares the buffer's allocation.
    pub fn decode(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<RawFrame>, H2Error> {
        let header = match decode_frame_header(buf) {
            Some(h) => h,
            None => return Ok(None),
        };
        // SETTINGS may legitimately exceed the limit (6 bytes per entry).
        if header.length > max_frame_size && header.kind != FrameKind::Settings {
            return Err(H2Error::FrameSizeError);
        }
        let total = FRAME_HEADER_LEN + header.length as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }
        let mut frame = buf.split_to(total);
        frame.advance(FRAME_HEADER_LEN);
        Ok(Some(RawFrame {
            kind: header.kind,
            flags: header.flags,
            stream_id: header.stream_id,
            payload: frame.freeze(),
        }))
    }
}

// -- Typed frames --

/// Stream priority information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

impl Priority {
    fn put(&self, buf: &mut BytesMut) {
        let dep = if self.exclusive {
            self.dependency | 0x8000_0000
        } else {
            self.dependency
        };
        buf.put_u32(dep);
        buf.put_u8(self.weight);
    }

    fn read(mut data: &[u8]) -> Self {
        let dep = data.get_u32();
        Self {
            exclusive: dep & 0x8000_0000 != 0,
            dependency: dep & MAX_STREAM_ID,
            weight: data.get_u8(),
        }
    }
}

/// An HTTP/2 frame, tagged by type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// DATA frame (type 0x0): carries request or response body.
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
    },
    /// HEADERS frame (type 0x1): HPACK-encoded header block fragment.
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    },
    /// PRIORITY frame (type 0x2): stream dependency and weight.
    Priority { stream_id: u32, priority: Priority },
    /// RST_STREAM frame (type 0x3): abnormal stream termination.
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    /// SETTINGS frame (type 0x4): configuration parameters.
    Settings { ack: bool, settings: Settings },
    /// PUSH_PROMISE frame (type 0x5): refused by this client.
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// PING frame (type 0x6): connection liveness check.
    Ping { ack: bool, opaque_data: [u8; 8] },
    /// GOAWAY frame (type 0x7): graceful shutdown.
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    /// WINDOW_UPDATE frame (type 0x8): flow control window increment.
    WindowUpdate { stream_id: u32, increment: u32 },
    /// CONTINUATION frame (type 0x9): header block continuation.
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// Unknown frame type, kept verbatim.
    Unknown(RawFrame),
}

impl Frame {
    /// Stream the frame belongs to (0 for connection-level frames).
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
            Frame::Unknown(raw) => raw.stream_id,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data { .. } => FrameKind::Data,
            Frame::Headers { .. } => FrameKind::Headers,
            Frame::Priority { .. } => FrameKind::Priority,
            Frame::RstStream { .. } => FrameKind::RstStream,
            Frame::Settings { .. } => FrameKind::Settings,
            Frame::PushPromise { .. } => FrameKind::PushPromise,
            Frame::Ping { .. } => FrameKind::Ping,
            Frame::GoAway { .. } => FrameKind::GoAway,
            Frame::WindowUpdate { .. } => FrameKind::WindowUpdate,
            Frame::Continuation { .. } => FrameKind::Continuation,
            Frame::Unknown(raw) => raw.kind,
        }
    }

    /// Whether the frame carries END_STREAM.
    pub fn is_end_stream(&self) -> bool {
        matches!(
            self,
            Frame::Data {
                end_stream: true,
                ..
            } | Frame::Headers {
                end_stream: true,
                ..
            }
        )
    }

    /// Build the wire representation of this frame.
    pub fn to_raw(&self) -> RawFrame {
        let mut payload = BytesMut::new();
        let (kind, flags, stream_id) = match self {
            Frame::Data {
                stream_id,
                payload: data,
                end_stream,
            } => {
                payload.put_slice(data);
                let flags = if *end_stream { flags::END_STREAM } else { 0 };
                (FrameKind::Data, flags, *stream_id)
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            } => {
                let mut f = 0u8;
                if *end_stream {
                    f |= flags::END_STREAM;
                }
                if *end_headers {
                    f |= flags::END_HEADERS;
                }
                if let Some(pri) = priority {
                    f |= flags::PRIORITY;
                    pri.put(&mut payload);
                }
                payload.put_slice(block);
                (FrameKind::Headers, f, *stream_id)
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                priority.put(&mut payload);
                (FrameKind::Priority, 0, *stream_id)
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                payload.put_u32(*error_code as u32);
                (FrameKind::RstStream, 0, *stream_id)
            }
            Frame::Settings { ack, settings } => {
                if *ack {
                    (FrameKind::Settings, flags::ACK, 0)
                } else {
                    settings.encode(&mut payload);
                    (FrameKind::Settings, 0, 0)
                }
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                block,
                end_headers,
            } => {
                payload.put_u32(*promised_stream_id & MAX_STREAM_ID);
                payload.put_slice(block);
                let f = if *end_headers { flags::END_HEADERS } else { 0 };
                (FrameKind::PushPromise, f, *stream_id)
            }
            Frame::Ping { ack, opaque_data } => {
                payload.put_slice(opaque_data);
                let f = if *ack { flags::ACK } else { 0 };
                (FrameKind::Ping, f, 0)
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                payload.put_u32(*last_stream_id & MAX_STREAM_ID);
                payload.put_u32(*error_code as u32);
                payload.put_slice(debug_data);
                (FrameKind::GoAway, 0, 0)
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                payload.put_u32(*increment & MAX_STREAM_ID);
                (FrameKind::WindowUpdate, 0, *stream_id)
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                payload.put_slice(block);
                let f = if *end_headers { flags::END_HEADERS } else { 0 };
                (FrameKind::Continuation, f, *stream_id)
            }
            Frame::Unknown(raw) => return raw.clone(),
        };
        RawFrame {
            kind,
            flags,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Encode this frame into `buf` (header + payload).
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), H2Error> {
        self.to_raw().pack_into(buf)
    }

    /// Interpret a raw frame, validating the per-type layout rules.
    pub fn parse(raw: RawFrame, max_frame_size: u32) -> Result<Frame, H2Error> {
        if raw.payload.len() > max_frame_size as usize && raw.kind != FrameKind::Settings {
            return Err(H2Error::FrameSizeError);
        }
        let RawFrame {
            kind,
            flags: f,
            stream_id,
            payload,
        } = raw;

        let frame = match kind {
            FrameKind::Data => {
                require_stream(stream_id, "DATA")?;
                Frame::Data {
                    stream_id,
                    payload: strip_padding(payload, f)?,
                    end_stream: f & flags::END_STREAM != 0,
                }
            }
            FrameKind::Headers => {
                require_stream(stream_id, "HEADERS")?;
                let mut data = strip_padding(payload, f)?;
                let priority = if f & flags::PRIORITY != 0 {
                    if data.len() < 5 {
                        return Err(H2Error::FrameSizeError);
                    }
                    let pri = Priority::read(&data[..5]);
                    data.advance(5);
                    Some(pri)
                } else {
                    None
                };
                Frame::Headers {
                    stream_id,
                    block: data,
                    end_stream: f & flags::END_STREAM != 0,
                    end_headers: f & flags::END_HEADERS != 0,
                    priority,
                }
            }
            FrameKind::Priority => {
                require_stream(stream_id, "PRIORITY")?;
                if payload.len() != 5 {
                    return Err(H2Error::StreamError(stream_id, ErrorCode::FrameSizeError));
                }
                Frame::Priority {
                    stream_id,
                    priority: Priority::read(&payload),
                }
            }
            FrameKind::RstStream => {
                require_stream(stream_id, "RST_STREAM")?;
                require_len(&payload, 4)?;
                Frame::RstStream {
                    stream_id,
                    error_code: ErrorCode::from_u32((&payload[..]).get_u32()),
                }
            }
            FrameKind::Settings => {
                if stream_id != 0 {
                    return Err(H2Error::ProtocolError("SETTINGS on non-zero stream".into()));
                }
                if f & flags::ACK != 0 {
                    if !payload.is_empty() {
                        return Err(H2Error::FrameSizeError);
                    }
                    Frame::Settings {
                        ack: true,
                        settings: Settings::default(),
                    }
                } else {
                    Frame::Settings {
                        ack: false,
                        settings: Settings::decode(&payload)?,
                    }
                }
            }
            FrameKind::PushPromise => {
                require_stream(stream_id, "PUSH_PROMISE")?;
                let mut data = strip_padding(payload, f)?;
                if data.len() < 4 {
                    return Err(H2Error::FrameSizeError);
                }
                let promised = data.get_u32() & MAX_STREAM_ID;
                Frame::PushPromise {
                    stream_id,
                    promised_stream_id: promised,
                    block: data,
                    end_headers: f & flags::END_HEADERS != 0,
                }
            }
            FrameKind::Ping => {
                if stream_id != 0 {
                    return Err(H2Error::ProtocolError("PING on non-zero stream".into()));
                }
                require_len(&payload, 8)?;
                let mut opaque_data = [0u8; 8];
                opaque_data.copy_from_slice(&payload);
                Frame::Ping {
                    ack: f & flags::ACK != 0,
                    opaque_data,
                }
            }
            FrameKind::GoAway => {
                if stream_id != 0 {
                    return Err(H2Error::ProtocolError("GOAWAY on non-zero stream".into()));
                }
                if payload.len() < 8 {
                    return Err(H2Error::FrameSizeError);
                }
                let mut data = payload;
                let last_stream_id = data.get_u32() & MAX_STREAM_ID;
                let error_code = ErrorCode::from_u32(data.get_u32());
                Frame::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data: data,
                }
            }
            FrameKind::WindowUpdate => {
                require_len(&payload, 4)?;
                let increment = (&payload[..]).get_u32() & MAX_STREAM_ID;
                if increment == 0 {
                    if stream_id != 0 {
                        return Err(H2Error::StreamError(stream_id, ErrorCode::ProtocolError));
                    }
                    return Err(H2Error::ProtocolError(
                        "WINDOW_UPDATE with 0 increment".into(),
                    ));
                }
                Frame::WindowUpdate {
                    stream_id,
                    increment,
                }
            }
            FrameKind::Continuation => {
                require_stream(stream_id, "CONTINUATION")?;
                Frame::Continuation {
                    stream_id,
                    block: payload,
                    end_headers: f & flags::END_HEADERS != 0,
                }
            }
            FrameKind::Unknown(_) => Frame::Unknown(RawFrame {
                kind,
                flags: f,
                stream_id,
                payload,
            }),
        };
        Ok(frame)
    }
}

fn require_stream(stream_id: u32, name: &str) -> Result<(), H2Error> {
    if stream_id == 0 {
        return Err(H2Error::ProtocolError(format!("{name} on stream 0")));
    }
    Ok(())
}

fn require_len(payload: &[u8], expected: usize) -> Result<(), H2Error> {
    if payload.len() != expected {
        return Err(FrameError::LengthMismatch {
            expected,
            actual: payload.len(),
        }
        .into());
    }
    Ok(())
}

/// Strip padding from a frame payload if the PADDED flag is set.
fn strip_padding(mut payload: Bytes, f: u8) -> Result<Bytes, H2Error> {
    if f & flags::PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(H2Error::FrameSizeError);
    }
    let pad_len = payload[0] as usize;
    if pad_len >= payload.len() {
        return Err(H2Error::ProtocolError("padding exceeds payload".into()));
    }
    payload.advance(1);
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}
