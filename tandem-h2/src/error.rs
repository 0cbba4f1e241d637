/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Map a wire value to a known code. Unknown codes are treated as
    /// INTERNAL_ERROR (RFC 7540 Section 7).
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

/// Why a frame could not be packed or unpacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Stream identifier does not fit in 31 bits.
    StreamIdOverflow(u32),
    /// Payload does not fit in the 24-bit length field.
    PayloadTooLarge(usize),
    /// The buffer ends before the declared frame does. Buffer more and retry.
    Truncated { needed: usize, available: usize },
    /// The payload length differs from the fixed size the frame type requires.
    LengthMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StreamIdOverflow(id) => write!(f, "stream id {id:#x} exceeds 31 bits"),
            Self::PayloadTooLarge(len) => write!(f, "payload of {len} bytes exceeds 24-bit length"),
            Self::Truncated { needed, available } => {
                write!(f, "truncated frame: need {needed} bytes, have {available}")
            }
            Self::LengthMismatch { expected, actual } => {
                write!(f, "payload is {actual} bytes, frame type requires {expected}")
            }
        }
    }
}

/// Errors produced by the HTTP/2 framing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H2Error {
    /// Malformed or length-mismatched frame.
    Frame(FrameError),
    /// Received a frame that violates the protocol.
    ProtocolError(String),
    /// HPACK header compression/decompression error.
    CompressionError,
    /// Flow control violation (a window would go negative or overflow).
    FlowControlError,
    /// Frame size exceeds the maximum allowed.
    FrameSizeError,
    /// Connection-level error with an error code.
    ConnectionError(ErrorCode),
    /// Stream-level error with an error code.
    StreamError(u32, ErrorCode),
}

impl H2Error {
    /// True when the error only means "not enough bytes yet".
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Frame(FrameError::Truncated { .. }))
    }
}

impl From<FrameError> for H2Error {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

impl std::fmt::Display for H2Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "frame error: {e}"),
            Self::ProtocolError(s) => write!(f, "protocol error: {s}"),
            Self::CompressionError => write!(f, "HPACK compression error"),
            Self::FlowControlError => write!(f, "flow control error"),
            Self::FrameSizeError => write!(f, "frame size error"),
            Self::ConnectionError(code) => write!(f, "connection error: {code:?}"),
            Self::StreamError(id, code) => write!(f, "stream {id} error: {code:?}"),
        }
    }
}

impl std::error::Error for H2Error {}
