//! Sans-IO HTTP/2 building blocks.
//!
//! Everything here is pure computation over byte buffers: the frame codec,
//! HPACK with its Huffman coder, the SETTINGS payload, and flow control
//! window arithmetic. The async multiplexer in `tandem-http` drives these
//! pieces over a socket.
//!
//! ```text
//!   socket bytes
//!        |
//!   +----v-----------+
//!   | RawFrame       |  9-byte header + payload (pack / unpack)
//!   | Frame          |  typed view, per-type validation
//!   +----+-----------+
//!        | header blocks
//!   +----v-----------+
//!   | hpack          |  Encoder / Decoder, one pair per connection
//!   +----------------+
//! ```
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use tandem_h2::frame::{FrameKind, RawFrame};
//! use tandem_h2::hpack::{Decoder, Encoder};
//! use tandem_h2::HeaderField;
//!
//! let mut encoder = Encoder::default();
//! let mut block = BytesMut::new();
//! encoder.encode(&[HeaderField::new(":method", "GET")], &mut block);
//!
//! let frame = RawFrame::new(FrameKind::Headers, 0x5, 1, block.freeze());
//! let wire = frame.pack()?;
//! let (decoded, rest) = RawFrame::unpack(&wire)?;
//! assert!(rest.is_empty());
//!
//! let headers = Decoder::default().decode(&decoded.payload)?;
//! assert_eq!(headers[0].value, "GET");
//! # Ok::<(), tandem_h2::H2Error>(())
//! ```

pub mod error;
pub mod flowcontrol;
pub mod frame;
pub mod hpack;
pub mod huffman;
pub mod settings;

pub use error::{ErrorCode, FrameError, H2Error};
pub use flowcontrol::Window;
pub use frame::{Frame, FrameKind, RawFrame};
pub use hpack::{HeaderField, HeaderList};
pub use settings::Settings;

/// Client connection preface (RFC 7540 Section 3.5).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
