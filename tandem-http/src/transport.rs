//! Byte streams the client speaks HTTP over, and the connectors that open
//! them.
//!
//! TLS is not handled here. A TLS connector wraps its stream in
//! [`Negotiated`] (or implements [`Transport`] directly) to report the ALPN
//! protocol its handshake settled on, and the client picks HTTP/2 or
//! HTTP/1.1 from that.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::HttpError;
use crate::target::{Scheme, Target};

/// ALPN id for HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN id for HTTP/1.1.
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// A connected, bidirectional byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Protocol selected by ALPN, if the handshake negotiated one.
    fn alpn_protocol(&self) -> Option<&[u8]> {
        None
    }
}

impl Transport for TcpStream {}

impl Transport for DuplexStream {}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn alpn_protocol(&self) -> Option<&[u8]> {
        (**self).alpn_protocol()
    }
}

/// Attaches a negotiated ALPN protocol to a stream that does not carry one.
pub struct Negotiated<T> {
    io: T,
    alpn: Option<Vec<u8>>,
}

impl<T> Negotiated<T> {
    pub fn new(io: T, alpn: Option<&[u8]>) -> Self {
        Self {
            io,
            alpn: alpn.map(<[u8]>::to_vec),
        }
    }

    /// A stream that negotiated `h2`.
    pub fn h2(io: T) -> Self {
        Self::new(io, Some(ALPN_H2))
    }

    /// A stream that negotiated `http/1.1`.
    pub fn http1(io: T) -> Self {
        Self::new(io, Some(ALPN_HTTP1))
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Negotiated<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Negotiated<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl<T> Transport for Negotiated<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }
}

pub type BoxTransport = Box<dyn Transport>;

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxTransport, HttpError>> + Send + 'a>>;

/// Opens a transport to a request target. One call per connection.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, target: &'a Target) -> ConnectFuture<'a>;
}

/// Plain TCP. `https` targets need a TLS connector and are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, target: &'a Target) -> ConnectFuture<'a> {
        Box::pin(async move {
            if target.scheme == Scheme::Https {
                return Err(HttpError::InvalidUrl(
                    "https requires a TLS connector".into(),
                ));
            }
            let host = target.host.trim_start_matches('[').trim_end_matches(']');
            let stream = TcpStream::connect((host, target.port)).await?;
            stream.set_nodelay(true)?;
            debug!(host = %target.host, port = target.port, "connected");
            Ok(Box::new(stream) as BoxTransport)
        })
    }
}
