//! HTTP/1.1 exchange.
//!
//! One request per connection: the request is written in full, then the
//! response is read until its framing says it is complete (Content-Length,
//! chunked, or connection close).

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::HttpError;
use crate::request::{Method, RequestHead};
use crate::response::Response;

/// Serialize the request line, headers and body.
pub(crate) fn encode_request(head: &RequestHead, body: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(head.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(head.target.path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    out.extend_from_slice(b"host: ");
    out.extend_from_slice(head.target.authority().as_bytes());
    out.extend_from_slice(b"\r\n");
    // The connection carries this one request only.
    out.extend_from_slice(b"connection: close\r\n");

    for (name, value) in &head.headers {
        if ["host", "content-length", "connection"]
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if !body.is_empty() || head.method.expects_body() {
        out.extend_from_slice(b"content-length: ");
        out.extend_from_slice(body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
}

/// Write one request to `io` and read its response.
pub(crate) async fn send_request<T>(
    io: &mut T,
    head: &RequestHead,
    body: &[u8],
) -> Result<Response, HttpError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut req = Vec::with_capacity(256 + body.len());
    encode_request(head, body, &mut req);
    io.write_all(&req).await?;
    io.flush().await?;

    let mut buf = BytesMut::with_capacity(8 * 1024);
    let parsed = loop {
        if let Some(end) = find_header_end(&buf) {
            let parsed = parse_response_headers(&buf[..end]).ok_or(HttpError::Parse)?;
            buf.advance(end + 4);
            // Interim responses carry no body; the final one follows.
            if (100..200).contains(&parsed.status) {
                trace!(status = parsed.status, "skipping interim response");
                continue;
            }
            break parsed;
        }
        fill(io, &mut buf).await?;
    };

    let body = if !has_body(head.method, parsed.status) {
        Bytes::new()
    } else if parsed.chunked {
        read_chunked(io, buf).await?
    } else if let Some(len) = parsed.content_length {
        while buf.len() < len {
            fill(io, &mut buf).await?;
        }
        buf.truncate(len);
        buf.freeze()
    } else {
        while io.read_buf(&mut buf).await? > 0 {}
        buf.freeze()
    };

    Ok(Response::new(parsed.status, parsed.headers, body))
}

async fn fill<T: AsyncRead + Unpin>(io: &mut T, buf: &mut BytesMut) -> Result<(), HttpError> {
    buf.reserve(8 * 1024);
    if io.read_buf(buf).await? == 0 {
        return Err(HttpError::ConnectionClosed);
    }
    Ok(())
}

/// HEAD responses and 204/304 never carry a body, whatever the headers say.
fn has_body(method: Method, status: u16) -> bool {
    method != Method::Head && status != 204 && status != 304
}

async fn read_chunked<T: AsyncRead + Unpin>(
    io: &mut T,
    mut buf: BytesMut,
) -> Result<Bytes, HttpError> {
    let mut decoded = BytesMut::new();
    loop {
        match decode_chunk(&buf)? {
            ChunkResult::Complete {
                data,
                consumed,
                is_last,
            } => {
                decoded.extend_from_slice(data);
                buf.advance(consumed);
                if is_last {
                    return Ok(decoded.freeze());
                }
            }
            ChunkResult::NeedMore => fill(io, &mut buf).await?,
        }
    }
}

/// Find the position of `\r\n\r\n` in data, returns index of the first `\r`.
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug)]
struct ParsedHeaders {
    status: u16,
    headers: Vec<(String, String)>,
    content_length: Option<usize>,
    chunked: bool,
}

/// Parse HTTP/1.1 response headers (everything before `\r\n\r\n`).
fn parse_response_headers(data: &[u8]) -> Option<ParsedHeaders> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");

    // Status line: HTTP/1.1 200 OK
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    let status: u16 = parts.next()?.parse().ok()?;

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;

    for line in lines {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            content_length = Some(value.parse().ok()?);
        }
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
        {
            chunked = true;
        }
        headers.push((name.to_string(), value.to_string()));
    }

    Some(ParsedHeaders {
        status,
        headers,
        content_length,
        chunked,
    })
}

#[derive(Debug, PartialEq, Eq)]
enum ChunkResult<'a> {
    Complete {
        data: &'a [u8],
        consumed: usize,
        is_last: bool,
    },
    NeedMore,
}

/// Decode one chunk from chunked transfer encoding. The last chunk is only
/// complete once its trailer section has arrived.
fn decode_chunk(data: &[u8]) -> Result<ChunkResult<'_>, HttpError> {
    let Some(crlf) = find_crlf(data) else {
        return Ok(ChunkResult::NeedMore);
    };

    let size_line = std::str::from_utf8(&data[..crlf]).map_err(|_| HttpError::Parse)?;
    // Strip chunk extensions (;key=value).
    let size_hex = size_line.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_hex, 16).map_err(|_| HttpError::Parse)?;
    let chunk_start = crlf + 2;

    if size == 0 {
        // Trailer fields, then an empty line.
        let trailers = &data[chunk_start..];
        let end = if trailers.starts_with(b"\r\n") {
            Some(2)
        } else {
            find_header_end(trailers).map(|i| i + 4)
        };
        return Ok(match end {
            Some(end) => ChunkResult::Complete {
                data: &[],
                consumed: chunk_start + end,
                is_last: true,
            },
            None => ChunkResult::NeedMore,
        });
    }

    let chunk_end = chunk_start.checked_add(size).ok_or(HttpError::Parse)?;
    let total = chunk_end + 2;
    if data.len() < total {
        return Ok(ChunkResult::NeedMore);
    }
    if &data[chunk_end..total] != b"\r\n" {
        return Err(HttpError::Parse);
    }

    Ok(ChunkResult::Complete {
        data: &data[chunk_start..chunk_end],
        consumed: total,
        is_last: false,
    })
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;

    fn head(method: Method, url: &str, headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method,
            target: Target::parse(url).unwrap(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn encode_with_body() {
        let mut out = Vec::new();
        encode_request(
            &head(
                Method::Post,
                "http://example.com:8080/v1/x?a=1",
                &[
                    ("content-type", "text/plain"),
                    ("Host", "ignored"),
                    ("Connection", "keep-alive"),
                ],
            ),
            b"hello",
            &mut out,
        );
        assert_eq!(
            out,
            b"POST /v1/x?a=1 HTTP/1.1\r\nhost: example.com:8080\r\nconnection: close\r\n\
              content-type: text/plain\r\ncontent-length: 5\r\n\r\nhello"
        );
    }

    #[test]
    fn encode_get_without_length() {
        let mut out = Vec::new();
        encode_request(&head(Method::Get, "http://example.com/", &[]), b"", &mut out);
        assert_eq!(
            out,
            b"GET / HTTP/1.1\r\nhost: example.com\r\nconnection: close\r\n\r\n"
        );

        out.clear();
        encode_request(&head(Method::Post, "http://example.com/", &[]), b"", &mut out);
        assert!(out.ends_with(b"content-length: 0\r\n\r\n"));
    }

    #[test]
    fn parse_simple_response() {
        let data = b"HTTP/1.1 200 OK\r\ncontent-length: 5";
        let parsed = parse_response_headers(data).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.content_length, Some(5));
        assert!(!parsed.chunked);
        assert_eq!(parsed.headers.len(), 1);
    }

    #[test]
    fn parse_chunked_response() {
        let data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked";
        let parsed = parse_response_headers(data).unwrap();
        assert!(parsed.chunked);
        assert_eq!(parsed.content_length, None);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_response_headers(b"SSH-2.0-OpenSSH").is_none());
        assert!(parse_response_headers(b"HTTP/1.1 abc OK").is_none());
        assert!(parse_response_headers(b"HTTP/1.1 200 OK\r\nno colon here").is_none());
    }

    #[test]
    fn find_header_end_found() {
        let data = b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\nbody";
        assert_eq!(find_header_end(data), Some(34));
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn decode_chunk_simple() {
        assert_eq!(
            decode_chunk(b"5\r\nhello\r\n").unwrap(),
            ChunkResult::Complete {
                data: b"hello",
                consumed: 10,
                is_last: false
            }
        );
        assert_eq!(
            decode_chunk(b"5;ext=1\r\nhel").unwrap(),
            ChunkResult::NeedMore
        );
    }

    #[test]
    fn decode_last_chunk_waits_for_trailers() {
        assert_eq!(decode_chunk(b"0\r\n").unwrap(), ChunkResult::NeedMore);
        assert_eq!(
            decode_chunk(b"0\r\n\r\n").unwrap(),
            ChunkResult::Complete {
                data: b"",
                consumed: 5,
                is_last: true
            }
        );
        assert_eq!(
            decode_chunk(b"0\r\nx-checksum: 1\r\n\r\n").unwrap(),
            ChunkResult::Complete {
                data: b"",
                consumed: 20,
                is_last: true
            }
        );
    }

    #[test]
    fn decode_chunk_rejects_bad_size() {
        assert!(matches!(decode_chunk(b"zz\r\n"), Err(HttpError::Parse)));
        assert!(matches!(
            decode_chunk(b"2\r\nabc\r\n"),
            Err(HttpError::Parse)
        ));
    }

    async fn exchange(method: Method, response: &'static [u8]) -> Result<Response, HttpError> {
        let (mut client, mut server) = tokio::io::duplex(1 << 16);
        let peer = tokio::spawn(async move {
            let mut req = BytesMut::new();
            while find_header_end(&req).is_none() {
                server.read_buf(&mut req).await.unwrap();
            }
            server.write_all(response).await.unwrap();
        });
        let result = send_request(&mut client, &head(method, "http://example.com/", &[]), b"").await;
        peer.await.unwrap();
        result
    }

    #[tokio::test]
    async fn content_length_body() {
        let resp = exchange(
            Method::Get,
            b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhelloEXTRA",
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(&resp.body()[..], b"hello");
    }

    #[tokio::test]
    async fn chunked_body_with_interim_response() {
        let resp = exchange(
            Method::Get,
            b"HTTP/1.1 100 Continue\r\n\r\n\
              HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(&resp.body()[..], b"hello world");
    }

    #[tokio::test]
    async fn body_until_close() {
        let resp = exchange(Method::Get, b"HTTP/1.1 200 OK\r\n\r\nstreamed")
            .await
            .unwrap();
        assert_eq!(&resp.body()[..], b"streamed");
    }

    #[tokio::test]
    async fn head_and_no_content_have_no_body() {
        let resp = exchange(
            Method::Head,
            b"HTTP/1.1 200 OK\r\ncontent-length: 1000\r\n\r\n",
        )
        .await
        .unwrap();
        assert!(resp.body().is_empty());
        assert_eq!(resp.header("content-length"), Some("1000"));

        let resp = exchange(Method::Delete, b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let result = exchange(
            Method::Get,
            b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nshort",
        )
        .await;
        assert!(matches!(result, Err(HttpError::ConnectionClosed)));
    }
}
