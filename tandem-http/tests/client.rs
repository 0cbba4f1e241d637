//! End-to-end requests through `HttpClient` against scripted in-process
//! servers. The connector hands the client one half of a duplex pipe and
//! runs a script on the other half, reporting whatever ALPN protocol the
//! test asks for.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serial_test::serial;
use tandem_h2::frame::RawFrame;
use tandem_h2::hpack::{Decoder, Encoder};
use tandem_h2::{CONNECTION_PREFACE, ErrorCode, Frame, HeaderField, HeaderList, Settings};
use tandem_http::metrics::{REQUESTS_H1, REQUESTS_H2, RETRIES};
use tandem_http::transport::{ALPN_H2, ConnectFuture};
use tandem_http::{
    BoxTransport, ClientConfig, Connector, HttpClient, HttpError, Negotiated, RetryPolicy, Target,
    blocking,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

// ── Scripted connector ───────────────────────────────────────────

type Script = Arc<dyn Fn(usize, DuplexStream) + Send + Sync>;

struct ScriptedConnector {
    alpn: Option<&'static [u8]>,
    connects: Arc<AtomicUsize>,
    script: Script,
}

impl ScriptedConnector {
    /// `script` runs once per connection with the 0-based connection number
    /// and the server half of the pipe.
    fn new(
        alpn: Option<&'static [u8]>,
        script: impl Fn(usize, DuplexStream) + Send + Sync + 'static,
    ) -> (Self, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = Self {
            alpn,
            connects: connects.clone(),
            script: Arc::new(script),
        };
        (connector, connects)
    }
}

impl Connector for ScriptedConnector {
    fn connect<'a>(&'a self, _target: &'a Target) -> ConnectFuture<'a> {
        Box::pin(async move {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(1 << 20);
            (self.script)(n, server);
            Ok(Box::new(Negotiated::new(client, self.alpn)) as BoxTransport)
        })
    }
}

// ── HTTP/1.1 server side ─────────────────────────────────────────

/// Read one request: head plus a Content-Length body.
async fn read_h1_request(io: &mut DuplexStream) -> String {
    let mut buf = Vec::new();
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length: "))
                .map_or(0, |v| v.trim().parse::<usize>().unwrap());
            if buf.len() >= end + 4 + len {
                return String::from_utf8(buf).unwrap();
            }
        }
        let mut chunk = [0u8; 4096];
        let n = io.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before finishing the request");
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn h1_replying(response: &'static str) -> impl Fn(usize, DuplexStream) + Send + Sync + 'static {
    move |_, mut io| {
        tokio::spawn(async move {
            read_h1_request(&mut io).await;
            io.write_all(response.as_bytes()).await.unwrap();
        });
    }
}

// ── HTTP/2 server side ───────────────────────────────────────────

struct H2Peer {
    io: DuplexStream,
    buf: BytesMut,
    encoder: Encoder,
    decoder: Decoder,
    pending: HashMap<u32, (HeaderList, BytesMut)>,
}

impl H2Peer {
    /// Check the client preface and answer with our own SETTINGS.
    async fn accept(io: DuplexStream) -> Self {
        let mut peer = Self {
            io,
            buf: BytesMut::new(),
            encoder: Encoder::default(),
            decoder: Decoder::default(),
            pending: HashMap::new(),
        };
        while peer.buf.len() < CONNECTION_PREFACE.len() {
            peer.io.read_buf(&mut peer.buf).await.unwrap();
        }
        assert_eq!(&peer.buf[..CONNECTION_PREFACE.len()], CONNECTION_PREFACE);
        let _ = peer.buf.split_to(CONNECTION_PREFACE.len());
        match peer.read_frame().await {
            Some(Frame::Settings {
                ack: false,
                settings,
            }) => assert!(!settings.enable_push),
            other => panic!("expected client SETTINGS, got {other:?}"),
        }
        peer.send(Frame::Settings {
            ack: false,
            settings: Settings::client_default(),
        })
        .await;
        peer
    }

    async fn read_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(raw) = RawFrame::decode(&mut self.buf, 1 << 20).unwrap() {
                return Some(Frame::parse(raw, 1 << 20).unwrap());
            }
            if self.io.read_buf(&mut self.buf).await.ok()? == 0 {
                return None;
            }
        }
    }

    async fn send(&mut self, frame: Frame) {
        let mut out = BytesMut::new();
        frame.encode(&mut out).unwrap();
        self.io.write_all(&out).await.unwrap();
    }

    /// Next complete request: stream id, decoded headers, body.
    async fn next_request(&mut self) -> Option<(u32, HeaderList, Bytes)> {
        loop {
            match self.read_frame().await? {
                Frame::Headers {
                    stream_id,
                    block,
                    end_stream,
                    ..
                } => {
                    let headers = self.decoder.decode(&block).unwrap();
                    if end_stream {
                        return Some((stream_id, headers, Bytes::new()));
                    }
                    self.pending.insert(stream_id, (headers, BytesMut::new()));
                }
                Frame::Data {
                    stream_id,
                    payload,
                    end_stream,
                } => {
                    let entry = self.pending.get_mut(&stream_id).unwrap();
                    entry.1.extend_from_slice(&payload);
                    if end_stream {
                        let (headers, body) = self.pending.remove(&stream_id).unwrap();
                        return Some((stream_id, headers, body.freeze()));
                    }
                }
                _ => {}
            }
        }
    }

    async fn respond(&mut self, stream_id: u32, status: &'static str, body: &[u8]) {
        let mut block = BytesMut::new();
        self.encoder.encode(
            &[
                HeaderField::new(":status", status),
                HeaderField::new("content-type", "text/plain"),
            ],
            &mut block,
        );
        self.send(Frame::Headers {
            stream_id,
            block: block.freeze(),
            end_stream: body.is_empty(),
            end_headers: true,
            priority: None,
        })
        .await;
        if !body.is_empty() {
            self.send(Frame::Data {
                stream_id,
                payload: Bytes::copy_from_slice(body),
                end_stream: true,
            })
            .await;
        }
    }
}

fn header<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|f| f.name == name.as_bytes())
        .map(|f| &f.value[..])
}

/// Echo every request body back with status 200.
fn h2_echo(_: usize, io: DuplexStream) {
    tokio::spawn(async move {
        let mut peer = H2Peer::accept(io).await;
        while let Some((id, _, body)) = peer.next_request().await {
            peer.respond(id, "200", &body).await;
        }
    });
}

/// Honors `RUST_LOG`; quiet by default.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Tests ────────────────────────────────────────────────────────

#[tokio::test]
#[serial]
async fn h2_alpn_routes_through_multiplexer() {
    init_logging();
    let (connector, connects) = ScriptedConnector::new(Some(ALPN_H2), h2_echo);
    let client = HttpClient::with_connector(
        ClientConfig::default().with_base_url("https://api.test/v1"),
        connector,
    );
    let h1_before = REQUESTS_H1.value();
    let h2_before = REQUESTS_H2.value();

    let resp = client.post("/echo").body("over h2").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.header("content-type"), Some("text/plain"));
    assert_eq!(&resp.body()[..], b"over h2");

    let resp = client.get("/echo").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.body().is_empty());

    assert_eq!(connects.load(Ordering::SeqCst), 1, "session not reused");
    assert_eq!(REQUESTS_H2.value() - h2_before, 2);
    assert_eq!(REQUESTS_H1.value(), h1_before);
}

#[tokio::test]
#[serial]
async fn h2_request_headers_on_the_wire() {
    init_logging();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (connector, _) = ScriptedConnector::new(Some(ALPN_H2), move |_, io| {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut peer = H2Peer::accept(io).await;
            let (id, headers, body) = peer.next_request().await.unwrap();
            tx.send((headers, body)).unwrap();
            peer.respond(id, "201", b"").await;
        });
    });
    let client = HttpClient::with_connector(ClientConfig::default(), connector);
    let resp = client
        .put("https://api.test:8443/items/7")
        .query("v", "a b")
        .header("Connection", "keep-alive")
        .json(&serde_json::json!({"name": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let (headers, body) = rx.recv().await.unwrap();
    assert_eq!(header(&headers, ":method"), Some(&b"PUT"[..]));
    assert_eq!(header(&headers, ":scheme"), Some(&b"https"[..]));
    assert_eq!(header(&headers, ":authority"), Some(&b"api.test:8443"[..]));
    assert_eq!(header(&headers, ":path"), Some(&b"/items/7?v=a%20b"[..]));
    assert_eq!(
        header(&headers, "content-type"),
        Some(&b"application/json"[..])
    );
    assert_eq!(header(&headers, "content-length"), Some(&b"12"[..]));
    assert_eq!(header(&headers, "connection"), None);
    assert_eq!(&body[..], b"{\"name\":\"x\"}");
}

#[tokio::test]
#[serial]
async fn h2_concurrent_requests_share_one_connection() {
    init_logging();
    let (connector, connects) = ScriptedConnector::new(Some(ALPN_H2), |_, io| {
        tokio::spawn(async move {
            let mut peer = H2Peer::accept(io).await;
            // Hold the first request until the second arrives, then answer
            // in reverse order.
            let (a, _, body_a) = peer.next_request().await.unwrap();
            let (b, _, body_b) = peer.next_request().await.unwrap();
            peer.respond(b, "200", &body_b).await;
            peer.respond(a, "200", &body_a).await;
            while peer.read_frame().await.is_some() {}
        });
    });
    let client = HttpClient::with_connector(
        ClientConfig::default().with_base_url("https://api.test"),
        connector,
    );

    // Open the session first so both requests land on it.
    let first = client.post("/a").body("first");
    let first = tokio::spawn({
        let client = client.clone();
        let request = first.build().unwrap();
        async move { client.execute(request).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = client.post("/b").body("second").send().await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(&first.body()[..], b"first");
    assert_eq!(&second.body()[..], b"second");
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[serial]
async fn h2_reset_stream_is_protocol_error() {
    init_logging();
    let (connector, connects) = ScriptedConnector::new(Some(ALPN_H2), |_, io| {
        tokio::spawn(async move {
            let mut peer = H2Peer::accept(io).await;
            while let Some((id, _, _)) = peer.next_request().await {
                peer.send(Frame::RstStream {
                    stream_id: id,
                    error_code: ErrorCode::RefusedStream,
                })
                .await;
            }
        });
    });
    let client = HttpClient::with_connector(ClientConfig::default(), connector);
    let err = client.get("https://api.test/").send().await.unwrap_err();
    assert!(matches!(err, HttpError::Protocol(ref m) if m.contains("reset")), "{err}");
    assert_eq!(connects.load(Ordering::SeqCst), 1, "errors must not be retried");
}

#[tokio::test]
#[serial]
async fn h2_response_before_goaway_and_close_is_kept() {
    init_logging();
    // Each connection answers one request, says GOAWAY and hangs up.
    let (connector, connects) = ScriptedConnector::new(Some(ALPN_H2), |_, io| {
        tokio::spawn(async move {
            let mut peer = H2Peer::accept(io).await;
            let (id, _, _) = peer.next_request().await.unwrap();
            peer.respond(id, "200", b"hello").await;
            peer.send(Frame::GoAway {
                last_stream_id: id,
                error_code: ErrorCode::NoError,
                debug_data: Bytes::new(),
            })
            .await;
        });
    });
    let client = HttpClient::with_connector(
        ClientConfig::default().with_base_url("https://api.test/"),
        connector,
    );

    for round in 1..=3 {
        let resp = client.get("greeting").send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().unwrap(), "hello");
        // Let the receive task see the GOAWAY and the close.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connects.load(Ordering::SeqCst), round);
    }
}

#[tokio::test]
#[serial]
async fn no_alpn_routes_through_http1() {
    init_logging();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (connector, _) = ScriptedConnector::new(None, move |_, mut io| {
        let tx = tx.clone();
        tokio::spawn(async move {
            let request = read_h1_request(&mut io).await;
            tx.send(request).unwrap();
            io.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
        });
    });
    let client = HttpClient::with_connector(
        ClientConfig::default().with_base_url("http://svc.local:8080/v1/"),
        connector,
    );
    let h1_before = REQUESTS_H1.value();
    let h2_before = REQUESTS_H2.value();

    let resp = client
        .post("search")
        .query("q", "a b")
        .json(&serde_json::json!({"k": "v"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().unwrap(), "ok");

    let request = rx.recv().await.unwrap();
    assert!(!request.as_bytes().starts_with(CONNECTION_PREFACE));
    assert!(
        request.starts_with("POST /v1/search?q=a%20b HTTP/1.1\r\nhost: svc.local:8080\r\n"),
        "{request}"
    );
    assert!(request.contains("\r\nconnection: close\r\n"));
    assert!(request.contains("\r\ncontent-type: application/json\r\n"));
    assert!(request.contains("\r\nuser-agent: tandem/"));
    assert!(request.ends_with("\r\n\r\n{\"k\":\"v\"}"));
    assert_eq!(REQUESTS_H1.value() - h1_before, 1);
    assert_eq!(REQUESTS_H2.value(), h2_before);
}

#[tokio::test]
#[serial]
async fn too_many_requests_retried_exactly_once() {
    init_logging();
    let (connector, connects) = ScriptedConnector::new(
        None,
        h1_replying("HTTP/1.1 429 Too Many Requests\r\ncontent-length: 4\r\n\r\nslow"),
    );
    let client = HttpClient::with_connector(ClientConfig::default(), connector);
    let retries_before = RETRIES.value();

    let resp = client.get("http://api.test/").send().await.unwrap();
    assert_eq!(resp.status(), 429);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(RETRIES.value() - retries_before, 1);
}

#[tokio::test]
#[serial]
async fn overloaded_then_ok() {
    init_logging();
    let (connector, connects) = ScriptedConnector::new(None, |n, mut io| {
        tokio::spawn(async move {
            read_h1_request(&mut io).await;
            let reply: &[u8] = if n == 0 {
                b"HTTP/1.1 529 Site Overloaded\r\ncontent-length: 0\r\n\r\n"
            } else {
                b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\ndone"
            };
            io.write_all(reply).await.unwrap();
        });
    });
    let client = HttpClient::with_connector(ClientConfig::default(), connector);
    let resp = client.delete("http://api.test/x").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[serial]
async fn retry_policy_can_be_disabled() {
    init_logging();
    let (connector, connects) = ScriptedConnector::new(
        None,
        h1_replying("HTTP/1.1 429 Too Many Requests\r\ncontent-length: 0\r\n\r\n"),
    );
    let client = HttpClient::with_connector(
        ClientConfig::default().with_retry(RetryPolicy::none()),
        connector,
    );
    let resp = client.get("http://api.test/").send().await.unwrap();
    assert_eq!(resp.status(), 429);
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[serial]
async fn silent_server_times_out() {
    init_logging();
    let (connector, _) = ScriptedConnector::new(None, |_, mut io| {
        tokio::spawn(async move {
            read_h1_request(&mut io).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(io);
        });
    });
    let client = HttpClient::with_connector(ClientConfig::default(), connector);
    let result = client
        .get("http://api.test/")
        .timeout(Duration::from_millis(50))
        .send()
        .await;
    assert!(matches!(result, Err(HttpError::Timeout)));
}

#[tokio::test]
#[serial]
async fn https_needs_a_tls_connector() {
    init_logging();
    let client = HttpClient::new(ClientConfig::default());
    assert!(matches!(
        client.get("https://api.test/").send().await,
        Err(HttpError::InvalidUrl(_))
    ));
    assert!(matches!(
        client.get("/relative").send().await,
        Err(HttpError::InvalidUrl(_))
    ));
}

#[test]
#[serial]
fn blocking_client_over_both_protocols() {
    init_logging();
    let (connector, _) = ScriptedConnector::new(
        None,
        h1_replying("HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n"),
    );
    let client = blocking::Client::with_connector(ClientConfig::default(), connector).unwrap();
    let resp = client.get("http://api.test/").send().unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(&resp.body()[..], b"abc");

    let (connector, connects) = ScriptedConnector::new(Some(ALPN_H2), h2_echo);
    let client = blocking::Client::with_connector(ClientConfig::default(), connector).unwrap();
    for body in ["one", "two"] {
        let resp = client.post("https://api.test/echo").body(body).send().unwrap();
        assert_eq!(resp.text().unwrap(), body);
    }
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}
