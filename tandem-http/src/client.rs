//! Top-level HTTP client with protocol dispatch.
//!
//! Every request attempt asks the [`Connector`] for a transport and routes on
//! the ALPN protocol it reports: `h2` starts an [`H2Session`], which is kept
//! and reused for later requests to the same origin; anything else is a
//! one-shot HTTP/1.1 exchange.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tandem_h2::{ErrorCode, HeaderField, HeaderList};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{ClientConfig, H2Config};
use crate::error::HttpError;
use crate::h1;
use crate::metrics::{REQUESTS_H1, REQUESTS_H2};
use crate::mux::{Multiplexer, StreamFrame};
use crate::request::{Method, Request, RequestBuilder, RequestHead};
use crate::response::Response;
use crate::target::Target;
use crate::transport::{ALPN_H2, Connector, TcpConnector, Transport};

/// Headers that are meaningful only on an HTTP/1.1 hop (RFC 7540 Section
/// 8.1.2.2).
const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// One HTTP/2 connection. Requests may be sent concurrently from several
/// tasks; each gets its own stream.
pub struct H2Session {
    mux: Multiplexer,
}

impl H2Session {
    /// Send the connection preface over `io` and start the receive task.
    pub async fn handshake<T: Transport>(io: T, config: &H2Config) -> Result<Self, HttpError> {
        let mux = Multiplexer::new(io, config.clone());
        mux.handshake().await?;
        mux.start_receiving()?;
        Ok(Self { mux })
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Shut the connection down. In-flight requests fail with
    /// [`HttpError::ConnectionClosed`].
    pub fn close(&self) {
        self.mux.stop_receiving();
    }

    /// Run one request on a new stream and collect the full response.
    pub(crate) async fn send_request(
        &self,
        head: &RequestHead,
        body: Bytes,
        timeout: Duration,
    ) -> Result<Response, HttpError> {
        let id = self.mux.create_stream()?;
        self.send_on(id, head, body, timeout).await
    }

    /// Run one request on the already opened stream `id`.
    async fn send_on(
        &self,
        id: u32,
        head: &RequestHead,
        body: Bytes,
        timeout: Duration,
    ) -> Result<Response, HttpError> {
        REQUESTS_H2.increment();
        let result = match tokio::time::timeout(timeout, self.exchange(id, head, body, timeout)).await
        {
            Ok(result) => result,
            Err(_) => Err(HttpError::Timeout),
        };
        if result.is_err() && self.mux.stream_state(id).is_some() {
            let _ = self.mux.reset_stream(id, ErrorCode::Cancel).await;
        }
        result
    }

    async fn exchange(
        &self,
        id: u32,
        head: &RequestHead,
        body: Bytes,
        timeout: Duration,
    ) -> Result<Response, HttpError> {
        let fields = request_fields(head, body.len());
        self.mux.send_headers(id, &fields, body.is_empty()).await?;
        if !body.is_empty() {
            self.mux.send_data(id, body, true).await?;
        }

        let mut status = None;
        let mut headers = Vec::new();
        let mut data = BytesMut::new();
        loop {
            let frame = self.mux.get_response(id, timeout).await?;
            let end_stream = frame.is_end_stream();
            match frame {
                StreamFrame::Headers { headers: list, .. } => {
                    if status.is_none() {
                        let code = status_of(&list)?;
                        if (100..200).contains(&code) {
                            continue;
                        }
                        status = Some(code);
                    }
                    headers.extend(regular_fields(list));
                }
                StreamFrame::Data { data: chunk, .. } => {
                    if status.is_none() {
                        return Err(HttpError::Protocol(format!(
                            "stream {id}: DATA before response headers"
                        )));
                    }
                    data.extend_from_slice(&chunk);
                }
                StreamFrame::Reset(code) => {
                    return Err(HttpError::Protocol(format!("stream {id} reset: {code:?}")));
                }
            }
            if end_stream {
                break;
            }
        }
        let status = status
            .ok_or_else(|| HttpError::Protocol(format!("stream {id}: no response headers")))?;
        Ok(Response::new(status, headers, data.freeze()))
    }
}

/// Pseudo-headers first, then the caller's headers lowercased, minus the
/// ones HTTP/2 forbids.
fn request_fields(head: &RequestHead, body_len: usize) -> Vec<HeaderField> {
    let mut fields = vec![
        HeaderField::new(":method", head.method.as_str()),
        HeaderField::new(":scheme", head.target.scheme.as_str()),
        HeaderField::new(":authority", head.target.authority()),
        HeaderField::new(":path", head.target.path.clone()),
    ];
    for (name, value) in &head.headers {
        let name = name.to_ascii_lowercase();
        if CONNECTION_HEADERS.contains(&name.as_str()) {
            continue;
        }
        fields.push(HeaderField::new(name, value.clone()));
    }
    if body_len > 0 || head.method.expects_body() {
        fields.push(HeaderField::new("content-length", body_len.to_string()));
    }
    fields
}

fn status_of(list: &HeaderList) -> Result<u16, HttpError> {
    list.iter()
        .find(|f| &f.name[..] == b":status")
        .and_then(|f| std::str::from_utf8(&f.value).ok()?.parse().ok())
        .ok_or_else(|| HttpError::Protocol("response without a valid :status".into()))
}

fn regular_fields(list: HeaderList) -> impl Iterator<Item = (String, String)> {
    list.into_iter()
        .filter(|f| !f.name.starts_with(b":"))
        .map(|f| {
            (
                String::from_utf8_lossy(&f.name).into_owned(),
                String::from_utf8_lossy(&f.value).into_owned(),
            )
        })
}

struct ClientInner {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    /// Live HTTP/2 sessions by origin.
    sessions: Mutex<HashMap<String, Arc<H2Session>>>,
}

/// HTTP client speaking HTTP/2 or HTTP/1.1, whichever the connection
/// negotiates.
///
/// # Example
///
/// ```rust,ignore
/// let client = HttpClient::new(ClientConfig::default().with_base_url("http://localhost:8080"));
/// let resp = client.get("/api/data").header("authorization", "Bearer tok").send().await?;
/// assert_eq!(resp.status(), 200);
/// ```
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    /// A client that connects over plain TCP.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, TcpConnector)
    }

    /// A client that opens its transports through `connector`.
    pub fn with_connector(config: ClientConfig, connector: impl Connector + 'static) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                connector: Box::new(connector),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Build a request with an arbitrary method.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, url)
    }

    /// Build a GET request.
    pub fn get(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Get, url)
    }

    /// Build a POST request.
    pub fn post(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Post, url)
    }

    /// Build a PUT request.
    pub fn put(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Put, url)
    }

    /// Build a PATCH request.
    pub fn patch(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Patch, url)
    }

    /// Build a DELETE request.
    pub fn delete(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Delete, url)
    }

    /// Build a HEAD request.
    pub fn head(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Head, url)
    }

    /// Build an OPTIONS request.
    pub fn options(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Options, url)
    }

    /// Send `request`, re-issuing it while the retry policy asks for it.
    pub async fn execute(&self, request: Request) -> Result<Response, HttpError> {
        let config = &self.inner.config;
        let mut target = Target::resolve(config.base_url.as_deref(), &request.url)?;
        target.append_query(&request.query);
        let head = RequestHead {
            method: request.method,
            target,
            headers: self.merge_headers(&request),
        };
        let body = request.body.to_bytes();
        let timeout = request.timeout.unwrap_or(config.timeout);

        let head = &head;
        let response = config
            .retry
            .run(|attempt| {
                let body = body.clone();
                async move {
                    debug!(
                        method = %head.method,
                        host = %head.target.host,
                        path = %head.target.path,
                        attempt,
                        "sending request"
                    );
                    self.dispatch(head, body, timeout).await
                }
            })
            .await?;
        debug!(status = response.status(), "response received");
        Ok(response)
    }

    /// Client defaults, then the user agent unless the request sets one,
    /// then the request's own headers.
    fn merge_headers(&self, request: &Request) -> Vec<(String, String)> {
        let config = &self.inner.config;
        let mut headers = config.default_headers.clone();
        let has_agent = request
            .headers
            .iter()
            .chain(&config.default_headers)
            .any(|(k, _)| k.eq_ignore_ascii_case("user-agent"));
        if !has_agent {
            headers.push(("user-agent".into(), config.user_agent.clone()));
        }
        headers.extend(request.headers.iter().cloned());
        headers
    }

    /// One attempt: reuse a live HTTP/2 session for the origin, or connect
    /// and route on ALPN.
    async fn dispatch(
        &self,
        head: &RequestHead,
        body: Bytes,
        timeout: Duration,
    ) -> Result<Response, HttpError> {
        let origin = format!("{}://{}", head.target.scheme.as_str(), head.target.authority());
        if let Some(session) = self.session(&origin).await {
            match session.mux.create_stream() {
                Ok(id) => return session.send_on(id, head, body, timeout).await,
                // Closed or drained since it was cached; nothing was sent.
                Err(HttpError::ConnectionClosed) => {
                    debug!(origin = %origin, "cached session gone, reconnecting");
                }
                Err(e) => return Err(e),
            }
        }

        let config = &self.inner.config;
        let mut io = tokio::time::timeout(
            config.connect_timeout,
            self.inner.connector.connect(&head.target),
        )
        .await
        .map_err(|_| HttpError::Timeout)??;

        if io.alpn_protocol() == Some(ALPN_H2) {
            debug!(origin = %origin, "negotiated h2");
            let session = Arc::new(H2Session::handshake(io, &config.h2).await?);
            self.inner
                .sessions
                .lock()
                .await
                .insert(origin, session.clone());
            session.send_request(head, body, timeout).await
        } else {
            debug!(origin = %origin, "using http/1.1");
            REQUESTS_H1.increment();
            tokio::time::timeout(timeout, h1::send_request(&mut io, head, &body))
                .await
                .map_err(|_| HttpError::Timeout)?
        }
    }

    async fn session(&self, origin: &str) -> Option<Arc<H2Session>> {
        let mut sessions = self.inner.sessions.lock().await;
        match sessions.get(origin) {
            Some(session) if !session.is_closed() => Some(session.clone()),
            Some(_) => {
                sessions.remove(origin);
                None
            }
            None => None,
        }
    }

    /// Shut down every cached HTTP/2 session.
    pub async fn close(&self) {
        for (_, session) in self.inner.sessions.lock().await.drain() {
            session.close();
        }
    }
}
