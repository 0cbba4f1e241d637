//! Request builder for ergonomic HTTP request construction.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::body::Body;
use crate::client::HttpClient;
use crate::error::HttpError;
use crate::response::Response;
use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }

    /// Whether an empty body is still announced with `content-length: 0`.
    pub(crate) fn expects_body(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request as the caller describes it. `url` may be relative to the
/// client's base URL.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Body,
    /// Overrides the client timeout for this request.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: Body::Empty,
            timeout: None,
        }
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

/// What goes on the wire ahead of the body: method, resolved target and the
/// final header list.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: Target,
    pub headers: Vec<(String, String)>,
}

/// Builder for an HTTP request.
#[must_use = "a request does nothing until sent"]
pub struct RequestBuilder<'a> {
    client: &'a HttpClient,
    request: Result<Request, HttpError>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a HttpClient, method: Method, url: &str) -> Self {
        Self {
            client,
            request: Ok(Request::new(method, url)),
        }
    }

    fn map(mut self, f: impl FnOnce(&mut Request)) -> Self {
        if let Ok(request) = &mut self.request {
            f(request);
        }
        self
    }

    /// Add a header to the request.
    pub fn header(self, name: &str, value: &str) -> Self {
        self.map(|r| r.headers.push((name.to_string(), value.to_string())))
    }

    /// Add a query parameter. Names and values are percent-encoded.
    pub fn query(self, name: &str, value: &str) -> Self {
        self.map(|r| r.query.push((name.to_string(), value.to_string())))
    }

    /// Set the request body.
    pub fn body(self, body: impl Into<Body>) -> Self {
        let body = body.into();
        self.map(|r| r.body = body)
    }

    /// Serialize `value` as the JSON body and set
    /// `content-type: application/json` unless a content type is already set.
    /// A serialization failure is reported by `send`.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(json) => {
                self = self.map(|r| {
                    if !r.has_header("content-type") {
                        r.headers
                            .push(("content-type".into(), "application/json".into()));
                    }
                    r.body = Body::from(json);
                });
            }
            Err(e) => {
                if self.request.is_ok() {
                    self.request = Err(e.into());
                }
            }
        }
        self
    }

    /// Per-request timeout, replacing the client default.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.map(|r| r.timeout = Some(timeout))
    }

    pub fn build(self) -> Result<Request, HttpError> {
        self.request
    }

    /// Send the request and return the response.
    pub async fn send(self) -> Result<Response, HttpError> {
        self.client.execute(self.request?).await
    }
}
