//! Blocking client.
//!
//! A thin adapter that drives the async [`HttpClient`] on a private
//! current-thread runtime. Must not be used from inside an async context.

use std::time::Duration;

use serde::Serialize;
use tokio::runtime::{Builder, Runtime};

use crate::body::Body;
use crate::client::HttpClient;
use crate::config::ClientConfig;
use crate::error::HttpError;
use crate::request::{self, Method, Request};
use crate::response::Response;
use crate::transport::Connector;

/// Blocking counterpart of [`HttpClient`].
pub struct Client {
    inner: HttpClient,
    runtime: Runtime,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, HttpError> {
        Self::from_async(HttpClient::new(config))
    }

    pub fn with_connector(
        config: ClientConfig,
        connector: impl Connector + 'static,
    ) -> Result<Self, HttpError> {
        Self::from_async(HttpClient::with_connector(config, connector))
    }

    fn from_async(inner: HttpClient) -> Result<Self, HttpError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| HttpError::Runtime(e.to_string()))?;
        Ok(Self { inner, runtime })
    }

    pub fn config(&self) -> &ClientConfig {
        self.inner.config()
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder<'_> {
        RequestBuilder {
            client: self,
            inner: self.inner.request(method, url),
        }
    }

    pub fn get(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Get, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Post, url)
    }

    pub fn put(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Put, url)
    }

    pub fn patch(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Patch, url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Delete, url)
    }

    pub fn head(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Head, url)
    }

    pub fn options(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Options, url)
    }

    pub fn execute(&self, request: Request) -> Result<Response, HttpError> {
        self.runtime.block_on(self.inner.execute(request))
    }
}

/// Blocking request builder; see [`request::RequestBuilder`].
#[must_use = "a request does nothing until sent"]
pub struct RequestBuilder<'a> {
    client: &'a Client,
    inner: request::RequestBuilder<'a>,
}

impl<'a> RequestBuilder<'a> {
    fn map(self, f: impl FnOnce(request::RequestBuilder<'a>) -> request::RequestBuilder<'a>) -> Self {
        Self {
            client: self.client,
            inner: f(self.inner),
        }
    }

    pub fn header(self, name: &str, value: &str) -> Self {
        self.map(|b| b.header(name, value))
    }

    pub fn query(self, name: &str, value: &str) -> Self {
        self.map(|b| b.query(name, value))
    }

    pub fn body(self, body: impl Into<Body>) -> Self {
        self.map(|b| b.body(body))
    }

    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Self {
        self.map(|b| b.json(value))
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.map(|b| b.timeout(timeout))
    }

    pub fn build(self) -> Result<Request, HttpError> {
        self.inner.build()
    }

    /// Send the request, blocking until the response is complete.
    pub fn send(self) -> Result<Response, HttpError> {
        let request = self.inner.build()?;
        self.client.execute(request)
    }
}
