//! HTTP/1.1 and HTTP/2 client on tokio.
//!
//! The connection's negotiated ALPN protocol decides the wire format:
//! `h2` goes through the stream [`Multiplexer`], anything else through a
//! plain HTTP/1.1 exchange. Framing and header compression come from the
//! sans-IO `tandem-h2` crate.
//!
//! # Architecture
//!
//! ```text
//!  HttpClient / blocking::Client
//!        |  RetryPolicy (429, 529)
//!        v
//!  Connector ──> Transport ──ALPN──┬── "h2" ──> H2Session ──> Multiplexer ──> FlowControl
//!                                 │                              │ receive task
//!                                 └── other ─> h1                └ HPACK decode
//! ```
//!
//! One [`H2Session`] is kept per origin and carries concurrent requests.
//! HTTP/1.1 connections carry one request each.
//!
//! # Example
//!
//! ```rust,ignore
//! use tandem_http::{ClientConfig, HttpClient};
//!
//! async fn example() -> Result<(), tandem_http::HttpError> {
//!     let client = HttpClient::new(
//!         ClientConfig::default().with_base_url("http://localhost:8080/v1/"),
//!     );
//!
//!     let resp = client
//!         .post("messages")
//!         .header("authorization", "Bearer tok")
//!         .json(&serde_json::json!({"text": "hi"}))
//!         .send()
//!         .await?;
//!
//!     assert_eq!(resp.status(), 200);
//!     let (status, headers, body) = resp.into_parts();
//!     Ok(())
//! }
//! ```
//!
//! The blocking client has the same surface:
//!
//! ```rust,ignore
//! let client = tandem_http::blocking::Client::new(ClientConfig::default())?;
//! let resp = client.get("http://localhost:8080/health").send()?;
//! ```

pub mod blocking;
pub mod body;
pub mod client;
pub mod config;
pub mod error;
pub mod flow;
mod h1;
pub mod metrics;
pub mod mux;
pub mod request;
pub mod response;
pub mod retry;
pub mod target;
pub mod transport;

pub use body::Body;
pub use client::{H2Session, HttpClient};
pub use config::{ClientConfig, H2Config};
pub use error::HttpError;
pub use flow::FlowControl;
pub use mux::{Multiplexer, StreamFrame, StreamState};
pub use request::{Method, Request, RequestBuilder};
pub use response::Response;
pub use retry::RetryPolicy;
pub use target::{Scheme, Target};
pub use transport::{BoxTransport, Connector, Negotiated, TcpConnector, Transport};
