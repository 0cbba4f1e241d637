//! Client configuration.

use std::time::Duration;

use tandem_h2::Settings;
use tandem_h2::flowcontrol::DEFAULT_WINDOW_SIZE;
use tandem_h2::frame::DEFAULT_MAX_FRAME_SIZE;
use tandem_h2::hpack::DEFAULT_TABLE_SIZE;

use crate::retry::RetryPolicy;

/// HTTP/2 connection tuning.
#[derive(Debug, Clone)]
pub struct H2Config {
    /// Receive window advertised for every stream, and the target the
    /// connection window is topped up to. Default 65535.
    pub initial_window_size: u32,
    /// HPACK dynamic table budget for both directions. Default 4096.
    pub header_table_size: u32,
    /// Largest frame payload we accept. Default 16384.
    pub max_frame_size: u32,
    /// A receive window that falls below this many bytes is refilled with a
    /// WINDOW_UPDATE. Default 32768.
    pub window_update_threshold: u32,
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            initial_window_size: DEFAULT_WINDOW_SIZE as u32,
            header_table_size: DEFAULT_TABLE_SIZE as u32,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            window_update_threshold: 32_768,
        }
    }
}

impl H2Config {
    /// SETTINGS sent in the connection preface. Push is always disabled.
    pub fn settings(&self) -> Settings {
        Settings {
            header_table_size: self.header_table_size,
            initial_window_size: self.initial_window_size,
            max_frame_size: self.max_frame_size,
            ..Settings::client_default()
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Joined with relative request paths. Absolute URLs ignore it.
    pub base_url: Option<String>,
    /// Deadline for a whole request attempt, from connect to last body byte.
    pub timeout: Duration,
    /// Deadline for establishing the transport.
    pub connect_timeout: Duration,
    pub h2: H2Config,
    pub retry: RetryPolicy,
    /// Sent unless the request sets its own `user-agent`.
    pub user_agent: String,
    /// Added to every request before per-request headers.
    pub default_headers: Vec<(String, String)>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            h2: H2Config::default(),
            retry: RetryPolicy::default(),
            user_agent: concat!("tandem/", env!("CARGO_PKG_VERSION")).to_string(),
            default_headers: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }
}
