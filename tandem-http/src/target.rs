//! Request targets: absolute URLs split into the parts the wire needs.

use std::fmt::Write;

use crate::error::HttpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    /// Host name or address. IPv6 literals keep their brackets.
    pub host: String,
    pub port: u16,
    /// Origin-form request target: path plus query, always starting with `/`.
    pub path: String,
}

impl Target {
    /// Parse an absolute `http` or `https` URL. Fragments are dropped.
    pub fn parse(url: &str) -> Result<Self, HttpError> {
        let invalid = |why: &str| HttpError::InvalidUrl(format!("{url}: {why}"));

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let scheme = if scheme.eq_ignore_ascii_case("http") {
            Scheme::Http
        } else if scheme.eq_ignore_ascii_case("https") {
            Scheme::Https
        } else {
            return Err(invalid("unsupported scheme"));
        };

        let rest = rest.split('#').next().unwrap_or_default();
        let split = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, path) = rest.split_at(split);
        if authority.contains('@') {
            return Err(invalid("credentials in url"));
        }

        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (addr, after) = v6
                .split_once(']')
                .ok_or_else(|| invalid("unclosed IPv6 literal"))?;
            (format!("[{addr}]"), after.strip_prefix(':'))
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host.to_string(), Some(port)),
                None => (authority.to_string(), None),
            }
        };
        if host.is_empty() || host == "[]" {
            return Err(invalid("empty host"));
        }
        let port = match port {
            Some(p) => p.parse().map_err(|_| invalid("bad port"))?,
            None => scheme.default_port(),
        };

        let path = match path {
            "" => "/".to_string(),
            p if p.starts_with('?') => format!("/{p}"),
            p => p.to_string(),
        };

        Ok(Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
            path,
        })
    }

    /// Resolve `url` against an optional base the way a link is resolved
    /// (RFC 3986 Section 5.2): `/x` replaces the base path, `x` replaces its
    /// last segment, `?q` keeps the path, and `//host/x` keeps the scheme.
    /// A base meant as a prefix therefore needs its trailing slash.
    pub fn resolve(base: Option<&str>, url: &str) -> Result<Self, HttpError> {
        if url.contains("://") {
            return Self::parse(url);
        }
        let base = base.ok_or_else(|| {
            HttpError::InvalidUrl(format!("{url}: relative url and no base url"))
        })?;
        let mut target = Self::parse(base)?;
        if let Some(rest) = url.strip_prefix("//") {
            return Self::parse(&format!("{}://{rest}", target.scheme.as_str()));
        }
        if url.is_empty() {
            return Ok(target);
        }

        let base_path = match target.path.split_once('?') {
            Some((p, _)) => p,
            None => target.path.as_str(),
        };
        let (path, query) = match url.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (url, None),
        };
        let merged = if path.is_empty() {
            base_path.to_string()
        } else if path.starts_with('/') {
            path.to_string()
        } else {
            let dir = base_path.rfind('/').map_or("/", |i| &base_path[..=i]);
            format!("{dir}{path}")
        };
        let mut resolved = remove_dot_segments(&merged);
        if let Some(query) = query {
            resolved.push('?');
            resolved.push_str(query);
        }
        target.path = resolved;
        Ok(target)
    }

    /// Append percent-encoded query parameters to the path.
    pub fn append_query(&mut self, params: &[(String, String)]) {
        for (name, value) in params {
            self.path.push(if self.path.contains('?') { '&' } else { '?' });
            percent_encode(name, &mut self.path);
            self.path.push('=');
            percent_encode(value, &mut self.path);
        }
    }

    /// `host[:port]`, with the port omitted when it is the scheme default.
    /// Used for the HTTP/1.1 `host` header and the HTTP/2 `:authority`.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Apply `.` and `..` segments (RFC 3986 Section 5.2.4) to an absolute path.
fn remove_dot_segments(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut trailing = false;
    for segment in path.split('/').skip(1) {
        trailing = matches!(segment, "." | "..");
        match segment {
            "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    let mut result = format!("/{}", out.join("/"));
    if trailing && !out.is_empty() {
        result.push('/');
    }
    result
}

/// Encode everything except RFC 3986 unreserved characters.
fn percent_encode(s: &str, out: &mut String) {
    for &b in s.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
}
