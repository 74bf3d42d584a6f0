//! Tunnel Configuration
//!
//! Parses the compact connection string into a validated, immutable
//! [`TunnelConfiguration`].
//!
//! # Format
//!
//! ```text
//! vless://<uuid>@<host>[:<port>]/[?type=ws&encryption=none&host=<ws-host>&path=<url-encoded-path>]
//! ```
//!
//! The port defaults to [`DEFAULT_PORT`] (443), the WebSocket path to `/`,
//! and the WebSocket `Host` header to the server host.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use url::{Host, Url, form_urlencoded};
use uuid::Uuid;

/// Scheme tag every connection string must carry
pub const SCHEME: &str = "vless";

/// Port used when the connection string omits one
pub const DEFAULT_PORT: u16 = 443;

/// WebSocket request path used when `path` is absent
pub const DEFAULT_PATH: &str = "/";

/// Connection parameters for one tunnel attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelConfiguration {
    /// Client identity, sent in the greeting
    pub identity: Uuid,
    /// Server host name or IP literal (no brackets)
    pub server_host: String,
    /// Server TCP port
    pub server_port: u16,
    /// WebSocket request target
    pub request_path: String,
    /// Value of the WebSocket `Host` header
    pub ws_host: String,
}

impl TunnelConfiguration {
    /// Parse a connection string
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(uri.trim()).map_err(|e| match e {
            url::ParseError::EmptyHost => ConfigError::MissingHost,
            other => ConfigError::Malformed(other.to_string()),
        })?;

        if url.scheme() != SCHEME {
            return Err(ConfigError::SchemeMismatch(url.scheme().to_string()));
        }

        let server_host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(ConfigError::MissingHost),
        };

        let user = url.username();
        if user.is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        let identity =
            Uuid::parse_str(user).map_err(|_| ConfigError::InvalidIdentity(user.to_string()))?;

        let mut request_path = None;
        let mut ws_host = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "path" if request_path.is_none() && !value.is_empty() => {
                    request_path = Some(normalize_path(&value));
                }
                "host" if ws_host.is_none() && !value.is_empty() => {
                    ws_host = Some(value.into_owned());
                }
                _ => {}
            }
        }

        Ok(Self {
            identity,
            server_port: url.port().unwrap_or(DEFAULT_PORT),
            request_path: request_path.unwrap_or_else(|| DEFAULT_PATH.to_string()),
            ws_host: ws_host.unwrap_or_else(|| server_host.clone()),
            server_host,
        })
    }

    /// Render back into a connection string
    pub fn to_uri(&self) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("type", "ws")
            .append_pair("encryption", "none")
            .append_pair("host", &self.ws_host)
            .append_pair("path", &self.request_path)
            .finish();

        format!(
            "{SCHEME}://{}@{}:{}/?{query}",
            self.identity.hyphenated(),
            self.authority_host(),
            self.server_port,
        )
    }

    /// Server host as it appears in an authority (IPv6 literals bracketed)
    pub fn authority_host(&self) -> String {
        if self.server_host.contains(':') {
            format!("[{}]", self.server_host)
        } else {
            self.server_host.clone()
        }
    }

    /// `host:port` string for logging
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.authority_host(), self.server_port)
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

impl FromStr for TunnelConfiguration {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TunnelConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Malformed connection string: {0}")]
    Malformed(String),

    #[error("Unexpected scheme '{0}' (expected '{SCHEME}')")]
    SchemeMismatch(String),

    #[error("Connection string has no host")]
    MissingHost,

    #[error("Connection string has no identity")]
    MissingIdentity,

    #[error("Identity is not a valid UUID: {0}")]
    InvalidIdentity(String),
}
