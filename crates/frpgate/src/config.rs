//! Tunnel configuration.
//!
//! A [`TunnelConfig`] is validated once at construction and never mutated;
//! `with_*` methods return a new value. `local_port` may be left unset until
//! the local listener has bound and is only required by `start`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use frpgate_core::config::TunnelSettings;

use crate::error::TunnelError;

/// Proxy type requested from the frp server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "tcp" => Ok(Self::Tcp),
            other => Err(TunnelError::config(format!(
                "Unknown protocol '{other}' (expected http, https or tcp)"
            ))),
        }
    }
}

/// Validated description of one desired tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    enabled: bool,
    server_address: String,
    server_host: String,
    server_port: u16,
    subdomain: Option<String>,
    tunnel_domain: String,
    protocol: Protocol,
    use_tls: bool,
    local_host: String,
    local_port: Option<u16>,
}

impl TunnelConfig {
    /// Start building a config for the given frps endpoint and public domain.
    pub fn builder(
        server_address: impl Into<String>,
        tunnel_domain: impl Into<String>,
    ) -> TunnelConfigBuilder {
        TunnelConfigBuilder::new(server_address, tunnel_domain)
    }

    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// The `host:port` frps control endpoint as given.
    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    pub fn server_host(&self) -> &str {
        &self.server_host
    }

    pub const fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn subdomain(&self) -> Option<&str> {
        self.subdomain.as_deref()
    }

    pub fn tunnel_domain(&self) -> &str {
        &self.tunnel_domain
    }

    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub const fn use_tls(&self) -> bool {
        self.use_tls
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub const fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// Public URL of the tunnel: `scheme://{subdomain}.{tunnel_domain}`.
    ///
    /// The scheme is `https` only for the `https` protocol.
    pub fn get_public_url(&self) -> Result<String, TunnelError> {
        let subdomain = self
            .subdomain
            .as_deref()
            .ok_or_else(|| TunnelError::config("Subdomain must be set to generate public URL"))?;
        let scheme = if self.protocol == Protocol::Https {
            "https"
        } else {
            "http"
        };
        Ok(format!("{scheme}://{subdomain}.{}", self.tunnel_domain))
    }

    /// Copy of this config targeting `port` locally.
    #[must_use]
    pub fn with_local_port(&self, port: u16) -> Self {
        Self {
            local_port: Some(port),
            ..self.clone()
        }
    }

    /// Copy of this config with a (validated) subdomain.
    pub fn with_subdomain(&self, subdomain: impl Into<String>) -> Result<Self, TunnelError> {
        let subdomain = subdomain.into();
        validate_subdomain(&subdomain)?;
        Ok(Self {
            subdomain: Some(subdomain),
            ..self.clone()
        })
    }
}

/// Builder for [`TunnelConfig`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct TunnelConfigBuilder {
    enabled: bool,
    server_address: String,
    subdomain: Option<String>,
    tunnel_domain: String,
    protocol: String,
    use_tls: bool,
    local_host: String,
    local_port: Option<u16>,
}

impl TunnelConfigBuilder {
    fn new(server_address: impl Into<String>, tunnel_domain: impl Into<String>) -> Self {
        Self {
            enabled: true,
            server_address: server_address.into(),
            subdomain: None,
            tunnel_domain: tunnel_domain.into(),
            protocol: Protocol::Http.to_string(),
            use_tls: false,
            local_host: "127.0.0.1".to_string(),
            local_port: None,
        }
    }

    /// Seed server address and domain from loaded settings.
    pub fn from_settings(settings: &TunnelSettings) -> Self {
        Self::new(
            settings.server_address.clone(),
            settings.tunnel_domain.clone(),
        )
    }

    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    /// Protocol by name (`http`, `https` or `tcp`); checked in `build`.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    #[must_use]
    pub const fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    #[must_use]
    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    #[must_use]
    pub const fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn build(self) -> Result<TunnelConfig, TunnelError> {
        let server_address = self.server_address.trim().to_string();
        if server_address.is_empty() {
            return Err(TunnelError::config("server_address must not be empty"));
        }
        let (server_host, server_port) = split_host_port(&server_address)?;

        let protocol: Protocol = self.protocol.parse()?;

        let tunnel_domain = self.tunnel_domain.trim().trim_matches('.').to_string();
        if tunnel_domain.is_empty() {
            return Err(TunnelError::config("tunnel_domain must not be empty"));
        }

        if self.local_host.trim().is_empty() {
            return Err(TunnelError::config("local_host must not be empty"));
        }
        if self.local_port == Some(0) {
            return Err(TunnelError::config("local_port must be non-zero"));
        }

        if let Some(subdomain) = &self.subdomain {
            validate_subdomain(subdomain)?;
        }

        Ok(TunnelConfig {
            enabled: self.enabled,
            server_address,
            server_host,
            server_port,
            subdomain: self.subdomain,
            tunnel_domain,
            protocol,
            use_tls: self.use_tls,
            local_host: self.local_host.trim().to_string(),
            local_port: self.local_port,
        })
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
fn split_host_port(address: &str) -> Result<(String, u16), TunnelError> {
    let malformed = |why: &str| {
        TunnelError::config(format!("Malformed server_address '{address}': {why}"))
    };

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| malformed("expected host:port"))?;
    if host.is_empty() {
        return Err(malformed("empty host"));
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(malformed("IPv6 hosts must be bracketed"));
    }
    let port: u16 = port.parse().map_err(|_| malformed("port is not a number"))?;
    if port == 0 {
        return Err(malformed("port must be non-zero"));
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

fn validate_subdomain(subdomain: &str) -> Result<(), TunnelError> {
    let valid = !subdomain.is_empty()
        && subdomain.len() <= 63
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TunnelError::config(format!(
            "Invalid subdomain '{subdomain}' (letters, digits and inner hyphens only)"
        )))
    }
}
