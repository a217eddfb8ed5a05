//! frpc TOML configuration rendering.

use serde::Serialize;

use crate::config::{Protocol, TunnelConfig};
use crate::error::TunnelError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FrpcFile<'a> {
    server_addr: &'a str,
    server_port: u16,
    /// Exit instead of retrying forever, so a refused login surfaces as a
    /// nonzero exit.
    login_fail_exit: bool,
    transport: Transport,
    proxies: Vec<Proxy<'a>>,
}

#[derive(Serialize)]
struct Transport {
    tls: Tls,
}

#[derive(Serialize)]
struct Tls {
    enable: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Proxy<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: Protocol,
    #[serde(rename = "localIP")]
    local_ip: &'a str,
    local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    subdomain: Option<&'a str>,
    /// `0` lets frps pick a free port.
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_port: Option<u16>,
}

/// Render the frpc configuration for one proxy named `proxy_name`.
pub fn render_frpc_config(config: &TunnelConfig, proxy_name: &str) -> Result<String, TunnelError> {
    let local_port = config
        .local_port()
        .ok_or_else(|| TunnelError::config("local_port must be set before starting a tunnel"))?;

    let is_tcp = config.protocol() == Protocol::Tcp;
    let file = FrpcFile {
        server_addr: config.server_host(),
        server_port: config.server_port(),
        login_fail_exit: true,
        transport: Transport {
            tls: Tls {
                enable: config.use_tls(),
            },
        },
        proxies: vec![Proxy {
            name: proxy_name,
            kind: config.protocol(),
            local_ip: config.local_host(),
            local_port,
            subdomain: if is_tcp { None } else { config.subdomain() },
            remote_port: is_tcp.then_some(0),
        }],
    };

    toml::to_string(&file)
        .map_err(|e| TunnelError::config(format!("Failed to render frpc config: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(protocol: &str) -> TunnelConfig {
        TunnelConfig::builder("frps.example.com:7000", "tunnel.example.com")
            .protocol(protocol)
            .subdomain("demo")
            .use_tls(true)
            .local_port(3773)
            .build()
            .unwrap()
    }

    #[test]
    fn renders_http_proxy() {
        let rendered = render_frpc_config(&config("http"), "frpgate-1234").unwrap();
        let value: toml::Value = toml::from_str(&rendered).unwrap();

        assert_eq!(value["serverAddr"].as_str(), Some("frps.example.com"));
        assert_eq!(value["serverPort"].as_integer(), Some(7000));
        assert_eq!(value["loginFailExit"].as_bool(), Some(true));
        assert_eq!(value["transport"]["tls"]["enable"].as_bool(), Some(true));

        let proxy = &value["proxies"][0];
        assert_eq!(proxy["name"].as_str(), Some("frpgate-1234"));
        assert_eq!(proxy["type"].as_str(), Some("http"));
        assert_eq!(proxy["localIP"].as_str(), Some("127.0.0.1"));
        assert_eq!(proxy["localPort"].as_integer(), Some(3773));
        assert_eq!(proxy["subdomain"].as_str(), Some("demo"));
        assert!(proxy.get("remotePort").is_none());
    }

    #[test]
    fn tcp_proxy_uses_remote_port() {
        let rendered = render_frpc_config(&config("tcp"), "p").unwrap();
        let value: toml::Value = toml::from_str(&rendered).unwrap();
        let proxy = &value["proxies"][0];
        assert_eq!(proxy["type"].as_str(), Some("tcp"));
        assert_eq!(proxy["remotePort"].as_integer(), Some(0));
        assert!(proxy.get("subdomain").is_none());
    }

    #[test]
    fn missing_local_port_is_config_error() {
        let config = TunnelConfig::builder("frps.example.com:7000", "tunnel.example.com")
            .build()
            .unwrap();
        assert!(matches!(
            render_frpc_config(&config, "p"),
            Err(TunnelError::ConfigurationError(_))
        ));
    }
}
