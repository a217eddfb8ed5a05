//! Settings resolution for frpgate.
//!
//! Implements hierarchical settings resolution:
//! 1. Built-in defaults
//! 2. Global settings file (`settings.json` in the platform config dir)
//! 3. Environment variables (`FRPGATE_*`)
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default frpc release to download.
pub const DEFAULT_FRPC_VERSION: &str = "0.61.1";

/// Default base URL of the frp release downloads.
pub const DEFAULT_RELEASE_BASE_URL: &str = "https://github.com/fatedier/frp/releases/download";

/// Complete frpgate settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub log: LogSettings,
}

/// Where tunnels go and where the client binary comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// frpc release version, without the leading `v`.
    pub frpc_version: String,
    /// frps control endpoint (`host:port`).
    pub server_address: String,
    /// Base domain public subdomains hang off.
    pub tunnel_domain: String,
    /// Binary cache directory. `None` means `~/.frpgate/frpc`.
    pub cache_dir: Option<PathBuf>,
    /// Release download base URL.
    pub release_base_url: String,
    /// Upper bound for one archive download.
    pub download_timeout_secs: u64,
    /// Use an already-installed frpc instead of downloading one.
    pub frpc_path: Option<PathBuf>,
    /// Expected SHA-256 (hex) of the extracted client, keyed by archive URL.
    pub checksums: BTreeMap<String, String>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            frpc_version: DEFAULT_FRPC_VERSION.to_string(),
            server_address: "tunnel.getbindu.com:7000".to_string(),
            tunnel_domain: "tunnel.getbindu.com".to_string(),
            cache_dir: None,
            release_base_url: DEFAULT_RELEASE_BASE_URL.to_string(),
            download_timeout_secs: 60,
            frpc_path: None,
            checksums: BTreeMap::new(),
        }
    }
}

impl TunnelSettings {
    /// Resolve the cache directory, falling back to `~/.frpgate/frpc`.
    pub fn resolved_cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        default_cache_dir()
            .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))
    }
}

/// Timing and restart knobs for the process supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// How long `start` waits for the client to report a connection.
    pub readiness_timeout_secs: u64,
    /// Grace period between the termination request and a forced kill.
    pub stop_grace_secs: u64,
    /// Liveness poll interval of the per-tunnel monitor.
    pub monitor_interval_ms: u64,
    /// Restart attempts after a crash before the tunnel is marked failed.
    pub max_restarts: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            readiness_timeout_secs: 30,
            stop_grace_secs: 5,
            monitor_interval_ms: 1000,
            max_restarts: 5,
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load settings with hierarchical resolution.
pub fn load_settings() -> Result<Settings> {
    let mut settings = Settings::default();

    if let Some(global_path) = global_settings_path()
        && global_path.exists()
    {
        settings = load_settings_file(&global_path)?;
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());

    Ok(settings)
}

/// Get the global settings file path.
pub fn global_settings_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".frpgate").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/frpgate/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("frpgate").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Default binary cache: `~/.frpgate/frpc`.
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".frpgate").join("frpc"))
}

/// Read one settings file. Missing sections keep their defaults.
pub fn load_settings_file(path: &Path) -> Result<Settings> {
    tracing::debug!(path = %path.display(), "Loading settings file");
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Apply `FRPGATE_*` overrides using `lookup` to read variables.
///
/// Unparseable numeric values are ignored with a warning.
pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("FRPGATE_FRPC_VERSION") {
        settings.tunnel.frpc_version = val.trim_start_matches('v').to_string();
    }
    if let Some(val) = lookup("FRPGATE_SERVER_ADDRESS") {
        settings.tunnel.server_address = val;
    }
    if let Some(val) = lookup("FRPGATE_TUNNEL_DOMAIN") {
        settings.tunnel.tunnel_domain = val;
    }
    if let Some(val) = lookup("FRPGATE_CACHE_DIR") {
        settings.tunnel.cache_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("FRPGATE_RELEASE_BASE_URL") {
        settings.tunnel.release_base_url = val;
    }
    if let Some(val) = lookup("FRPGATE_FRPC_PATH") {
        settings.tunnel.frpc_path = Some(PathBuf::from(val));
    }
    parse_override(&lookup, "FRPGATE_DOWNLOAD_TIMEOUT", &mut settings.tunnel.download_timeout_secs);
    parse_override(&lookup, "FRPGATE_MAX_RESTARTS", &mut settings.supervisor.max_restarts);
    parse_override(
        &lookup,
        "FRPGATE_READINESS_TIMEOUT",
        &mut settings.supervisor.readiness_timeout_secs,
    );
    parse_override(&lookup, "FRPGATE_STOP_GRACE", &mut settings.supervisor.stop_grace_secs);
    parse_override(
        &lookup,
        "FRPGATE_MONITOR_INTERVAL_MS",
        &mut settings.supervisor.monitor_interval_ms,
    );
    if let Some(val) = lookup("FRPGATE_LOG_LEVEL") {
        settings.log.level = val;
    }
}

fn parse_override<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(val) = lookup(key) else {
        return;
    };
    match val.trim().parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => tracing::warn!(key, value = %val, "Ignoring invalid numeric override"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_bounded() {
        let settings = Settings::default();
        assert_eq!(settings.tunnel.frpc_version, DEFAULT_FRPC_VERSION);
        assert_eq!(settings.tunnel.download_timeout_secs, 60);
        assert_eq!(settings.supervisor.stop_grace_secs, 5);
        assert!(settings.supervisor.max_restarts > 0);
    }

    #[test]
    fn env_overrides_win() {
        let mut settings = Settings::default();
        apply_env_overrides(
            &mut settings,
            env(&[
                ("FRPGATE_FRPC_VERSION", "v0.60.0"),
                ("FRPGATE_TUNNEL_DOMAIN", "tunnel.example.com"),
                ("FRPGATE_MAX_RESTARTS", "2"),
            ]),
        );
        assert_eq!(settings.tunnel.frpc_version, "0.60.0");
        assert_eq!(settings.tunnel.tunnel_domain, "tunnel.example.com");
        assert_eq!(settings.supervisor.max_restarts, 2);
    }

    #[test]
    fn invalid_numeric_override_is_ignored() {
        let mut settings = Settings::default();
        apply_env_overrides(&mut settings, env(&[("FRPGATE_MAX_RESTARTS", "many")]));
        assert_eq!(settings.supervisor.max_restarts, 5);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"tunnel": {"tunnel_domain": "t.example.org"}}"#).unwrap();

        let settings = load_settings_file(&path).unwrap();
        assert_eq!(settings.tunnel.tunnel_domain, "t.example.org");
        assert_eq!(settings.tunnel.frpc_version, DEFAULT_FRPC_VERSION);
        assert_eq!(settings.supervisor.readiness_timeout_secs, 30);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = load_settings_file(&path).unwrap_err();
        assert!(matches!(err, Error::Json(_)), "{err}");
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_settings_file(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err}");
    }

    #[test]
    fn timing_overrides_cover_supervisor_and_download() {
        let mut settings = Settings::default();
        apply_env_overrides(
            &mut settings,
            env(&[
                ("FRPGATE_STOP_GRACE", "9"),
                ("FRPGATE_MONITOR_INTERVAL_MS", "250"),
                ("FRPGATE_DOWNLOAD_TIMEOUT", " 120 "),
                ("FRPGATE_READINESS_TIMEOUT", "soon"),
            ]),
        );
        assert_eq!(settings.supervisor.stop_grace_secs, 9);
        assert_eq!(settings.supervisor.monitor_interval_ms, 250);
        assert_eq!(settings.tunnel.download_timeout_secs, 120);
        assert_eq!(settings.supervisor.readiness_timeout_secs, 30);
    }

    #[test]
    fn checksums_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"tunnel": {"checksums": {"https://example.com/frp.tar.gz": "ABCD"}}}"#,
        )
        .unwrap();

        let settings = load_settings_file(&path).unwrap();
        assert_eq!(
            settings.tunnel.checksums.get("https://example.com/frp.tar.gz").map(String::as_str),
            Some("ABCD")
        );
    }

    #[test]
    fn explicit_cache_dir_is_used() {
        let settings = TunnelSettings {
            cache_dir: Some(PathBuf::from("/tmp/frpc-cache")),
            ..TunnelSettings::default()
        };
        assert_eq!(
            settings.resolved_cache_dir().unwrap(),
            PathBuf::from("/tmp/frpc-cache")
        );
    }
}
