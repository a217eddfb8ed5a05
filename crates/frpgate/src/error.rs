//! Tunnel error types.

use std::path::PathBuf;

use crate::platform::PlatformDescriptor;
use crate::supervisor::TunnelState;

/// Errors from binary acquisition and tunnel supervision.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("frpc {version} is not published for {platform} ({url})")]
    PlatformUnsupported {
        platform: PlatformDescriptor,
        version: String,
        url: String,
    },

    #[error("Failed to download frpc {version} for {platform} from {url}: {reason}")]
    DownloadError {
        platform: PlatformDescriptor,
        version: String,
        url: String,
        reason: String,
    },

    #[error("Checksum mismatch for {} (from {url}): expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Archive from {url} is unusable: {reason}")]
    Extraction { url: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to spawn {}: {reason}", .binary.display())]
    Spawn { binary: PathBuf, reason: String },

    #[error("Tunnel {tunnel_id} not ready after {waited_ms}ms")]
    TunnelStartTimeout { tunnel_id: String, waited_ms: u128 },

    #[error("Tunnel {tunnel_id} client exited before ready ({}){}", describe_code(.exit_code), describe_output(.output))]
    ProcessCrashed {
        tunnel_id: String,
        exit_code: Option<i32>,
        output: Vec<String>,
    },

    #[error("Tunnel {tunnel_id} rejected by server: {reason}")]
    ProxyRejected { tunnel_id: String, reason: String },

    #[error("Tunnel {tunnel_id} failed after {attempts} restart attempts: {last_error}")]
    RestartsExhausted {
        tunnel_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Tunnel {tunnel_id} is {state}{}", describe_last_error(.last_error))]
    Closed {
        tunnel_id: String,
        state: TunnelState,
        last_error: Option<String>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[allow(clippy::ref_option)]
fn describe_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}"))
}

fn describe_output(output: &[String]) -> String {
    output
        .last()
        .map_or_else(String::new, |line| format!(": {line}"))
}

#[allow(clippy::ref_option)]
fn describe_last_error(last_error: &Option<String>) -> String {
    last_error
        .as_deref()
        .map_or_else(String::new, |e| format!(" ({e})"))
}

impl TunnelError {
    /// Configuration error shorthand.
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigurationError(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crashed_message_carries_code_and_last_line() {
        let err = TunnelError::ProcessCrashed {
            tunnel_id: "abc".into(),
            exit_code: Some(1),
            output: vec!["first".into(), "login to the server failed".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code 1"));
        assert!(msg.contains("login to the server failed"));
    }

    #[test]
    fn crashed_by_signal() {
        let err = TunnelError::ProcessCrashed {
            tunnel_id: "abc".into(),
            exit_code: None,
            output: Vec::new(),
        };
        assert!(err.to_string().contains("killed by signal"));
    }

    #[test]
    fn closed_includes_last_error() {
        let err = TunnelError::Closed {
            tunnel_id: "abc".into(),
            state: TunnelState::Failed,
            last_error: Some("restarts exhausted".into()),
        };
        assert_eq!(err.to_string(), "Tunnel abc is failed (restarts exhausted)");
    }
}
