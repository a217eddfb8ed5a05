//! Process abstraction for tunnel clients.
//!
//! The supervisor only needs liveness, a line stream of output and two ways
//! to end the process. [`FrpcLauncher`] provides them on `tokio::process`;
//! tests substitute an in-memory implementation.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TunnelError;

/// Buffered output lines per child. Lines beyond this are dropped rather
/// than stalling the child on a full pipe.
const OUTPUT_BUFFER: usize = 256;

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
}

impl ExitInfo {
    pub const fn code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub const fn signaled() -> Self {
        Self { code: None }
    }

    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// What to run for one tunnel.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub tunnel_id: String,
    pub binary: PathBuf,
    /// Rendered frpc TOML configuration.
    pub config_toml: String,
}

/// A spawned tunnel client.
///
/// Dropping a child that is still running must terminate it.
pub trait TunnelChild: Send + fmt::Debug {
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>>;

    /// Ask the process to exit (SIGTERM on Unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to exit. Does not wait.
    fn kill(&mut self) -> io::Result<()>;
}

/// A child plus the receiving end of its merged stdout/stderr lines.
#[derive(Debug)]
pub struct Launched {
    pub child: Box<dyn TunnelChild>,
    pub output: mpsc::Receiver<String>,
}

/// Spawns tunnel clients.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, spec: &LaunchSpec) -> Result<Launched, TunnelError>;
}

/// Runs the real `frpc` binary as `frpc -c <tempdir>/frpc.toml`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrpcLauncher;

impl Launcher for FrpcLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Launched, TunnelError> {
        let spawn_error = |reason: String| TunnelError::Spawn {
            binary: spec.binary.clone(),
            reason,
        };

        // Lives as long as the child so the config stays readable for it.
        let workdir = tempfile::Builder::new()
            .prefix("frpgate-")
            .tempdir()
            .map_err(|e| spawn_error(format!("Failed to create config dir: {e}")))?;
        let config_path = workdir.path().join("frpc.toml");
        std::fs::write(&config_path, &spec.config_toml)
            .map_err(|e| spawn_error(format!("Failed to write frpc.toml: {e}")))?;

        let mut child = Command::new(&spec.binary)
            .arg("-c")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone(), spec.tunnel_id.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx, spec.tunnel_id.clone(), "stderr");
        }

        debug!(
            tunnel_id = %spec.tunnel_id,
            pid = ?child.id(),
            binary = %spec.binary.display(),
            "Spawned frpc"
        );

        Ok(Launched {
            child: Box::new(FrpcChild {
                child,
                _workdir: workdir,
            }),
            output: rx,
        })
    }
}

fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>, tunnel_id: String, source: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(tunnel_id = %tunnel_id, source, "frpc: {}", line);
            // Keep draining even when nobody listens, or frpc blocks on write.
            let _ = tx.try_send(line);
        }
        debug!(tunnel_id = %tunnel_id, source, "frpc output closed");
    });
}

#[derive(Debug)]
struct FrpcChild {
    child: Child,
    _workdir: TempDir,
}

impl TunnelChild for FrpcChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(ExitInfo::from))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: pid comes from our own un-reaped Child handle; kill(2) with
        // SIGTERM has no memory-safety preconditions.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
        if ret == 0 {
            Ok(())
        } else {
            let err = io::Error::last_os_error();
            warn!(pid, error = %err, "Failed to send SIGTERM");
            Err(err)
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        // No graceful signal available; fall back to TerminateProcess.
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already exited.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn exit_info_display() {
        assert_eq!(ExitInfo::code(3).to_string(), "exit code 3");
        assert_eq!(ExitInfo::signaled().to_string(), "terminated by signal");
        assert!(ExitInfo::code(0).success());
        assert!(!ExitInfo::signaled().success());
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let spec = LaunchSpec {
            tunnel_id: "t".into(),
            binary: PathBuf::from("/nonexistent/frpc"),
            config_toml: String::new(),
        };
        let err = FrpcLauncher.launch(&spec).unwrap_err();
        assert!(matches!(err, TunnelError::Spawn { .. }));
    }
}
