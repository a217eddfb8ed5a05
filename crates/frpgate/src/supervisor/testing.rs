//! In-memory tunnel clients for supervisor tests.

#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::process::{ExitInfo, LaunchSpec, Launched, Launcher, TunnelChild};
use crate::error::TunnelError;

pub const READY_LINE: &str = "[I] [proxy/proxy_wrapper.go:204] [frpgate] start proxy success";

/// Behaviour of one fake client.
#[derive(Debug, Clone)]
pub enum Script {
    /// Print the ready marker after the delay, then run until stopped.
    ReadyAfter(Duration),
    /// Print `url`, then the ready marker.
    ReportUrl(String),
    /// Print a login failure and exit with the code.
    ExitImmediately(i32),
    /// Stay alive without output.
    Silent,
    /// Print a server rejection with the reason.
    Reject(String),
    /// Become ready, then exit with `code` after `crash_after`.
    CrashAfterReady { crash_after: Duration, code: i32 },
    /// Become ready and ignore termination requests.
    IgnoreTerm,
}

#[derive(Debug, Default)]
struct ChildState {
    exit: Option<ExitInfo>,
}

impl ChildState {
    fn exit_with(&mut self, exit: ExitInfo) {
        self.exit.get_or_insert(exit);
    }
}

/// Launcher replaying [`Script`]s in order; the last one repeats.
#[derive(Debug)]
pub struct FakeLauncher {
    scripts: Mutex<VecDeque<Script>>,
    children: Mutex<Vec<Arc<Mutex<ChildState>>>>,
    configs: Mutex<Vec<String>>,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            children: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(4000),
        })
    }

    pub fn launch_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    /// Children that have not exited.
    pub fn alive_count(&self) -> usize {
        self.children
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.lock().unwrap().exit.is_none())
            .count()
    }

    pub fn last_config(&self) -> Option<String> {
        self.configs.lock().unwrap().last().cloned()
    }

    fn next_script(&self) -> Script {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.len() > 1 {
            scripts.pop_front().unwrap()
        } else {
            scripts.front().cloned().unwrap_or(Script::Silent)
        }
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Launched, TunnelError> {
        let script = self.next_script();
        let state = Arc::new(Mutex::new(ChildState::default()));
        self.children.lock().unwrap().push(Arc::clone(&state));
        self.configs.lock().unwrap().push(spec.config_toml.clone());

        let (tx, rx) = mpsc::channel(64);
        let ignore_term = matches!(script, Script::IgnoreTerm);
        let task_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            match script {
                Script::ReadyAfter(delay) => {
                    sleep(delay).await;
                    let _ = tx.send(READY_LINE.to_string()).await;
                }
                Script::ReportUrl(url) => {
                    let _ = tx.send(format!("[I] proxy available at {url}")).await;
                    let _ = tx.send(READY_LINE.to_string()).await;
                }
                Script::ExitImmediately(code) => {
                    let _ = tx
                        .send("[E] login to the server failed: connection refused".to_string())
                        .await;
                    task_state.lock().unwrap().exit_with(ExitInfo::code(code));
                    return;
                }
                Script::Silent => {}
                Script::Reject(reason) => {
                    let _ = tx.send(format!("[W] [frpgate] start error: {reason}")).await;
                }
                Script::CrashAfterReady { crash_after, code } => {
                    let _ = tx.send(READY_LINE.to_string()).await;
                    sleep(crash_after).await;
                    let _ = tx.send("[W] connection to server closed".to_string()).await;
                    task_state.lock().unwrap().exit_with(ExitInfo::code(code));
                    return;
                }
                Script::IgnoreTerm => {
                    let _ = tx.send(READY_LINE.to_string()).await;
                }
            }
            // Keep the output open like a running process would.
            std::future::pending::<()>().await;
        });

        Ok(Launched {
            child: Box::new(FakeChild {
                pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
                state,
                task,
                ignore_term,
            }),
            output: rx,
        })
    }
}

#[derive(Debug)]
struct FakeChild {
    pid: u32,
    state: Arc<Mutex<ChildState>>,
    task: JoinHandle<()>,
    ignore_term: bool,
}

impl TunnelChild for FakeChild {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(self.state.lock().unwrap().exit)
    }

    fn terminate(&mut self) -> io::Result<()> {
        if !self.ignore_term {
            self.state.lock().unwrap().exit_with(ExitInfo::code(0));
            self.task.abort();
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().exit_with(ExitInfo::signaled());
        self.task.abort();
        Ok(())
    }
}

impl Drop for FakeChild {
    /// Mirrors `kill_on_drop`.
    fn drop(&mut self) {
        let _ = self.kill();
    }
}
