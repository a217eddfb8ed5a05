//! Tunnel process supervisor.
//!
//! Each tunnel is registered as soon as it enters `Starting`. Its entry holds
//! the child from the moment it is spawned, a `watch` channel with the latest
//! [`TunnelStatus`] and, once `Running`, a monitor task. The monitor polls
//! liveness and restarts crashed clients per the restart policy.
//! Transitions are validated against [`TunnelState::can_transition_to`],
//! logged and broadcast as [`TunnelEvent`]s.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use frpgate_core::config::SupervisorSettings;

use super::handle::TunnelHandle;
use super::policy::BackoffPolicy;
use super::process::{ExitInfo, FrpcLauncher, LaunchSpec, Launched, Launcher, TunnelChild};
use super::readiness::{EXIT_OUTPUT_GRACE, OutputTail, ReadinessProbe, await_ready};
use super::render::render_frpc_config;
use super::state::{TunnelState, TunnelStatus};
use crate::binary::BinaryAcquirer;
use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::platform::PlatformDescriptor;

const EVENT_CAPACITY: usize = 256;

/// Liveness poll interval while waiting out the stop grace period.
const STOP_POLL: Duration = Duration::from_millis(50);

/// How long to wait for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Supervisor tunables.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub readiness_timeout: Duration,
    pub readiness_poll: BackoffPolicy,
    /// When set, a client alive this long without the marker counts as ready.
    pub ready_after_warmup: Option<Duration>,
    pub monitor_interval: Duration,
    pub stop_grace: Duration,
    pub restart: BackoffPolicy,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(30),
            readiness_poll: BackoffPolicy::readiness_poll(),
            ready_after_warmup: None,
            monitor_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
            restart: BackoffPolicy::default(),
        }
    }
}

impl SupervisorOptions {
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self {
            readiness_timeout: Duration::from_secs(settings.readiness_timeout_secs),
            monitor_interval: Duration::from_millis(settings.monitor_interval_ms),
            stop_grace: Duration::from_secs(settings.stop_grace_secs),
            restart: BackoffPolicy::restarts(settings.max_restarts),
            ..Self::default()
        }
    }
}

/// Where the frpc executable comes from.
#[derive(Debug, Clone)]
pub enum BinarySource {
    /// Downloaded and cached on demand.
    Managed {
        acquirer: BinaryAcquirer,
        version: String,
        platform: PlatformDescriptor,
    },
    /// A preinstalled executable.
    Fixed(PathBuf),
}

impl BinarySource {
    pub async fn resolve(&self) -> Result<PathBuf, TunnelError> {
        match self {
            Self::Managed {
                acquirer,
                version,
                platform,
            } => acquirer.ensure_binary(version, platform, false).await,
            Self::Fixed(path) => Ok(path.clone()),
        }
    }
}

/// How [`ProcessSupervisor::stop`] ended a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing to do; the tunnel was already in this state.
    AlreadyStopped(TunnelState),
    /// The client exited within the grace period.
    Graceful { exit_code: Option<i32> },
    /// The client ignored the termination request and was killed.
    Killed,
}

/// A state change of one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEvent {
    pub tunnel_id: String,
    pub from: TunnelState,
    pub to: TunnelState,
}

struct RunningChild {
    child: Box<dyn TunnelChild>,
    output: mpsc::Receiver<String>,
    tail: OutputTail,
}

struct Entry {
    id: String,
    proxy_name: String,
    /// Effective config, subdomain assigned.
    config: TunnelConfig,
    status: watch::Sender<TunnelStatus>,
    child: Mutex<Option<RunningChild>>,
    shutdown: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    stop_lock: Mutex<()>,
}

pub(super) struct Inner {
    launcher: Arc<dyn Launcher>,
    binary: BinarySource,
    options: SupervisorOptions,
    registry: Mutex<HashMap<String, Arc<Entry>>>,
    events: broadcast::Sender<TunnelEvent>,
    /// Set by `shutdown`; checked under the registry lock by `start`.
    closing: watch::Sender<bool>,
}

/// Starts, watches, restarts and stops tunnel client processes.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("binary", &self.inner.binary)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Supervisor running the real frpc.
    pub fn new(binary: BinarySource, options: SupervisorOptions) -> Self {
        Self::with_launcher(Arc::new(FrpcLauncher), binary, options)
    }

    pub fn with_launcher(
        launcher: Arc<dyn Launcher>,
        binary: BinarySource,
        options: SupervisorOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                launcher,
                binary,
                options,
                registry: Mutex::new(HashMap::new()),
                events,
                closing: watch::Sender::new(false),
            }),
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.inner.options
    }

    /// Transition events of every tunnel started after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    /// Start a tunnel and wait until the server accepted it.
    ///
    /// The tunnel is visible to [`list`](Self::list) and
    /// [`shutdown`](Self::shutdown) while it starts. A stop or shutdown that
    /// lands before readiness tears the client down and fails the start with
    /// [`TunnelError::Closed`]. Dropping the returned future before it
    /// resolves kills the client.
    pub async fn start(&self, config: TunnelConfig) -> Result<TunnelHandle, TunnelError> {
        if !config.enabled() {
            return Err(TunnelError::config("Tunnel is disabled in its configuration"));
        }
        if config.local_port().is_none() {
            return Err(TunnelError::config(
                "local_port must be set before starting a tunnel",
            ));
        }
        let config = match config.subdomain() {
            Some(_) => config,
            None => config.with_subdomain(random_subdomain())?,
        };
        let default_url = config.get_public_url()?;

        let id = Uuid::new_v4().to_string();
        let (status_tx, mut status_rx) = watch::channel(TunnelStatus::default());
        let entry = Arc::new(Entry {
            id: id.clone(),
            proxy_name: proxy_name_for(&id),
            config: config.clone(),
            status: status_tx,
            child: Mutex::new(None),
            shutdown: watch::Sender::new(false),
            monitor: Mutex::new(None),
            stop_lock: Mutex::new(()),
        });
        let inner = &self.inner;

        {
            let mut registry = inner.registry.lock().await;
            if *inner.closing.borrow() {
                return Err(TunnelError::Closed {
                    tunnel_id: id,
                    state: TunnelState::Idle,
                    last_error: Some("supervisor is shutting down".to_string()),
                });
            }
            info!(
                tunnel_id = %id,
                local_port = ?config.local_port(),
                subdomain = ?config.subdomain(),
                protocol = %config.protocol(),
                "Starting tunnel"
            );
            let _ = inner.transition(&id, &entry.status, TunnelState::Starting, |_| {});
            registry.insert(id.clone(), Arc::clone(&entry));
        }
        let mut pending = PendingStart {
            inner,
            entry: Arc::clone(&entry),
            armed: true,
        };

        let mut stop_requested = entry.shutdown.subscribe();
        let launched = tokio::select! {
            () = shutdown_requested(&mut stop_requested) => None,
            result = inner.launch_ready(&entry) => Some(result),
        };

        let reported_url = match launched {
            // The stopper owns the entry and its child from here.
            None => {
                pending.disarm();
                return Err(closed_after_stop(&id, &mut status_rx).await);
            }
            Some(Err(e)) => {
                let _ = inner.transition(&id, &entry.status, TunnelState::Failed, |s| {
                    s.last_error = Some(e.to_string());
                });
                inner.registry.lock().await.remove(&id);
                pending.disarm();
                return Err(e);
            }
            Some(Ok(url)) => url,
        };

        let public_url = reported_url.unwrap_or(default_url);
        let pid = entry.child.lock().await.as_ref().and_then(|r| r.child.id());
        let running = inner.transition(&id, &entry.status, TunnelState::Running, |s| {
            s.pid = pid;
            s.started_at = Some(SystemTime::now());
            s.public_url = Some(public_url.clone());
        });
        pending.disarm();
        if running.is_err() {
            // A stop raced the readiness marker.
            return Err(closed_after_stop(&id, &mut status_rx).await);
        }
        info!(tunnel_id = %id, pid = ?pid, url = %public_url, "Tunnel running");

        // A stop that already ran leaves the shutdown flag set, so this
        // monitor exits on its first tick.
        let task = tokio::spawn(monitor(Arc::downgrade(inner), Arc::clone(&entry)));
        *entry.monitor.lock().await = Some(task);

        Ok(TunnelHandle::new(
            id,
            config,
            status_rx,
            Arc::downgrade(inner),
        ))
    }

    /// Stop a tunnel. Idempotent: a terminal tunnel is left as is.
    pub async fn stop(&self, handle: &TunnelHandle) -> Result<StopOutcome, TunnelError> {
        self.inner.stop_tunnel(handle.id(), handle.state()).await
    }

    /// Stop every registered tunnel, including ones still starting.
    ///
    /// Later `start` calls fail with [`TunnelError::Closed`].
    pub async fn shutdown(&self) {
        self.inner.closing.send_replace(true);
        let entries: Vec<Arc<Entry>> = self.inner.registry.lock().await.values().cloned().collect();
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "Stopping all tunnels");
        let results = futures_util::future::join_all(
            entries.iter().map(|entry| self.inner.stop_entry(entry)),
        )
        .await;
        for (entry, result) in entries.iter().zip(results) {
            if let Err(e) = result {
                warn!(tunnel_id = %entry.id, error = %e, "Failed to stop tunnel cleanly");
            }
        }
    }

    /// Status of every registered tunnel, keyed by id. Includes tunnels
    /// that are still starting or restarting.
    pub async fn list(&self) -> Vec<(String, TunnelStatus)> {
        self.inner
            .registry
            .lock()
            .await
            .values()
            .map(|entry| (entry.id.clone(), entry.status.borrow().clone()))
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.registry.lock().await.len()
    }
}

impl Inner {
    /// Apply `next` if legal. Returns the previous state, or the current one
    /// when the transition was refused.
    fn transition(
        &self,
        tunnel_id: &str,
        status: &watch::Sender<TunnelStatus>,
        next: TunnelState,
        update: impl FnOnce(&mut TunnelStatus),
    ) -> Result<TunnelState, TunnelState> {
        let mut outcome = Err(next);
        status.send_if_modified(|s| {
            if !s.state.can_transition_to(next) {
                outcome = Err(s.state);
                return false;
            }
            outcome = Ok(s.state);
            s.state = next;
            update(s);
            true
        });

        match outcome {
            Ok(from) => {
                info!(tunnel_id, %from, to = %next, "Tunnel state changed");
                let _ = self.events.send(TunnelEvent {
                    tunnel_id: tunnel_id.to_string(),
                    from,
                    to: next,
                });
            }
            Err(current) => {
                debug!(tunnel_id, %current, refused = %next, "Ignoring state transition");
            }
        }
        outcome
    }

    /// Spawn a client into `entry` and wait for readiness. Kills the client
    /// on failure.
    ///
    /// The child slot stays locked during the wait; a stopper takes the
    /// child once this future is dropped.
    async fn launch_ready(&self, entry: &Entry) -> Result<Option<String>, TunnelError> {
        let binary = self.binary.resolve().await?;
        let spec = LaunchSpec {
            tunnel_id: entry.id.clone(),
            binary,
            config_toml: render_frpc_config(&entry.config, &entry.proxy_name)?,
        };
        let Launched { child, output } = self.launcher.launch(&spec)?;

        let mut slot = entry.child.lock().await;
        let running = slot.insert(RunningChild {
            child,
            output,
            tail: OutputTail::default(),
        });
        let probe = ReadinessProbe {
            tunnel_id: &entry.id,
            tunnel_domain: entry.config.tunnel_domain(),
            timeout: self.options.readiness_timeout,
            poll: &self.options.readiness_poll,
            warmup: self.options.ready_after_warmup,
        };
        let result = await_ready(
            running.child.as_mut(),
            &mut running.output,
            &mut running.tail,
            &probe,
        )
        .await;

        if let Err(e) = &result {
            warn!(tunnel_id = %entry.id, error = %e, "Tunnel client did not become ready");
            if let Some(mut failed) = slot.take()
                && let Err(kill_err) = failed.child.kill()
            {
                warn!(tunnel_id = %entry.id, error = %kill_err, "Failed to kill tunnel client");
            }
        }
        result
    }

    pub(super) async fn stop_tunnel(
        &self,
        tunnel_id: &str,
        last_known: TunnelState,
    ) -> Result<StopOutcome, TunnelError> {
        let entry = self.registry.lock().await.get(tunnel_id).cloned();
        match entry {
            Some(entry) => self.stop_entry(&entry).await,
            None => Ok(StopOutcome::AlreadyStopped(last_known)),
        }
    }

    async fn stop_entry(&self, entry: &Arc<Entry>) -> Result<StopOutcome, TunnelError> {
        let _guard = entry.stop_lock.lock().await;

        let current = entry.status.borrow().state;
        if current.is_terminal() {
            return Ok(StopOutcome::AlreadyStopped(current));
        }
        if let Err(current) = self.transition(&entry.id, &entry.status, TunnelState::Stopping, |_| {}) {
            return Ok(StopOutcome::AlreadyStopped(current));
        }

        entry.shutdown.send_replace(true);
        let monitor = entry.monitor.lock().await.take();
        if let Some(monitor) = monitor
            && let Err(e) = monitor.await
        {
            warn!(tunnel_id = %entry.id, error = %e, "Tunnel monitor task failed");
        }

        let running = entry.child.lock().await.take();
        let result = match running {
            Some(running) => self.terminate_child(&entry.id, running).await,
            None => Ok(StopOutcome::Graceful { exit_code: None }),
        };

        let _ = self.transition(&entry.id, &entry.status, TunnelState::Stopped, |s| {
            s.pid = None;
            if let Err(e) = &result {
                s.last_error = Some(e.to_string());
            }
        });
        self.registry.lock().await.remove(&entry.id);
        result
    }

    /// SIGTERM, wait out the grace period, then kill.
    async fn terminate_child(
        &self,
        tunnel_id: &str,
        mut running: RunningChild,
    ) -> Result<StopOutcome, TunnelError> {
        let pid = running.child.id();
        if let Some(exit) = running.child.try_wait()? {
            debug!(tunnel_id, exit = %exit, "Tunnel client already exited");
            return Ok(StopOutcome::Graceful {
                exit_code: exit.code,
            });
        }

        debug!(tunnel_id, pid = ?pid, "Sending termination request");
        if let Err(e) = running.child.terminate() {
            warn!(tunnel_id, pid = ?pid, error = %e, "Termination request failed");
        }

        let deadline = Instant::now() + self.options.stop_grace;
        loop {
            if let Some(exit) = running.child.try_wait()? {
                info!(tunnel_id, pid = ?pid, exit = %exit, "Tunnel client stopped");
                return Ok(StopOutcome::Graceful {
                    exit_code: exit.code,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(STOP_POLL.min(deadline - now)).await;
        }

        warn!(
            tunnel_id,
            pid = ?pid,
            grace_ms = self.options.stop_grace.as_millis(),
            "Tunnel client ignored termination request, killing"
        );
        running.child.kill()?;

        let reap_deadline = Instant::now() + REAP_TIMEOUT;
        while running.child.try_wait()?.is_none() && Instant::now() < reap_deadline {
            sleep(STOP_POLL).await;
        }
        Ok(StopOutcome::Killed)
    }

    /// Restart a crashed tunnel. Returns `false` when monitoring should end.
    async fn recover(
        &self,
        entry: &Entry,
        exit: ExitInfo,
        output: Vec<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let crash = TunnelError::ProcessCrashed {
            tunnel_id: entry.id.clone(),
            exit_code: exit.code,
            output,
        };
        warn!(tunnel_id = %entry.id, exit = %exit, "Tunnel client exited unexpectedly");
        entry.child.lock().await.take();

        let crashed = self.transition(&entry.id, &entry.status, TunnelState::Crashed, |s| {
            s.pid = None;
            s.last_error = Some(crash.to_string());
        });
        if crashed.is_err() {
            return false;
        }

        let policy = &self.options.restart;
        let mut last_error = crash.to_string();
        let mut attempt = 0u32;
        while policy.should_retry(attempt) {
            let delay = policy.delay_for_attempt(attempt);
            attempt += 1;

            let restarting = self.transition(&entry.id, &entry.status, TunnelState::Restarting, |s| {
                s.restart_count += 1;
            });
            if restarting.is_err() {
                return false;
            }
            info!(
                tunnel_id = %entry.id,
                attempt,
                delay_ms = delay.as_millis(),
                "Restarting tunnel client"
            );
            tokio::select! {
                () = shutdown_requested(shutdown) => return false,
                () = sleep(delay) => {}
            }

            if self
                .transition(&entry.id, &entry.status, TunnelState::Starting, |_| {})
                .is_err()
            {
                return false;
            }
            let launched = tokio::select! {
                () = shutdown_requested(shutdown) => return false,
                result = self.launch_ready(entry) => result,
            };

            match launched {
                Ok(reported_url) => {
                    let pid = entry.child.lock().await.as_ref().and_then(|r| r.child.id());
                    let running = self.transition(&entry.id, &entry.status, TunnelState::Running, |s| {
                        s.pid = pid;
                        s.started_at = Some(SystemTime::now());
                        if reported_url.is_some() {
                            s.public_url = reported_url;
                        }
                        s.last_error = None;
                    });
                    return running.is_ok();
                }
                Err(e) => {
                    last_error = e.to_string();
                    if self
                        .transition(&entry.id, &entry.status, TunnelState::Crashed, |s| {
                            s.pid = None;
                            s.last_error = Some(last_error.clone());
                        })
                        .is_err()
                    {
                        return false;
                    }
                }
            }
        }

        let failure = TunnelError::RestartsExhausted {
            tunnel_id: entry.id.clone(),
            attempts: attempt,
            last_error,
        };
        error!(tunnel_id = %entry.id, error = %failure, "Giving up on tunnel");
        let _ = self.transition(&entry.id, &entry.status, TunnelState::Failed, |s| {
            s.last_error = Some(failure.to_string());
        });
        self.registry.lock().await.remove(&entry.id);
        false
    }
}

/// Per-tunnel liveness loop. Ends on stop, on `Failed` or when the
/// supervisor is gone; in the last case the client dies with the entry.
async fn monitor(inner: Weak<Inner>, entry: Arc<Entry>) {
    let Some(interval) = inner.upgrade().map(|i| i.options.monitor_interval) else {
        return;
    };
    let mut shutdown = entry.shutdown.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown_requested(&mut shutdown) => return,
            _ = ticker.tick() => {}
        }

        if inner.strong_count() == 0 {
            debug!(tunnel_id = %entry.id, "Supervisor dropped, releasing tunnel client");
            return;
        }

        let exited = {
            let mut guard = entry.child.lock().await;
            let Some(running) = guard.as_mut() else {
                return;
            };
            running.tail.drain(&mut running.output);
            match running.child.try_wait() {
                Ok(Some(exit)) => {
                    running
                        .tail
                        .drain_until_closed(&mut running.output, EXIT_OUTPUT_GRACE)
                        .await;
                    Some((exit, running.tail.lines()))
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(tunnel_id = %entry.id, error = %e, "Liveness check failed");
                    None
                }
            }
        };

        let Some((exit, output)) = exited else {
            continue;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.recover(&entry, exit, output, &mut shutdown).await {
            return;
        }
    }
}

/// Cleans up a `start` whose future was dropped before it finished.
struct PendingStart<'a> {
    inner: &'a Arc<Inner>,
    entry: Arc<Entry>,
    armed: bool,
}

impl PendingStart<'_> {
    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let entry = &self.entry;
        debug!(tunnel_id = %entry.id, "Start cancelled, releasing tunnel client");
        let _ = self
            .inner
            .transition(&entry.id, &entry.status, TunnelState::Stopping, |_| {});
        // Busy only while the readiness wait is still being dropped; the
        // child then dies with the last reference to the entry.
        if let Ok(mut slot) = entry.child.try_lock() {
            slot.take();
        }
        let _ = self
            .inner
            .transition(&entry.id, &entry.status, TunnelState::Stopped, |s| {
                s.pid = None;
            });

        if let Ok(mut registry) = self.inner.registry.try_lock() {
            registry.remove(&entry.id);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(tunnel_id = %entry.id, "Cancelled start outside a runtime, entry left registered");
            return;
        };
        let inner = Arc::clone(self.inner);
        let id = entry.id.clone();
        runtime.spawn(async move {
            inner.registry.lock().await.remove(&id);
        });
    }
}

/// Wait for the stopper to finish and describe where the tunnel ended up.
async fn closed_after_stop(
    tunnel_id: &str,
    status: &mut watch::Receiver<TunnelStatus>,
) -> TunnelError {
    let waited = status
        .wait_for(|s| s.state.is_terminal())
        .await
        .map(|settled| settled.clone());
    let settled = match waited {
        Ok(settled) => settled,
        Err(_) => status.borrow().clone(),
    };
    TunnelError::Closed {
        tunnel_id: tunnel_id.to_string(),
        state: settled.state,
        last_error: settled.last_error,
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A closed channel means the entry is gone; treat it as a stop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Random DNS-safe subdomain: 12 lowercase hex characters.
fn random_subdomain() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

fn proxy_name_for(tunnel_id: &str) -> String {
    let short: String = tunnel_id.chars().take(8).collect();
    format!("frpgate-{short}")
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
