//! Caller-side view of one supervised tunnel.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::manager::{Inner, StopOutcome};
use super::state::{TunnelState, TunnelStatus};
use crate::config::TunnelConfig;
use crate::error::TunnelError;

/// Handle to a started tunnel.
///
/// Holds only a weak reference into the supervisor: a handle that outlives
/// it keeps reporting the last known status. Dropping a live handle stops
/// the tunnel in the background; call [`close`](Self::close) to wait for it.
pub struct TunnelHandle {
    id: String,
    config: TunnelConfig,
    status: watch::Receiver<TunnelStatus>,
    supervisor: Weak<Inner>,
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TunnelHandle {
    pub(super) const fn new(
        id: String,
        config: TunnelConfig,
        status: watch::Receiver<TunnelStatus>,
        supervisor: Weak<Inner>,
    ) -> Self {
        Self {
            id,
            config,
            status,
            supervisor,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Effective configuration, including an assigned subdomain.
    pub const fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> TunnelState {
        self.status.borrow().state
    }

    pub fn status(&self) -> TunnelStatus {
        self.status.borrow().clone()
    }

    /// Public URL, only while `Running`.
    pub fn public_url(&self) -> Option<String> {
        let status = self.status.borrow();
        if status.state == TunnelState::Running {
            status.public_url.clone()
        } else {
            None
        }
    }

    /// Wait until the tunnel is `Running`.
    ///
    /// Fails with [`TunnelError::Closed`] if it reaches a terminal state
    /// first and with [`TunnelError::TunnelStartTimeout`] after `timeout`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), TunnelError> {
        let mut status = self.status.clone();
        let waited = tokio::time::timeout(
            timeout,
            status.wait_for(|s| s.state == TunnelState::Running || s.state.is_terminal()),
        )
        .await;

        let settled = match waited {
            Err(_) => {
                return Err(TunnelError::TunnelStartTimeout {
                    tunnel_id: self.id.clone(),
                    waited_ms: timeout.as_millis(),
                });
            }
            Ok(Ok(current)) => current.clone(),
            // Sender gone without a matching state: report what we last saw.
            Ok(Err(_)) => self.status(),
        };

        if settled.state == TunnelState::Running {
            Ok(())
        } else {
            Err(TunnelError::Closed {
                tunnel_id: self.id.clone(),
                state: settled.state,
                last_error: settled.last_error,
            })
        }
    }

    /// Stop the tunnel and return its final state. Idempotent.
    pub async fn close(&self) -> Result<TunnelState, TunnelError> {
        let Some(inner) = self.supervisor.upgrade() else {
            debug!(tunnel_id = %self.id, "Supervisor gone, nothing to close");
            return Ok(self.state());
        };
        let outcome = inner.stop_tunnel(&self.id, self.state()).await?;
        debug!(tunnel_id = %self.id, outcome = ?outcome, "Tunnel closed");
        Ok(match outcome {
            StopOutcome::AlreadyStopped(state) => state,
            StopOutcome::Graceful { .. } | StopOutcome::Killed => self.state(),
        })
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        let Some(inner) = self.supervisor.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(tunnel_id = %self.id, "Tunnel handle dropped outside a runtime, not stopping it");
            return;
        };
        let id = self.id.clone();
        let last_known = self.state();
        runtime.spawn(async move {
            if let Err(e) = inner.stop_tunnel(&id, last_known).await {
                warn!(tunnel_id = %id, error = %e, "Failed to stop dropped tunnel");
            }
        });
    }
}
