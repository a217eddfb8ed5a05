//! Tunnel lifecycle state machine.
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Stopped
//!                     Running -> Crashed -> Restarting -> Starting
//!                                Crashed -> Failed
//! ```
//!
//! `Stopped` and `Failed` are terminal.

use std::fmt;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    Idle,
    Starting,
    Running,
    Crashed,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

impl TunnelState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use TunnelState::{Crashed, Failed, Idle, Restarting, Running, Starting, Stopped, Stopping};
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running | Crashed | Stopping | Failed)
                | (Running, Crashed | Stopping)
                | (Crashed, Restarting | Stopping | Failed)
                | (Restarting, Starting | Stopping | Failed)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Restarting => "restarting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of one tunnel, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub restart_count: u32,
    /// Set while `Running`; kept across restarts.
    pub public_url: Option<String>,
    pub last_error: Option<String>,
}

impl Default for TunnelStatus {
    fn default() -> Self {
        Self {
            state: TunnelState::Idle,
            pid: None,
            started_at: None,
            restart_count: 0,
            public_url: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TunnelState::*;

    const ALL: [TunnelState; 8] = [
        Idle, Starting, Running, Crashed, Restarting, Stopping, Stopped, Failed,
    ];

    #[test]
    fn graceful_path() {
        assert!(Idle.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn crash_loop() {
        assert!(Running.can_transition_to(Crashed));
        assert!(Crashed.can_transition_to(Restarting));
        assert!(Restarting.can_transition_to(Starting));
        assert!(Crashed.can_transition_to(Failed));
    }

    #[test]
    fn terminal_states_are_sinks() {
        for next in ALL {
            assert!(!Stopped.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
        assert!(Stopped.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn no_shortcuts() {
        assert!(!Idle.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn default_status_is_idle() {
        let status = TunnelStatus::default();
        assert_eq!(status.state, Idle);
        assert_eq!(status.restart_count, 0);
        assert!(status.public_url.is_none());
    }
}
