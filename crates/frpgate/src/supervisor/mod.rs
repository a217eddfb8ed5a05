//! Supervision of frpc client processes.
//!
//! [`ProcessSupervisor`] spawns a client per tunnel, waits for the server to
//! accept the proxy, restarts crashed clients with backoff and stops them
//! gracefully. Callers interact through [`TunnelHandle`].

pub mod handle;
pub mod manager;
pub mod policy;
pub mod process;
pub mod readiness;
pub mod render;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use handle::TunnelHandle;
pub use manager::{BinarySource, ProcessSupervisor, StopOutcome, SupervisorOptions, TunnelEvent};
pub use policy::BackoffPolicy;
pub use process::{ExitInfo, FrpcLauncher, LaunchSpec, Launched, Launcher, TunnelChild};
pub use state::{TunnelState, TunnelStatus};
