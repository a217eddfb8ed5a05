//! frpgate library
//!
//! Exposes a local HTTP service on a public URL through a supervised frpc
//! client:
//! - Platform resolution and frpc binary acquisition with a checksum-verified cache
//! - Immutable tunnel configuration
//! - A process supervisor with readiness probing, crash restarts and graceful stop
//!
//! ```no_run
//! # async fn demo() -> Result<(), frpgate::TunnelError> {
//! use frpgate::{
//!     AcquirerOptions, BinaryAcquirer, BinarySource, ProcessSupervisor, SupervisorOptions,
//!     TunnelConfig, resolve_platform,
//! };
//!
//! let acquirer = BinaryAcquirer::new("/tmp/frpc-cache", AcquirerOptions::default())?;
//! let supervisor = ProcessSupervisor::new(
//!     BinarySource::Managed {
//!         acquirer,
//!         version: "0.61.1".into(),
//!         platform: resolve_platform(),
//!     },
//!     SupervisorOptions::default(),
//! );
//! let config = TunnelConfig::builder("tunnel.getbindu.com:7000", "tunnel.getbindu.com")
//!     .local_port(3773)
//!     .build()?;
//! let handle = supervisor.start(config).await?;
//! println!("{}", handle.public_url().unwrap_or_default());
//! supervisor.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod binary;
pub mod config;
pub mod error;
pub mod platform;
pub mod supervisor;

pub use binary::{AcquirerOptions, BinaryAcquirer, BinaryArtifact, ChecksumRegistry};
pub use config::{Protocol, TunnelConfig, TunnelConfigBuilder};
pub use error::TunnelError;
pub use platform::{Arch, Os, PlatformDescriptor, resolve_platform};
pub use supervisor::{
    BinarySource, ProcessSupervisor, StopOutcome, SupervisorOptions, TunnelEvent, TunnelHandle,
    TunnelState, TunnelStatus,
};
