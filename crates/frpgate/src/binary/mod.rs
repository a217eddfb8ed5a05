//! Acquisition of the frpc client executable.
//!
//! Resolves the release archive for a platform, downloads and extracts it,
//! verifies it against an optional checksum registry and caches the result.

pub mod acquirer;
pub mod archive;
pub mod checksum;

pub use acquirer::{AcquirerOptions, BinaryAcquirer, BinaryArtifact};
pub use checksum::ChecksumRegistry;
