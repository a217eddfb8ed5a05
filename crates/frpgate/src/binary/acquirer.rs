//! Download, extraction and caching of the frpc binary.
//!
//! The cache holds one executable per `(platform, version)` at a
//! deterministic path. Acquisition takes an exclusive file lock next to the
//! target, stages everything in a scoped temp dir inside the cache root and
//! renames into place only once the executable is complete and verified.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use frpgate_core::config::TunnelSettings;

use super::archive::{self, ArchiveKind};
use super::checksum::{self, ChecksumRegistry};
use crate::error::TunnelError;
use crate::platform::PlatformDescriptor;

/// Tunables for a [`BinaryAcquirer`].
#[derive(Debug, Clone)]
pub struct AcquirerOptions {
    /// Base URL; archives live at `<base>/v<version>/frp_<version>_<os>_<arch>.<ext>`.
    pub release_base_url: String,
    /// Upper bound for the whole download.
    pub timeout: Duration,
    /// Expected digests by download URL.
    pub checksums: ChecksumRegistry,
}

impl Default for AcquirerOptions {
    fn default() -> Self {
        Self {
            release_base_url: frpgate_core::config::DEFAULT_RELEASE_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
            checksums: ChecksumRegistry::default(),
        }
    }
}

impl AcquirerOptions {
    pub fn from_settings(settings: &TunnelSettings) -> Self {
        Self {
            release_base_url: settings.release_base_url.clone(),
            timeout: Duration::from_secs(settings.download_timeout_secs),
            checksums: settings.checksums.clone().into_iter().collect(),
        }
    }
}

/// One cached client executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryArtifact {
    pub version: String,
    pub platform: PlatformDescriptor,
    pub local_path: PathBuf,
    /// `true` only when a registered checksum matched.
    pub verified: bool,
}

/// Keeps a verified frpc executable available under `cache_root`.
#[derive(Debug, Clone)]
pub struct BinaryAcquirer {
    cache_root: PathBuf,
    options: AcquirerOptions,
    http: reqwest::Client,
}

impl BinaryAcquirer {
    pub fn new(cache_root: impl Into<PathBuf>, options: AcquirerOptions) -> Result<Self, TunnelError> {
        // reqwest is built with rustls-no-provider; an `Err` means a provider
        // is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.timeout.min(Duration::from_secs(15)))
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(concat!("frpgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TunnelError::config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            cache_root: cache_root.into(),
            options,
            http,
        })
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Cache path for `(version, platform)`. Pure, no I/O.
    pub fn binary_path(&self, version: &str, platform: &PlatformDescriptor) -> PathBuf {
        self.cache_root.join(format!(
            "frpc_{platform}_v{}{}",
            normalize_version(version),
            platform.exe_suffix()
        ))
    }

    /// Release archive URL for `(version, platform)`.
    pub fn download_url(&self, version: &str, platform: &PlatformDescriptor) -> String {
        let version = normalize_version(version);
        format!(
            "{}/v{version}/frp_{version}_{platform}.{}",
            self.options.release_base_url.trim_end_matches('/'),
            platform.archive_ext()
        )
    }

    fn lock_path(&self, version: &str, platform: &PlatformDescriptor) -> PathBuf {
        self.cache_root.join(format!(
            ".frpc_{platform}_v{}.lock",
            normalize_version(version)
        ))
    }

    /// Ensure the executable exists and return its path.
    pub async fn ensure_binary(
        &self,
        version: &str,
        platform: &PlatformDescriptor,
        force: bool,
    ) -> Result<PathBuf, TunnelError> {
        self.ensure_artifact(version, platform, force)
            .await
            .map(|artifact| artifact.local_path)
    }

    /// Ensure the executable exists and describe it.
    ///
    /// A warm cache returns without touching the network. Failures are not
    /// retried here.
    pub async fn ensure_artifact(
        &self,
        version: &str,
        platform: &PlatformDescriptor,
        force: bool,
    ) -> Result<BinaryArtifact, TunnelError> {
        validate_version(version)?;
        let version = normalize_version(version).to_string();
        let path = self.binary_path(&version, platform);
        let url = self.download_url(&version, platform);

        if !force && path.exists() {
            debug!(path = %path.display(), "frpc binary already cached");
            return self.cached_artifact(version, platform, path, &url).await;
        }

        tokio::fs::create_dir_all(&self.cache_root).await?;
        let _lock = acquire_lock(self.lock_path(&version, platform)).await?;

        // Another caller may have finished while we waited for the lock.
        if !force && path.exists() {
            debug!(path = %path.display(), "frpc binary appeared while waiting for lock");
            return self.cached_artifact(version, platform, path, &url).await;
        }

        info!(%platform, %version, %url, "Downloading frpc binary");
        let verified = self.download_and_install(&version, platform, &url, &path).await?;
        info!(path = %path.display(), verified, "frpc binary installed");

        Ok(BinaryArtifact {
            version,
            platform: platform.clone(),
            local_path: path,
            verified,
        })
    }

    async fn cached_artifact(
        &self,
        version: String,
        platform: &PlatformDescriptor,
        path: PathBuf,
        url: &str,
    ) -> Result<BinaryArtifact, TunnelError> {
        let verified = match self.options.checksums.get(url) {
            Some(expected) => {
                verify_blocking(path.clone(), expected.to_string(), url.to_string()).await?;
                true
            }
            None => false,
        };
        Ok(BinaryArtifact {
            version,
            platform: platform.clone(),
            local_path: path,
            verified,
        })
    }

    async fn download_and_install(
        &self,
        version: &str,
        platform: &PlatformDescriptor,
        url: &str,
        final_path: &Path,
    ) -> Result<bool, TunnelError> {
        // Same filesystem as the cache so the final rename is atomic. Dropped
        // (and removed) on every exit path, including cancellation.
        let workdir = tempfile::Builder::new()
            .prefix(".frpc-download-")
            .tempdir_in(&self.cache_root)?;
        let archive_path = workdir.path().join(format!("frp.{}", platform.archive_ext()));

        self.download(version, platform, url, &archive_path).await?;

        let exe_name = platform.client_exe_name();
        let kind = ArchiveKind::from_ext(platform.archive_ext());
        let extract_dir = workdir.path().to_path_buf();
        let staged = tokio::task::spawn_blocking(move || {
            archive::extract_member(&archive_path, kind, &exe_name, &extract_dir)
        })
        .await
        .map_err(|e| TunnelError::Io(std::io::Error::other(e)))?
        .map_err(|e| TunnelError::Extraction {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        make_executable(&staged).await?;

        let verified = match self.options.checksums.get(url) {
            Some(expected) => {
                verify_blocking(staged.clone(), expected.to_string(), url.to_string()).await?;
                true
            }
            None => {
                debug!(%url, "No checksum registered, skipping verification");
                false
            }
        };

        tokio::fs::rename(&staged, final_path).await?;
        Ok(verified)
    }

    async fn download(
        &self,
        version: &str,
        platform: &PlatformDescriptor,
        url: &str,
        dest: &Path,
    ) -> Result<(), TunnelError> {
        let download_error = |reason: String| TunnelError::DownloadError {
            platform: platform.clone(),
            version: version.to_string(),
            url: url.to_string(),
            reason,
        };

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TunnelError::PlatformUnsupported {
                platform: platform.clone(),
                version: version.to_string(),
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(download_error(format!("HTTP {status}")));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| download_error(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(bytes = written, dest = %dest.display(), "Archive downloaded");
        Ok(())
    }
}

fn normalize_version(version: &str) -> &str {
    version.trim().trim_start_matches('v')
}

fn validate_version(version: &str) -> Result<(), TunnelError> {
    semver::Version::parse(normalize_version(version))
        .map(|_| ())
        .map_err(|e| TunnelError::config(format!("Invalid frpc version '{version}': {e}")))
}

async fn acquire_lock(path: PathBuf) -> Result<File, TunnelError> {
    tokio::task::spawn_blocking(move || {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            debug!(lock = %path.display(), "Waiting for concurrent frpc download");
            file.lock_exclusive()?;
        }
        Ok::<_, std::io::Error>(file)
    })
    .await
    .map_err(|e| TunnelError::Io(std::io::Error::other(e)))?
    .map_err(TunnelError::from)
}

async fn verify_blocking(path: PathBuf, expected: String, url: String) -> Result<(), TunnelError> {
    let result = tokio::task::spawn_blocking(move || checksum::verify_file(&path, &expected, &url))
        .await
        .map_err(|e| TunnelError::Io(std::io::Error::other(e)))?;
    if let Err(ref e) = result {
        warn!(error = %e, "frpc checksum verification failed");
    }
    result
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    tokio::fs::set_permissions(path, perms).await
}

#[cfg(not(unix))]
#[allow(clippy::unused_async)]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
