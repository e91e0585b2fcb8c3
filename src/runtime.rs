//! Download, verify and install the runtime bundle
//!
//! Acquisition has two phases:
//! 1. Describe: fetch the release index, find the archive and descriptor
//!    assets, fetch and parse the descriptor
//! 2. Acquire + install: stream the archive to a staging file, check its
//!    SHA-256 against the descriptor, then unpack it next to the runtime
//!    directory and swap it into place
//!
//! "Installed" means exactly one thing: the entry-point executable exists at
//! `<runtime>/bin/<entry>`. Every failure path leaves that file absent.

use crate::config::RuntimeConfig;
use crate::environment::bin_dir;
use crate::shutdown;
use flate2::read::GzDecoder;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Name of the staged download inside the staging directory
const STAGED_ARCHIVE: &str = "runtime.tar.gz.partial";

/// Connect timeout for release metadata and archive requests
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// What a release says about its runtime archive
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuntimeDescriptor {
    pub version: String,
    pub backend_version: String,
    /// Hex SHA-256 of the archive, compared case-insensitively
    pub digest: String,
    pub download_url: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseIndex {
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("release metadata unavailable: {0}")]
    Describe(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("digest mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("install failed: {0}")]
    Install(String),
    #[error("entry point missing after install: {0}")]
    EntryPointMissing(PathBuf),
    #[error("acquisition cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for AcquisitionError {
    fn from(err: reqwest::Error) -> Self {
        AcquisitionError::Download(err.to_string())
    }
}

/// Progress sink receiving a fraction in `[0, 1]`
pub type ProgressFn<'a> = dyn Fn(f64) + Send + Sync + 'a;

/// Installs the runtime bundle the supervisor launches.
///
/// Not reentrant: callers must not run two acquisitions at once. The
/// supervisor guarantees this by only acquiring while in `Starting`.
pub struct RuntimeInstaller {
    client: reqwest::Client,
    config: RuntimeConfig,
    runtime_dir: PathBuf,
    staging_dir: PathBuf,
    entry_executable: String,
}

impl RuntimeInstaller {
    pub fn new(
        config: RuntimeConfig,
        runtime_dir: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        entry_executable: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            config,
            runtime_dir: runtime_dir.into(),
            staging_dir: staging_dir.into(),
            entry_executable: entry_executable.into(),
        })
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// The file whose presence defines "runtime installed"
    pub fn entry_point(&self) -> PathBuf {
        bin_dir(&self.runtime_dir).join(&self.entry_executable)
    }

    pub fn is_installed(&self) -> bool {
        self.entry_point().is_file()
    }

    fn staged_archive(&self) -> PathBuf {
        self.staging_dir.join(STAGED_ARCHIVE)
    }

    /// Phase 1. Fails closed: any problem yields `None`.
    pub async fn describe(&self) -> Option<RuntimeDescriptor> {
        match self.try_describe().await {
            Ok(descriptor) => {
                info!(
                    version = %descriptor.version,
                    backend_version = %descriptor.backend_version,
                    "Runtime release described"
                );
                Some(descriptor)
            }
            Err(e) => {
                warn!(url = %self.config.release_index_url, error = %e, "No runtime descriptor");
                None
            }
        }
    }

    async fn try_describe(&self) -> Result<RuntimeDescriptor, AcquisitionError> {
        let index: ReleaseIndex = self
            .client
            .get(&self.config.release_index_url)
            .header("Accept", "application/json")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AcquisitionError::Describe(e.to_string()))?
            .json()
            .await
            .map_err(|e| AcquisitionError::Describe(format!("malformed release index: {}", e)))?;

        let find = |name: &str| {
            index
                .assets
                .iter()
                .find(|a| a.name == name)
                .map(|a| a.browser_download_url.clone())
                .ok_or_else(|| AcquisitionError::Describe(format!("asset '{}' not in release", name)))
        };
        // Both must be present even though only the descriptor is fetched here
        find(&self.config.artifact_asset)?;
        let descriptor_url = find(&self.config.descriptor_asset)?;

        let descriptor: RuntimeDescriptor = self
            .client
            .get(&descriptor_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AcquisitionError::Describe(e.to_string()))?
            .json()
            .await
            .map_err(|e| AcquisitionError::Describe(format!("malformed descriptor: {}", e)))?;

        if descriptor.digest.trim().is_empty() || descriptor.download_url.trim().is_empty() {
            return Err(AcquisitionError::Describe("descriptor is missing digest or url".into()));
        }

        Ok(descriptor)
    }

    /// Phase 2: download, verify, install. The staged archive is removed on
    /// every exit path.
    pub async fn acquire_and_install(
        &self,
        descriptor: &RuntimeDescriptor,
        progress: &ProgressFn<'_>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), AcquisitionError> {
        let staged = self.download(descriptor, progress, cancel).await?;

        let result = self.verify_and_install(descriptor, &staged).await;
        remove_quietly(&staged);
        result
    }

    /// Both phases end to end. Returns whether the runtime is now installed.
    pub async fn install_latest(&self, progress: &ProgressFn<'_>, cancel: &mut watch::Receiver<bool>) -> bool {
        let Some(descriptor) = self.describe().await else {
            return false;
        };

        match self.acquire_and_install(&descriptor, progress, cancel).await {
            Ok(()) => {
                info!(version = %descriptor.version, path = %self.runtime_dir.display(), "Runtime installed");
                true
            }
            Err(AcquisitionError::Integrity { expected, actual }) => {
                error!(%expected, %actual, "Runtime archive failed integrity check, discarded");
                false
            }
            Err(e) => {
                error!(error = %e, "Runtime acquisition failed");
                false
            }
        }
    }

    async fn download(
        &self,
        descriptor: &RuntimeDescriptor,
        progress: &ProgressFn<'_>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<PathBuf, AcquisitionError> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staged = self.staged_archive();

        let result = self.stream_to(&staged, descriptor, progress, cancel).await;
        if result.is_err() {
            remove_quietly(&staged);
        }
        result.map(|_| staged)
    }

    async fn stream_to(
        &self,
        staged: &Path,
        descriptor: &RuntimeDescriptor,
        progress: &ProgressFn<'_>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), AcquisitionError> {
        if *cancel.borrow() {
            return Err(AcquisitionError::Cancelled);
        }

        let mut response = tokio::select! {
            response = self.client.get(&descriptor.download_url).send() => response?.error_for_status()?,
            _ = shutdown::requested(cancel) => return Err(AcquisitionError::Cancelled),
        };

        let total = response.content_length().filter(|len| *len > 0);
        let mut file = tokio::fs::File::create(staged).await?;
        let mut received: u64 = 0;
        let mut reported = 0.0_f64;

        info!(url = %descriptor.download_url, total_bytes = ?total, "Downloading runtime archive");
        progress(0.0);

        loop {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk?,
                _ = shutdown::requested(cancel) => {
                    warn!(received, "Runtime download cancelled");
                    return Err(AcquisitionError::Cancelled);
                }
            };
            let Some(chunk) = chunk else { break };

            file.write_all(&chunk).await?;
            received += chunk.len() as u64;

            if let Some(total) = total {
                let fraction = (received as f64 / total as f64).min(1.0);
                if fraction > reported {
                    reported = fraction;
                    progress(fraction);
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(total) = total {
            if received != total {
                return Err(AcquisitionError::Download(format!(
                    "truncated transfer: {} of {} bytes",
                    received, total
                )));
            }
        }

        debug!(received, path = %staged.display(), "Runtime archive staged");
        Ok(())
    }

    async fn verify_and_install(
        &self,
        descriptor: &RuntimeDescriptor,
        staged: &Path,
    ) -> Result<(), AcquisitionError> {
        let path = staged.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || file_sha256(&path))
            .await
            .map_err(|e| AcquisitionError::Install(e.to_string()))??;

        if !digest_matches(&descriptor.digest, &actual) {
            return Err(AcquisitionError::Integrity {
                expected: descriptor.digest.clone(),
                actual,
            });
        }
        debug!(digest = %actual, "Runtime archive digest verified");

        let runtime_dir = self.runtime_dir.clone();
        let entry = self.entry_executable.clone();
        let archive = staged.to_path_buf();
        tokio::task::spawn_blocking(move || install_archive(&archive, &runtime_dir, &entry))
            .await
            .map_err(|e| AcquisitionError::Install(e.to_string()))?
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove staged archive");
        }
    }
}

/// Hex SHA-256 of a file's contents
pub fn file_sha256(path: &Path) -> Result<String, AcquisitionError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compare an expected digest (optionally `sha256:`-prefixed) to a computed one
pub fn digest_matches(expected: &str, actual: &str) -> bool {
    let expected = expected.trim();
    let expected = expected.strip_prefix("sha256:").unwrap_or(expected);
    expected.eq_ignore_ascii_case(actual)
}

/// Unpack `archive` into a sibling of `runtime_dir`, check the entry point,
/// then replace `runtime_dir` with it.
pub fn install_archive(archive: &Path, runtime_dir: &Path, entry_executable: &str) -> Result<(), AcquisitionError> {
    let unpack_dir = sibling(runtime_dir, "partial");
    if unpack_dir.exists() {
        std::fs::remove_dir_all(&unpack_dir)?;
    }

    let result = unpack_and_check(archive, &unpack_dir, entry_executable)
        .and_then(|()| swap_into_place(&unpack_dir, runtime_dir));

    if result.is_err() && unpack_dir.exists() {
        let _ = std::fs::remove_dir_all(&unpack_dir);
    }
    result
}

fn unpack_and_check(archive: &Path, dest: &Path, entry_executable: &str) -> Result<(), AcquisitionError> {
    std::fs::create_dir_all(dest)?;

    let reader = BufReader::new(File::open(archive)?);
    let mut tarball = tar::Archive::new(GzDecoder::new(reader));
    tarball.set_preserve_permissions(true);
    tarball.set_overwrite(true);
    tarball
        .unpack(dest)
        .map_err(|e| AcquisitionError::Install(format!("extract failed: {}", e)))?;

    normalize_permissions(dest)?;

    let entry = bin_dir(dest).join(entry_executable);
    if !entry.is_file() {
        return Err(AcquisitionError::EntryPointMissing(
            PathBuf::from("bin").join(entry_executable),
        ));
    }
    make_executable(&entry)?;
    Ok(())
}

fn swap_into_place(unpacked: &Path, runtime_dir: &Path) -> Result<(), AcquisitionError> {
    if runtime_dir.exists() {
        std::fs::remove_dir_all(runtime_dir)
            .map_err(|e| AcquisitionError::Install(format!("failed to wipe old runtime: {}", e)))?;
    }
    if let Some(parent) = runtime_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(unpacked, runtime_dir)
        .map_err(|e| AcquisitionError::Install(format!("failed to move runtime into place: {}", e)))?;
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Directories and executables become 0755, other files 0644. Symlinks are
/// left alone so their targets are never touched.
#[cfg(unix)]
pub fn normalize_permissions(root: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755))?;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = std::fs::symlink_metadata(entry.path())?;
            let file_type = meta.file_type();
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                pending.push(entry.path());
            } else {
                let mode = if meta.permissions().mode() & 0o111 != 0 { 0o755 } else { 0o644 };
                std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn normalize_permissions(_root: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
