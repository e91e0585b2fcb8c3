//! Encryption secret for the supervised process
//!
//! The backend encrypts its stored credentials with this secret, so it is
//! generated once and then only ever read. A failure to read an existing
//! secret is reported as "unavailable" rather than silently regenerated,
//! since a fresh secret would orphan everything encrypted with the old one.

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Length of the generated secret in bytes (256 bits)
const SECRET_LENGTH: usize = 32;

/// Source of the backend encryption secret
pub trait KeyProvider: Send + Sync {
    /// Return the existing secret, creating one only if none was ever stored.
    /// `None` means the secret is unavailable and the launch must not proceed.
    fn get_or_create_secret(&self) -> Option<String>;
}

/// Stores the secret in a single file readable only by the owner
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_existing(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let secret = content.trim().to_string();
                if secret.is_empty() {
                    anyhow::bail!("Secret file {} is empty", self.path.display());
                }
                Ok(Some(secret))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read secret file"),
        }
    }

    fn create(&self) -> Result<String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let secret = generate_secret();

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&self.path)
            .context("Failed to create secret file")?;
        writeln!(file, "{}", secret)?;
        file.sync_all()?;

        info!(path = %self.path.display(), "Generated new encryption secret");
        Ok(secret)
    }
}

impl KeyProvider for FileKeyProvider {
    fn get_or_create_secret(&self) -> Option<String> {
        match self.read_existing() {
            Ok(Some(secret)) => Some(secret),
            Ok(None) => match self.create() {
                Ok(secret) => Some(secret),
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "Could not create encryption secret");
                    None
                }
            },
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Encryption secret unavailable");
                None
            }
        }
    }
}

/// Generate a random secret, base64 encoded
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}
