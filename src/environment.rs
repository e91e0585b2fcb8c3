//! The fixed set of variables the supervised process is launched with

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const HOME: &str = "HOME";
pub const USER_FOLDER: &str = "N8N_USER_FOLDER";
pub const LIBRARY_PATH: &str = "LD_LIBRARY_PATH";
pub const EXECUTABLE_PATH: &str = "PATH";
pub const LISTEN_PORT: &str = "N8N_PORT";
pub const LISTEN_HOST: &str = "N8N_HOST";
pub const LISTEN_ADDRESS: &str = "N8N_LISTEN_ADDRESS";
pub const ENCRYPTION_KEY: &str = "N8N_ENCRYPTION_KEY";
pub const STORAGE_ENGINE: &str = "DB_TYPE";
pub const RUNTIME_OPTIONS: &str = "NODE_OPTIONS";

/// Storage engine selected for the supervised process
const STORAGE_ENGINE_VALUE: &str = "sqlite";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("encryption secret unavailable")]
    SecretUnavailable,
    #[error("encryption secret is empty")]
    EmptySecret,
}

/// Inputs for one launch
pub struct EnvironmentInputs<'a> {
    pub runtime_root: &'a Path,
    pub data_root: &'a Path,
    pub host: Ipv4Addr,
    pub port: u16,
    pub memory_limit_mb: u32,
    /// Host `PATH` appended after the runtime bin directory
    pub inherited_path: Option<OsString>,
}

/// Complete environment for one launch of the supervised process.
///
/// Either every key is present or the contract does not exist: `build` has no
/// partial result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentContract {
    vars: BTreeMap<&'static str, OsString>,
}

impl EnvironmentContract {
    pub fn build(
        inputs: &EnvironmentInputs<'_>,
        secret: Option<String>,
    ) -> Result<Self, EnvironmentError> {
        let secret = secret.ok_or(EnvironmentError::SecretUnavailable)?;
        if secret.trim().is_empty() {
            return Err(EnvironmentError::EmptySecret);
        }

        let bin_dir = inputs.runtime_root.join("bin");
        let lib_dir = inputs.runtime_root.join("lib");

        let mut search_path = vec![bin_dir];
        if let Some(inherited) = &inputs.inherited_path {
            search_path.extend(std::env::split_paths(inherited));
        }
        let search_path = std::env::join_paths(search_path)
            .unwrap_or_else(|_| inputs.runtime_root.join("bin").into_os_string());

        let host = inputs.host.to_string();
        let data_root: OsString = inputs.data_root.as_os_str().to_owned();

        let mut vars = BTreeMap::new();
        vars.insert(HOME, data_root.clone());
        vars.insert(USER_FOLDER, data_root);
        vars.insert(LIBRARY_PATH, lib_dir.into_os_string());
        vars.insert(EXECUTABLE_PATH, search_path);
        vars.insert(LISTEN_PORT, inputs.port.to_string().into());
        vars.insert(LISTEN_HOST, host.clone().into());
        vars.insert(LISTEN_ADDRESS, host.into());
        vars.insert(ENCRYPTION_KEY, secret.into());
        vars.insert(STORAGE_ENGINE, STORAGE_ENGINE_VALUE.into());
        vars.insert(
            RUNTIME_OPTIONS,
            format!("--max-old-space-size={}", inputs.memory_limit_mb).into(),
        );

        Ok(Self { vars })
    }

    pub fn get(&self, key: &str) -> Option<&OsString> {
        self.vars.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &OsString)> {
        self.vars.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Apply to a command, leaving the rest of the inherited environment intact
    pub fn apply(&self, cmd: &mut tokio::process::Command) {
        for (key, value) in &self.vars {
            cmd.env(key, value);
        }
    }
}

/// Directory holding the executables of a runtime bundle
pub fn bin_dir(runtime_root: &Path) -> PathBuf {
    runtime_root.join("bin")
}
