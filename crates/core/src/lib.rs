//! Core types shared across the onion local manager crates.

#![forbid(unsafe_code)]

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity of the single managed resource, used as the work queue key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object key: {0} (expect namespace/name)")]
pub struct ParseKeyError(pub String);

impl FromStr for ObjectKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {
                Ok(Self::new(ns, name))
            }
            _ => Err(ParseKeyError(s.to_string())),
        }
    }
}

/// Everything the long-lived tasks need to know at startup. Built once by
/// the binary and handed into constructors; there is no process-global
/// mutable configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the managed tor config file.
    pub config_path: PathBuf,
    /// Hidden service directory; tor writes `hostname` here after startup.
    pub service_dir: PathBuf,
    /// Path the rendered config points the private key at.
    pub private_key_path: PathBuf,
    /// Binary to supervise.
    pub tor_binary: PathBuf,
    /// Fixed delay before restarting an exited daemon.
    pub restart_delay: Duration,
    /// Settle delay applied to every notification before it is processed,
    /// coalescing bursts of updates into one sync pass.
    pub settle_delay: Duration,
    /// Failed syncs per key before the key is dropped from the queue.
    pub max_retries: u32,
    /// Concurrent sync workers.
    pub workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/run/tor/torfile"),
            service_dir: PathBuf::from("/run/tor/service"),
            private_key_path: PathBuf::from("/run/tor/private_key"),
            tor_binary: PathBuf::from("tor"),
            restart_delay: Duration::from_secs(1),
            settle_delay: Duration::from_secs(2),
            max_retries: 5,
            workers: 1,
        }
    }
}

impl Settings {
    pub fn hostname_path(&self) -> PathBuf {
        self.service_dir.join("hostname")
    }

    pub fn service_dir(&self) -> &Path {
        &self.service_dir
    }
}

/// Config rendering failures. These are permanent for a given desired
/// state, but still flow through the queue retry policy like any other
/// sync error.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("unsupported onion service version {0} (expected 2 or 3)")]
    UnsupportedVersion(u8),
}
