//! Config synchronization: renders the desired state into the daemon's
//! config grammar, applies it on change only, and mirrors daemon-reported
//! status back to the control plane.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub mod controller;
pub mod status;
pub mod syncer;
pub mod torrc;

pub use controller::Controller;
pub use status::StatusReporter;
pub use syncer::Syncer;

/// Seam to the process supervisor. The synchronizer only ever asks for a
/// reload (which starts the daemon if needed) or a stop; it never touches
/// the process directly.
#[async_trait]
pub trait DaemonControl: Send + Sync {
    async fn reload(&self) -> Result<()>;
    async fn stop(&self);
    /// Whether the daemon is currently supervised. Drives the restart of
    /// a stopped daemon whose config is already on disk.
    async fn is_running(&self) -> bool;
}

#[async_trait]
impl DaemonControl for Arc<onion_daemon::Supervisor> {
    async fn reload(&self) -> Result<()> {
        onion_daemon::Supervisor::reload(self)
    }

    async fn stop(&self) {
        onion_daemon::Supervisor::stop(self);
    }

    async fn is_running(&self) -> bool {
        onion_daemon::Supervisor::is_supervising(self)
    }
}

/// Seam to the control plane's status update verb.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish_hostname(&self, name: &str, hostname: &str) -> Result<()>;
}

#[async_trait]
impl StatusSink for onion_kubehub::KubeStatusWriter {
    async fn publish_hostname(&self, name: &str, hostname: &str) -> Result<()> {
        onion_kubehub::KubeStatusWriter::publish_hostname(self, name, hostname).await
    }
}
