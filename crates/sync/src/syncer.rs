//! One sync pass: desired state in, config file and daemon signal out.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::counter;
use onion_core::Settings;
use onion_kubehub::DesiredCache;
use tracing::{debug, info};

use crate::status::StatusReporter;
use crate::{torrc, DaemonControl, StatusSink};

pub struct Syncer<D, S> {
    cache: Arc<DesiredCache>,
    daemon: D,
    reporter: StatusReporter<S>,
    settings: Settings,
}

impl<D: DaemonControl, S: StatusSink> Syncer<D, S> {
    pub fn new(
        cache: Arc<DesiredCache>,
        daemon: D,
        reporter: StatusReporter<S>,
        settings: Settings,
    ) -> Self {
        Self { cache, daemon, reporter, settings }
    }

    /// Bring the daemon in line with the current cache state for `key`.
    ///
    /// Re-running with no upstream change does not disturb a running
    /// daemon: no write, no reload, and no status update. A stopped
    /// daemon whose config is already current is started anyway. Errors
    /// bubble up uninterpreted and become queue-level failures.
    pub async fn sync(&self, key: &str) -> Result<()> {
        let Some(svc) = self.cache.get() else {
            info!(key, "resource no longer exists; stopping daemon");
            self.daemon.stop().await;
            return Ok(());
        };

        let rendered = torrc::render(&svc, &self.settings)?;
        let current = match tokio::fs::read(&self.settings.config_path).await {
            Ok(bytes) => Some(bytes),
            // Absent file is a valid initial state: write and reload.
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e).context("reading current config"),
        };

        if current.as_deref() != Some(rendered.as_bytes()) {
            info!(key, path = %self.settings.config_path.display(), "config changed; applying");
            write_atomic(&self.settings.config_path, rendered.as_bytes())
                .context("writing config")?;
            // Write is durable before the daemon is told to re-read it.
            self.daemon.reload().await?;
            counter!("config_reloads_total", 1u64);
        } else if !self.daemon.is_running().await {
            // The file survived a stop (delete then recreate with the
            // same spec, or a manager restart), so the byte comparison
            // alone would leave the daemon down forever.
            info!(key, "config current but daemon not running; starting");
            self.daemon.reload().await?;
        } else {
            debug!(key, "config unchanged");
        }

        self.reporter.refresh(&svc).await
    }
}

/// Write via a temp file in the target directory and rename over the
/// destination, so the daemon never observes a partially written config.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
