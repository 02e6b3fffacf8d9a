//! Mirrors daemon-emitted facts back into the resource status.

use std::path::PathBuf;

use anyhow::Result;
use onion_kubehub::OnionService;
use tracing::{debug, info};

use crate::StatusSink;

pub struct StatusReporter<S> {
    sink: S,
    hostname_path: PathBuf,
}

impl<S: StatusSink> StatusReporter<S> {
    pub fn new(sink: S, hostname_path: PathBuf) -> Self {
        Self { sink, hostname_path }
    }

    /// Read the hostname file the daemon writes after startup and push it
    /// upstream when it differs from the last-reported value. A missing
    /// or unreadable file means the daemon has not finished initializing;
    /// that is an empty observation, not an error.
    pub async fn refresh(&self, svc: &OnionService) -> Result<()> {
        let observed = match tokio::fs::read_to_string(&self.hostname_path).await {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                debug!(path = %self.hostname_path.display(), error = %e, "hostname not readable yet");
                String::new()
            }
        };

        let reported = svc.status.as_ref().map(|s| s.hostname.as_str()).unwrap_or("");
        if observed != reported {
            let name = svc.metadata.name.as_deref().unwrap_or_default();
            info!(hostname = %observed, "publishing observed hostname");
            self.sink.publish_hostname(name, &observed).await?;
        }
        Ok(())
    }
}
