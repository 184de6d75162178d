//! The controller executes the long verbs on behalf of the state
//! machine: probe, fetch and report. The state machine only sees this
//! trait; the server-backed implementation below is wired in at
//! bootstrap and swapped for a scripted one in tests.

use async_trait::async_trait;
use otad_updates::{FirmwareMetadata, UpdateMetadata};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{FetchOutcome, ProbeOutcome, ServerClient};
use crate::error::{AgentError, Result};
use crate::installer::verify_object;

/// Reports download progress as a percentage of the object group.
pub type ProgressFn = Box<dyn Fn(u8) + Send + Sync>;

#[async_trait]
pub trait Controller: Send + Sync {
    /// Negotiate with the server: an update package, or none, plus an
    /// optional extra-poll request.
    async fn probe(&self, retries: u32) -> Result<ProbeOutcome>;

    /// Download every object of the selected group into the download
    /// dir. Interruptible through the token.
    async fn fetch(
        &self,
        update: &UpdateMetadata,
        group: usize,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome>;

    /// Send the agent's state to the server. Best-effort: the daemon
    /// logs and swallows failures.
    async fn report(
        &self,
        status: &str,
        package_uid: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()>;
}

/// Controller backed by the real update server.
pub struct ServerController {
    client: ServerClient,
    firmware: FirmwareMetadata,
    download_dir: PathBuf,
    progress: Option<ProgressFn>,
}

impl ServerController {
    pub fn new(client: ServerClient, firmware: FirmwareMetadata, download_dir: PathBuf) -> Self {
        Self {
            client,
            firmware,
            download_dir,
            progress: None,
        }
    }

    /// Attach a download progress observer.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    fn publish_progress(&self, done: usize, total: usize) {
        if let Some(progress) = &self.progress {
            let percent = (done * 100 / total.max(1)) as u8;
            progress(percent);
        }
    }
}

#[async_trait]
impl Controller for ServerController {
    async fn probe(&self, retries: u32) -> Result<ProbeOutcome> {
        self.client.probe(&self.firmware, retries).await
    }

    async fn fetch(
        &self,
        update: &UpdateMetadata,
        group: usize,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome> {
        let objects = update
            .objects
            .get(group)
            .ok_or_else(|| AgentError::Fetch(format!("no object group {group}")))?;

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| {
                AgentError::Fetch(format!("creating {}: {e}", self.download_dir.display()))
            })?;

        let package_uid = update.package_uid();
        info!(
            "fetching {} object(s) of group {group} for {package_uid}",
            objects.len()
        );

        for (index, object) in objects.iter().enumerate() {
            // An object already present and intact is not fetched
            // again; partial or stale files are simply overwritten.
            if verify_object(&self.download_dir, &object.sha256sum).is_ok() {
                debug!("object {} already present", object.sha256sum);
            } else {
                let outcome = self
                    .client
                    .fetch_object(
                        &update.product_uid,
                        &package_uid,
                        &object.sha256sum,
                        &self.download_dir,
                        &cancel,
                    )
                    .await?;

                if outcome == FetchOutcome::Cancelled {
                    return Ok(FetchOutcome::Cancelled);
                }
            }

            self.publish_progress(index + 1, objects.len());
        }

        Ok(FetchOutcome::Complete)
    }

    async fn report(
        &self,
        status: &str,
        package_uid: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.client.report(status, package_uid, error_message).await
    }
}
