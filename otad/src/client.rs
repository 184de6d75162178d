//! HTTP client for the update server.
//!
//! Three requests make up the protocol: a probe (`POST /upgrades`)
//! answering 200 with an update package or 404 for none, a best-effort
//! state report (`POST /report`), and streaming object downloads. The
//! server may attach an `Add-Extra-Poll` header to a probe response to
//! override the next poll interval once.

use anyhow::Context;
use futures::StreamExt;
use otad_updates::{FirmwareMetadata, UpdateMetadata};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AgentError, Result};

const EXTRA_POLL_HEADER: &str = "Add-Extra-Poll";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What a probe produced.
#[derive(Debug)]
pub struct ProbeOutcome {
    /// The offered update package, absent when the server had none
    pub update: Option<UpdateMetadata>,

    /// Server-requested one-shot override of the next poll interval
    pub extra_poll: Duration,
}

/// How a fetch ended. Cancellation is not an error; it leaves partial
/// files behind for the next fetch to overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Complete,
    Cancelled,
}

pub struct ServerClient {
    http: reqwest::Client,
    server: String,
}

impl ServerClient {
    pub fn new(server: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            server: server.trim_end_matches('/').to_string(),
        })
    }

    /// Ask the server whether an update is available for this device.
    pub async fn probe(&self, firmware: &FirmwareMetadata, retries: u32) -> Result<ProbeOutcome> {
        let mut body = serde_json::to_value(firmware)
            .map_err(|e| AgentError::Probe(format!("encoding probe request: {e}")))?;
        if let Value::Object(map) = &mut body {
            map.insert("retries".to_string(), json!(retries));
        }

        let url = format!("{}/upgrades", self.server);
        debug!("probing {url}");

        let response = self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Probe(e.to_string()))?;

        let extra_poll = parse_extra_poll(response.headers());

        match response.status() {
            StatusCode::OK => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| AgentError::Probe(e.to_string()))?;
                let update = UpdateMetadata::from_bytes(&bytes)?;
                info!("update available: {}", update.package_uid());
                Ok(ProbeOutcome {
                    update: Some(update),
                    extra_poll,
                })
            }
            // Not an error: there is simply no update for us.
            StatusCode::NOT_FOUND => Ok(ProbeOutcome {
                update: None,
                extra_poll,
            }),
            status => Err(AgentError::Probe(format!(
                "unexpected response status {status}"
            ))),
        }
    }

    /// Report the agent's state to the server. Callers treat failures
    /// as best-effort.
    pub async fn report(
        &self,
        status: &str,
        package_uid: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut body = json!({ "status": status });
        if let Value::Object(map) = &mut body {
            if let Some(uid) = package_uid {
                map.insert("package-uid".to_string(), json!(uid));
            }
            if let Some(message) = error_message {
                map.insert("error-message".to_string(), json!(message));
            }
        }

        let url = format!("{}/report", self.server);
        self.http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| AgentError::Probe(format!("report: {e}")))?;

        Ok(())
    }

    /// Stream one object into the download dir under its SHA-256 name.
    ///
    /// Cancellation stops the transfer promptly and leaves the partial
    /// file in place.
    pub async fn fetch_object(
        &self,
        product_uid: &str,
        package_uid: &str,
        sha256sum: &str,
        download_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let url = format!(
            "{}/products/{product_uid}/packages/{package_uid}/objects/{sha256sum}",
            self.server
        );
        info!("fetching object {sha256sum}");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::Fetch(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(AgentError::Fetch(format!(
                "object {sha256sum}: unexpected response status {}",
                response.status()
            )));
        }

        let expected_length = response.content_length();
        let mut stream = response.bytes_stream();

        let path = download_dir.join(sha256sum);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| AgentError::Fetch(format!("creating {}: {e}", path.display())))?;

        let mut written: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("fetch of {sha256sum} cancelled after {written} bytes");
                    return Ok(FetchOutcome::Cancelled);
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        file.write_all(&bytes)
                            .await
                            .map_err(|e| AgentError::Fetch(format!("writing {}: {e}", path.display())))?;
                        written += bytes.len() as u64;
                    }
                    Some(Err(e)) => return Err(AgentError::Fetch(e.to_string())),
                    None => break,
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| AgentError::Fetch(format!("flushing {}: {e}", path.display())))?;

        // Content-Length is authoritative for the transfer.
        if let Some(expected) = expected_length {
            if written != expected {
                return Err(AgentError::Fetch(format!(
                    "object {sha256sum}: received {written} of {expected} bytes"
                )));
            }
        }

        debug!("object {sha256sum}: {written} bytes");
        Ok(FetchOutcome::Complete)
    }
}

/// Parse the `Add-Extra-Poll` header: integer seconds, with absent or
/// malformed values meaning zero.
fn parse_extra_poll(headers: &HeaderMap) -> Duration {
    headers
        .get(EXTRA_POLL_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO)
}
