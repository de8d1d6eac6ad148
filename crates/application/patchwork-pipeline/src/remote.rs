use crate::PipelineError;
use patchwork_config::ManifestEndpoint;
use patchwork_core::formats::parse_manifest;
use patchwork_core::Manifest;
use reqwest::Client;
use tracing::{info, warn};

#[async_trait::async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch_manifest(&self) -> Result<Manifest, PipelineError>;
}

/// Fetches the manifest over HTTP, trying each endpoint in order.
///
/// Transport failures and non-2xx answers move on to the next endpoint. A
/// document that arrives but fails to parse is fatal: every endpoint serves
/// the same manifest, so retrying elsewhere would only hide the problem.
pub struct HttpManifestSource {
    client: Client,
    endpoints: Vec<ManifestEndpoint>,
}

impl HttpManifestSource {
    pub fn new(client: Client, endpoints: Vec<ManifestEndpoint>) -> Self {
        Self { client, endpoints }
    }

    async fn fetch_bytes(&self, endpoint: &ManifestEndpoint) -> Result<Vec<u8>, String> {
        let resp = self
            .client
            .get(&endpoint.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {} from {}", status.as_u16(), endpoint.url));
        }
        let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
        Ok(bytes.to_vec())
    }
}

#[async_trait::async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch_manifest(&self) -> Result<Manifest, PipelineError> {
        let mut attempted = Vec::new();
        let mut last = String::from("no manifest endpoint configured");

        for endpoint in &self.endpoints {
            attempted.push(endpoint.name.clone());
            info!("Fetching manifest from {} ({})", endpoint.name, endpoint.url);

            match self.fetch_bytes(endpoint).await {
                Ok(bytes) => {
                    let manifest = parse_manifest(&bytes)?;
                    info!(
                        "Manifest lists {} files ({} archives)",
                        manifest.len(),
                        manifest.archives().len()
                    );
                    return Ok(manifest);
                }
                Err(e) => {
                    warn!("Manifest endpoint {} failed: {}", endpoint.name, e);
                    last = e;
                }
            }
        }

        Err(PipelineError::ManifestUnavailable { attempted, last })
    }
}

/// Serves a manifest already in memory.
pub struct StaticManifestSource(pub Manifest);

#[async_trait::async_trait]
impl ManifestSource for StaticManifestSource {
    async fn fetch_manifest(&self) -> Result<Manifest, PipelineError> {
        Ok(self.0.clone())
    }
}
