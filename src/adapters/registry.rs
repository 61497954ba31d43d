//! Registry client used to verify cached images still exist.
//!
//! Endpoint: HEAD /v2/<repository>/manifests/<tag>

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::core::images::{registry_of, split_tag};

use super::ImageVerifier;

const DOCKER_HUB: &str = "registry-1.docker.io";

const MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// Checks image presence with the registry's manifest endpoint
pub struct RegistryVerifier {
    client: reqwest::Client,
    insecure: Vec<String>,
    token: Option<String>,
}

impl RegistryVerifier {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build registry client")?;
        Ok(Self {
            client,
            insecure: Vec::new(),
            token: None,
        })
    }

    /// Registries reached over plain HTTP
    pub fn with_insecure_registries(mut self, registries: Vec<String>) -> Self {
        self.insecure = registries;
        self
    }

    /// Bearer token sent with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Manifest URL for an image reference
    pub fn manifest_url(&self, reference: &str) -> Result<String> {
        let (repository, tag) = split_tag(reference);
        let tag = tag.with_context(|| format!("Image reference '{}' has no tag", reference))?;

        let (host, path) = match registry_of(repository) {
            Some(host) => (host, &repository[host.len() + 1..]),
            None => (DOCKER_HUB, repository),
        };
        let path = if host == DOCKER_HUB && !path.contains('/') {
            format!("library/{}", path)
        } else {
            path.to_string()
        };

        let scheme = if self.insecure.iter().any(|r| r == host) || host.starts_with("localhost") {
            "http"
        } else {
            "https"
        };
        Ok(format!("{}://{}/v2/{}/manifests/{}", scheme, host, path, tag))
    }
}

#[async_trait]
impl ImageVerifier for RegistryVerifier {
    async fn exists(&self, tag: &str) -> Result<bool> {
        let url = self.manifest_url(tag)?;
        let mut request = self.client.head(&url).header("Accept", MANIFEST_TYPES);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach registry for '{}'", tag))?;

        let status = response.status();
        debug!(image = tag, %status, "Registry manifest check");
        match status {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => anyhow::bail!("Registry error ({}) verifying '{}'", other, tag),
        }
    }
}
