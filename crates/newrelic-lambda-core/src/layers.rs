// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, warn};

use crate::runtime::ARCH_X86_64;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

const LAYER_ARN_PATTERN: &str = r"^(arn:[^:]+:lambda:[^:]+:\d+:layer:([^:]+))(?::\d+)?$";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayerError {
    #[error("Unable to get layer ARN for {runtime} in {region}: {reason}")]
    Transport {
        runtime: String,
        region: String,
        reason: String,
    },
}

/// Outcome of a registry lookup that reached the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerLookup {
    Found(String),
    /// No candidate matches the requested architecture
    Unsupported,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegistryResponse {
    #[serde(default)]
    layers: Vec<RegistryLayer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegistryLayer {
    layer_name: Option<String>,
    layer_arn: Option<String>,
    latest_matching_version: Option<RegistryLayerVersion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegistryLayerVersion {
    layer_version_arn: String,
    compatible_architectures: Option<Vec<String>>,
}

/// A published layer version eligible for selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerCandidate {
    pub name: String,
    pub version_arn: String,
    pub architectures: Option<Vec<String>>,
}

impl LayerCandidate {
    pub fn is_slim(&self) -> bool {
        self.name.to_lowercase().contains("slim")
    }

    fn supports(&self, architecture: Option<&str>) -> bool {
        match (architecture, &self.architectures) {
            (Some(arch), Some(archs)) => archs.iter().any(|a| a == arch),
            (Some(_), None) => false,
            (None, None) => true,
            (None, Some(archs)) => archs.is_empty() || archs.iter().any(|a| a == ARCH_X86_64),
        }
    }
}

impl RegistryLayer {
    fn into_candidate(self) -> Option<LayerCandidate> {
        let version = self.latest_matching_version?;
        let name = self
            .layer_name
            .or_else(|| self.layer_arn.as_deref().and_then(layer_name).map(String::from))
            .or_else(|| layer_name(&version.layer_version_arn).map(String::from))
            .unwrap_or_default();
        Some(LayerCandidate {
            name,
            version_arn: version.layer_version_arn,
            architectures: version.compatible_architectures,
        })
    }
}

fn layer_arn_regex() -> Option<&'static Regex> {
    static LAYER_ARN: OnceLock<Option<Regex>> = OnceLock::new();
    LAYER_ARN
        .get_or_init(|| Regex::new(LAYER_ARN_PATTERN).ok())
        .as_ref()
}

/// Layer name segment of a layer or layer-version ARN.
pub fn layer_name(arn: &str) -> Option<&str> {
    layer_arn_regex()?
        .captures(arn)?
        .get(2)
        .map(|m| m.as_str())
}

/// ARN without its trailing version number. Non-ARN strings are returned as is.
pub fn unversioned_arn(arn: &str) -> &str {
    layer_arn_regex()
        .and_then(|re| re.captures(arn))
        .and_then(|caps| caps.get(1))
        .map_or(arn, |m| m.as_str())
}

/// True when `existing` is the resolved layer or any other version of it.
pub fn is_same_layer(existing: &str, resolved: &str) -> bool {
    existing == resolved || unversioned_arn(existing) == unversioned_arn(resolved)
}

/// Picks the preferred variant among the candidates compatible with `architecture`,
/// falling back to the first compatible one.
pub fn select_layer(
    candidates: &[LayerCandidate],
    architecture: Option<&str>,
    slim: bool,
) -> Option<String> {
    let compatible: Vec<&LayerCandidate> = candidates
        .iter()
        .filter(|candidate| candidate.supports(architecture))
        .collect();
    compatible
        .iter()
        .find(|candidate| candidate.is_slim() == slim)
        .or_else(|| compatible.first())
        .map(|candidate| candidate.version_arn.clone())
}

type CacheKey = (String, Option<String>);
type CachedLookup = Arc<OnceCell<Result<LayerLookup, LayerError>>>;

/// Resolves layer ARNs from the regional registry, memoized per runtime and architecture
pub struct LayerSelector {
    client: reqwest::Client,
    base_url: String,
    region: String,
    slim: bool,
    max_attempts: u32,
    backoff: Duration,
    cache: Mutex<HashMap<CacheKey, CachedLookup>>,
}

impl LayerSelector {
    pub fn new(client: reqwest::Client, region: &str, slim: bool) -> Self {
        Self {
            client,
            base_url: format!("https://{region}.layers.newrelic-external.com"),
            region: region.to_string(),
            slim,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            cache: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub async fn lookup(
        &self,
        runtime: &str,
        architecture: Option<&str>,
    ) -> Result<LayerLookup, LayerError> {
        let cell = {
            let mut cache = self.cache.lock().await;
            cache
                .entry((runtime.to_string(), architecture.map(String::from)))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        cell.get_or_init(|| self.fetch(runtime, architecture))
            .await
            .clone()
    }

    async fn fetch(
        &self,
        runtime: &str,
        architecture: Option<&str>,
    ) -> Result<LayerLookup, LayerError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.request(runtime).await {
                Ok(candidates) => {
                    debug!(
                        "Layer registry returned {} candidates for {}",
                        candidates.len(),
                        runtime
                    );
                    return Ok(match select_layer(&candidates, architecture, self.slim) {
                        Some(arn) => LayerLookup::Found(arn),
                        None => {
                            warn!(
                                "{} is not yet supported by New Relic layers for {} in {}. Skipping.",
                                architecture.unwrap_or(ARCH_X86_64),
                                runtime,
                                self.region
                            );
                            LayerLookup::Unsupported
                        }
                    });
                }
                Err(e) => {
                    if attempts >= self.max_attempts {
                        error!(
                            "Unable to get layer ARN for {} in {} after {} attempts",
                            runtime, self.region, attempts
                        );
                        error!("URL: {}/get-layers?CompatibleRuntime={}", self.base_url, runtime);
                        return Err(LayerError::Transport {
                            runtime: runtime.to_string(),
                            region: self.region.clone(),
                            reason: e.to_string(),
                        });
                    }
                    warn!(
                        "Layer lookup for {} failed (attempt {}): {}, retrying",
                        runtime, attempts, e
                    );
                }
            }
            tokio::time::sleep(self.backoff).await;
        }
    }

    async fn request(&self, runtime: &str) -> Result<Vec<LayerCandidate>, reqwest::Error> {
        let response = self
            .client
            .get(format!("{}/get-layers", self.base_url))
            .query(&[("CompatibleRuntime", runtime)])
            .send()
            .await?
            .error_for_status()?;
        let body: RegistryResponse = response.json().await?;
        Ok(body
            .layers
            .into_iter()
            .filter_map(RegistryLayer::into_candidate)
            .collect())
    }
}
