// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cloud::CloudError;
use crate::layers::LayerError;
use crate::nerdgraph::NerdGraphError;
use crate::provision::ProvisionError;

/// Configuration problems that abort a hook before any function is touched
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Please use a valid New Relic API key as your apiKey value; skipping.")]
    MissingApiKey,

    #[error("exclude and include options are mutually exclusive; skipping.")]
    IncludeExcludeConflict,

    #[error("{plugin} plugin must come after {other} in serverless.yml; skipping.")]
    PluginOrder { plugin: String, other: String },

    #[error("Invalid custom.newRelic configuration: {0}")]
    Parse(String),
}

/// Errors surfaced by the lifecycle hooks
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown lifecycle hook: {0}")]
    UnknownHook(String),

    #[error("Failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse manifest: {0}")]
    Manifest(#[from] serde_yaml::Error),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Layer(#[from] LayerError),

    #[error(transparent)]
    NerdGraph(#[from] NerdGraphError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("HTTP client error: {0}")]
    Http(String),
}
