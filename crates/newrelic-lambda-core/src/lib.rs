// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # New Relic Lambda Core
//!
//! Deployment-time instrumentation of Serverless Framework Lambda functions with the
//! New Relic layer.
//!
//! The crate mutates a deployment manifest in place and provisions the AWS resources the
//! layer depends on:
//! - [`instrument`]: attaches the layer, rewrites handlers and injects environment variables
//! - [`layers`]: resolves the layer ARN for a runtime/architecture pair
//! - [`license`]: resolves the license key and the managed secret that stores it
//! - [`subscriptions`]: reconciles the `NewRelicLogStreaming` log subscription filters
//! - [`integration`]: links the AWS account to New Relic through NerdGraph
//! - [`plugin`]: dispatches the framework lifecycle hooks to the modules above

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

/// AWS SDK implementation of [`cloud::CloudProvider`]
pub mod aws;

/// Control-plane boundary: the provider trait and its uniform error kind
pub mod cloud;

/// `custom.newRelic` configuration resolution
pub mod config;

pub mod error;

pub mod http_utils;

/// Per-function mutation of the manifest
pub mod instrument;

pub mod integration;

/// Layer registry lookups
pub mod layers;

pub mod license;

/// Log line formatting for the binary
pub mod logger;

/// Typed view of `serverless.yml`
pub mod manifest;

pub mod nerdgraph;

pub mod plugin;

/// Stack creation, status polling and paginated existence scans
pub mod provision;

pub mod runtime;

pub mod subscriptions;

pub use config::PluginConfig;
pub use error::PluginError;
pub use manifest::Manifest;
pub use plugin::{Hook, NewRelicLayers, PluginOptions};
