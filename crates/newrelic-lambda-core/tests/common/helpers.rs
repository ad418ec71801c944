// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mockito::{Matcher, Mock, ServerGuard};
use newrelic_lambda_core::provision::StackWaiter;
use newrelic_lambda_core::{Manifest, NewRelicLayers, PluginOptions};

use super::mocks::FakeCloud;

pub const NODE_LAYER_ARN: &str =
    "arn:aws:lambda:us-east-1:451483290750:layer:NewRelicNodeJS18X:42";
pub const NODE_SLIM_LAYER_ARN: &str =
    "arn:aws:lambda:us-east-1:451483290750:layer:NewRelicNodeJS18XSlim:7";
pub const LICENSE_KEY: &str = "lk-0123456789";

/// Options pointing every HTTP dependency at `server`, with instant stack polling.
pub fn options_for(server: &ServerGuard) -> PluginOptions {
    PluginOptions {
        registry_url: Some(server.url()),
        nerdgraph_url: Some(format!("{}/graphql", server.url())),
        waiter: StackWaiter::new(Duration::from_millis(1), 3),
        layer_max_attempts: 1,
        layer_backoff: Duration::from_millis(1),
        ..PluginOptions::default()
    }
}

pub fn plugin(cloud: &Arc<FakeCloud>, server: &ServerGuard) -> NewRelicLayers {
    NewRelicLayers::new(cloud.clone(), options_for(server))
}

pub fn manifest(yaml: &str) -> Manifest {
    Manifest::from_yaml_str(yaml).expect("test manifest should parse")
}

/// Registry answer listing the regular and slim Node.js layers.
pub async fn mock_node_layers(server: &mut ServerGuard) -> Mock {
    server
        .mock("GET", "/get-layers")
        .match_query(Matcher::UrlEncoded(
            "CompatibleRuntime".into(),
            "nodejs18.x".into(),
        ))
        .with_status(200)
        .with_body(
            serde_json::json!({
                "Layers": [
                    {
                        "LayerName": "NewRelicNodeJS18X",
                        "LatestMatchingVersion": {
                            "LayerVersionArn": NODE_LAYER_ARN,
                            "CompatibleArchitectures": ["x86_64", "arm64"]
                        }
                    },
                    {
                        "LayerName": "NewRelicNodeJS18XSlim",
                        "LatestMatchingVersion": {
                            "LayerVersionArn": NODE_SLIM_LAYER_ARN,
                            "CompatibleArchitectures": ["x86_64", "arm64"]
                        }
                    }
                ]
            })
            .to_string(),
        )
        .create_async()
        .await
}

/// NerdGraph answer to the license key query.
pub async fn mock_license_key(server: &mut ServerGuard) -> Mock {
    server
        .mock("POST", "/graphql")
        .match_header("API-Key", Matcher::Any)
        .match_body(Matcher::Regex("licenseKey".to_string()))
        .with_status(200)
        .with_body(
            serde_json::json!({
                "data": {"actor": {"account": {"licenseKey": LICENSE_KEY, "name": "acct", "id": 123}}}
            })
            .to_string(),
        )
        .create_async()
        .await
}
