// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use std::{env, path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use newrelic_lambda_core::{
    aws::AwsCloud, logger::Formatter, Hook, Manifest, NewRelicLayers, PluginOptions,
};

const DEFAULT_MANIFEST: &str = "serverless.yml";
const USAGE: &str = "usage: newrelic-lambda-layers <hook> [manifest] [output]";

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("NR_LAYERS_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,aws_config=warn,aws_smithy_runtime=warn,{}",
        log_level
    );

    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level in configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .event_format(Formatter)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        return ExitCode::FAILURE;
    }

    debug!("Logging subsystem enabled");

    match run(env::args().skip(1)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(mut args: impl Iterator<Item = String>) -> anyhow::Result<()> {
    let hook: Hook = args.next().context(USAGE)?.parse()?;
    let manifest_path = PathBuf::from(args.next().unwrap_or(DEFAULT_MANIFEST.to_string()));
    let output_path = args.next().map(PathBuf::from);

    let mut manifest = Manifest::load(&manifest_path)
        .await
        .with_context(|| format!("Error loading {}", manifest_path.display()))?;
    let original = manifest.clone();

    let cloud = AwsCloud::new(manifest.region(), manifest.provider.profile.as_deref()).await;
    let mut plugin = NewRelicLayers::new(Arc::new(cloud), PluginOptions::from_env());
    plugin
        .run_hook(hook, &mut manifest)
        .await
        .with_context(|| format!("Error running {}", hook.event()))?;

    if output_path.is_none() && manifest == original {
        debug!("Manifest unchanged");
        return Ok(());
    }
    let target = output_path.unwrap_or(manifest_path);
    manifest
        .save(&target)
        .await
        .with_context(|| format!("Error writing {}", target.display()))?;
    info!("Wrote {}", target.display());
    Ok(())
}
