// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use futures_util::future::join_all;
use indexmap::IndexMap;
use serde_yaml::Value;
use tracing::{debug, error, info, warn};

use crate::config::PluginConfig;
use crate::layers::{is_same_layer, LayerLookup, LayerSelector};
use crate::license::LicenseState;
use crate::manifest::{FunctionDef, Manifest, Package};
use crate::runtime::{is_wrappable, wrapper_handler, RuntimeFamily};

pub const WRAPPER_HELPER_RULE: &str = "!newrelic-wrapper-helper.js";
pub const LAMBDA_HANDLER_ENV: &str = "NEW_RELIC_LAMBDA_HANDLER";

const DOTNET_PROFILER_ENV: [(&str, &str); 4] = [
    ("CORECLR_ENABLE_PROFILING", "1"),
    ("CORECLR_PROFILER", "{36032161-FFC0-4B61-B559-F6C5D41BAE5A}"),
    ("CORECLR_NEWRELIC_HOME", "/opt/lib/newrelic-dotnet-agent"),
    (
        "CORECLR_PROFILER_PATH",
        "/opt/lib/newrelic-dotnet-agent/libNewRelicProfiler.so",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoRegion,
    NoAccountId,
    UnsupportedRuntime(Option<String>),
    NotIncluded,
    Excluded,
    LayerUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `layer_attached` is false when the function already carried the layer or relies on
    /// `provider.layers`.
    Instrumented { layer_attached: bool },
    Skipped(SkipReason),
}

/// Run-level inputs shared by every function of one instrumentation pass
pub struct InstrumentContext<'a> {
    pub config: &'a PluginConfig,
    pub license: &'a LicenseState,
    pub layers: &'a LayerSelector,
    pub region: String,
    pub provider_runtime: Option<String>,
    pub provider_architecture: Option<String>,
    /// `provider.environment.NEW_RELIC_LOG_LEVEL`
    pub provider_log_level: Option<String>,
    pub provider_layers_hoisted: bool,
}

impl<'a> InstrumentContext<'a> {
    pub fn new(
        manifest: &Manifest,
        config: &'a PluginConfig,
        license: &'a LicenseState,
        layers: &'a LayerSelector,
    ) -> Self {
        Self {
            config,
            license,
            layers,
            region: manifest.region().to_string(),
            provider_runtime: manifest.provider.runtime.clone(),
            provider_architecture: manifest.provider.architecture.clone(),
            provider_log_level: manifest.provider_env_str("NEW_RELIC_LOG_LEVEL"),
            provider_layers_hoisted: false,
        }
    }

    /// Explicit `layerArn`, else the registry result. `None` means the function is skipped.
    async fn resolve_layer_arn(&self, runtime: &str, architecture: Option<&str>) -> Option<String> {
        if let Some(arn) = &self.config.layer_arn {
            return Some(arn.clone());
        }
        match self.layers.lookup(runtime, architecture).await {
            Ok(LayerLookup::Found(arn)) => Some(arn),
            Ok(LayerLookup::Unsupported) => None,
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }
}

/// Include/exclude filtering on the function key.
pub fn should_skip_function(config: &PluginConfig, key: &str) -> Option<SkipReason> {
    if !config.include.is_empty() && !config.include.iter().any(|f| f == key) {
        warn!("Excluded function {}; is not part of include; skipping", key);
        return Some(SkipReason::NotIncluded);
    }
    if config.exclude.iter().any(|f| f == key) {
        warn!("Excluded function {}; skipping", key);
        return Some(SkipReason::Excluded);
    }
    None
}

/// Adds the wrapper helper retention rule to `patterns` when the function uses them,
/// `exclude` otherwise.
pub fn retain_wrapper_helper(package: &mut Option<Package>) {
    let package = package.get_or_insert_with(Package::default);
    let rules = match package.patterns.as_mut() {
        Some(patterns) => patterns,
        None => package.exclude.get_or_insert_with(Vec::new),
    };
    if !rules.iter().any(|rule| rule == WRAPPER_HELPER_RULE) {
        rules.push(WRAPPER_HELPER_RULE.to_string());
    }
}

fn attach_layer(func: &mut FunctionDef, key: &str, layer_arn: &str, prepend: bool) -> bool {
    let layers = func.layers.get_or_insert_with(Vec::new);
    let already_present = layers
        .iter()
        .filter_map(Value::as_str)
        .any(|existing| is_same_layer(existing, layer_arn));
    if already_present {
        warn!(
            "Function \"{}\" already specifies an NewRelic layer; skipping.",
            key
        );
        return false;
    }
    let layer = Value::String(layer_arn.to_string());
    if prepend {
        layers.insert(0, layer);
    } else {
        layers.push(layer);
    }
    true
}

fn log_level(ctx: &InstrumentContext<'_>) -> String {
    ctx.provider_log_level
        .clone()
        .or_else(|| ctx.config.log_level.clone())
        .unwrap_or_else(|| {
            if ctx.config.debug {
                "debug".to_string()
            } else {
                "error".to_string()
            }
        })
}

fn apply_environment(ctx: &InstrumentContext<'_>, key: &str, func: &mut FunctionDef, runtime: &str) {
    let config = ctx.config;
    let family = RuntimeFamily::of(runtime);

    if config.log_enabled {
        func.set_env_default("NEW_RELIC_LOG_ENABLED", "true");
        func.set_env_default(
            "NEW_RELIC_LOG",
            if family == RuntimeFamily::Python {
                "stderr"
            } else {
                "stdout"
            },
        );
        func.set_env_default("NEW_RELIC_LOG_LEVEL", log_level(ctx));
    }

    func.set_env_default("NEW_RELIC_NO_CONFIG_FILE", "true");
    let app_name = func.name.clone().unwrap_or_else(|| key.to_string());
    func.set_env_default("NEW_RELIC_APP_NAME", app_name);
    if let Some(account_id) = &config.account_id {
        func.set_env_default("NEW_RELIC_ACCOUNT_ID", account_id.as_str());
    }
    if config.enable_distributed_tracing {
        func.set_env("NEW_RELIC_DISTRIBUTED_TRACING_ENABLED", "true");
    }
    if let Some(trusted) = config
        .trusted_account_key
        .clone()
        .map(Value::String)
        .or_else(|| func.env_value("NEW_RELIC_ACCOUNT_ID").cloned())
    {
        func.set_env_default("NEW_RELIC_TRUSTED_ACCOUNT_KEY", trusted);
    }
    if config.apm {
        func.set_env("NEW_RELIC_APM_LAMBDA_MODE", "true");
    }

    match family {
        RuntimeFamily::Python => func.set_env("NEW_RELIC_SERVERLESS_MODE_ENABLED", "true"),
        RuntimeFamily::Dotnet => {
            for (name, value) in DOTNET_PROFILER_ENV {
                func.set_env(name, value);
            }
        }
        _ => {}
    }

    if ctx.license.extension_disabled {
        func.set_env("NEW_RELIC_LAMBDA_EXTENSION_ENABLED", "false");
        return;
    }
    if let Some(license_key) = ctx.license.env_license_key() {
        func.set_env("NEW_RELIC_LICENSE_KEY", license_key);
    }
    if config.enable_function_logs {
        func.set_env("NEW_RELIC_EXTENSION_SEND_FUNCTION_LOGS", "true");
    }
    if config.enable_extension_logs == Some(false) {
        func.set_env("NEW_RELIC_EXTENSION_LOGS_ENABLED", "false");
    }
}

/// Instruments one function. Every precondition failure is a logged skip.
pub async fn instrument_function(
    ctx: &InstrumentContext<'_>,
    key: &str,
    func: &mut FunctionDef,
) -> Outcome {
    info!("Adding NewRelic layer to {}", key);
    let config = ctx.config;

    if ctx.region.is_empty() {
        warn!("No AWS region specified for NewRelic layer; skipping.");
        return Outcome::Skipped(SkipReason::NoRegion);
    }

    if config.account_id.is_none() && !func.env_is_set("NEW_RELIC_ACCOUNT_ID") {
        warn!("No New Relic Account ID specified for \"{}\"; skipping.", key);
        return Outcome::Skipped(SkipReason::NoAccountId);
    }

    let runtime = func
        .runtime
        .clone()
        .or_else(|| ctx.provider_runtime.clone());
    let runtime = match runtime {
        Some(runtime) if is_wrappable(&runtime) || config.extension_explicitly_enabled() => {
            runtime
        }
        other => {
            warn!(
                "Unsupported runtime \"{}\" for NewRelic layer; skipping.",
                other.as_deref().unwrap_or("undefined")
            );
            return Outcome::Skipped(SkipReason::UnsupportedRuntime(other));
        }
    };

    if let Some(reason) = should_skip_function(config, key) {
        return Outcome::Skipped(reason);
    }

    let architecture = func
        .architecture
        .clone()
        .or_else(|| ctx.provider_architecture.clone());
    let Some(layer_arn) = ctx
        .resolve_layer_arn(&runtime, architecture.as_deref())
        .await
    else {
        return Outcome::Skipped(SkipReason::LayerUnavailable);
    };

    let layer_attached = if ctx.provider_layers_hoisted && func.layers.is_none() {
        warn!(
            "Function \"{}\" already will be handled with provider.layers; skipping.",
            key
        );
        false
    } else {
        attach_layer(func, key, &layer_arn, config.prepend)
    };

    let wrapper = wrapper_handler(&runtime, config.java_new_relic_handler);
    if let Some(handler) = func.handler.clone() {
        if wrapper.as_deref() != Some(handler.as_str()) {
            func.set_env(LAMBDA_HANDLER_ENV, handler);
        }
    }

    apply_environment(ctx, key, func, &runtime);

    if config.manual_wrapping {
        debug!("Manual wrapping is enabled; leaving the handler of {} unchanged", key);
    } else {
        if let Some(wrapper) = wrapper {
            func.handler = Some(wrapper);
        }
        if RuntimeFamily::of(&runtime) == RuntimeFamily::Node {
            retain_wrapper_helper(&mut func.package);
        }
    }

    Outcome::Instrumented { layer_attached }
}

/// Instruments every function concurrently. Outcomes keep declaration order.
pub async fn instrument_all(
    ctx: &InstrumentContext<'_>,
    functions: &mut IndexMap<String, FunctionDef>,
) -> Vec<(String, Outcome)> {
    join_all(functions.iter_mut().map(|(key, func)| async move {
        let outcome = instrument_function(ctx, key, func).await;
        (key.clone(), outcome)
    }))
    .await
}

/// Moves the layer to `provider.layers` when all functions share a runtime and
/// architecture and none is filtered out. Returns whether the layer was hoisted.
pub async fn hoist_provider_layer(ctx: &InstrumentContext<'_>, manifest: &mut Manifest) -> bool {
    let config = ctx.config;
    if !config.use_provider_layers
        || manifest.functions.is_empty()
        || !config.include.is_empty()
        || !config.exclude.is_empty()
        || ctx.region.is_empty()
        || config.account_id.is_none()
    {
        return false;
    }

    let mut runtimes = manifest.functions.values().map(|f| f.runtime.as_deref());
    let mut architectures = manifest.functions.values().map(|f| f.architecture.as_deref());
    let first_runtime = runtimes.next().flatten();
    let first_architecture = architectures.next().flatten();
    if !runtimes.all(|r| r == first_runtime) || !architectures.all(|a| a == first_architecture) {
        return false;
    }

    let Some(runtime) = first_runtime
        .or(ctx.provider_runtime.as_deref())
        .map(String::from)
    else {
        return false;
    };
    if !is_wrappable(&runtime) {
        return false;
    }
    let architecture = first_architecture
        .or(ctx.provider_architecture.as_deref())
        .map(String::from);
    let Some(layer_arn) = ctx
        .resolve_layer_arn(&runtime, architecture.as_deref())
        .await
    else {
        return false;
    };

    let layers = manifest.provider.layers.get_or_insert_with(Vec::new);
    if !layers.iter().any(|l| l.as_str() == Some(layer_arn.as_str())) {
        layers.push(Value::String(layer_arn));
    }
    info!("Using provider.layers for all functions");
    true
}
