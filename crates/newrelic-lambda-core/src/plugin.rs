// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cloud::CloudProvider;
use crate::config::PluginConfig;
use crate::error::{ConfigError, PluginError};
use crate::http_utils::{build_client, DEFAULT_HTTP_TIMEOUT};
use crate::instrument::{hoist_provider_layer, instrument_all, InstrumentContext, Outcome};
use crate::integration::IntegrationRegistrar;
use crate::layers::{LayerSelector, DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS};
use crate::license::{self, LicenseState};
use crate::manifest::Manifest;
use crate::nerdgraph::NerdGraphClient;
use crate::provision::{StackWaiter, DEFAULT_MAX_POLLS, DEFAULT_POLL_INTERVAL};
use crate::subscriptions::SubscriptionManager;

pub const PLUGIN_NAME: &str = "serverless-newrelic-lambda-layers";
const PLUGINS_BEFORE_US: [&str; 2] = ["serverless-webpack", "serverless-plugin-typescript"];

/// Framework lifecycle events the plugin reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    BeforePackage,
    BeforePackageFunction,
    AfterPackage,
    AfterPackageFunction,
    BeforeDeploy,
    AfterDeploy,
    BeforeRemove,
}

impl Hook {
    pub const ALL: [Hook; 7] = [
        Hook::BeforePackage,
        Hook::BeforePackageFunction,
        Hook::AfterPackage,
        Hook::AfterPackageFunction,
        Hook::BeforeDeploy,
        Hook::AfterDeploy,
        Hook::BeforeRemove,
    ];

    pub fn event(self) -> &'static str {
        match self {
            Hook::BeforePackage => "before:package:createDeploymentArtifacts",
            Hook::BeforePackageFunction => "before:deploy:function:packageFunction",
            Hook::AfterPackage => "after:package:createDeploymentArtifacts",
            Hook::AfterPackageFunction => "after:deploy:function:packageFunction",
            Hook::BeforeDeploy => "before:deploy:deploy",
            Hook::AfterDeploy => "after:deploy:deploy",
            Hook::BeforeRemove => "before:remove:remove",
        }
    }
}

impl FromStr for Hook {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hook::ALL
            .into_iter()
            .find(|hook| hook.event() == s)
            .ok_or_else(|| PluginError::UnknownHook(s.to_string()))
    }
}

/// Process-level knobs that are not part of `custom.newRelic`
#[derive(Debug, Clone, PartialEq)]
pub struct PluginOptions {
    /// `--stage` passed to the framework
    pub stage: Option<String>,
    pub registry_url: Option<String>,
    pub nerdgraph_url: Option<String>,
    pub waiter: StackWaiter,
    pub layer_max_attempts: u32,
    pub layer_backoff: Duration,
    pub http_timeout: Duration,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            stage: None,
            registry_url: None,
            nerdgraph_url: None,
            waiter: StackWaiter::default(),
            layer_max_attempts: DEFAULT_MAX_ATTEMPTS,
            layer_backoff: DEFAULT_BACKOFF,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_non_empty(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value {} for {}", raw, key);
            None
        }
    }
}

impl PluginOptions {
    /// Reads `NR_LAYERS_*` overrides from the environment.
    pub fn from_env() -> Self {
        let interval = env_parse::<u64>("NR_LAYERS_POLL_INTERVAL_SECS")
            .map_or(DEFAULT_POLL_INTERVAL, Duration::from_secs);
        let max_polls = env_parse::<u32>("NR_LAYERS_MAX_POLLS").unwrap_or(DEFAULT_MAX_POLLS);
        Self {
            stage: env_non_empty("NR_LAYERS_STAGE"),
            registry_url: env_non_empty("NR_LAYERS_REGISTRY_URL"),
            nerdgraph_url: env_non_empty("NR_LAYERS_NERDGRAPH_URL"),
            waiter: StackWaiter::new(interval, max_polls),
            ..Self::default()
        }
    }
}

/// Rejects manifests where a bundling plugin runs after this one.
pub fn check_plugin_order(modules: &[String]) -> Result<(), ConfigError> {
    let Some(ours) = modules.iter().position(|m| m == PLUGIN_NAME) else {
        return Ok(());
    };
    for other in PLUGINS_BEFORE_US {
        if modules.iter().position(|m| m == other) > Some(ours) {
            return Err(ConfigError::PluginOrder {
                plugin: PLUGIN_NAME.to_string(),
                other: other.to_string(),
            });
        }
    }
    Ok(())
}

pub struct NewRelicLayers {
    cloud: Arc<dyn CloudProvider>,
    options: PluginOptions,
    license: Option<LicenseState>,
}

impl NewRelicLayers {
    pub fn new(cloud: Arc<dyn CloudProvider>, options: PluginOptions) -> Self {
        Self {
            cloud,
            options,
            license: None,
        }
    }

    /// License state decided by the last instrumentation pass, if any.
    pub fn license_state(&self) -> Option<&LicenseState> {
        self.license.as_ref()
    }

    /// Runs one lifecycle hook against `manifest`. Configuration problems are logged and
    /// leave the manifest untouched.
    pub async fn run_hook(&mut self, hook: Hook, manifest: &mut Manifest) -> Result<(), PluginError> {
        let config = match PluginConfig::from_manifest(manifest) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                return Ok(());
            }
        };

        let stage = manifest.stage(self.options.stage.as_deref()).to_string();
        if !config.stage_enabled(&stage) {
            warn!("Skipping plugin {} for stage {}", PLUGIN_NAME, stage);
            return Ok(());
        }

        debug!("Running {}", hook.event());
        match hook {
            Hook::BeforePackage | Hook::BeforePackageFunction => {
                self.instrument(manifest, &config).await
            }
            Hook::AfterPackage | Hook::AfterPackageFunction => Ok(()),
            Hook::BeforeDeploy => self.check_integration(&config).await,
            Hook::AfterDeploy => self.add_log_subscriptions(manifest, &config, &stage).await,
            Hook::BeforeRemove => {
                self.remove_log_subscriptions(manifest, &config, &stage)
                    .await
            }
        }
    }

    fn http_client(&self, config: &PluginConfig) -> Result<reqwest::Client, PluginError> {
        build_client(config.proxy.as_deref(), self.options.http_timeout)
            .map_err(|e| PluginError::Http(e.to_string()))
    }

    fn nerdgraph(&self, client: &reqwest::Client, config: &PluginConfig) -> Option<NerdGraphClient> {
        let api_key = config.api_key.as_deref()?;
        let url = self
            .options
            .nerdgraph_url
            .as_deref()
            .unwrap_or_else(|| config.nerdgraph_url());
        Some(NerdGraphClient::new(client.clone(), url, api_key))
    }

    async fn instrument(&mut self, manifest: &mut Manifest, config: &PluginConfig) -> Result<(), PluginError> {
        if let Err(e) = config
            .validate()
            .and_then(|()| check_plugin_order(manifest.plugin_modules()))
        {
            error!("{}", e);
            return Ok(());
        }
        debug!("Plugins: {:?}", manifest.plugin_modules());

        if let Some(proxy) = &config.proxy {
            info!("HTTP proxy set to {}", proxy);
        }

        let client = self.http_client(config)?;
        let nerdgraph = self.nerdgraph(&client, config);
        let region = manifest.region().to_string();

        let license = license::prepare(
            config,
            self.cloud.as_ref(),
            nerdgraph.as_ref(),
            self.options.waiter,
            &region,
        )
        .await;

        if !config.disable_license_key_secret {
            let roles = manifest.attach_managed_policies(&license.managed_policy_arns);
            debug!("Attached managed policies to {} roles", roles);
        }

        let mut selector = LayerSelector::new(client, &region, config.slim)
            .with_retry(self.options.layer_max_attempts, self.options.layer_backoff);
        if let Some(url) = &self.options.registry_url {
            selector = selector.with_base_url(url);
        }

        let mut ctx = InstrumentContext::new(manifest, config, &license, &selector);
        ctx.provider_layers_hoisted = hoist_provider_layer(&ctx, manifest).await;
        let outcomes = instrument_all(&ctx, &mut manifest.functions).await;

        let instrumented = outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, Outcome::Instrumented { .. }))
            .count();
        info!(
            "Instrumented {} of {} functions",
            instrumented,
            outcomes.len()
        );

        self.license = Some(license);
        Ok(())
    }

    async fn check_integration(&self, config: &PluginConfig) -> Result<(), PluginError> {
        let client = self.http_client(config)?;
        let Some(nerdgraph) = self.nerdgraph(&client, config) else {
            warn!("No apiKey configured; skipping the New Relic AWS Lambda integration check.");
            return Ok(());
        };
        let status = IntegrationRegistrar::new(
            self.cloud.as_ref(),
            &nerdgraph,
            config,
            self.options.waiter,
        )
        .check()
        .await;
        debug!("Integration check finished: {:?}", status);
        Ok(())
    }

    /// Deployed names of the functions this plugin instruments.
    fn target_functions(manifest: &Manifest, config: &PluginConfig, stage: &str) -> Vec<String> {
        manifest
            .functions
            .keys()
            .filter(|key| config.include.is_empty() || config.include.contains(key))
            .filter(|key| !config.exclude.contains(key))
            .map(|key| manifest.deployed_name(key, stage))
            .collect()
    }

    async fn add_log_subscriptions(
        &self,
        manifest: &Manifest,
        config: &PluginConfig,
        stage: &str,
    ) -> Result<(), PluginError> {
        let client = self.http_client(config)?;
        let nerdgraph = self.nerdgraph(&client, config);
        let license = match &self.license {
            Some(license) => license.clone(),
            None => license::assess(config, nerdgraph.as_ref()).await,
        };

        if license.auto_subscription_disabled {
            info!("Skipping adding log subscription. Explicitly disabled");
            return Ok(());
        }

        let license_key = match license.license_key {
            Some(key) => Some(key),
            None => license::resolve_license_key(config, nerdgraph.as_ref()).await,
        };
        let names = Self::target_functions(manifest, config, stage);
        let results = SubscriptionManager::new(self.cloud.as_ref(), config, self.options.waiter)
            .add_all(&names, license_key.as_deref())
            .await;
        debug!("Log subscription results: {:?}", results);
        Ok(())
    }

    async fn remove_log_subscriptions(
        &self,
        manifest: &Manifest,
        config: &PluginConfig,
        stage: &str,
    ) -> Result<(), PluginError> {
        let names = Self::target_functions(manifest, config, stage);
        SubscriptionManager::new(self.cloud.as_ref(), config, self.options.waiter)
            .remove_all(&names)
            .await;
        Ok(())
    }
}
