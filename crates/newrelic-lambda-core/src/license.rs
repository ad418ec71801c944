// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tracing::{debug, error, info, warn};

use crate::cloud::{Capability, CloudError, CloudProvider, StackRequest};
use crate::config::PluginConfig;
use crate::nerdgraph::NerdGraphClient;
use crate::provision::{scan_pages, ProvisionError, Provisioner, StackWaiter};

pub const LICENSE_SECRET_STACK: &str = "NewRelicLicenseKeySecret";
pub const LICENSE_POLICY_NAME: &str = "NewRelic-ViewLicenseKey";

const LICENSE_SECRET_TEMPLATE: &str = include_str!("../templates/nr-license-key-secret.yaml");

const EXTENSION_FALLBACK_NOTICE: &str = "The variables in the custom block of your serverless.yml show that you've chosen \
to deliver telemetry via our Lambda Extension. The value of your personal New Relic API Key, \
however, was not found in your New Relic account. Are you sure you used the correct API key? \
If not, you can retrieve it from our Onboarding nerdlet for AWS Lambda: https://one.nr/0DvwBpoxbjp \
For now, your function will still deliver telemetry to New Relic using a CloudWatch Log \
Subscription, but we recommend using the lambda extension.";

/// Per-run credential delivery state, decided before any function is mutated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LicenseState {
    pub license_key: Option<String>,
    pub managed_secret_configured: bool,
    pub managed_policy_arns: Vec<String>,
    /// Set when no license key could be found and telemetry goes through CloudWatch.
    pub ext_fell_back_to_cw: bool,
    /// The extension was turned off for this run, either by config or by the fallback.
    pub extension_disabled: bool,
    pub auto_subscription_disabled: bool,
}

impl LicenseState {
    /// License key to put in the function environment, only when no managed secret holds it.
    pub fn env_license_key(&self) -> Option<&str> {
        if self.managed_secret_configured {
            None
        } else {
            self.license_key.as_deref()
        }
    }
}

pub fn policy_name(region: &str) -> String {
    format!("{LICENSE_POLICY_NAME}-{region}")
}

pub fn policy_arn(account: &str, region: &str) -> String {
    format!("arn:aws:iam::{account}:policy/{}", policy_name(region))
}

/// Resolves the license key, preferring `ingestKey` over a NerdGraph lookup.
pub async fn resolve_license_key(
    config: &PluginConfig,
    nerdgraph: Option<&NerdGraphClient>,
) -> Option<String> {
    if let Some(key) = &config.ingest_key {
        debug!("Using ingestKey as the license key");
        return Some(key.clone());
    }
    let (Some(client), Some(account_id)) = (nerdgraph, config.account_id.as_deref()) else {
        return None;
    };
    match client.fetch_license_key(account_id).await {
        Ok(key) => key,
        Err(e) => {
            error!("Unable to retrieve the New Relic license key: {}", e);
            None
        }
    }
}

/// Finds the ARN of the managed secret access policy for `region`.
pub async fn find_secret_policy(
    cloud: &dyn CloudProvider,
    region: &str,
) -> Result<Option<String>, CloudError> {
    let name = policy_name(region);
    let found = scan_pages(
        move |marker| cloud.list_policies(marker),
        |policy| policy.name == name,
    )
    .await?;
    Ok(found.into_iter().next().map(|policy| policy.arn))
}

/// Looks up the managed secret policy and creates the secret stack when it is missing.
/// Returns the policy ARN to attach to execution roles.
pub async fn ensure_managed_secret(
    cloud: &dyn CloudProvider,
    waiter: StackWaiter,
    region: &str,
    license_key: &str,
) -> Result<String, ProvisionError> {
    let mut provisioner = Provisioner::new(cloud, waiter, LICENSE_SECRET_STACK);
    if let Some(arn) = provisioner.check(find_secret_policy(cloud, region)).await? {
        debug!("Found managed secret policy {}", arn);
        return Ok(arn);
    }

    let identity = cloud.caller_identity().await?;
    info!("Creating the managed secret for the New Relic license key in {}", region);
    provisioner
        .create_stack(StackRequest {
            stack_name: LICENSE_SECRET_STACK.to_string(),
            template_body: LICENSE_SECRET_TEMPLATE.to_string(),
            parameters: vec![
                ("LicenseKey".to_string(), license_key.to_string()),
                ("Region".to_string(), region.to_string()),
                ("PolicyName".to_string(), LICENSE_POLICY_NAME.to_string()),
            ],
            capabilities: vec![Capability::NamedIam],
        })
        .await?;
    Ok(policy_arn(&identity.account, region))
}

/// Decides how telemetry is delivered for this run without provisioning anything.
pub async fn assess(config: &PluginConfig, nerdgraph: Option<&NerdGraphClient>) -> LicenseState {
    let mut state = LicenseState {
        extension_disabled: config.extension_disabled(),
        auto_subscription_disabled: config.disable_auto_subscription,
        ..LicenseState::default()
    };
    if state.extension_disabled {
        return state;
    }

    state.license_key = resolve_license_key(config, nerdgraph).await;
    if state.license_key.is_none() {
        state.extension_disabled = true;
        state.ext_fell_back_to_cw = true;
        // The fallback relies on the log subscription, so it wins over the config flag.
        state.auto_subscription_disabled = false;
        warn!("Unable to find NR License key for extension validation; falling back to CloudWatch for transport.");
        warn!("{}", EXTENSION_FALLBACK_NOTICE);
        return state;
    }

    // The extension can authenticate, so the log subscription is redundant.
    state.auto_subscription_disabled = true;
    state
}

/// Like [`assess`], then stores the key in the managed secret unless disabled.
pub async fn prepare(
    config: &PluginConfig,
    cloud: &dyn CloudProvider,
    nerdgraph: Option<&NerdGraphClient>,
    waiter: StackWaiter,
    region: &str,
) -> LicenseState {
    let mut state = assess(config, nerdgraph).await;
    let Some(license_key) = state.license_key.clone() else {
        return state;
    };
    if state.extension_disabled {
        return state;
    }

    if !config.disable_license_key_secret {
        match ensure_managed_secret(cloud, waiter, region, &license_key).await {
            Ok(arn) => {
                state.managed_secret_configured = true;
                state.managed_policy_arns.push(arn);
            }
            Err(e) => {
                error!(
                    "Unable to configure the managed secret, the license key will be set in the function environment: {}",
                    e
                );
            }
        }
    }
    state
}
