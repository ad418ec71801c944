// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tracing::{debug, error, info, warn};

use crate::cloud::{Capability, CloudError, CloudProvider, StackRequest};
use crate::config::PluginConfig;
use crate::nerdgraph::{LinkedAccount, NerdGraphClient, NerdGraphError};
use crate::provision::{ProvisionError, Provisioner, StackWaiter};

const INTEGRATION_ROLE_TEMPLATE: &str =
    include_str!("../templates/nr-lambda-integration-role.yaml");

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrationError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("Something went wrong while creating NewRelicLambdaIntegrationRole: {0}")]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    NerdGraph(#[from] NerdGraphError),

    #[error("Role not found after creating {0}")]
    RoleMissing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationStatus {
    /// The AWS account could not be resolved from the local credentials.
    NoAwsConfig,
    AlreadyLinked,
    /// Not linked and `enableIntegration` is off.
    NotEnabled,
    Linked { linked_account_id: Option<String> },
    Failed(String),
}

pub struct IntegrationRegistrar<'a> {
    cloud: &'a dyn CloudProvider,
    nerdgraph: &'a NerdGraphClient,
    config: &'a PluginConfig,
    waiter: StackWaiter,
}

fn is_match(account: &LinkedAccount, name: &str, external_id: &str, nr_account_id: &str) -> bool {
    account.name.as_deref() == Some(name)
        && account.external_id.as_deref() == Some(external_id)
        && account.nr_account_id.as_deref() == Some(nr_account_id)
}

impl<'a> IntegrationRegistrar<'a> {
    pub fn new(
        cloud: &'a dyn CloudProvider,
        nerdgraph: &'a NerdGraphClient,
        config: &'a PluginConfig,
        waiter: StackWaiter,
    ) -> Self {
        Self {
            cloud,
            nerdgraph,
            config,
            waiter,
        }
    }

    pub async fn check(&self) -> IntegrationStatus {
        let Some(account_id) = self.config.account_id.as_deref() else {
            warn!("No New Relic Account ID specified; Cannot check for required NewRelicLambdaIntegrationRole.");
            return IntegrationStatus::Failed("missing accountId".to_string());
        };

        let external_id = match self.cloud.caller_identity().await {
            Ok(identity) => identity.account,
            Err(e) => {
                warn!("No AWS config found, please configure a default AWS config.");
                debug!("Caller identity lookup failed: {}", e);
                return IntegrationStatus::NoAwsConfig;
            }
        };

        let linked_accounts = match self.nerdgraph.fetch_linked_accounts(account_id).await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("Unable to fetch New Relic linked accounts: {}", e);
                return IntegrationStatus::Failed(e.to_string());
            }
        };

        let name = self.config.linked_account_name();
        if linked_accounts
            .iter()
            .any(|account| is_match(account, &name, &external_id, account_id))
        {
            info!("Existing New Relic integration found for this linked account and aws account, skipping creation.");
            return IntegrationStatus::AlreadyLinked;
        }

        info!("No New Relic AWS Lambda integration found for this New Relic linked account and aws account.");
        if !self.config.enable_integration {
            info!("Please enable the configuration manually or add the 'enableIntegration' config var to your serverless.yaml file.");
            return IntegrationStatus::NotEnabled;
        }

        match self.enable(account_id, &external_id, &name).await {
            Ok(linked_account_id) => {
                info!("New Relic AWS Lambda cloud integration created successfully.");
                IntegrationStatus::Linked { linked_account_id }
            }
            Err(e) => {
                error!(
                    "Error while creating the New Relic AWS Lambda cloud integration: {}.",
                    e
                );
                IntegrationStatus::Failed(e.to_string())
            }
        }
    }

    async fn enable(
        &self,
        account_id: &str,
        external_id: &str,
        linked_account: &str,
    ) -> Result<Option<String>, IntegrationError> {
        let role_arn = self.ensure_integration_role(account_id).await?;

        info!(
            "Enabling New Relic integration for linked account: {} and aws account: {}.",
            linked_account, external_id
        );
        let linked_account_id = self
            .nerdgraph
            .link_account(account_id, &role_arn, linked_account)
            .await?;

        let Some(id) = &linked_account_id else {
            return Err(NerdGraphError::Decode(
                "cloudLinkAccount returned no linked account".to_string(),
            )
            .into());
        };
        self.nerdgraph
            .configure_lambda_integration(account_id, id)
            .await?;
        Ok(linked_account_id)
    }

    async fn find_role(&self) -> Result<Option<String>, CloudError> {
        for role_name in self.config.integration_role_names() {
            match self.cloud.get_role_arn(&role_name).await {
                Ok(arn) => {
                    debug!("Found integration role {}", role_name);
                    return Ok(Some(arn));
                }
                Err(CloudError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Resolves the integration role, creating its stack when no candidate role exists.
    pub async fn ensure_integration_role(
        &self,
        account_id: &str,
    ) -> Result<String, IntegrationError> {
        let stack_name = format!("NewRelicLambdaIntegrationRole-{account_id}");
        let mut provisioner = Provisioner::new(self.cloud, self.waiter, &stack_name);
        if let Some(arn) = provisioner.check(self.find_role()).await? {
            return Ok(arn);
        }

        info!("The required NewRelicLambdaIntegrationRole cannot be found; Creating Stack with NewRelicLambdaIntegrationRole.");
        provisioner
            .create_stack(StackRequest {
                stack_name: stack_name.clone(),
                template_body: INTEGRATION_ROLE_TEMPLATE.to_string(),
                parameters: vec![
                    ("NewRelicAccountNumber".to_string(), account_id.to_string()),
                    (
                        "PolicyName".to_string(),
                        self.config.custom_role_policy.clone(),
                    ),
                ],
                capabilities: vec![Capability::NamedIam],
            })
            .await?;

        self.find_role()
            .await?
            .ok_or(IntegrationError::RoleMissing(stack_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(name: &str, external_id: &str, nr_account_id: &str) -> LinkedAccount {
        LinkedAccount {
            id: Some("1".to_string()),
            name: Some(name.to_string()),
            external_id: Some(external_id.to_string()),
            nr_account_id: Some(nr_account_id.to_string()),
        }
    }

    #[test]
    fn test_match_requires_all_fields() {
        let linked = account("New Relic Lambda Integration - 42", "123456789012", "42");
        assert!(is_match(&linked, "New Relic Lambda Integration - 42", "123456789012", "42"));
        assert!(!is_match(&linked, "other", "123456789012", "42"));
        assert!(!is_match(&linked, "New Relic Lambda Integration - 42", "999", "42"));
        assert!(!is_match(&linked, "New Relic Lambda Integration - 42", "123456789012", "7"));
    }

    #[test]
    fn test_role_template_parameters() {
        assert!(INTEGRATION_ROLE_TEMPLATE.contains("NewRelicAccountNumber"));
        assert!(INTEGRATION_ROLE_TEMPLATE.contains("PolicyName"));
    }
}
