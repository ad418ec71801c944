// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reconciles the `NewRelicLogStreaming` subscription filter of each function's log group
//! against the log ingestion function.

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::cloud::{ApplicationRequest, Capability, CloudError, CloudProvider, SubscriptionFilter};
use crate::config::PluginConfig;
use crate::provision::{scan_pages, Provisioner, StackWaiter};

pub const FILTER_NAME: &str = "NewRelicLogStreaming";
pub const LOG_INGESTION_APPLICATION: &str =
    "arn:aws:serverlessrepo:us-east-1:463657938898:applications/NewRelic-log-ingestion";
pub const LOG_INGESTION_STACK: &str = "NewRelic-log-ingestion";

pub fn log_group(function_name: &str) -> String {
    format!("/aws/lambda/{function_name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Created,
    Replaced,
    Unchanged,
    FunctionMissing,
    Failed,
}

pub struct SubscriptionManager<'a> {
    cloud: &'a dyn CloudProvider,
    config: &'a PluginConfig,
    waiter: StackWaiter,
}

impl<'a> SubscriptionManager<'a> {
    pub fn new(cloud: &'a dyn CloudProvider, config: &'a PluginConfig, waiter: StackWaiter) -> Self {
        Self {
            cloud,
            config,
            waiter,
        }
    }

    /// ARN of the log ingestion function, if deployed.
    pub async fn find_destination(&self) -> Result<Option<String>, CloudError> {
        let cloud = self.cloud;
        let needle = self.config.log_ingestion_function_name.as_str();
        let found = scan_pages(
            move |marker| cloud.list_functions(marker),
            |function| function.name.contains(needle),
        )
        .await?;
        Ok(found.into_iter().next().map(|function| function.arn))
    }

    /// Resolves the destination, deploying the log ingestion application when it is missing.
    pub async fn ensure_destination(&self, license_key: Option<&str>) -> Option<String> {
        match self.find_destination().await {
            Ok(Some(arn)) => return Some(arn),
            Ok(None) => {}
            Err(e) => {
                error!("Unable to look up the log ingestion function: {}", e);
                return None;
            }
        }

        let Some(license_key) = license_key else {
            error!(
                "Could not find a {} function and no license key is available to create one; skipping log subscriptions.",
                self.config.log_ingestion_function_name
            );
            return None;
        };

        info!(
            "Could not find a {} function; installing it from the serverless application repository.",
            self.config.log_ingestion_function_name
        );
        let logging_enabled = if self.config.log_enabled { "True" } else { "False" };
        let mut provisioner = Provisioner::new(self.cloud, self.waiter, LOG_INGESTION_STACK);
        if let Err(e) = provisioner
            .deploy_application(ApplicationRequest {
                application_id: LOG_INGESTION_APPLICATION.to_string(),
                stack_name: LOG_INGESTION_STACK.to_string(),
                parameters: vec![
                    ("NRLicenseKey".to_string(), license_key.to_string()),
                    ("NRLoggingEnabled".to_string(), logging_enabled.to_string()),
                ],
                capabilities: vec![Capability::Iam],
            })
            .await
        {
            error!("Unable to install the log ingestion function: {}", e);
            return None;
        }

        match self.find_destination().await {
            Ok(Some(arn)) => Some(arn),
            Ok(None) => {
                error!(
                    "Unable to find the {} function after installing it; skipping log subscriptions.",
                    self.config.log_ingestion_function_name
                );
                None
            }
            Err(e) => {
                error!("Unable to look up the log ingestion function: {}", e);
                None
            }
        }
    }

    /// Brings the owned filter of one function in line with `destination_arn` and `pattern`.
    /// Filters owned by others are reported and left alone.
    pub async fn reconcile(
        &self,
        function_name: &str,
        destination_arn: &str,
        pattern: &str,
    ) -> Reconciliation {
        match self.cloud.get_function(function_name).await {
            Ok(_) => {}
            Err(CloudError::NotFound(_)) => {
                warn!(
                    "Could not find function {}; skipping log subscription.",
                    function_name
                );
                return Reconciliation::FunctionMissing;
            }
            Err(e) => {
                error!("Unable to get function {}: {}", function_name, e);
                return Reconciliation::Failed;
            }
        }

        let group = log_group(function_name);
        let filters = match self.cloud.describe_subscription_filters(&group).await {
            Ok(filters) => filters,
            Err(CloudError::NotFound(_)) => Vec::new(),
            Err(e) => {
                error!("Unable to describe subscription filters of {}: {}", group, e);
                return Reconciliation::Failed;
            }
        };

        for foreign in filters.iter().filter(|f| f.name != FILTER_NAME) {
            warn!(
                "Function {} has a subscription filter {} not managed by New Relic; leaving it in place.",
                function_name, foreign.name
            );
        }

        let desired = SubscriptionFilter {
            name: FILTER_NAME.to_string(),
            destination_arn: destination_arn.to_string(),
            filter_pattern: pattern.to_string(),
        };
        let outcome = match filters.iter().find(|f| f.name == FILTER_NAME) {
            Some(owned) if *owned == desired => {
                debug!("Subscription filter of {} is up to date", function_name);
                return Reconciliation::Unchanged;
            }
            Some(_) => {
                info!("Replacing the {} filter of {}", FILTER_NAME, function_name);
                if let Err(e) = self
                    .cloud
                    .delete_subscription_filter(&group, FILTER_NAME)
                    .await
                {
                    error!("Unable to delete the {} filter of {}: {}", FILTER_NAME, function_name, e);
                    return Reconciliation::Failed;
                }
                Reconciliation::Replaced
            }
            None => Reconciliation::Created,
        };

        match self.cloud.put_subscription_filter(&group, &desired).await {
            Ok(()) => {
                info!("Added {} filter to {}", FILTER_NAME, function_name);
                outcome
            }
            Err(e) => {
                error!("Unable to add the {} filter to {}: {}", FILTER_NAME, function_name, e);
                Reconciliation::Failed
            }
        }
    }

    /// Reconciles every function concurrently against the ingestion destination.
    pub async fn add_all(
        &self,
        function_names: &[String],
        license_key: Option<&str>,
    ) -> Vec<(String, Reconciliation)> {
        let Some(destination) = self.ensure_destination(license_key).await else {
            return Vec::new();
        };
        let pattern = self.config.filter_pattern();
        join_all(function_names.iter().map(|name| {
            let (destination, pattern) = (&destination, &pattern);
            async move { (name.clone(), self.reconcile(name, destination, pattern).await) }
        }))
        .await
    }

    /// Deletes the owned filter. A missing filter or log group counts as removed.
    pub async fn remove(&self, function_name: &str) -> Result<(), CloudError> {
        let group = log_group(function_name);
        match self
            .cloud
            .delete_subscription_filter(&group, FILTER_NAME)
            .await
        {
            Ok(()) => {
                info!("Removed {} filter from {}", FILTER_NAME, function_name);
                Ok(())
            }
            Err(CloudError::NotFound(_)) => {
                debug!("No {} filter on {}", FILTER_NAME, function_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn remove_all(&self, function_names: &[String]) -> Vec<(String, Result<(), CloudError>)> {
        join_all(function_names.iter().map(|name| async move {
            let result = self.remove(name).await;
            if let Err(e) = &result {
                error!("Unable to remove the {} filter from {}: {}", FILTER_NAME, name, e);
            }
            (name.clone(), result)
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_group() {
        assert_eq!(log_group("svc-dev-hello"), "/aws/lambda/svc-dev-hello");
    }
}
