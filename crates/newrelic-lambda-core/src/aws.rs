// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error as StdError;
use std::fmt;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sts::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use tracing::debug;

use crate::cloud::{
    ApplicationRequest, CallerIdentity, CloudError, CloudProvider, FunctionInfo,
    FunctionSummary, Page, PolicySummary, StackOperation, StackRequest, StatusReport,
    SubscriptionFilter,
};

const NOT_FOUND_CODES: [&str; 4] = [
    "NoSuchEntity",
    "ResourceNotFoundException",
    "ChangeSetNotFound",
    "NotFoundException",
];
const ALREADY_EXISTS_CODES: [&str; 3] = [
    "AlreadyExistsException",
    "EntityAlreadyExists",
    "ResourceAlreadyExistsException",
];
const THROTTLING_CODES: [&str; 4] = [
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
];

/// Maps an SDK failure onto a [`CloudError`] kind.
fn classify<E, R>(err: SdkError<E, R>) -> CloudError
where
    E: ProvideErrorMetadata + StdError + 'static,
    R: fmt::Debug,
{
    let context = DisplayErrorContext(&err).to_string();
    if matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)
    ) {
        return CloudError::Transient(context);
    }

    let code = err.code().unwrap_or_default().to_string();
    let message = err.message().map_or(context, str::to_string);
    if NOT_FOUND_CODES.contains(&code.as_str()) {
        return CloudError::NotFound(message);
    }
    if ALREADY_EXISTS_CODES.contains(&code.as_str()) {
        return CloudError::AlreadyExists(message);
    }
    if THROTTLING_CODES.contains(&code.as_str()) {
        return CloudError::Transient(message);
    }
    // CloudFormation reports missing stacks as a ValidationError.
    if message.contains("does not exist") {
        return CloudError::NotFound(message);
    }
    CloudError::Service { code, message }
}

fn missing(field: &str) -> CloudError {
    CloudError::Service {
        code: "MissingField".to_string(),
        message: format!("response did not include {field}"),
    }
}

/// [`CloudProvider`] backed by the AWS SDK, using the default credential chain.
#[derive(Debug, Clone)]
pub struct AwsCloud {
    cloudformation: aws_sdk_cloudformation::Client,
    iam: aws_sdk_iam::Client,
    lambda: aws_sdk_lambda::Client,
    logs: aws_sdk_cloudwatchlogs::Client,
    serverless_repo: aws_sdk_serverlessapplicationrepository::Client,
    sts: aws_sdk_sts::Client,
}

impl AwsCloud {
    pub async fn new(region: &str, profile: Option<&str>) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(profile) = profile {
            debug!("Using AWS profile {}", profile);
            loader = loader.profile_name(profile);
        }
        let shared = loader.load().await;

        Self {
            cloudformation: aws_sdk_cloudformation::Client::new(&shared),
            iam: aws_sdk_iam::Client::new(&shared),
            lambda: aws_sdk_lambda::Client::new(&shared),
            logs: aws_sdk_cloudwatchlogs::Client::new(&shared),
            serverless_repo: aws_sdk_serverlessapplicationrepository::Client::new(&shared),
            sts: aws_sdk_sts::Client::new(&shared),
        }
    }
}

#[async_trait]
impl CloudProvider for AwsCloud {
    async fn caller_identity(&self) -> Result<CallerIdentity, CloudError> {
        let output = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .map_err(classify)?;
        Ok(CallerIdentity {
            account: output.account().ok_or_else(|| missing("Account"))?.to_string(),
            arn: output.arn().unwrap_or_default().to_string(),
        })
    }

    async fn list_policies(
        &self,
        marker: Option<String>,
    ) -> Result<Page<PolicySummary>, CloudError> {
        let output = self
            .iam
            .list_policies()
            .scope(aws_sdk_iam::types::PolicyScopeType::Local)
            .set_marker(marker)
            .send()
            .await
            .map_err(classify)?;
        let items = output
            .policies()
            .iter()
            .filter_map(|policy| {
                Some(PolicySummary {
                    name: policy.policy_name()?.to_string(),
                    arn: policy.arn()?.to_string(),
                })
            })
            .collect();
        Ok(Page {
            items,
            next_marker: output.marker().map(str::to_string),
        })
    }

    async fn get_role_arn(&self, role_name: &str) -> Result<String, CloudError> {
        let output = self
            .iam
            .get_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(classify)?;
        output
            .role()
            .map(|role| role.arn().to_string())
            .ok_or_else(|| CloudError::NotFound(role_name.to_string()))
    }

    async fn create_stack(&self, request: StackRequest) -> Result<String, CloudError> {
        use aws_sdk_cloudformation::types::{Capability, Parameter};

        let parameters = request
            .parameters
            .into_iter()
            .map(|(key, value)| {
                Parameter::builder()
                    .parameter_key(key)
                    .parameter_value(value)
                    .build()
            })
            .collect();
        let capabilities = request
            .capabilities
            .iter()
            .map(|c| Capability::from(c.as_str()))
            .collect();

        let output = self
            .cloudformation
            .create_stack()
            .stack_name(&request.stack_name)
            .template_body(request.template_body)
            .set_parameters(Some(parameters))
            .set_capabilities(Some(capabilities))
            .send()
            .await
            .map_err(classify)?;
        Ok(output
            .stack_id()
            .map_or(request.stack_name, str::to_string))
    }

    async fn stack_status(&self, stack_name: &str) -> Result<StatusReport, CloudError> {
        let output = self
            .cloudformation
            .describe_stacks()
            .stack_name(stack_name)
            .send()
            .await
            .map_err(classify)?;
        let stack = output
            .stacks()
            .first()
            .ok_or_else(|| CloudError::NotFound(stack_name.to_string()))?;
        Ok(StatusReport {
            status: stack
                .stack_status()
                .map(|status| status.as_str().to_string())
                .unwrap_or_default(),
            reason: stack.stack_status_reason().map(str::to_string),
        })
    }

    async fn create_application_change_set(
        &self,
        request: ApplicationRequest,
    ) -> Result<StackOperation, CloudError> {
        use aws_sdk_serverlessapplicationrepository::types::ParameterValue;

        let parameters = request
            .parameters
            .into_iter()
            .map(|(name, value)| {
                Ok::<_, CloudError>(
                    ParameterValue::builder()
                        .name(name)
                        .value(value)
                        .build(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let capabilities = request
            .capabilities
            .iter()
            .map(|c| c.as_str().to_string())
            .collect();

        let output = self
            .serverless_repo
            .create_cloud_formation_change_set()
            .application_id(request.application_id)
            .stack_name(request.stack_name)
            .set_parameter_overrides(Some(parameters))
            .set_capabilities(Some(capabilities))
            .send()
            .await
            .map_err(classify)?;
        Ok(StackOperation {
            change_set_id: output
                .change_set_id()
                .ok_or_else(|| missing("ChangeSetId"))?
                .to_string(),
            stack_id: output
                .stack_id()
                .ok_or_else(|| missing("StackId"))?
                .to_string(),
        })
    }

    async fn change_set_status(&self, change_set_id: &str) -> Result<StatusReport, CloudError> {
        let output = self
            .cloudformation
            .describe_change_set()
            .change_set_name(change_set_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(StatusReport {
            status: output
                .status()
                .map(|status| status.as_str().to_string())
                .unwrap_or_default(),
            reason: output.status_reason().map(str::to_string),
        })
    }

    async fn execute_change_set(&self, change_set_id: &str) -> Result<(), CloudError> {
        self.cloudformation
            .execute_change_set()
            .change_set_name(change_set_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get_function(&self, name: &str) -> Result<FunctionInfo, CloudError> {
        let output = self
            .lambda
            .get_function()
            .function_name(name)
            .send()
            .await
            .map_err(classify)?;
        let configuration = output
            .configuration()
            .ok_or_else(|| CloudError::NotFound(name.to_string()))?;
        Ok(FunctionInfo {
            name: configuration.function_name().unwrap_or(name).to_string(),
            arn: configuration.function_arn().unwrap_or_default().to_string(),
            runtime: configuration
                .runtime()
                .map(|runtime| runtime.as_str().to_string()),
        })
    }

    async fn list_functions(
        &self,
        marker: Option<String>,
    ) -> Result<Page<FunctionSummary>, CloudError> {
        let output = self
            .lambda
            .list_functions()
            .set_marker(marker)
            .send()
            .await
            .map_err(classify)?;
        let items = output
            .functions()
            .iter()
            .filter_map(|function| {
                Some(FunctionSummary {
                    name: function.function_name()?.to_string(),
                    arn: function.function_arn()?.to_string(),
                })
            })
            .collect();
        Ok(Page {
            items,
            next_marker: output.next_marker().map(str::to_string),
        })
    }

    async fn describe_subscription_filters(
        &self,
        log_group: &str,
    ) -> Result<Vec<SubscriptionFilter>, CloudError> {
        let output = self
            .logs
            .describe_subscription_filters()
            .log_group_name(log_group)
            .send()
            .await
            .map_err(classify)?;
        Ok(output
            .subscription_filters()
            .iter()
            .filter_map(|filter| {
                Some(SubscriptionFilter {
                    name: filter.filter_name()?.to_string(),
                    destination_arn: filter.destination_arn().unwrap_or_default().to_string(),
                    filter_pattern: filter.filter_pattern().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    async fn put_subscription_filter(
        &self,
        log_group: &str,
        filter: &SubscriptionFilter,
    ) -> Result<(), CloudError> {
        self.logs
            .put_subscription_filter()
            .log_group_name(log_group)
            .filter_name(&filter.name)
            .filter_pattern(&filter.filter_pattern)
            .destination_arn(&filter.destination_arn)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_subscription_filter(
        &self,
        log_group: &str,
        filter_name: &str,
    ) -> Result<(), CloudError> {
        self.logs
            .delete_subscription_filter()
            .log_group_name(log_group)
            .filter_name(filter_name)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}
