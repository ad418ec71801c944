// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

/// Uniform classification of control-plane failures. Provider implementations map their
/// service-specific error codes onto these kinds so callers can branch on them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Transient cloud error: {0}")]
    Transient(String),

    #[error("{code}: {message}")]
    Service { code: String, message: String },
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, CloudError::AlreadyExists(_))
    }
}

/// One page of a paginated listing. `next_marker` is `None` on the last page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_marker: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_marker: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySummary {
    pub name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSummary {
    pub name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub name: String,
    pub destination_arn: String,
    pub filter_pattern: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Iam,
    NamedIam,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Iam => "CAPABILITY_IAM",
            Capability::NamedIam => "CAPABILITY_NAMED_IAM",
        }
    }
}

/// Template-based stack creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackRequest {
    pub stack_name: String,
    pub template_body: String,
    pub parameters: Vec<(String, String)>,
    pub capabilities: Vec<Capability>,
}

/// Serverless application deployment request, materialized as a change set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationRequest {
    pub application_id: String,
    pub stack_name: String,
    pub parameters: Vec<(String, String)>,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackOperation {
    pub change_set_id: String,
    pub stack_id: String,
}

/// Lifecycle status as reported by the provider, e.g. `CREATE_COMPLETE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
    pub arn: String,
    pub runtime: Option<String>,
}

/// Control-plane operations the plugin depends on. The production implementation is
/// [`crate::aws::AwsCloud`]; tests substitute an in-memory fake.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn caller_identity(&self) -> Result<CallerIdentity, CloudError>;

    /// Lists customer-managed policies.
    async fn list_policies(
        &self,
        marker: Option<String>,
    ) -> Result<Page<PolicySummary>, CloudError>;

    /// Returns the ARN of the named role, `NotFound` when it does not exist.
    async fn get_role_arn(&self, role_name: &str) -> Result<String, CloudError>;

    /// Starts stack creation and returns the stack id.
    async fn create_stack(&self, request: StackRequest) -> Result<String, CloudError>;

    async fn stack_status(&self, stack_name: &str) -> Result<StatusReport, CloudError>;

    async fn create_application_change_set(
        &self,
        request: ApplicationRequest,
    ) -> Result<StackOperation, CloudError>;

    async fn change_set_status(&self, change_set_id: &str) -> Result<StatusReport, CloudError>;

    async fn execute_change_set(&self, change_set_id: &str) -> Result<(), CloudError>;

    async fn get_function(&self, name: &str) -> Result<FunctionInfo, CloudError>;

    async fn list_functions(
        &self,
        marker: Option<String>,
    ) -> Result<Page<FunctionSummary>, CloudError>;

    async fn describe_subscription_filters(
        &self,
        log_group: &str,
    ) -> Result<Vec<SubscriptionFilter>, CloudError>;

    async fn put_subscription_filter(
        &self,
        log_group: &str,
        filter: &SubscriptionFilter,
    ) -> Result<(), CloudError>;

    async fn delete_subscription_filter(
        &self,
        log_group: &str,
        filter_name: &str,
    ) -> Result<(), CloudError>;
}
