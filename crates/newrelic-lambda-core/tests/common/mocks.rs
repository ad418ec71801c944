// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory control plane for exercising the plugin without AWS

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use newrelic_lambda_core::cloud::{
    ApplicationRequest, CallerIdentity, CloudError, CloudProvider, FunctionInfo,
    FunctionSummary, Page, PolicySummary, StackOperation, StackRequest, StatusReport,
    SubscriptionFilter,
};

pub const ACCOUNT: &str = "123456789012";
pub const INGESTION_FUNCTION: &str = "newrelic-log-ingestion-0f1e2d";

pub fn ingestion_arn() -> String {
    format!("arn:aws:lambda:us-east-1:{ACCOUNT}:function:{INGESTION_FUNCTION}")
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub identity_available: bool,
    pub policy_pages: Vec<Vec<PolicySummary>>,
    pub function_pages: Vec<Vec<FunctionSummary>>,
    pub roles: HashMap<String, String>,
    /// Log group name to filters. Groups absent from the map do not exist.
    pub filters: HashMap<String, Vec<SubscriptionFilter>>,
    pub stacks: Vec<StackRequest>,
    pub applications: Vec<ApplicationRequest>,
    pub executed_change_sets: Vec<String>,
    pub deleted_filters: Vec<(String, String)>,
    pub policy_list_calls: usize,
    /// Final status reported for every stack. `CREATE_COMPLETE` when unset.
    pub stack_status: Option<String>,
}

/// Fake [`CloudProvider`]. Stacks complete immediately and leave behind the resources
/// their templates declare.
#[derive(Debug)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState {
                identity_available: true,
                ..FakeState::default()
            }),
        }
    }
}

fn page<T: Clone>(pages: &[Vec<T>], marker: Option<String>) -> Result<Page<T>, CloudError> {
    let index = match marker {
        Some(marker) => marker.parse::<usize>().map_err(|_| CloudError::Service {
            code: "InvalidMarker".to_string(),
            message: marker,
        })?,
        None => 0,
    };
    let items = pages.get(index).cloned().unwrap_or_default();
    let next_marker = (index + 1 < pages.len()).then(|| (index + 1).to_string());
    Ok(Page { items, next_marker })
}

fn parameter<'a>(parameters: &'a [(String, String)], key: &str) -> Option<&'a str> {
    parameters
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

impl FakeCloud {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn with_functions(self, names: &[&str]) -> Self {
        {
            let mut state = self.state();
            let mut page: Vec<FunctionSummary> = names
                .iter()
                .map(|name| FunctionSummary {
                    name: name.to_string(),
                    arn: format!("arn:aws:lambda:us-east-1:{ACCOUNT}:function:{name}"),
                })
                .collect();
            match state.function_pages.last_mut() {
                Some(last) => last.append(&mut page),
                None => state.function_pages.push(page),
            }
            for name in names {
                state
                    .filters
                    .entry(format!("/aws/lambda/{name}"))
                    .or_default();
            }
        }
        self
    }

    pub fn with_ingestion_function(self) -> Self {
        self.with_functions(&[INGESTION_FUNCTION])
    }

    pub fn with_policy_pages(self, pages: Vec<Vec<PolicySummary>>) -> Self {
        self.state().policy_pages = pages;
        self
    }

    pub fn with_role(self, name: &str) -> Self {
        self.state().roles.insert(
            name.to_string(),
            format!("arn:aws:iam::{ACCOUNT}:role/{name}"),
        );
        self
    }

    pub fn with_filter(self, function_name: &str, filter: SubscriptionFilter) -> Self {
        self.state()
            .filters
            .entry(format!("/aws/lambda/{function_name}"))
            .or_default()
            .push(filter);
        self
    }

    pub fn with_stack_status(self, status: &str) -> Self {
        self.state().stack_status = Some(status.to_string());
        self
    }

    pub fn without_identity(self) -> Self {
        self.state().identity_available = false;
        self
    }

    pub fn filters_of(&self, function_name: &str) -> Vec<SubscriptionFilter> {
        self.state()
            .filters
            .get(&format!("/aws/lambda/{function_name}"))
            .cloned()
            .unwrap_or_default()
    }

    fn function_exists(state: &FakeState, name: &str) -> bool {
        state.function_pages.iter().flatten().any(|f| f.name == name)
    }
}

#[async_trait::async_trait]
impl CloudProvider for FakeCloud {
    async fn caller_identity(&self) -> Result<CallerIdentity, CloudError> {
        if !self.state().identity_available {
            return Err(CloudError::Service {
                code: "InvalidClientTokenId".to_string(),
                message: "no credentials".to_string(),
            });
        }
        Ok(CallerIdentity {
            account: ACCOUNT.to_string(),
            arn: format!("arn:aws:iam::{ACCOUNT}:user/deployer"),
        })
    }

    async fn list_policies(
        &self,
        marker: Option<String>,
    ) -> Result<Page<PolicySummary>, CloudError> {
        let mut state = self.state();
        state.policy_list_calls += 1;
        page(&state.policy_pages, marker)
    }

    async fn get_role_arn(&self, role_name: &str) -> Result<String, CloudError> {
        self.state()
            .roles
            .get(role_name)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(role_name.to_string()))
    }

    async fn create_stack(&self, request: StackRequest) -> Result<String, CloudError> {
        let mut state = self.state();
        if state.stacks.iter().any(|s| s.stack_name == request.stack_name) {
            return Err(CloudError::AlreadyExists(request.stack_name));
        }
        if let (Some(policy), Some(region)) = (
            parameter(&request.parameters, "PolicyName"),
            parameter(&request.parameters, "Region"),
        ) {
            let name = format!("{policy}-{region}");
            let summary = PolicySummary {
                arn: format!("arn:aws:iam::{ACCOUNT}:policy/{name}"),
                name,
            };
            match state.policy_pages.last_mut() {
                Some(last) => last.push(summary),
                None => state.policy_pages.push(vec![summary]),
            }
        }
        if let Some(account) = parameter(&request.parameters, "NewRelicAccountNumber") {
            let role = format!("NewRelicLambdaIntegrationRole_{account}");
            let arn = format!("arn:aws:iam::{ACCOUNT}:role/{role}");
            state.roles.insert(role, arn);
        }
        let stack_id = format!("arn:aws:cloudformation:us-east-1:{ACCOUNT}:stack/{}", request.stack_name);
        state.stacks.push(request);
        Ok(stack_id)
    }

    async fn stack_status(&self, _stack_name: &str) -> Result<StatusReport, CloudError> {
        Ok(StatusReport {
            status: self
                .state()
                .stack_status
                .clone()
                .unwrap_or_else(|| "CREATE_COMPLETE".to_string()),
            reason: None,
        })
    }

    async fn create_application_change_set(
        &self,
        request: ApplicationRequest,
    ) -> Result<StackOperation, CloudError> {
        let mut state = self.state();
        let operation = StackOperation {
            change_set_id: format!("changeset-{}", state.applications.len()),
            stack_id: format!("serverlessrepo-{}", request.stack_name),
        };
        state.applications.push(request);
        Ok(operation)
    }

    async fn change_set_status(&self, _change_set_id: &str) -> Result<StatusReport, CloudError> {
        Ok(StatusReport {
            status: "CREATE_COMPLETE".to_string(),
            reason: None,
        })
    }

    async fn execute_change_set(&self, change_set_id: &str) -> Result<(), CloudError> {
        self.state()
            .executed_change_sets
            .push(change_set_id.to_string());
        self.deploy_ingestion_function();
        Ok(())
    }

    async fn get_function(&self, name: &str) -> Result<FunctionInfo, CloudError> {
        let state = self.state();
        if !Self::function_exists(&state, name) {
            return Err(CloudError::NotFound(name.to_string()));
        }
        Ok(FunctionInfo {
            name: name.to_string(),
            arn: format!("arn:aws:lambda:us-east-1:{ACCOUNT}:function:{name}"),
            runtime: Some("nodejs18.x".to_string()),
        })
    }

    async fn list_functions(
        &self,
        marker: Option<String>,
    ) -> Result<Page<FunctionSummary>, CloudError> {
        page(&self.state().function_pages, marker)
    }

    async fn describe_subscription_filters(
        &self,
        log_group: &str,
    ) -> Result<Vec<SubscriptionFilter>, CloudError> {
        self.state()
            .filters
            .get(log_group)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(log_group.to_string()))
    }

    async fn put_subscription_filter(
        &self,
        log_group: &str,
        filter: &SubscriptionFilter,
    ) -> Result<(), CloudError> {
        let mut state = self.state();
        let filters = state.filters.entry(log_group.to_string()).or_default();
        filters.retain(|f| f.name != filter.name);
        filters.push(filter.clone());
        Ok(())
    }

    async fn delete_subscription_filter(
        &self,
        log_group: &str,
        filter_name: &str,
    ) -> Result<(), CloudError> {
        let mut state = self.state();
        let Some(filters) = state.filters.get_mut(log_group) else {
            return Err(CloudError::NotFound(log_group.to_string()));
        };
        let before = filters.len();
        filters.retain(|f| f.name != filter_name);
        if filters.len() == before {
            return Err(CloudError::NotFound(filter_name.to_string()));
        }
        state
            .deleted_filters
            .push((log_group.to_string(), filter_name.to_string()));
        Ok(())
    }
}

impl FakeCloud {
    /// Executing the log ingestion change set deploys the ingestion function.
    fn deploy_ingestion_function(&self) {
        let mut state = self.state();
        if !Self::function_exists(&state, INGESTION_FUNCTION) {
            let summary = FunctionSummary {
                name: INGESTION_FUNCTION.to_string(),
                arn: ingestion_arn(),
            };
            match state.function_pages.last_mut() {
                Some(last) => last.push(summary),
                None => state.function_pages.push(vec![summary]),
            }
        }
    }
}
