// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cloud::{ApplicationRequest, CloudError, CloudProvider, Page, StackRequest, StatusReport};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_POLLS: u32 = 120;

const CREATED: &[&str] = &["CREATE_COMPLETE"];
/// An executed change set updates the stack when it already existed.
const CREATED_OR_UPDATED: &[&str] = &["CREATE_COMPLETE", "UPDATE_COMPLETE"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    #[error("Something went wrong while creating aws resource {name}: status {status}")]
    Failed { name: String, status: String },

    #[error("Timed out waiting for {name} after {attempts} status checks (last status {status})")]
    TimedOut {
        name: String,
        attempts: u32,
        status: String,
    },

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Lifecycle of one provisioned resource during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Unknown,
    Checking,
    Found,
    Absent,
    Creating,
    Polling,
    Complete,
    Failed,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisionState::Unknown => "unknown",
            ProvisionState::Checking => "checking",
            ProvisionState::Found => "found",
            ProvisionState::Absent => "absent",
            ProvisionState::Creating => "creating",
            ProvisionState::Polling => "polling",
            ProvisionState::Complete => "complete",
            ProvisionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Polls a stack or change set until it completes, fails, or the attempt ceiling is
/// reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackWaiter {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for StackWaiter {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_POLLS,
        }
    }
}

impl StackWaiter {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn wait_for_stack(
        &self,
        cloud: &dyn CloudProvider,
        stack: &str,
    ) -> Result<(), ProvisionError> {
        self.wait(stack, CREATED, || cloud.stack_status(stack)).await
    }

    pub async fn wait_for_executed_stack(
        &self,
        cloud: &dyn CloudProvider,
        stack: &str,
    ) -> Result<(), ProvisionError> {
        self.wait(stack, CREATED_OR_UPDATED, || cloud.stack_status(stack))
            .await
    }

    pub async fn wait_for_change_set(
        &self,
        cloud: &dyn CloudProvider,
        change_set_id: &str,
    ) -> Result<(), ProvisionError> {
        self.wait(change_set_id, CREATED, || {
            cloud.change_set_status(change_set_id)
        })
        .await
    }

    async fn wait<F, Fut>(
        &self,
        name: &str,
        complete: &[&str],
        mut poll: F,
    ) -> Result<(), ProvisionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<StatusReport, CloudError>>,
    {
        let mut attempts = 0;
        let mut last_status = String::from("UNKNOWN");
        loop {
            attempts += 1;
            match poll().await {
                Ok(report) if complete.contains(&report.status.as_str()) => {
                    info!("Resource successfully created.");
                    return Ok(());
                }
                Ok(report) if report.status.contains("FAILED") => {
                    if let Some(reason) = &report.reason {
                        warn!("{} failed: {}", name, reason);
                    }
                    return Err(ProvisionError::Failed {
                        name: name.to_string(),
                        status: report.status,
                    });
                }
                Ok(report) => {
                    debug!("{} is {} (check {})", name, report.status, attempts);
                    last_status = report.status;
                }
                Err(CloudError::Transient(e)) => {
                    warn!("Transient error while checking {}: {}", name, e);
                }
                Err(e) => return Err(e.into()),
            }
            if attempts >= self.max_attempts {
                return Err(ProvisionError::TimedOut {
                    name: name.to_string(),
                    attempts,
                    status: last_status,
                });
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Fetches pages by marker until one yields items accepted by `matches` or the pages run
/// out. Returns the matches of the first matching page, empty when none matched.
pub async fn scan_pages<T, F, Fut, P>(mut fetch: F, mut matches: P) -> Result<Vec<T>, CloudError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, CloudError>>,
    P: FnMut(&T) -> bool,
{
    let mut marker = None;
    let mut pages = 0;
    loop {
        let page = fetch(marker.take()).await?;
        pages += 1;
        let found: Vec<T> = page.items.into_iter().filter(|item| matches(item)).collect();
        if !found.is_empty() {
            debug!("Scan matched on page {}", pages);
            return Ok(found);
        }
        match page.next_marker {
            Some(next) => marker = Some(next),
            None => return Ok(found),
        }
    }
}

/// Drives one resource through check, creation and polling, tracking its state.
pub struct Provisioner<'a> {
    cloud: &'a dyn CloudProvider,
    waiter: StackWaiter,
    resource: String,
    state: ProvisionState,
}

impl<'a> Provisioner<'a> {
    pub fn new(cloud: &'a dyn CloudProvider, waiter: StackWaiter, resource: &str) -> Self {
        Self {
            cloud,
            waiter,
            resource: resource.to_string(),
            state: ProvisionState::Unknown,
        }
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    fn transition(&mut self, next: ProvisionState) {
        debug!("{}: {} -> {}", self.resource, self.state, next);
        self.state = next;
    }

    /// Runs an existence check. The state ends as `Found` or `Absent`.
    pub async fn check<T, Fut>(&mut self, check: Fut) -> Result<Option<T>, CloudError>
    where
        Fut: Future<Output = Result<Option<T>, CloudError>>,
    {
        self.transition(ProvisionState::Checking);
        match check.await {
            Ok(Some(found)) => {
                self.transition(ProvisionState::Found);
                Ok(Some(found))
            }
            Ok(None) => {
                self.transition(ProvisionState::Absent);
                Ok(None)
            }
            Err(e) => {
                self.transition(ProvisionState::Failed);
                Err(e)
            }
        }
    }

    /// Creates a stack from a template and waits for it. An existing stack of the same
    /// name counts as provisioned.
    pub async fn create_stack(&mut self, request: StackRequest) -> Result<(), ProvisionError> {
        self.transition(ProvisionState::Creating);
        let stack_name = request.stack_name.clone();
        let stack_id = match self.cloud.create_stack(request).await {
            Ok(stack_id) => stack_id,
            Err(CloudError::AlreadyExists(_)) => {
                info!("Stack {} already exists; skipping creation.", stack_name);
                self.transition(ProvisionState::Complete);
                return Ok(());
            }
            Err(e) => {
                self.transition(ProvisionState::Failed);
                return Err(e.into());
            }
        };
        self.transition(ProvisionState::Polling);
        let outcome = self.waiter.wait_for_stack(self.cloud, &stack_id).await;
        self.finish(outcome)
    }

    /// Deploys a serverless application: change set, poll, execute, then poll the stack.
    pub async fn deploy_application(
        &mut self,
        request: ApplicationRequest,
    ) -> Result<(), ProvisionError> {
        self.transition(ProvisionState::Creating);
        let stack_name = request.stack_name.clone();
        let operation = match self.cloud.create_application_change_set(request).await {
            Ok(operation) => operation,
            Err(CloudError::AlreadyExists(_)) => {
                info!("Stack {} already exists; skipping creation.", stack_name);
                self.transition(ProvisionState::Complete);
                return Ok(());
            }
            Err(e) => {
                self.transition(ProvisionState::Failed);
                return Err(e.into());
            }
        };
        self.transition(ProvisionState::Polling);
        let outcome = async {
            self.waiter
                .wait_for_change_set(self.cloud, &operation.change_set_id)
                .await?;
            self.cloud
                .execute_change_set(&operation.change_set_id)
                .await?;
            self.waiter
                .wait_for_executed_stack(self.cloud, &operation.stack_id)
                .await
        }
        .await;
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: Result<(), ProvisionError>) -> Result<(), ProvisionError> {
        match outcome {
            Ok(()) => {
                self.transition(ProvisionState::Complete);
                Ok(())
            }
            Err(e) => {
                self.transition(ProvisionState::Failed);
                Err(e)
            }
        }
    }
}
