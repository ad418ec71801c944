// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal NerdGraph (New Relic GraphQL) client covering the license key lookup, linked
//! account listing and the two cloud integration mutations.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::deserialize_string_or_int;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NerdGraphError {
    #[error("NerdGraph request failed: {0}")]
    Transport(String),

    #[error("Unexpected NerdGraph response: {0}")]
    Decode(String),

    #[error("NerdGraph returned errors: {0}")]
    Remote(String),

    #[error("Invalid New Relic id {0:?}: expected an integer")]
    InvalidId(String),
}

/// AWS account already linked to the New Relic account
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedAccount {
    #[serde(default, deserialize_with = "deserialize_string_or_int")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_string_or_int")]
    pub external_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_string_or_int")]
    pub nr_account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

pub struct NerdGraphClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

const LICENSE_KEY_QUERY: &str = "query($accountId: Int!) { actor { account(id: $accountId) \
     { licenseKey name id } } }";

const LINKED_ACCOUNTS_QUERY: &str = "query($accountId: Int!) { actor { account(id: $accountId) \
     { cloud { linkedAccounts { id name createdAt updatedAt authLabel externalId nrAccountId } } } } }";

const LINK_ACCOUNT_MUTATION: &str = "mutation($accountId: Int!, $accounts: CloudLinkCloudAccountsInput!) \
     { cloudLinkAccount(accountId: $accountId, accounts: $accounts) \
     { linkedAccounts { id name } errors { message } } }";

const CONFIGURE_INTEGRATION_MUTATION: &str = "mutation($accountId: Int!, $integrations: CloudIntegrationsInput!) \
     { cloudConfigureIntegration(accountId: $accountId, integrations: $integrations) \
     { integrations { id name service { id name } } errors { linkedAccountId message } } }";

/// Account and linked account ids are GraphQL `Int`s.
fn parse_id(id: &str) -> Result<i64, NerdGraphError> {
    id.trim()
        .parse()
        .map_err(|_| NerdGraphError::InvalidId(id.to_string()))
}

fn join_messages<'a>(messages: impl Iterator<Item = &'a str>) -> String {
    messages.collect::<Vec<_>>().join("; ")
}

/// Messages of a mutation's `errors` array, if any.
fn mutation_errors(payload: &Value) -> Option<String> {
    let errors = payload.get("errors")?.as_array()?;
    if errors.is_empty() {
        return None;
    }
    Some(join_messages(
        errors
            .iter()
            .map(|e| e.get("message").and_then(Value::as_str).unwrap_or("unknown error")),
    ))
}

impl NerdGraphClient {
    pub fn new(client: reqwest::Client, url: &str, api_key: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn query(&self, query: &str, variables: Value) -> Result<Value, NerdGraphError> {
        debug!("Sending NerdGraph request to {}", self.url);
        let response = self
            .client
            .post(&self.url)
            .header("API-Key", &self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| NerdGraphError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NerdGraphError::Transport(format!(
                "unexpected status {status}"
            )));
        }
        let body: GraphQlResponse = response
            .json()
            .await
            .map_err(|e| NerdGraphError::Decode(e.to_string()))?;
        if !body.errors.is_empty() {
            return Err(NerdGraphError::Remote(join_messages(
                body.errors.iter().map(|e| e.message.as_str()),
            )));
        }
        Ok(body.data.unwrap_or(Value::Null))
    }

    pub async fn fetch_license_key(
        &self,
        account_id: &str,
    ) -> Result<Option<String>, NerdGraphError> {
        let data = self
            .query(
                LICENSE_KEY_QUERY,
                json!({ "accountId": parse_id(account_id)? }),
            )
            .await?;
        Ok(data
            .pointer("/actor/account/licenseKey")
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .map(String::from))
    }

    pub async fn fetch_linked_accounts(
        &self,
        account_id: &str,
    ) -> Result<Vec<LinkedAccount>, NerdGraphError> {
        let data = self
            .query(
                LINKED_ACCOUNTS_QUERY,
                json!({ "accountId": parse_id(account_id)? }),
            )
            .await?;
        match data.pointer("/actor/account/cloud/linkedAccounts") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(accounts) => serde_json::from_value(accounts.clone())
                .map_err(|e| NerdGraphError::Decode(e.to_string())),
        }
    }

    /// Links the AWS account behind `role_arn`. Returns the new linked account id.
    pub async fn link_account(
        &self,
        account_id: &str,
        role_arn: &str,
        linked_account: &str,
    ) -> Result<Option<String>, NerdGraphError> {
        let variables = json!({
            "accountId": parse_id(account_id)?,
            "accounts": { "aws": [{ "arn": role_arn, "name": linked_account }] },
        });
        let data = self.query(LINK_ACCOUNT_MUTATION, variables).await?;
        let payload = data.get("cloudLinkAccount").cloned().unwrap_or_default();
        if let Some(errors) = mutation_errors(&payload) {
            return Err(NerdGraphError::Remote(errors));
        }
        Ok(payload
            .pointer("/linkedAccounts/0/id")
            .and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }))
    }

    pub async fn configure_lambda_integration(
        &self,
        account_id: &str,
        linked_account_id: &str,
    ) -> Result<(), NerdGraphError> {
        let variables = json!({
            "accountId": parse_id(account_id)?,
            "integrations": {
                "aws": { "lambda": [{ "linkedAccountId": parse_id(linked_account_id)? }] }
            },
        });
        let data = self.query(CONFIGURE_INTEGRATION_MUTATION, variables).await?;
        let payload = data
            .get("cloudConfigureIntegration")
            .cloned()
            .unwrap_or_default();
        match mutation_errors(&payload) {
            Some(errors) => Err(NerdGraphError::Remote(errors)),
            None => Ok(()),
        }
    }
}
