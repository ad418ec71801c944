// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Deserializer};
use serde_aux::prelude::deserialize_bool_from_anything;
use serde_json::Value;
use tracing::error;

use crate::error::ConfigError;
use crate::manifest::Manifest;

/// Key of the configuration block under `custom` in `serverless.yml`
pub const CUSTOM_KEY: &str = "newRelic";
pub const DEFAULT_NR_REGION: &str = "us";
pub const DEFAULT_LOG_INGESTION_FUNCTION: &str = "newrelic-log-ingestion";
const DEFAULT_FILTER_PATTERN: &str = r#"?REPORT ?NR_LAMBDA_MONITORING ?"Task timed out" ?RequestId"#;

/// Which `HandlerWrapper` entrypoint Java functions are redirected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JavaHandler {
    #[default]
    HandleRequest,
    HandleStreamsRequest,
}

impl JavaHandler {
    pub fn method(self) -> &'static str {
        match self {
            JavaHandler::HandleRequest => "handleRequest",
            JavaHandler::HandleStreamsRequest => "handleStreamsRequest",
        }
    }
}

/// Resolved view of `custom.newRelic`. Every recognized option is listed here with its
/// default; the struct is not modified after [`PluginConfig::from_manifest`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginConfig {
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub account_id: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub api_key: Option<String>,
    /// License (ingest) key supplied directly; skips the NerdGraph lookup.
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub ingest_key: Option<String>,
    #[serde(deserialize_with = "deserialize_nr_region")]
    pub nr_region: String,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub layer_arn: Option<String>,
    #[serde(deserialize_with = "deserialize_string_list")]
    pub include: Vec<String>,
    #[serde(deserialize_with = "deserialize_string_list")]
    pub exclude: Vec<String>,
    #[serde(deserialize_with = "deserialize_bool_or_false")]
    pub prepend: bool,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub enable_extension: Option<bool>,
    #[serde(deserialize_with = "deserialize_bool_or_false")]
    pub enable_distributed_tracing: bool,
    #[serde(deserialize_with = "deserialize_bool_or_false")]
    pub enable_function_logs: bool,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub enable_extension_logs: Option<bool>,
    #[serde(deserialize_with = "deserialize_bool_or_false")]
    pub enable_integration: bool,
    #[serde(deserialize_with = "deserialize_bool_or_false")]
    pub log_enabled: bool,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub log_level: Option<String>,
    #[serde(deserialize_with = "deserialize_bool_or_false")]
    pub debug: bool,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub proxy: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string_list")]
    pub stages: Option<Vec<String>>,
    #[serde(deserialize_with = "deserialize_string_or_empty")]
    pub custom_role_policy: String,
    #[serde(deserialize_with = "deserialize_bool_or_false")]
    pub slim: bool,
    #[serde(deserialize_with = "deserialize_bool_or_false")]
    pub manual_wrapping: bool,
    #[serde(deserialize_with = "deserialize_java_handler")]
    pub java_new_relic_handler: JavaHandler,
    #[serde(deserialize_with = "deserialize_bool_or_false")]
    pub disable_auto_subscription: bool,
    #[serde(deserialize_with = "deserialize_bool_or_false")]
    pub disable_license_key_secret: bool,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub trusted_account_key: Option<String>,
    #[serde(deserialize_with = "deserialize_bool_or_false")]
    pub apm: bool,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub linked_account: Option<String>,
    #[serde(deserialize_with = "deserialize_string_list")]
    pub cloud_watch_filter: Vec<String>,
    #[serde(deserialize_with = "deserialize_log_ingestion_function_name")]
    pub log_ingestion_function_name: String,
    /// Second role name tried when `NewRelicLambdaIntegrationRole_<accountId>` is missing.
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub fallback_integration_role_name: Option<String>,
    /// Hoist the layer into `provider.layers` when every function shares one runtime.
    #[serde(deserialize_with = "deserialize_bool_or_false")]
    pub use_provider_layers: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            api_key: None,
            ingest_key: None,
            nr_region: DEFAULT_NR_REGION.to_string(),
            layer_arn: None,
            include: Vec::new(),
            exclude: Vec::new(),
            prepend: false,
            enable_extension: None,
            enable_distributed_tracing: false,
            enable_function_logs: false,
            enable_extension_logs: None,
            enable_integration: false,
            log_enabled: false,
            log_level: None,
            debug: false,
            proxy: None,
            stages: None,
            custom_role_policy: String::new(),
            slim: false,
            manual_wrapping: false,
            java_new_relic_handler: JavaHandler::default(),
            disable_auto_subscription: false,
            disable_license_key_secret: false,
            trusted_account_key: None,
            apm: false,
            linked_account: None,
            cloud_watch_filter: Vec::new(),
            log_ingestion_function_name: DEFAULT_LOG_INGESTION_FUNCTION.to_string(),
            fallback_integration_role_name: None,
            use_provider_layers: false,
        }
    }
}

impl PluginConfig {
    /// Reads `custom.newRelic`. A missing block yields the defaults; validation is separate
    /// so that stage gating can run before the key checks.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self, ConfigError> {
        let Some(block) = manifest.custom.get(CUSTOM_KEY) else {
            return Ok(Self::default());
        };
        if block.is_null() {
            return Ok(Self::default());
        }
        let value =
            serde_json::to_value(block).map_err(|e| ConfigError::Parse(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.is_none() && self.ingest_key.is_none() {
            return Err(ConfigError::MissingApiKey);
        }
        if !self.include.is_empty() && !self.exclude.is_empty() {
            return Err(ConfigError::IncludeExcludeConflict);
        }
        Ok(())
    }

    pub fn extension_disabled(&self) -> bool {
        self.enable_extension == Some(false)
    }

    /// Non-wrappable runtimes are only instrumented when the extension was opted into.
    pub fn extension_explicitly_enabled(&self) -> bool {
        self.enable_extension == Some(true)
    }

    pub fn stage_enabled(&self, stage: &str) -> bool {
        self.stages
            .as_ref()
            .map_or(true, |stages| stages.iter().any(|s| s == stage))
    }

    pub fn nerdgraph_url(&self) -> &'static str {
        match self.nr_region.as_str() {
            "eu" => "https://api.eu.newrelic.com/graphql",
            "staging" => "https://staging-api.newrelic.com/graphql",
            _ => "https://api.newrelic.com/graphql",
        }
    }

    pub fn linked_account_name(&self) -> String {
        self.linked_account.clone().unwrap_or_else(|| {
            format!(
                "New Relic Lambda Integration - {}",
                self.account_id.as_deref().unwrap_or_default()
            )
        })
    }

    /// Roles checked, in order, before the integration role stack is created.
    pub fn integration_role_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(account_id) = &self.account_id {
            names.push(format!("NewRelicLambdaIntegrationRole_{account_id}"));
        }
        if let Some(fallback) = &self.fallback_integration_role_name {
            if !names.contains(fallback) {
                names.push(fallback.clone());
            }
        }
        names
    }

    pub fn filter_pattern(&self) -> String {
        if !self.cloud_watch_filter.is_empty() {
            return self
                .cloud_watch_filter
                .iter()
                .map(|term| format!("?\"{term}\""))
                .collect::<Vec<_>>()
                .join(" ");
        }
        if self.log_enabled {
            return String::new();
        }
        DEFAULT_FILTER_PATTERN.to_string()
    }
}

pub fn deserialize_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Null => Ok(None),
        other => {
            error!(
                "Failed to parse value, expected a string, got: {}, ignoring",
                other
            );
            Ok(None)
        }
    }
}

pub fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => {
            if s.trim().is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Null => Ok(None),
        _ => {
            error!("Failed to parse value, expected a string or an integer, ignoring");
            Ok(None)
        }
    }
}

fn deserialize_string_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_optional_string(deserializer)?.unwrap_or_default())
}

pub fn deserialize_optional_bool_from_anything<'de, D>(
    deserializer: D,
) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    // First try to deserialize as Option<_> to handle null/missing values
    let opt: Option<Value> = Option::deserialize(deserializer)?;

    match opt {
        None => Ok(None),
        Some(value) => match deserialize_bool_from_anything(value) {
            Ok(bool_result) => Ok(Some(bool_result)),
            Err(e) => {
                error!("Failed to parse bool value: {}, ignoring", e);
                Ok(None)
            }
        },
    }
}

fn deserialize_bool_or_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_optional_bool_from_anything(deserializer)?.unwrap_or(false))
}

/// Accepts a YAML list or a comma-separated string.
pub fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_optional_string_list(deserializer)?.unwrap_or_default())
}

fn deserialize_optional_string_list<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(
            s.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        )),
        Value::Array(items) => Ok(Some(
            items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s),
                    Value::Number(n) => Some(n.to_string()),
                    other => {
                        error!("Failed to parse list item {}, ignoring", other);
                        None
                    }
                })
                .collect(),
        )),
        other => {
            error!("Failed to parse value, expected a list, got: {}, ignoring", other);
            Ok(None)
        }
    }
}

fn deserialize_nr_region<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_optional_string(deserializer)?
        .map(|region| region.to_lowercase())
        .unwrap_or_else(|| DEFAULT_NR_REGION.to_string()))
}

fn deserialize_log_ingestion_function_name<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_optional_string(deserializer)?
        .unwrap_or_else(|| DEFAULT_LOG_INGESTION_FUNCTION.to_string()))
}

fn deserialize_java_handler<'de, D>(deserializer: D) -> Result<JavaHandler, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match deserialize_optional_string(deserializer)?.as_deref() {
        Some("handleStreamsRequest") => JavaHandler::HandleStreamsRequest,
        _ => JavaHandler::HandleRequest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplicate::duplicate_item;

    fn config_from_yaml(block: &str) -> PluginConfig {
        let manifest = Manifest::from_yaml_str(&format!(
            "service: svc\ncustom:\n  newRelic:\n{}",
            block
                .lines()
                .map(|line| format!("    {line}\n"))
                .collect::<String>()
        ))
        .unwrap();
        PluginConfig::from_manifest(&manifest).unwrap()
    }

    #[test]
    fn test_missing_block_uses_defaults() {
        let manifest = Manifest::from_yaml_str("service: svc\n").unwrap();
        let config = PluginConfig::from_manifest(&manifest).unwrap();
        assert_eq!(config, PluginConfig::default());
        assert_eq!(config.nr_region, "us");
        assert_eq!(config.log_ingestion_function_name, "newrelic-log-ingestion");
        assert_eq!(config.java_new_relic_handler, JavaHandler::HandleRequest);
    }

    #[test]
    fn test_numeric_account_id() {
        let config = config_from_yaml("accountId: 123\napiKey: k");
        assert_eq!(config.account_id.as_deref(), Some("123"));
        assert_eq!(config.api_key.as_deref(), Some("k"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_api_and_ingest_key() {
        let config = config_from_yaml("accountId: 123");
        assert_eq!(config.validate(), Err(ConfigError::MissingApiKey));
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("valid New Relic API key"));
    }

    #[test]
    fn test_ingest_key_alone_is_enough() {
        let config = config_from_yaml("accountId: 123\ningestKey: license");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_include_exclude_conflict() {
        let config = config_from_yaml("apiKey: k\ninclude: [a]\nexclude: [b]");
        assert_eq!(config.validate(), Err(ConfigError::IncludeExcludeConflict));
    }

    #[test]
    fn test_comma_separated_lists() {
        let config = config_from_yaml("apiKey: k\nexclude: \"a, b,,c\"");
        assert_eq!(config.exclude, vec!["a", "b", "c"]);
    }

    #[duplicate_item(
        test_name                       raw          expected;
        [test_extension_bool_false]     ["false"]    [Some(false)];
        [test_extension_string_false]   ["'false'"]  [Some(false)];
        [test_extension_bool_true]      ["true"]     [Some(true)];
        [test_extension_string_true]    ["'true'"]   [Some(true)];
        [test_extension_numeric_zero]   ["0"]        [Some(false)];
        [test_extension_garbage]        ["maybe"]    [None];
    )]
    #[test]
    fn test_name() {
        let config = config_from_yaml(&format!("apiKey: k\nenableExtension: {}", raw));
        assert_eq!(config.enable_extension, expected);
    }

    #[test]
    fn test_string_bools_for_flags() {
        let config = config_from_yaml("apiKey: k\napm: 'true'\nprepend: 'false'\nslim: true");
        assert!(config.apm);
        assert!(!config.prepend);
        assert!(config.slim);
    }

    #[test]
    fn test_stage_gating() {
        let config = config_from_yaml("apiKey: k\nstages: [prod]");
        assert!(config.stage_enabled("prod"));
        assert!(!config.stage_enabled("dev"));
        assert!(PluginConfig::default().stage_enabled("anything"));
    }

    #[test]
    fn test_nerdgraph_url_by_region() {
        assert_eq!(
            config_from_yaml("nrRegion: EU").nerdgraph_url(),
            "https://api.eu.newrelic.com/graphql"
        );
        assert_eq!(
            config_from_yaml("nrRegion: staging").nerdgraph_url(),
            "https://staging-api.newrelic.com/graphql"
        );
        assert_eq!(
            PluginConfig::default().nerdgraph_url(),
            "https://api.newrelic.com/graphql"
        );
    }

    #[test]
    fn test_java_handler() {
        let config = config_from_yaml("javaNewRelicHandler: handleStreamsRequest");
        assert_eq!(config.java_new_relic_handler.method(), "handleStreamsRequest");
        let config = config_from_yaml("javaNewRelicHandler: somethingElse");
        assert_eq!(config.java_new_relic_handler.method(), "handleRequest");
    }

    #[test]
    fn test_filter_pattern() {
        assert_eq!(
            PluginConfig::default().filter_pattern(),
            r#"?REPORT ?NR_LAMBDA_MONITORING ?"Task timed out" ?RequestId"#
        );
        assert_eq!(config_from_yaml("logEnabled: true").filter_pattern(), "");
        assert_eq!(
            config_from_yaml("cloudWatchFilter: [ERROR, \"Task timed out\"]").filter_pattern(),
            r#"?"ERROR" ?"Task timed out""#
        );
    }

    #[test]
    fn test_integration_role_names() {
        let config = config_from_yaml("accountId: 42\nfallbackIntegrationRoleName: LegacyRole");
        assert_eq!(
            config.integration_role_names(),
            vec!["NewRelicLambdaIntegrationRole_42", "LegacyRole"]
        );
        assert_eq!(
            config.linked_account_name(),
            "New Relic Lambda Integration - 42"
        );
    }
}
