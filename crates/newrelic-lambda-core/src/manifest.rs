// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::Path;

use crate::error::PluginError;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_STAGE: &str = "dev";
const IAM_ROLE_RESOURCE_TYPE: &str = "AWS::IAM::Role";

pub type Environment = IndexMap<String, Value>;

/// The parts of `serverless.yml` this crate reads or mutates. Everything else rides along in
/// the flattened `extra` maps so that writing the manifest back does not drop user keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Value>,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Plugins>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub custom: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub functions: IndexMap<String, FunctionDef>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_cloud_formation_template: Option<Value>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<Package>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Package {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patterns: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

/// `plugins` is either a plain list or the `{ localPath, modules }` form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Plugins {
    List(Vec<String>),
    Enhanced {
        #[serde(default)]
        modules: Vec<String>,
        #[serde(flatten)]
        extra: IndexMap<String, Value>,
    },
}

impl Plugins {
    pub fn modules(&self) -> &[String] {
        match self {
            Plugins::List(modules) | Plugins::Enhanced { modules, .. } => modules,
        }
    }
}

impl Manifest {
    pub fn from_yaml_str(contents: &str) -> Result<Self, PluginError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn to_yaml_string(&self) -> Result<String, PluginError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub async fn load(path: &Path) -> Result<Self, PluginError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_yaml_str(&contents)
    }

    pub async fn save(&self, path: &Path) -> Result<(), PluginError> {
        tokio::fs::write(path, self.to_yaml_string()?).await?;
        Ok(())
    }

    /// `service` may be a bare string or a `{ name: ... }` mapping.
    pub fn service_name(&self) -> Option<&str> {
        match self.service.as_ref()? {
            Value::String(name) => Some(name),
            other => other.get("name").and_then(Value::as_str),
        }
    }

    pub fn region(&self) -> &str {
        self.provider.region.as_deref().unwrap_or(DEFAULT_REGION)
    }

    /// CLI stage wins over `provider.stage`, which wins over the framework default.
    pub fn stage<'a>(&'a self, cli_stage: Option<&'a str>) -> &'a str {
        cli_stage
            .or(self.provider.stage.as_deref())
            .unwrap_or(DEFAULT_STAGE)
    }

    pub fn plugin_modules(&self) -> &[String] {
        self.plugins.as_ref().map(Plugins::modules).unwrap_or(&[])
    }

    /// Name the function is deployed under: explicit `name`, else `<service>-<stage>-<key>`.
    pub fn deployed_name(&self, key: &str, stage: &str) -> String {
        if let Some(name) = self.functions.get(key).and_then(|f| f.name.as_ref()) {
            return name.clone();
        }
        match self.service_name() {
            Some(service) => format!("{service}-{stage}-{key}"),
            None => key.to_string(),
        }
    }

    pub fn deployed_names(&self, stage: &str) -> Vec<String> {
        self.functions
            .keys()
            .map(|key| self.deployed_name(key, stage))
            .collect()
    }

    pub fn provider_env_str(&self, key: &str) -> Option<String> {
        self.provider
            .environment
            .as_ref()
            .and_then(|env| env.get(key))
            .and_then(value_to_string)
    }

    /// Appends `policy_arns` to every IAM role in the compiled template, or to
    /// `provider.iam.role.managedPolicies` when the template has not been compiled yet.
    /// Returns the number of roles touched.
    pub fn attach_managed_policies(&mut self, policy_arns: &[String]) -> usize {
        if policy_arns.is_empty() {
            return 0;
        }

        if let Some(resources) = self
            .provider
            .compiled_cloud_formation_template
            .as_mut()
            .and_then(|template| template.get_mut("Resources"))
            .and_then(Value::as_mapping_mut)
        {
            let mut touched = 0;
            for (_, resource) in resources.iter_mut() {
                if resource.get("Type").and_then(Value::as_str) != Some(IAM_ROLE_RESOURCE_TYPE) {
                    continue;
                }
                let Some(properties) = resource.as_mapping_mut().map(|r| {
                    r.entry(Value::from("Properties"))
                        .or_insert_with(|| Value::Mapping(Mapping::new()))
                }) else {
                    continue;
                };
                if let Some(properties) = properties.as_mapping_mut() {
                    merge_into_sequence(properties, "ManagedPolicyArns", policy_arns);
                    touched += 1;
                }
            }
            return touched;
        }

        let iam = self
            .provider
            .iam
            .get_or_insert_with(|| Value::Mapping(Mapping::new()));
        let Some(iam) = iam.as_mapping_mut() else {
            return 0;
        };
        let role = iam
            .entry(Value::from("role"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        // A string role is an existing role ARN that this deployment does not manage.
        match role.as_mapping_mut() {
            Some(role) => {
                merge_into_sequence(role, "managedPolicies", policy_arns);
                1
            }
            None => 0,
        }
    }
}

impl FunctionDef {
    pub fn env_mut(&mut self) -> &mut Environment {
        self.environment.get_or_insert_with(Environment::new)
    }

    pub fn env_str(&self, key: &str) -> Option<String> {
        self.environment
            .as_ref()
            .and_then(|env| env.get(key))
            .and_then(value_to_string)
    }

    /// Raw value of `key` when the user set it. Intrinsics such as `Ref` and `Fn::Sub`
    /// count as set even though they have no string form yet.
    pub fn env_value(&self, key: &str) -> Option<&Value> {
        self.environment
            .as_ref()
            .and_then(|env| env.get(key))
            .filter(|value| is_set(value))
    }

    pub fn env_is_set(&self, key: &str) -> bool {
        self.env_value(key).is_some()
    }

    pub fn set_env(&mut self, key: &str, value: impl Into<String>) {
        self.env_mut()
            .insert(key.to_string(), Value::String(value.into()));
    }

    /// Sets `key` only when the user has not already provided a value.
    pub fn set_env_default(&mut self, key: &str, value: impl Into<Value>) {
        if self.env_is_set(key) {
            return;
        }
        self.env_mut().insert(key.to_string(), value.into());
    }
}

fn is_set(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Scalar YAML values rendered the way the framework would pass them to Lambda.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn merge_into_sequence(mapping: &mut Mapping, key: &str, items: &[String]) {
    let entry = mapping
        .entry(Value::from(key))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if !entry.is_sequence() {
        *entry = Value::Sequence(Vec::new());
    }
    if let Some(sequence) = entry.as_sequence_mut() {
        for item in items {
            if !sequence.iter().any(|v| v.as_str() == Some(item.as_str())) {
                sequence.push(Value::String(item.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
service: orders
frameworkVersion: "3"
provider:
  name: aws
  runtime: nodejs18.x
  region: eu-west-1
  environment:
    NEW_RELIC_LOG_LEVEL: info
plugins:
  - serverless-webpack
  - serverless-newrelic-lambda-layers
custom:
  newRelic:
    accountId: 123
functions:
  create:
    handler: src/create.handler
    memorySize: 256
  named:
    name: custom-name
    handler: src/named.handler
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::from_yaml_str(MANIFEST).unwrap();
        assert_eq!(manifest.service_name(), Some("orders"));
        assert_eq!(manifest.region(), "eu-west-1");
        assert_eq!(manifest.stage(None), "dev");
        assert_eq!(manifest.stage(Some("prod")), "prod");
        assert_eq!(
            manifest.plugin_modules(),
            &["serverless-webpack", "serverless-newrelic-lambda-layers"]
        );
        assert_eq!(
            manifest.provider_env_str("NEW_RELIC_LOG_LEVEL"),
            Some("info".to_string())
        );
        assert!(manifest.extra.contains_key("frameworkVersion"));
    }

    #[test]
    fn test_deployed_names() {
        let manifest = Manifest::from_yaml_str(MANIFEST).unwrap();
        assert_eq!(
            manifest.deployed_names("prod"),
            vec!["orders-prod-create".to_string(), "custom-name".to_string()]
        );
    }

    #[test]
    fn test_unknown_keys_survive_serialization() {
        let manifest = Manifest::from_yaml_str(MANIFEST).unwrap();
        let reparsed = Manifest::from_yaml_str(&manifest.to_yaml_string().unwrap()).unwrap();
        assert_eq!(
            reparsed.functions["create"]
                .extra
                .get("memorySize")
                .and_then(Value::as_u64),
            Some(256)
        );
        assert_eq!(manifest, reparsed);
    }

    #[test]
    fn test_enhanced_plugins_form() {
        let manifest = Manifest::from_yaml_str(
            "service: svc\nplugins:\n  localPath: ./plugins\n  modules:\n    - serverless-newrelic-lambda-layers\n",
        )
        .unwrap();
        assert_eq!(
            manifest.plugin_modules(),
            &["serverless-newrelic-lambda-layers"]
        );
    }

    #[test]
    fn test_service_name_mapping_form() {
        let manifest = Manifest::from_yaml_str("service:\n  name: mapped\n").unwrap();
        assert_eq!(manifest.service_name(), Some("mapped"));
    }

    #[test]
    fn test_attach_policies_to_compiled_roles() {
        let mut manifest = Manifest::from_yaml_str(
            r#"
service: svc
provider:
  compiledCloudFormationTemplate:
    Resources:
      IamRoleLambdaExecution:
        Type: AWS::IAM::Role
        Properties:
          ManagedPolicyArns:
            - arn:aws:iam::aws:policy/existing
      Bucket:
        Type: AWS::S3::Bucket
"#,
        )
        .unwrap();
        let arns = vec!["arn:aws:iam::1:policy/NewRelic-ViewLicenseKey-us-east-1".to_string()];
        assert_eq!(manifest.attach_managed_policies(&arns), 1);
        assert_eq!(manifest.attach_managed_policies(&arns), 1);

        let role = &manifest.provider.compiled_cloud_formation_template.as_ref().unwrap()
            ["Resources"]["IamRoleLambdaExecution"]["Properties"]["ManagedPolicyArns"];
        assert_eq!(role.as_sequence().unwrap().len(), 2);
        assert!(manifest.provider.compiled_cloud_formation_template.as_ref().unwrap()
            ["Resources"]["Bucket"]
            .get("Properties")
            .is_none());
    }

    #[test]
    fn test_attach_policies_without_compiled_template() {
        let mut manifest = Manifest::from_yaml_str("service: svc\n").unwrap();
        let arns = vec!["arn:aws:iam::1:policy/p".to_string()];
        assert_eq!(manifest.attach_managed_policies(&arns), 1);
        let policies = &manifest.provider.iam.as_ref().unwrap()["role"]["managedPolicies"];
        assert_eq!(policies.as_sequence().unwrap().len(), 1);

        let mut external_role = Manifest::from_yaml_str(
            "service: svc\nprovider:\n  iam:\n    role: arn:aws:iam::1:role/external\n",
        )
        .unwrap();
        assert_eq!(external_role.attach_managed_policies(&arns), 0);
    }

    #[test]
    fn test_set_env_default_keeps_user_value() {
        let mut function = FunctionDef::default();
        function.set_env("NEW_RELIC_APP_NAME", "mine");
        function.set_env_default("NEW_RELIC_APP_NAME", "generated");
        function.set_env_default("NEW_RELIC_NO_CONFIG_FILE", "true");
        assert_eq!(function.env_str("NEW_RELIC_APP_NAME"), Some("mine".into()));
        assert_eq!(
            function.env_str("NEW_RELIC_NO_CONFIG_FILE"),
            Some("true".into())
        );
    }

    #[test]
    fn test_intrinsic_env_values_count_as_set() {
        let mut function: FunctionDef = serde_yaml::from_str(
            r#"
handler: index.handler
environment:
  NEW_RELIC_APP_NAME:
    Fn::Sub: "${AWS::StackName}-hello"
  NEW_RELIC_ACCOUNT_ID:
    Ref: NrAccountParam
  NEW_RELIC_LOG: ""
  NEW_RELIC_LOG_LEVEL: ~
"#,
        )
        .unwrap();
        let app_name = function.environment.as_ref().unwrap()["NEW_RELIC_APP_NAME"].clone();

        assert!(function.env_is_set("NEW_RELIC_APP_NAME"));
        assert!(function.env_is_set("NEW_RELIC_ACCOUNT_ID"));
        assert!(!function.env_is_set("NEW_RELIC_LOG"));
        assert!(!function.env_is_set("NEW_RELIC_LOG_LEVEL"));
        assert_eq!(function.env_str("NEW_RELIC_APP_NAME"), None);

        function.set_env_default("NEW_RELIC_APP_NAME", "hello");
        function.set_env_default("NEW_RELIC_LOG", "stdout");
        function.set_env_default("NEW_RELIC_LOG_LEVEL", "error");
        assert_eq!(function.env_value("NEW_RELIC_APP_NAME"), Some(&app_name));
        assert_eq!(function.env_str("NEW_RELIC_LOG"), Some("stdout".into()));
        assert_eq!(function.env_str("NEW_RELIC_LOG_LEVEL"), Some("error".into()));
    }
}
