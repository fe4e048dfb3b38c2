use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::{Validate, ValidationError};

use crate::core::client::access::{standard_permissions, PermissionSet};
use crate::core::client::kube_client::build_kube_client;
use crate::core::resources::settings::{CpuSetting, MemorySetting, ReplicasSetting};
use crate::errors::{Error, Result};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// How to handle a failed adjustment of a Kubernetes resource.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    Rollback,
    Destroy,
    Ignore,
    #[default]
    Crash,
}

impl FailureMode {
    pub fn options() -> [&'static str; 4] {
        ["rollback", "destroy", "ignore", "crash"]
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureMode::Rollback => "rollback",
            FailureMode::Destroy => "destroy",
            FailureMode::Ignore => "ignore",
            FailureMode::Crash => "crash",
        };
        write!(f, "{name}")
    }
}

/// The ways optimization can be performed on a controller.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StrategyType {
    /// Adjustments are applied directly to the target controller.
    #[default]
    Default,
    /// Adjustments are applied to a standalone tuning pod cloned from the
    /// target controller, leaving the target untouched.
    Canary,
}

/// Strategy selection, either a bare name or a configuration object
/// carrying strategy options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OptimizationStrategy {
    Name(StrategyType),
    Config {
        #[serde(rename = "type")]
        type_: StrategyType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
}

impl Default for OptimizationStrategy {
    fn default() -> Self {
        OptimizationStrategy::Name(StrategyType::Default)
    }
}

impl OptimizationStrategy {
    pub fn strategy_type(&self) -> StrategyType {
        match self {
            OptimizationStrategy::Name(type_) => *type_,
            OptimizationStrategy::Config { type_, .. } => *type_,
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match self {
            OptimizationStrategy::Name(_) => None,
            OptimizationStrategy::Config { alias, .. } => alias.as_deref(),
        }
    }
}

/// Serde support for human-readable durations ("5m", "90s").
mod duration_string {
    use super::*;
    use serde::{de, Deserializer, Serializer};

    pub fn parse(value: &serde_json::Value) -> Result<Duration> {
        match value {
            serde_json::Value::String(text) => parse_duration::parse(text)
                .map_err(|e| Error::Configuration(format!("invalid duration '{text}': {e}"))),
            serde_json::Value::Number(seconds) => seconds
                .as_f64()
                .map(Duration::from_secs_f64)
                .ok_or_else(|| Error::Configuration(format!("invalid duration: {seconds}"))),
            other => Err(Error::Configuration(format!("invalid duration: {other}"))),
        }
    }

    pub fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Duration, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        parse(&value).map_err(de::Error::custom)
    }
}

mod duration_string_opt {
    use super::*;
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => super::duration_string::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        if value.is_null() {
            return Ok(None);
        }
        super::duration_string::parse(&value)
            .map(Some)
            .map_err(de::Error::custom)
    }
}

fn validate_dns_subdomain(name: &str) -> std::result::Result<(), ValidationError> {
    let valid_interior = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    let valid_ends = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());
    if valid_interior && valid_ends {
        Ok(())
    } else {
        Err(ValidationError::new("dns_subdomain"))
    }
}

fn validate_container_tag(name: &str) -> std::result::Result<(), ValidationError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    let valid_rest = chars.all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/' | ':' | '@')
    });
    if valid_start && valid_rest {
        Ok(())
    } else {
        Err(ValidationError::new("container_tag"))
    }
}

/// Configuration of an optimizable container within a controller.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ContainerConfiguration {
    #[validate(length(min = 1, max = 128), custom(function = validate_container_tag))]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    pub cpu: CpuSetting,
    pub memory: MemorySetting,
}

/// Configuration of an optimizable controller (Deployment or Argo Rollout).
///
/// Common settings (`namespace`, `timeout`, `settlement`, `on_failure`,
/// `kubeconfig`, `context`) are optional here; unset fields are filled from
/// the parent [`KubernetesConfiguration`] by the cascade. `Option::None`
/// carries the "not explicitly set" bit from parse time, so a user value
/// that happens to equal the parent default is never clobbered.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ControllerConfiguration {
    #[validate(length(min = 1, max = 253), custom(function = validate_dns_subdomain))]
    pub name: String,
    #[validate(length(min = 1), nested)]
    pub containers: Vec<ContainerConfiguration>,
    #[serde(default)]
    pub strategy: OptimizationStrategy,
    pub replicas: ReplicasSetting,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, with = "duration_string_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "duration_string_opt", skip_serializing_if = "Option::is_none")]
    pub settlement: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<FailureMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ControllerConfiguration {
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn settlement(&self) -> Option<Duration> {
        self.settlement
    }

    pub fn on_failure(&self) -> FailureMode {
        self.on_failure.unwrap_or_default()
    }
}

/// Root configuration for the Kubernetes optimization core.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct KubernetesConfiguration {
    #[serde(default = "default_namespace")]
    #[validate(length(min = 1, max = 253), custom(function = validate_dns_subdomain))]
    pub namespace: String,
    #[serde(default = "default_timeout", with = "duration_string")]
    pub timeout: Duration,
    #[serde(default, with = "duration_string_opt", skip_serializing_if = "Option::is_none")]
    pub settlement: Option<Duration>,
    #[serde(default)]
    pub on_failure: FailureMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default = "standard_permissions")]
    pub permissions: Vec<PermissionSet>,
    #[serde(default)]
    #[validate(nested)]
    pub deployments: Vec<ControllerConfiguration>,
    #[serde(default)]
    #[validate(nested)]
    pub rollouts: Vec<ControllerConfiguration>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

impl Default for KubernetesConfiguration {
    fn default() -> Self {
        KubernetesConfiguration {
            namespace: default_namespace(),
            timeout: DEFAULT_TIMEOUT,
            settlement: None,
            on_failure: FailureMode::default(),
            kubeconfig: None,
            context: None,
            permissions: standard_permissions(),
            deployments: Vec::new(),
            rollouts: Vec::new(),
        }
    }
}

impl KubernetesConfiguration {
    /// Validate and cascade; the canonical way to finish construction.
    pub fn prepare(mut self) -> Result<Self> {
        self.cascade_common_settings(false);
        self.validate()
            .map_err(|errors| Error::Configuration(errors.to_string()))?;
        Ok(self)
    }

    /// Propagate common settings into every child controller configuration.
    /// Only fields the user did not set explicitly are filled; `overwrite`
    /// replaces child values unconditionally.
    pub fn cascade_common_settings(&mut self, overwrite: bool) {
        let namespace = self.namespace.clone();
        let timeout = self.timeout;
        let settlement = self.settlement;
        let on_failure = self.on_failure;
        let kubeconfig = self.kubeconfig.clone();
        let context = self.context.clone();

        for child in self.deployments.iter_mut().chain(self.rollouts.iter_mut()) {
            if overwrite || child.namespace.is_none() {
                child.namespace = Some(namespace.clone());
            }
            if overwrite || child.timeout.is_none() {
                child.timeout = Some(timeout);
            }
            if (overwrite || child.settlement.is_none()) && settlement.is_some() {
                child.settlement = settlement;
            }
            if overwrite || child.on_failure.is_none() {
                child.on_failure = Some(on_failure);
            }
            if (overwrite || child.kubeconfig.is_none()) && kubeconfig.is_some() {
                child.kubeconfig = kubeconfig.clone();
            }
            if (overwrite || child.context.is_none()) && context.is_some() {
                child.context = context.clone();
            }
            debug!("cascaded common settings to controller '{}'", child.name);
        }
    }

    /// Build a Kubernetes client according to the configured loading order.
    pub async fn build_client(&self) -> Result<Client> {
        build_kube_client(self.kubeconfig.as_deref(), self.context.as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn controller(name: &str) -> ControllerConfiguration {
        serde_json::from_value(json!({
            "name": name,
            "replicas": { "min": 1, "max": 4 },
            "containers": [{
                "name": name,
                "cpu": { "min": "125m", "max": "4", "step": "125m" },
                "memory": { "min": "128Mi", "max": "4Gi", "step": "128Mi" }
            }]
        }))
        .unwrap()
    }

    #[test]
    fn cascade_fills_unset_child_settings() {
        let mut config = KubernetesConfiguration {
            namespace: "perf".to_string(),
            timeout: Duration::from_secs(120),
            on_failure: FailureMode::Rollback,
            deployments: vec![controller("fiber-http")],
            ..Default::default()
        };
        config.cascade_common_settings(false);

        let child = &config.deployments[0];
        assert_eq!(child.namespace(), "perf");
        assert_eq!(child.timeout(), Duration::from_secs(120));
        assert_eq!(child.on_failure(), FailureMode::Rollback);
    }

    #[test]
    fn cascade_preserves_explicitly_set_child_settings() {
        let mut child = controller("fiber-http");
        child.namespace = Some("edge".to_string());
        child.on_failure = Some(FailureMode::Ignore);

        let mut config = KubernetesConfiguration {
            namespace: "perf".to_string(),
            on_failure: FailureMode::Rollback,
            deployments: vec![child],
            ..Default::default()
        };
        config.cascade_common_settings(false);

        let child = &config.deployments[0];
        assert_eq!(child.namespace(), "edge");
        assert_eq!(child.on_failure(), FailureMode::Ignore);
        // Unset fields still inherit.
        assert_eq!(child.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(child.timeout, Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn overwrite_mode_replaces_child_settings() {
        let mut child = controller("fiber-http");
        child.namespace = Some("edge".to_string());

        let mut config = KubernetesConfiguration {
            namespace: "perf".to_string(),
            deployments: vec![child],
            ..Default::default()
        };
        config.cascade_common_settings(true);
        assert_eq!(config.deployments[0].namespace(), "perf");
    }

    #[test]
    fn strategy_parses_bare_names_and_config_objects() {
        let bare: OptimizationStrategy = serde_json::from_value(json!("canary")).unwrap();
        assert_eq!(bare.strategy_type(), StrategyType::Canary);
        assert_eq!(bare.alias(), None);

        let object: OptimizationStrategy =
            serde_json::from_value(json!({ "type": "canary", "alias": "tuning" })).unwrap();
        assert_eq!(object.strategy_type(), StrategyType::Canary);
        assert_eq!(object.alias(), Some("tuning"));
    }

    #[test]
    fn durations_parse_human_strings() {
        let config: KubernetesConfiguration = serde_json::from_value(json!({
            "timeout": "5m",
            "settlement": "30s"
        }))
        .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.settlement, Some(Duration::from_secs(30)));
    }

    #[test]
    fn prepare_rejects_invalid_names() {
        let mut config = KubernetesConfiguration::default();
        config.deployments.push(controller("fiber-http"));
        config.deployments[0].name = "-bad-name".to_string();
        assert!(matches!(
            config.prepare().unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn prepare_requires_at_least_one_container() {
        let mut config = KubernetesConfiguration::default();
        let mut child = controller("fiber-http");
        child.containers.clear();
        config.deployments.push(child);
        assert!(matches!(
            config.prepare().unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn defaults_match_the_documented_contract() {
        let config = KubernetesConfiguration::default();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.on_failure, FailureMode::Crash);
        assert_eq!(config.permissions.len(), 3);
        assert_eq!(FailureMode::options(), ["rollback", "destroy", "ignore", "crash"]);
    }
}
