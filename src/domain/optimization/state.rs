use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use kube::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{FailureMode, KubernetesConfiguration, StrategyType};
use crate::core::client::controllers::ControllerKind;
use crate::core::client::kube_client::AgentIdentity;
use crate::core::client::namespaces::Namespace;
use crate::core::resources::settings::{Adjustment, Component, Description};
use crate::domain::optimization::canary::CanaryOptimization;
use crate::domain::optimization::direct::DirectOptimization;
use crate::domain::optimization::Optimization;
use crate::errors::{Error, RejectionReason, Result};

/// Per-adjustment control values supplied by the optimizer. A settlement
/// here overrides the configured settlement duration.
#[derive(Debug, Clone, Default)]
pub struct Control {
    pub settlement: Option<Duration>,
}

const READINESS_TIMEOUT: Duration = Duration::from_secs(60);
const SETTLEMENT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Stable SHA-256 digest of any serializable value, used to detect
/// out-of-band cluster mutations between optimization cycles.
pub fn hash_spec<T: Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let spec_bytes = serde_json::to_vec(spec).expect("hash input must serialize");
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    hex::encode(hasher.finalize())
}

/// The state of all resources under optimization in the cluster: one
/// optimization per configured controller, plus the checksums that pin the
/// observed cluster state.
pub struct OptimizationState {
    config: KubernetesConfiguration,
    namespace: Namespace,
    optimizations: Vec<Box<dyn Optimization>>,
    /// Digest of the pod template specs, sorted by controller name.
    pub spec_id: String,
    /// Digest of the optimization-name to pod-uid mapping.
    pub runtime_id: String,
    /// Digest of the container images, sorted by container name.
    pub version_id: String,
}

impl OptimizationState {
    /// Read the state of every configured target from the cluster and
    /// build its optimization.
    pub async fn create(client: &Client, config: KubernetesConfiguration) -> Result<Self> {
        let identity = AgentIdentity::from_env();
        let namespace = Namespace::read(client, &config.namespace).await?;

        let mut optimizations: Vec<Box<dyn Optimization>> = Vec::new();
        let mut pod_template_specs: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let mut runtime_ids: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut images: BTreeMap<String, String> = BTreeMap::new();

        let targets = config
            .deployments
            .iter()
            .map(|cfg| (ControllerKind::Deployment, cfg))
            .chain(config.rollouts.iter().map(|cfg| (ControllerKind::Rollout, cfg)));

        for (kind, controller_config) in targets {
            let optimization: Box<dyn Optimization> =
                match controller_config.strategy.strategy_type() {
                    StrategyType::Default => Box::new(
                        DirectOptimization::create(client, controller_config, kind).await?,
                    ),
                    StrategyType::Canary => Box::new(
                        CanaryOptimization::create(
                            client,
                            controller_config,
                            kind,
                            identity.clone(),
                        )
                        .await?,
                    ),
                };

            // Collect the artifacts the checksums are computed over.
            let controller = optimization.controller();
            let pods = controller.get_pods().await?;
            runtime_ids.insert(
                optimization.name().to_string(),
                pods.iter().map(|pod| pod.uid().to_string()).collect(),
            );
            let template_spec = controller.pod_template().and_then(|t| t.spec.as_ref());
            pod_template_specs.insert(
                controller.name().to_string(),
                serde_json::to_value(template_spec).unwrap_or_default(),
            );
            if let Some(container) = controller.find_container(optimization.container_name()) {
                images.insert(
                    container.name.clone(),
                    container.image.clone().unwrap_or_default(),
                );
            }

            optimizations.push(optimization);
        }

        // BTreeMap iteration yields name-sorted values, pinning the digests
        // against enumeration order.
        let spec_id = hash_spec(&pod_template_specs.values().collect::<Vec<_>>());
        let runtime_id = hash_spec(&runtime_ids);
        let version_id = hash_spec(&images.values().collect::<Vec<_>>());
        debug!(
            "optimization state created: spec_id={spec_id} runtime_id={runtime_id} version_id={version_id}"
        );

        Ok(OptimizationState {
            config,
            namespace,
            optimizations,
            spec_id,
            runtime_id,
            version_id,
        })
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn find_optimization(&self, name: &str) -> Option<&dyn Optimization> {
        self.optimizations
            .iter()
            .find(|optimization| optimization.name() == name)
            .map(|optimization| optimization.as_ref())
    }

    /// The optimizer-facing view of everything under optimization.
    pub fn to_components(&self) -> Vec<Component> {
        self.optimizations
            .iter()
            .flat_map(|optimization| optimization.to_components())
            .collect()
    }

    pub fn to_description(&self) -> Description {
        Description {
            components: self.to_components(),
        }
    }

    /// Apply a batch of adjustments and wait for them to take effect.
    ///
    /// Adjustments are first staged locally by component name; unknown
    /// names are dropped with a warning. All optimizations then apply
    /// concurrently with a grace window beyond the per-optimization timeout
    /// so their own deadlines expire first and produce precise errors.
    pub async fn apply(&mut self, adjustments: &[Adjustment]) -> Result<()> {
        if adjustments.is_empty() {
            debug!("early exiting from adjust: no adjustments");
            return Ok(());
        }

        info!("Applying {} Kubernetes adjustment(s)", adjustments.len());
        for adjustment in adjustments {
            match self
                .optimizations
                .iter_mut()
                .find(|optimization| optimization.name() == adjustment.component_name)
            {
                Some(optimization) => {
                    info!(
                        "adjusting {}: {} = {}",
                        adjustment.component_name, adjustment.setting_name, adjustment.value
                    );
                    optimization.adjust(adjustment)?;
                }
                None => {
                    warn!(
                        "ignoring unrecognized adjustment targeting '{}'",
                        adjustment.component_name
                    );
                }
            }
        }

        if self.optimizations.is_empty() {
            warn!("failed to apply adjustments: no adjustables");
            return Ok(());
        }

        let mode = self.config.on_failure;
        let timeout = self.config.timeout + Duration::from_secs(60);
        debug!(
            "waiting for adjustments to take effect on {} optimization(s)",
            self.optimizations.len()
        );

        let applies = join_all(
            self.optimizations
                .iter_mut()
                .map(|optimization| optimization.apply()),
        );
        match tokio::time::timeout(timeout, applies).await {
            Ok(results) => {
                for result in results {
                    if let Err(error) = result {
                        self.dispatch_error(error, mode).await?;
                    }
                }
                Ok(())
            }
            Err(_) => {
                let error = Error::Timeout {
                    condition: "adjustments to apply".to_string(),
                    timeout,
                };
                self.dispatch_error(error, mode).await
            }
        }
    }

    /// Route an apply failure through the configured failure mode, offering
    /// it to each optimization until one claims to have handled it. An
    /// unhandled error propagates unchanged.
    async fn dispatch_error(&mut self, error: Error, mode: FailureMode) -> Result<()> {
        for optimization in self.optimizations.iter_mut() {
            match optimization.handle_error(&error, mode).await {
                Ok(true) => return Ok(()),
                Ok(false) => return Err(error),
                Err(handler_error) => {
                    warn!("handle_error failed: {handler_error}");
                    return Err(error);
                }
            }
        }
        Err(error)
    }

    /// Whether every optimization target is ready.
    pub async fn is_ready(&self) -> Result<bool> {
        if self.optimizations.is_empty() {
            warn!("no optimizations to check for readiness");
            return Ok(true);
        }

        debug!(
            "checking readiness of {} optimization(s)",
            self.optimizations.len()
        );
        let checks = join_all(
            self.optimizations
                .iter()
                .map(|optimization| optimization.is_ready()),
        );
        let results = tokio::time::timeout(READINESS_TIMEOUT, checks)
            .await
            .map_err(|_| Error::Timeout {
                condition: "optimization readiness".to_string(),
                timeout: READINESS_TIMEOUT,
            })?;

        for result in results {
            if !result? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Observe the targets for a settlement window, requiring readiness to
    /// hold throughout and at the end of the window.
    pub async fn settle(&self, duration: Duration) -> Result<()> {
        info!(
            "settlement duration of {:?} requested, waiting for pods to settle...",
            duration
        );
        let deadline = tokio::time::Instant::now() + duration;

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(SETTLEMENT_POLL_INTERVAL.min(deadline - now)).await;

            if !self.is_ready().await? {
                return Err(Error::rejected(
                    RejectionReason::UnreadyDuringSettlement,
                    "optimization target became unready during adjustment settlement period",
                ));
            }
        }

        if !self.is_ready().await? {
            return Err(Error::rejected(
                RejectionReason::UnreadyDuringSettlement,
                "optimization target became unready after adjustment settlement period",
            ));
        }

        info!("settlement duration of {:?} has elapsed, resuming optimization", duration);
        Ok(())
    }

    /// The full adjustment pipeline: stage and apply the adjustments,
    /// observe the optional settlement window, and report the resulting
    /// cluster state.
    pub async fn adjust(
        &mut self,
        adjustments: &[Adjustment],
        control: &Control,
    ) -> Result<Description> {
        self.apply(adjustments).await?;

        if let Some(settlement) = control.settlement.or(self.config.settlement) {
            self.settle(settlement).await?;
        }

        Ok(self.to_description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hashes_are_stable_and_content_sensitive() {
        let a = hash_spec(&json!({ "cpu": "125m", "memory": "128Mi" }));
        let b = hash_spec(&json!({ "cpu": "125m", "memory": "128Mi" }));
        let c = hash_spec(&json!({ "cpu": "250m", "memory": "128Mi" }));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn checksum_inputs_are_order_independent() {
        // Controllers are enumerated in configuration order but digested in
        // name order, so two runs over the same cluster agree.
        let mut first = BTreeMap::new();
        first.insert("web", json!({ "image": "fiber-http:latest" }));
        first.insert("api", json!({ "image": "api:latest" }));

        let mut second = BTreeMap::new();
        second.insert("api", json!({ "image": "api:latest" }));
        second.insert("web", json!({ "image": "fiber-http:latest" }));

        assert_eq!(
            hash_spec(&first.values().collect::<Vec<_>>()),
            hash_spec(&second.values().collect::<Vec<_>>())
        );
    }

    #[test]
    fn runtime_id_tracks_pod_uids() {
        let mut pods = BTreeMap::new();
        pods.insert(
            "fiber-http/fiber-http".to_string(),
            vec![uuid::Uuid::new_v4().to_string()],
        );
        let before = hash_spec(&pods);

        pods.insert(
            "fiber-http/fiber-http".to_string(),
            vec![uuid::Uuid::new_v4().to_string()],
        );
        let after = hash_spec(&pods);
        assert_ne!(before, after);
    }

    #[test]
    fn control_defaults_to_no_settlement() {
        assert_eq!(Control::default().settlement, None);
    }
}
