use async_trait::async_trait;
use kube::Client;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{ControllerConfiguration, FailureMode};
use crate::core::client::controllers::{Controller, ControllerKind, DEFAULT_CANARY_TIMEOUT};
use crate::core::client::kube_client::AgentIdentity;
use crate::core::client::pods::Pod;
use crate::core::resources::requirements::{first_requirement, set_requirements};
use crate::core::resources::settings::{
    normalize_adjustment, Adjustment, Component, CpuSetting, MemorySetting, NormalizedSetting,
    ReplicasSetting,
};
use crate::domain::optimization::{dispatch_failure, Optimization};
use crate::errors::{Error, RejectionReason, Result};

/// Optimization strategy that adjusts a standalone tuning pod cloned from
/// the target controller. The target itself is never mutated; its settings
/// are reported pinned so the optimizer compares the tuning pod against a
/// stable reference.
pub struct CanaryOptimization {
    name: String,
    config: ControllerConfiguration,
    container_name: String,
    controller: Controller,
    canary_pod: Pod,
    identity: Option<AgentIdentity>,
    timeout: Duration,
}

impl CanaryOptimization {
    pub async fn create(
        client: &Client,
        config: &ControllerConfiguration,
        kind: ControllerKind,
        identity: Option<AgentIdentity>,
    ) -> Result<Self> {
        let controller = Controller::read(client, kind, &config.name, config.namespace()).await?;
        let canary_pod = controller
            .ensure_canary_pod(identity.as_ref(), DEFAULT_CANARY_TIMEOUT)
            .await?;

        let container_config = config.containers.first().ok_or_else(|| {
            Error::Configuration(format!(
                "controller '{}' must configure at least one container",
                config.name
            ))
        })?;
        if config.containers.len() > 1 {
            warn!(
                "only the first configured container ('{}') of '{}' is optimized; ignoring {} other(s)",
                container_config.name,
                config.name,
                config.containers.len() - 1
            );
        }

        if controller.find_container(&container_config.name).is_none() {
            return Err(Error::Configuration(format!(
                "no container named '{}' exists in the pod (found {})",
                container_config.name,
                controller.container_names().join(", ")
            )));
        }

        let name = config
            .strategy
            .alias()
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("{}/{}-canary", controller.name(), container_config.name)
            });

        Ok(CanaryOptimization {
            name,
            container_name: container_config.name.clone(),
            timeout: config.timeout(),
            config: config.clone(),
            controller,
            canary_pod,
            identity,
        })
    }

    fn container_config(&self) -> &crate::config::ContainerConfiguration {
        &self.config.containers[0]
    }

    /// The current CPU setting, valued from the tuning pod's container.
    fn cpu(&self) -> CpuSetting {
        let mut cpu = self.container_config().cpu.clone();
        if let Some(container) = self.canary_pod.container(&self.container_name) {
            cpu.value = first_requirement(container, "cpu", cpu.requirements, false)
                .and_then(|value| value.parse().ok());
        }
        cpu
    }

    /// The current memory setting, valued from the tuning pod's container.
    fn memory(&self) -> MemorySetting {
        let mut memory = self.container_config().memory.clone();
        if let Some(container) = self.canary_pod.container(&self.container_name) {
            memory.value = first_requirement(container, "memory", memory.requirements, false)
                .and_then(|value| value.parse().ok());
        }
        memory
    }

    /// The reference component: the target controller's settings, pinned.
    fn target_component(&self) -> Component {
        let target_name = self
            .container_config()
            .alias
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.controller.name(), self.container_name));

        let mut cpu = self.container_config().cpu.clone();
        cpu.pinned = true;
        let mut memory = self.container_config().memory.clone();
        memory.pinned = true;
        if let Some(container) = self.controller.find_container(&self.container_name) {
            if let Some(value) = first_requirement(container, "cpu", cpu.requirements, false) {
                cpu.value = value.parse().ok();
            }
            if let Some(value) = first_requirement(container, "memory", memory.requirements, false) {
                memory.value = value.parse().ok();
            }
        }
        let mut replicas = self.config.replicas.clone();
        replicas.pinned = true;
        replicas.value = Some(self.controller.replicas());

        Component {
            name: target_name,
            settings: vec![cpu.descriptor(), memory.descriptor(), replicas.descriptor()],
        }
    }

    /// Recovery shared by the rollback and destroy failure modes: tear the
    /// tuning pod down and stand a fresh baseline up for the next cycle.
    async fn recreate_baseline(&mut self) -> Result<()> {
        tokio::time::timeout(self.timeout, async {
            self.canary_pod.delete().await?;
            self.canary_pod.wait_until_deleted(self.timeout).await
        })
        .await
        .map_err(|_| Error::Timeout {
            condition: "canary pod deletion".to_string(),
            timeout: self.timeout,
        })??;

        info!("creating new canary against baseline following failed adjustment");
        self.canary_pod = self
            .controller
            .ensure_canary_pod(self.identity.as_ref(), DEFAULT_CANARY_TIMEOUT)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Optimization for CanaryOptimization {
    fn name(&self) -> &str {
        &self.name
    }

    fn controller(&self) -> &Controller {
        &self.controller
    }

    fn container_name(&self) -> &str {
        &self.container_name
    }

    fn to_components(&self) -> Vec<Component> {
        vec![
            self.target_component(),
            Component {
                name: self.name.clone(),
                settings: vec![
                    self.cpu().descriptor(),
                    self.memory().descriptor(),
                    ReplicasSetting::pinned_single().descriptor(),
                ],
            },
        ]
    }

    fn adjust(&mut self, adjustment: &Adjustment) -> Result<()> {
        match normalize_adjustment(adjustment)? {
            NormalizedSetting::Cpu(value) => {
                info!("adjusting cpu to {value}");
                let requirements = self.container_config().cpu.requirements;
                let quantity = value.to_string();
                let container = self
                    .canary_pod
                    .container_mut(&self.container_name)
                    .ok_or_else(|| {
                        Error::Controller(format!(
                            "canary pod has no container '{}'",
                            self.container_name
                        ))
                    })?;
                set_requirements(container, "cpu", &[&quantity], requirements, true);
            }
            NormalizedSetting::Memory(value) => {
                info!("adjusting memory to {value}");
                let requirements = self.container_config().memory.requirements;
                let quantity = value.to_quantity();
                let container = self
                    .canary_pod
                    .container_mut(&self.container_name)
                    .ok_or_else(|| {
                        Error::Controller(format!(
                            "canary pod has no container '{}'",
                            self.container_name
                        ))
                    })?;
                set_requirements(container, "memory", &[&quantity], requirements, true);
            }
            NormalizedSetting::Replicas(value) => {
                // Replicas are fixed at one for a standalone tuning pod.
                if value != 1 {
                    warn!(
                        "ignored attempt to set replicas to \"{value}\" on canary pod '{}'",
                        self.canary_pod.name()
                    );
                }
            }
        }
        Ok(())
    }

    async fn apply(&mut self) -> Result<()> {
        // The adjusted pod object survives the delete/recreate cycle; the
        // cluster-side pod is replaced wholesale since pod resources are
        // immutable in place.
        let snapshot = self.canary_pod.obj().clone();

        self.controller
            .delete_canary_pod(false, DEFAULT_CANARY_TIMEOUT)
            .await?;

        let mut canary = Pod::new(self.controller.client().clone(), snapshot);
        info!(
            "creating adjusted canary pod '{}' in namespace '{}'",
            canary.name(),
            canary.namespace()
        );
        canary.create().await?;

        info!(
            "created adjusted canary pod '{}', waiting for it to become ready...",
            canary.name()
        );
        match canary.wait_until_ready(DEFAULT_CANARY_TIMEOUT).await {
            Ok(()) => {}
            Err(Error::Timeout { .. }) => {
                return Err(Error::rejected(
                    RejectionReason::Timeout,
                    "timed out waiting for canary pod to become ready",
                ))
            }
            Err(err) => return Err(err),
        }

        canary.refresh().await?;
        self.canary_pod = canary;
        Ok(())
    }

    async fn is_ready(&self) -> Result<bool> {
        let (ready, restarts) = futures::try_join!(
            self.canary_pod.is_ready(),
            self.canary_pod.restart_count()
        )?;
        Ok(ready && restarts == 0)
    }

    /// Rollbacks target controller revisions; a standalone tuning pod has
    /// no revision history to roll back to.
    async fn rollback(&mut self, _error: Option<&Error>) -> Result<()> {
        Err(Error::UnsupportedOperation(
            "rollback is not supported under the canary optimization strategy; adjustments are applied to a standalone pod"
                .to_string(),
        ))
    }

    async fn destroy(&mut self, error: Option<&Error>) -> Result<()> {
        info!(
            "destroying canary pod '{}' ({})",
            self.canary_pod.name(),
            error.map(ToString::to_string).unwrap_or_default()
        );
        self.canary_pod.delete().await?;

        debug!("awaiting deletion of canary pod '{}'", self.canary_pod.name());
        self.canary_pod.wait_until_deleted(self.timeout).await?;

        info!("destroyed canary pod '{}'", self.canary_pod.name());
        Ok(())
    }

    async fn handle_error(&mut self, error: &Error, mode: FailureMode) -> Result<bool> {
        match mode {
            FailureMode::Rollback | FailureMode::Destroy => {
                if mode == FailureMode::Rollback {
                    warn!("cannot roll back a canary pod: falling back to destroy: {error}");
                }
                if let Err(recovery_error) = self.recreate_baseline().await {
                    error!(
                        "canary recovery failed with unrecoverable error: {recovery_error}"
                    );
                }
                Ok(false)
            }
            FailureMode::Crash | FailureMode::Ignore => {
                dispatch_failure(self, error, mode).await
            }
        }
    }
}
