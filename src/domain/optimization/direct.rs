use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tracing::{info, warn};

use crate::config::{ControllerConfiguration, FailureMode};
use crate::core::client::controllers::{Controller, ControllerKind};
use crate::core::resources::requirements::{first_requirement, set_requirements};
use crate::core::resources::settings::{
    normalize_adjustment, Adjustment, Component, CpuSetting, MemorySetting, NormalizedSetting,
    ReplicasSetting,
};
use crate::domain::optimization::{dispatch_failure, Optimization};
use crate::errors::{Error, RejectionReason, Result};

/// Optimization strategy that reconfigures a controller and its container
/// directly: adjustments are staged on the local wrapper and rolled out to
/// the cluster as a patch.
pub struct DirectOptimization {
    name: String,
    config: ControllerConfiguration,
    container_name: String,
    controller: Controller,
    timeout: Duration,
    /// Restarts that predate the optimization; only restarts beyond this
    /// count indicate instability caused by an adjustment.
    baseline_restarts: i32,
}

impl DirectOptimization {
    pub async fn create(
        client: &Client,
        config: &ControllerConfiguration,
        kind: ControllerKind,
    ) -> Result<Self> {
        let controller = Controller::read(client, kind, &config.name, config.namespace()).await?;

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

        let container = controller.find_container(&container_config.name).ok_or_else(|| {
            Error::Configuration(format!(
                "no container named '{}' exists in the pod (found {})",
                container_config.name,
                controller.container_names().join(", ")
            ))
        })?;

        let name = container_config
            .alias
            .clone()
            .unwrap_or_else(|| format!("{}/{}", controller.name(), container.name));
        let baseline_restarts = controller.restart_count().await?;

        Ok(DirectOptimization {
            name,
            container_name: container_config.name.clone(),
            timeout: config.timeout(),
            config: config.clone(),
            controller,
            baseline_restarts,
        })
    }

    fn container_config(&self) -> &crate::config::ContainerConfiguration {
        &self.config.containers[0]
    }

    /// The current CPU setting, valued from the live container.
    fn cpu(&self) -> CpuSetting {
        let mut cpu = self.container_config().cpu.clone();
        if let Some(container) = self.controller.find_container(&self.container_name) {
            cpu.value = first_requirement(container, "cpu", cpu.requirements, false)
                .and_then(|value| value.parse().ok());
        }
        cpu
    }

    /// The current memory setting, valued from the live container.
    fn memory(&self) -> MemorySetting {
        let mut memory = self.container_config().memory.clone();
        if let Some(container) = self.controller.find_container(&self.container_name) {
            memory.value = first_requirement(container, "memory", memory.requirements, false)
                .and_then(|value| value.parse().ok());
        }
        memory
    }

    fn replicas(&self) -> ReplicasSetting {
        let mut replicas = self.config.replicas.clone();
        replicas.value = Some(self.controller.replicas());
        replicas
    }

    async fn restarts_since_baseline(&self) -> Result<i32> {
        Ok(self.controller.restart_count().await? - self.baseline_restarts)
    }
}

#[async_trait]
impl Optimization for DirectOptimization {
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
        vec![Component {
            name: self.name.clone(),
            settings: vec![
                self.cpu().descriptor(),
                self.memory().descriptor(),
                self.replicas().descriptor(),
            ],
        }]
    }

    fn adjust(&mut self, adjustment: &Adjustment) -> Result<()> {
        match normalize_adjustment(adjustment)? {
            NormalizedSetting::Cpu(value) => {
                info!("adjusting cpu to {value}");
                let requirements = self.container_config().cpu.requirements;
                self.config.containers[0].cpu.value = Some(value);
                let quantity = value.to_string();
                let container = self
                    .controller
                    .find_container_mut(&self.container_name)
                    .ok_or_else(|| {
                        Error::Controller(format!("container '{}' disappeared", self.container_name))
                    })?;
                set_requirements(container, "cpu", &[&quantity], requirements, true);
            }
            NormalizedSetting::Memory(value) => {
                info!("adjusting memory to {value}");
                let requirements = self.container_config().memory.requirements;
                self.config.containers[0].memory.value = Some(value);
                let quantity = value.to_quantity();
                let container = self
                    .controller
                    .find_container_mut(&self.container_name)
                    .ok_or_else(|| {
                        Error::Controller(format!("container '{}' disappeared", self.container_name))
                    })?;
                set_requirements(container, "memory", &[&quantity], requirements, true);
            }
            NormalizedSetting::Replicas(value) => {
                info!("adjusting replicas to {value}");
                self.config.replicas.value = Some(value);
                self.controller.set_replicas(value);
            }
        }
        Ok(())
    }

    async fn apply(&mut self) -> Result<()> {
        match self.controller.rollout(self.timeout).await {
            Ok(()) => {}
            Err(Error::Timeout { .. }) => {
                return Err(Error::rejected(
                    RejectionReason::Timeout,
                    "timed out waiting for rollout to apply adjustment",
                ))
            }
            Err(err) => return Err(err),
        }

        let restarts = self.restarts_since_baseline().await?;
        if restarts > 0 {
            return Err(Error::rejected(
                RejectionReason::Unstable,
                format!("{restarts} container restart(s) observed after adjustment"),
            ));
        }
        Ok(())
    }

    async fn is_ready(&self) -> Result<bool> {
        let (ready, restarts) = futures::try_join!(
            self.controller.is_ready(),
            self.restarts_since_baseline()
        )?;
        Ok(ready && restarts == 0)
    }

    async fn rollback(&mut self, error: Option<&Error>) -> Result<()> {
        info!(
            "adjustment failed: rolling back controller... ({})",
            error.map(ToString::to_string).unwrap_or_default()
        );
        tokio::time::timeout(self.timeout, self.controller.rollback())
            .await
            .map_err(|_| Error::Timeout {
                condition: "controller rollback".to_string(),
                timeout: self.timeout,
            })?
    }

    async fn destroy(&mut self, error: Option<&Error>) -> Result<()> {
        info!(
            "adjustment failed: destroying controller... ({})",
            error.map(ToString::to_string).unwrap_or_default()
        );
        tokio::time::timeout(self.timeout, self.controller.delete())
            .await
            .map_err(|_| Error::Timeout {
                condition: "controller deletion".to_string(),
                timeout: self.timeout,
            })?
    }

    async fn handle_error(&mut self, error: &Error, mode: FailureMode) -> Result<bool> {
        dispatch_failure(self, error, mode).await
    }
}
