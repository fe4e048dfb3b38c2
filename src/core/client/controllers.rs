use std::collections::BTreeMap;
use std::time::Duration;

use kube::Client;
use tracing::{debug, info, warn};

use crate::core::client::deployments::Deployment;
use crate::core::client::kube_client::{agent_owner_reference, AgentIdentity};
use crate::core::client::kube_resources::{
    ContainerPort, EnvVar, K8sContainer, K8sPod, K8sResourceRequirements, ObjectMeta,
    OwnerReference, PodTemplateSpec, Quantity,
};
use crate::core::client::pods::Pod;
use crate::core::client::rollouts::{Rollout, ROLLOUT_POD_TEMPLATE_HASH_LABEL};
use crate::core::client::services::Service;
use crate::core::wait::backoff_delay;
use crate::errors::{Error, Result};

/// Annotation tying a tuning pod back to the controller it was cloned from.
pub const TUNING_FOR_ANNOTATION: &str = "opsani.com/opsani_tuning_for";
pub const TUNING_ROLE_LABEL: &str = "opsani_role";
pub const TUNING_ROLE_VALUE: &str = "tuning";

pub const SIDECAR_CONTAINER_NAME: &str = "opsani-envoy";
pub const SIDECAR_IMAGE: &str = "opsani/envoy-proxy:latest";
pub const SIDECAR_SERVICE_PORT: i32 = 9980;
pub const SIDECAR_METRICS_PORT: i32 = 9901;

const SIDECAR_PATCH_ATTEMPTS: u32 = 3;
const SIDECAR_PATCH_BACKOFF: Duration = Duration::from_millis(500);

pub const DEFAULT_CANARY_TIMEOUT: Duration = Duration::from_secs(600);

/// The two controller kinds the agent can optimize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    Deployment,
    Rollout,
}

/// A workload controller under optimization. A closed set: standard
/// Deployments and Argo Rollouts.
#[derive(Clone)]
pub enum Controller {
    Deployment(Deployment),
    Rollout(Rollout),
}

impl Controller {
    /// Read the controller named in a configuration from the cluster.
    pub async fn read(
        client: &Client,
        kind: ControllerKind,
        name: &str,
        namespace: &str,
    ) -> Result<Self> {
        match kind {
            ControllerKind::Deployment => Ok(Controller::Deployment(
                Deployment::read(client, name, namespace).await?,
            )),
            ControllerKind::Rollout => Ok(Controller::Rollout(
                Rollout::read(client, name, namespace).await?,
            )),
        }
    }

    pub fn client(&self) -> &Client {
        match self {
            Controller::Deployment(deployment) => deployment.client(),
            Controller::Rollout(rollout) => rollout.client(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Controller::Deployment(_) => "Deployment",
            Controller::Rollout(_) => "Rollout",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Controller::Deployment(deployment) => deployment.name(),
            Controller::Rollout(rollout) => rollout.name(),
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Controller::Deployment(deployment) => deployment.namespace(),
            Controller::Rollout(rollout) => rollout.namespace(),
        }
    }

    pub fn uid(&self) -> &str {
        match self {
            Controller::Deployment(deployment) => deployment.uid(),
            Controller::Rollout(rollout) => rollout.uid(),
        }
    }

    pub fn resource_version(&self) -> &str {
        match self {
            Controller::Deployment(deployment) => deployment.resource_version(),
            Controller::Rollout(rollout) => rollout.resource_version(),
        }
    }

    pub fn replicas(&self) -> i32 {
        match self {
            Controller::Deployment(deployment) => deployment.replicas(),
            Controller::Rollout(rollout) => rollout.replicas(),
        }
    }

    pub fn set_replicas(&mut self, replicas: i32) {
        match self {
            Controller::Deployment(deployment) => deployment.set_replicas(replicas),
            Controller::Rollout(rollout) => rollout.set_replicas(replicas),
        }
    }

    pub fn match_labels(&self) -> BTreeMap<String, String> {
        match self {
            Controller::Deployment(deployment) => deployment.match_labels(),
            Controller::Rollout(rollout) => rollout.match_labels(),
        }
    }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Controller::Deployment(deployment) => deployment.pod_template(),
            Controller::Rollout(rollout) => rollout.pod_template(),
        }
    }

    pub fn containers(&self) -> &[K8sContainer] {
        match self {
            Controller::Deployment(deployment) => deployment.containers(),
            Controller::Rollout(rollout) => rollout.containers(),
        }
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers().iter().map(|c| c.name.clone()).collect()
    }

    pub fn find_container(&self, name: &str) -> Option<&K8sContainer> {
        match self {
            Controller::Deployment(deployment) => deployment.find_container(name),
            Controller::Rollout(rollout) => rollout.find_container(name),
        }
    }

    pub fn find_container_mut(&mut self, name: &str) -> Option<&mut K8sContainer> {
        match self {
            Controller::Deployment(deployment) => deployment.find_container_mut(name),
            Controller::Rollout(rollout) => rollout.find_container_mut(name),
        }
    }

    pub async fn patch(&mut self) -> Result<()> {
        match self {
            Controller::Deployment(deployment) => deployment.patch().await,
            Controller::Rollout(rollout) => rollout.patch().await,
        }
    }

    pub async fn refresh(&mut self) -> Result<()> {
        match self {
            Controller::Deployment(deployment) => deployment.refresh().await,
            Controller::Rollout(rollout) => rollout.refresh().await,
        }
    }

    pub async fn delete(&self) -> Result<()> {
        match self {
            Controller::Deployment(deployment) => deployment.delete().await,
            Controller::Rollout(rollout) => rollout.delete().await,
        }
    }

    pub async fn is_ready(&self) -> Result<bool> {
        match self {
            Controller::Deployment(deployment) => deployment.is_ready().await,
            Controller::Rollout(rollout) => rollout.is_ready().await,
        }
    }

    pub async fn get_pods(&self) -> Result<Vec<Pod>> {
        match self {
            Controller::Deployment(deployment) => deployment.get_pods().await,
            Controller::Rollout(rollout) => rollout.get_pods().await,
        }
    }

    pub async fn get_latest_pods(&self) -> Result<Vec<Pod>> {
        match self {
            Controller::Deployment(deployment) => deployment.get_latest_pods().await,
            Controller::Rollout(rollout) => rollout.get_latest_pods().await,
        }
    }

    pub async fn restart_count(&self) -> Result<i32> {
        match self {
            Controller::Deployment(deployment) => deployment.restart_count().await,
            Controller::Rollout(rollout) => rollout.restart_count().await,
        }
    }

    pub async fn rollback(&mut self) -> Result<()> {
        match self {
            Controller::Deployment(deployment) => deployment.rollback().await,
            Controller::Rollout(rollout) => rollout.rollback().await,
        }
    }

    /// Patch local changes and observe the rollout to convergence.
    pub async fn rollout(&mut self, timeout: Duration) -> Result<()> {
        match self {
            Controller::Deployment(deployment) => deployment.rollout(timeout).await,
            Controller::Rollout(rollout) => rollout.rollout(timeout).await,
        }
    }

    /// Inject an Envoy sidecar that proxies a service or literal TCP port,
    /// producing scrapable metrics for the optimizer. Exactly one of
    /// `service` and `port` must be given.
    pub async fn inject_sidecar(
        &mut self,
        service: Option<&str>,
        port: Option<i32>,
        index: Option<usize>,
    ) -> Result<()> {
        let deployment = match self {
            Controller::Deployment(deployment) => deployment,
            Controller::Rollout(_) => {
                return Err(Error::UnsupportedOperation(
                    "sidecar injection is not available for Argo Rollouts".to_string(),
                ))
            }
        };

        deployment.refresh().await?;

        let port = match (service, port) {
            (None, None) => {
                return Err(Error::Configuration(
                    "a service or port must be given".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(Error::Configuration(
                    "service and port cannot both be given".to_string(),
                ))
            }
            (None, Some(port)) => port,
            (Some(service), None) => {
                let service =
                    Service::read(deployment.client(), service, deployment.namespace()).await?;
                service.first_target_port()?
            }
        };

        info!(
            "injecting sidecar '{}' proxying port {} into deployment '{}'",
            SIDECAR_CONTAINER_NAME,
            port,
            deployment.name()
        );
        deployment.insert_container(build_sidecar_container(port), index)?;

        let mut attempt = 0;
        loop {
            match deployment.patch().await {
                Ok(()) => return Ok(()),
                Err(err @ Error::KubeApi(_)) if attempt + 1 < SIDECAR_PATCH_ATTEMPTS => {
                    let delay = backoff_delay(SIDECAR_PATCH_BACKOFF, attempt);
                    warn!(
                        "sidecar patch attempt {} failed, retrying in {:?}: {err}",
                        attempt + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn canary_pod_name(&self) -> String {
        format!("{}-canary", self.name())
    }

    /// Retrieve the canary pod for this controller, erroring when absent.
    pub async fn get_canary_pod(&self) -> Result<Pod> {
        Pod::read(self.client(), &self.canary_pod_name(), self.namespace()).await
    }

    /// Delete the canary pod and wait for it to disappear. A missing canary
    /// is tolerated unless `raise_if_not_found` is set.
    pub async fn delete_canary_pod(
        &self,
        raise_if_not_found: bool,
        timeout: Duration,
    ) -> Result<Option<Pod>> {
        match self.get_canary_pod().await {
            Ok(canary) => {
                warn!(
                    "deleting canary pod '{}' from namespace '{}'",
                    canary.name(),
                    canary.namespace()
                );
                canary.delete().await?;
                canary.wait_until_deleted(timeout).await?;
                info!(
                    "deleted canary pod '{}' from namespace '{}'",
                    canary.name(),
                    canary.namespace()
                );
                Ok(Some(canary))
            }
            Err(err) if err.is_not_found() && !raise_if_not_found => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The canary pod object cloned from this controller's pod template,
    /// carrying the tuning annotations and labels.
    pub fn build_canary_pod(&self, owner: Option<OwnerReference>) -> Result<K8sPod> {
        let template = self.pod_template().ok_or_else(|| {
            Error::Controller(format!("{} '{}' has no pod template", self.kind(), self.name()))
        })?;
        let pod_hash = match self {
            // Lets the active service adopt the canary pod.
            Controller::Rollout(rollout) => rollout.current_pod_hash(),
            Controller::Deployment(_) => None,
        };
        Ok(build_canary_pod(
            self.name(),
            self.namespace(),
            &self.canary_pod_name(),
            template,
            pod_hash,
            owner,
        ))
    }

    /// Return the existing canary pod or clone one from the controller's pod
    /// template, create it, and wait for it to become ready.
    pub async fn ensure_canary_pod(
        &self,
        identity: Option<&AgentIdentity>,
        timeout: Duration,
    ) -> Result<Pod> {
        let canary_pod_name = self.canary_pod_name();
        debug!(
            "ensuring existence of canary pod '{}' based on {} '{}' in namespace '{}'",
            canary_pod_name,
            self.kind(),
            self.name(),
            self.namespace()
        );

        match self.get_canary_pod().await {
            Ok(canary) => {
                debug!("found existing canary pod '{}'", canary_pod_name);
                return Ok(canary);
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        // When the agent itself runs in the cluster, its Deployment owns the
        // canary so the pod is garbage-collected with the agent.
        let owner = match identity {
            Some(identity) => {
                debug!(
                    "running within Kubernetes, registering as pod controller (pod={}, namespace={})",
                    identity.pod_name, identity.pod_namespace
                );
                Some(agent_owner_reference(self.client(), identity).await?)
            }
            None => None,
        };

        let mut canary = Pod::new(self.client().clone(), self.build_canary_pod(owner)?);
        info!(
            "creating canary pod '{}' in namespace '{}'",
            canary_pod_name,
            self.namespace()
        );
        canary.create().await?;

        info!(
            "created canary pod '{}', waiting for it to become ready...",
            canary_pod_name
        );
        match canary.wait_until_ready(timeout).await {
            Ok(()) => {}
            Err(Error::Timeout { .. }) => {
                return Err(Error::CanaryCreation(format!(
                    "canary pod '{canary_pod_name}' did not become ready within {timeout:?}"
                )))
            }
            Err(err) => return Err(err),
        }

        canary.refresh().await?;
        Ok(canary)
    }
}

/// Clone a controller's pod template into a standalone tuning pod carrying
/// the canary metadata.
pub fn build_canary_pod(
    controller_name: &str,
    namespace: &str,
    canary_name: &str,
    template: &PodTemplateSpec,
    rollout_pod_hash: Option<&str>,
    owner: Option<OwnerReference>,
) -> K8sPod {
    let template_meta = template.metadata.clone().unwrap_or_default();

    let mut labels = template_meta.labels.unwrap_or_default();
    labels.insert(TUNING_ROLE_LABEL.to_string(), TUNING_ROLE_VALUE.to_string());
    if let Some(pod_hash) = rollout_pod_hash {
        labels.insert(
            ROLLOUT_POD_TEMPLATE_HASH_LABEL.to_string(),
            pod_hash.to_string(),
        );
    }

    let mut annotations = template_meta.annotations.unwrap_or_default();
    annotations.insert(
        TUNING_FOR_ANNOTATION.to_string(),
        controller_name.to_string(),
    );

    K8sPod {
        metadata: ObjectMeta {
            name: Some(canary_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: owner.map(|reference| vec![reference]),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    }
}

/// The Envoy sidecar container proxying the given port.
pub fn build_sidecar_container(port: i32) -> K8sContainer {
    let quantities = |cpu: &str, memory: &str| -> BTreeMap<String, Quantity> {
        let mut map = BTreeMap::new();
        map.insert("cpu".to_string(), Quantity(cpu.to_string()));
        map.insert("memory".to_string(), Quantity(memory.to_string()));
        map
    };

    K8sContainer {
        name: SIDECAR_CONTAINER_NAME.to_string(),
        image: Some(SIDECAR_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        resources: Some(K8sResourceRequirements {
            requests: Some(quantities("125m", "128Mi")),
            limits: Some(quantities("250m", "256Mi")),
            ..Default::default()
        }),
        env: Some(vec![
            EnvVar {
                name: "OPSANI_ENVOY_PROXY_SERVICE_PORT".to_string(),
                value: Some(SIDECAR_SERVICE_PORT.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "OPSANI_ENVOY_PROXIED_CONTAINER_PORT".to_string(),
                value: Some(port.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "OPSANI_ENVOY_PROXY_METRICS_PORT".to_string(),
                value: Some(SIDECAR_METRICS_PORT.to_string()),
                ..Default::default()
            },
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("service".to_string()),
                container_port: port,
                ..Default::default()
            },
            ContainerPort {
                name: Some("metrics".to_string()),
                container_port: SIDECAR_METRICS_PORT,
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::kube_resources::PodSpec;

    #[test]
    fn sidecar_container_shape() {
        let sidecar = build_sidecar_container(8480);
        assert_eq!(sidecar.name, SIDECAR_CONTAINER_NAME);
        assert_eq!(sidecar.image.as_deref(), Some(SIDECAR_IMAGE));
        assert_eq!(sidecar.image_pull_policy.as_deref(), Some("IfNotPresent"));

        let resources = sidecar.resources.as_ref().unwrap();
        assert_eq!(resources.requests.as_ref().unwrap()["cpu"].0, "125m");
        assert_eq!(resources.requests.as_ref().unwrap()["memory"].0, "128Mi");
        assert_eq!(resources.limits.as_ref().unwrap()["cpu"].0, "250m");
        assert_eq!(resources.limits.as_ref().unwrap()["memory"].0, "256Mi");

        let env = sidecar.env.as_ref().unwrap();
        let find = |name: &str| {
            env.iter()
                .find(|var| var.name == name)
                .and_then(|var| var.value.as_deref())
        };
        assert_eq!(find("OPSANI_ENVOY_PROXY_SERVICE_PORT"), Some("9980"));
        assert_eq!(find("OPSANI_ENVOY_PROXIED_CONTAINER_PORT"), Some("8480"));
        assert_eq!(find("OPSANI_ENVOY_PROXY_METRICS_PORT"), Some("9901"));

        let ports = sidecar.ports.as_ref().unwrap();
        assert_eq!(ports[0].container_port, 8480);
        assert_eq!(ports[1].container_port, 9901);
    }

    fn template() -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(
                    [("app".to_string(), "fiber-http".to_string())].into_iter().collect(),
                ),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![K8sContainer {
                    name: "fiber-http".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    #[test]
    fn canary_pod_carries_tuning_metadata() {
        let canary = build_canary_pod(
            "fiber-http",
            "default",
            "fiber-http-canary",
            &template(),
            None,
            None,
        );

        assert_eq!(canary.metadata.name.as_deref(), Some("fiber-http-canary"));
        let labels = canary.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(TUNING_ROLE_LABEL).map(String::as_str), Some("tuning"));
        assert_eq!(labels.get("app").map(String::as_str), Some("fiber-http"));
        let annotations = canary.metadata.annotations.as_ref().unwrap();
        assert_eq!(
            annotations.get(TUNING_FOR_ANNOTATION).map(String::as_str),
            Some("fiber-http")
        );
        assert_eq!(canary.spec.as_ref().unwrap().containers[0].name, "fiber-http");
        assert!(canary.status.is_none());
    }

    #[test]
    fn rollout_canary_pod_carries_template_hash_label() {
        let canary = build_canary_pod(
            "bg-app",
            "default",
            "bg-app-canary",
            &template(),
            Some("6bf9d7c9c"),
            None,
        );
        let labels = canary.metadata.labels.as_ref().unwrap();
        assert_eq!(
            labels.get(ROLLOUT_POD_TEMPLATE_HASH_LABEL).map(String::as_str),
            Some("6bf9d7c9c")
        );
    }

    #[test]
    fn agent_owner_reference_is_attached() {
        let owner = OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "tuning-agent".to_string(),
            uid: "agent-uid".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let canary = build_canary_pod(
            "fiber-http",
            "default",
            "fiber-http-canary",
            &template(),
            None,
            Some(owner.clone()),
        );
        assert_eq!(canary.metadata.owner_references, Some(vec![owner]));
    }
}
