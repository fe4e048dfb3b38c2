use std::time::Duration;

use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

use crate::core::client::kube_resources::{K8sContainer, K8sPod, PodStatus};
use crate::core::wait::{wait_for_condition, Condition, DEFAULT_POLL_INTERVAL};
use crate::errors::{Error, RejectionReason, Result};

/// Wrapper around a Kubernetes Pod holding the last-read API object.
///
/// The object is mutated locally (e.g. container resource writes) and only
/// touches the cluster through the explicit CRUD methods.
#[derive(Clone)]
pub struct Pod {
    client: Client,
    obj: K8sPod,
}

impl Pod {
    pub fn new(client: Client, obj: K8sPod) -> Self {
        Pod { client, obj }
    }

    fn api(&self) -> Api<K8sPod> {
        Api::namespaced(self.client.clone(), self.namespace())
    }

    /// Read a pod by name under the given namespace.
    pub async fn read(client: &Client, name: &str, namespace: &str) -> Result<Self> {
        let pods: Api<K8sPod> = Api::namespaced(client.clone(), namespace);
        let obj = pods.get(name).await?;
        debug!("Fetched pod: {}/{}", namespace, name);
        Ok(Pod {
            client: client.clone(),
            obj,
        })
    }

    pub fn name(&self) -> &str {
        self.obj.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.obj.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn uid(&self) -> &str {
        self.obj.metadata.uid.as_deref().unwrap_or_default()
    }

    pub fn obj(&self) -> &K8sPod {
        &self.obj
    }

    pub fn obj_mut(&mut self) -> &mut K8sPod {
        &mut self.obj
    }

    /// Create the pod in the cluster. Server-populated metadata left over
    /// from a previous read is stripped so the object is valid for creation.
    pub async fn create(&mut self) -> Result<()> {
        debug!("creating pod '{}' in namespace '{}'", self.name(), self.namespace());
        let body = sanitize_for_create(&self.obj);
        self.obj = self.api().create(&PostParams::default(), &body).await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        debug!("deleting pod '{}' in namespace '{}'", self.name(), self.namespace());
        self.api()
            .delete(self.name(), &DeleteParams::default())
            .await?;
        Ok(())
    }

    /// Refresh the underlying Pod resource.
    pub async fn refresh(&mut self) -> Result<()> {
        self.obj = self.api().get_status(self.name()).await?;
        Ok(())
    }

    /// Whether the pod reports a `Ready` condition with status `True`.
    ///
    /// A condition carrying reason `Unschedulable` fails the check with an
    /// [`Error::AdjustmentRejected`] (reason `scheduling-failed`) rather than
    /// reporting unready, since waiting longer cannot help.
    pub async fn is_ready(&self) -> Result<bool> {
        let obj = self.api().get_status(self.name()).await?;
        pod_ready(obj.status.as_ref())
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let pod = &*self;
        let condition = Condition::new(format!("pod '{}' ready", pod.name()), move || {
            pod.is_ready()
        });
        wait_for_condition(condition, timeout, DEFAULT_POLL_INTERVAL, false).await
    }

    /// Wait for the pod to disappear from the cluster. A 404 is success;
    /// any other API error aborts the wait.
    pub async fn wait_until_deleted(&self, timeout: Duration) -> Result<()> {
        let api = self.api();
        let name = self.name().to_string();
        let condition = Condition::new(format!("pod '{name}' deleted"), || {
            let api = api.clone();
            let name = name.clone();
            async move { Ok(api.get_opt(&name).await?.is_none()) }
        });
        wait_for_condition(condition, timeout, DEFAULT_POLL_INTERVAL, true).await
    }

    /// Total number of container restarts reported in the pod status.
    pub async fn restart_count(&self) -> Result<i32> {
        let obj = self.api().get_status(self.name()).await?;
        Ok(count_restarts(obj.status.as_ref()))
    }

    pub fn containers(&self) -> &[K8sContainer] {
        self.obj
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default()
    }

    pub fn container(&self, name: &str) -> Option<&K8sContainer> {
        self.containers().iter().find(|c| c.name == name)
    }

    pub fn container_mut(&mut self, name: &str) -> Option<&mut K8sContainer> {
        self.obj
            .spec
            .as_mut()?
            .containers
            .iter_mut()
            .find(|c| c.name == name)
    }
}

/// Evaluate pod readiness from its status conditions.
pub fn pod_ready(status: Option<&PodStatus>) -> Result<bool> {
    let Some(status) = status else {
        return Ok(false);
    };
    let Some(conditions) = status.conditions.as_ref() else {
        return Ok(false);
    };

    for condition in conditions {
        if condition.reason.as_deref() == Some("Unschedulable") {
            return Err(Error::rejected(
                RejectionReason::SchedulingFailed,
                condition.message.clone().unwrap_or_default(),
            ));
        }

        if condition.type_.eq_ignore_ascii_case("ready") {
            return Ok(condition.status.eq_ignore_ascii_case("true"));
        }
    }

    Ok(false)
}

pub fn count_restarts(status: Option<&PodStatus>) -> i32 {
    status
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| statuses.iter().map(|s| s.restart_count).sum())
        .unwrap_or(0)
}

fn sanitize_for_create(obj: &K8sPod) -> K8sPod {
    let mut body = obj.clone();
    body.metadata.resource_version = None;
    body.metadata.uid = None;
    body.metadata.creation_timestamp = None;
    body.metadata.deletion_timestamp = None;
    body.metadata.managed_fields = None;
    body.status = None;
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::kube_resources::PodCondition;
    use k8s_openapi::api::core::v1::ContainerStatus;

    fn status_with_conditions(conditions: Vec<PodCondition>) -> PodStatus {
        PodStatus {
            conditions: Some(conditions),
            ..Default::default()
        }
    }

    fn condition(type_: &str, status: &str, reason: Option<&str>) -> PodCondition {
        PodCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.map(str::to_string),
            message: reason.map(|_| "0/4 nodes are available: insufficient cpu".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn ready_condition_true_is_ready() {
        let status = status_with_conditions(vec![condition("Ready", "True", None)]);
        assert!(pod_ready(Some(&status)).unwrap());
    }

    #[test]
    fn ready_condition_false_is_not_ready() {
        let status = status_with_conditions(vec![condition("Ready", "False", None)]);
        assert!(!pod_ready(Some(&status)).unwrap());
    }

    #[test]
    fn missing_status_or_conditions_is_not_ready() {
        assert!(!pod_ready(None).unwrap());
        assert!(!pod_ready(Some(&PodStatus::default())).unwrap());
    }

    #[test]
    fn unschedulable_fails_with_scheduling_reason() {
        let status = status_with_conditions(vec![
            condition("PodScheduled", "False", Some("Unschedulable")),
            condition("Ready", "False", None),
        ]);
        let err = pod_ready(Some(&status)).unwrap_err();
        match err {
            Error::AdjustmentRejected { reason, message } => {
                assert_eq!(reason, RejectionReason::SchedulingFailed);
                assert!(message.contains("insufficient cpu"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn restart_counts_sum_across_containers() {
        let status = PodStatus {
            container_statuses: Some(vec![
                ContainerStatus {
                    name: "app".into(),
                    restart_count: 2,
                    ..Default::default()
                },
                ContainerStatus {
                    name: "sidecar".into(),
                    restart_count: 1,
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        assert_eq!(count_restarts(Some(&status)), 3);
        assert_eq!(count_restarts(None), 0);
    }

    #[test]
    fn sanitize_strips_server_populated_metadata() {
        let mut obj = K8sPod::default();
        obj.metadata.name = Some("web-canary".into());
        obj.metadata.resource_version = Some("12345".into());
        obj.metadata.uid = Some("abc".into());
        obj.status = Some(PodStatus::default());

        let body = sanitize_for_create(&obj);
        assert_eq!(body.metadata.name.as_deref(), Some("web-canary"));
        assert!(body.metadata.resource_version.is_none());
        assert!(body.metadata.uid.is_none());
        assert!(body.status.is_none());
    }
}
