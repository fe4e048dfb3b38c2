use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::client::deployments::selector_string;
use crate::core::client::kube_resources::{
    K8sContainer, K8sPod, LabelSelector, ObjectMeta, PodTemplateSpec,
};
use crate::core::client::pods::Pod;
use crate::core::wait::{wait_for_condition, Condition, DEFAULT_POLL_INTERVAL};
use crate::errors::{Error, RejectionReason, Result};

pub const ROLLOUT_GROUP: &str = "argoproj.io";
pub const ROLLOUT_VERSION: &str = "v1alpha1";
pub const ROLLOUT_PLURAL: &str = "rollouts";

/// Label Argo applies to pods of a rollout revision; also the adoption hook
/// for canary pods cloned from a rollout template.
pub const ROLLOUT_POD_TEMPLATE_HASH_LABEL: &str = "rollouts-pod-template-hash";

/// The custom-resource API gives no watch ergonomics comparable to the
/// built-in kinds, so rollout convergence is polled at a fixed interval.
const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// The subset of the Argo Rollout custom resource the agent reads and
/// writes. Unknown fields are left untouched on the cluster because patches
/// use merge semantics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ArgoRollout {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ArgoRolloutSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ArgoRolloutStatus>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgoRolloutSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgoRolloutStatus {
    /// Argo reports this as a string in some API versions and an integer in
    /// others; it is only compared for equality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_pod_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blue_green: Option<BlueGreenStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ArgoRolloutCondition>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueGreenStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_selector: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgoRolloutCondition {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl k8s_openapi::Resource for ArgoRollout {
    const API_VERSION: &'static str = "argoproj.io/v1alpha1";
    const GROUP: &'static str = ROLLOUT_GROUP;
    const KIND: &'static str = "Rollout";
    const VERSION: &'static str = ROLLOUT_VERSION;
    const URL_PATH_SEGMENT: &'static str = ROLLOUT_PLURAL;
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::ListableResource for ArgoRollout {
    const LIST_KIND: &'static str = "RolloutList";
}

impl k8s_openapi::Metadata for ArgoRollout {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &Self::Ty {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Self::Ty {
        &mut self.metadata
    }
}

/// Wrapper around an Argo Rollout holding the last-read custom resource.
#[derive(Clone)]
pub struct Rollout {
    client: Client,
    obj: ArgoRollout,
}

impl Rollout {
    fn api(&self) -> Api<ArgoRollout> {
        Api::namespaced(self.client.clone(), self.namespace())
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Read a rollout by name under the given namespace.
    pub async fn read(client: &Client, name: &str, namespace: &str) -> Result<Self> {
        let rollouts: Api<ArgoRollout> = Api::namespaced(client.clone(), namespace);
        let obj = rollouts.get(name).await?;
        debug!("Fetched rollout: {}/{}", namespace, name);
        Ok(Rollout {
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

    pub fn resource_version(&self) -> &str {
        self.obj.metadata.resource_version.as_deref().unwrap_or_default()
    }

    pub fn obj(&self) -> &ArgoRollout {
        &self.obj
    }

    pub fn replicas(&self) -> i32 {
        self.obj
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1)
    }

    pub fn set_replicas(&mut self, replicas: i32) {
        if let Some(spec) = self.obj.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
    }

    pub fn match_labels(&self) -> BTreeMap<String, String> {
        self.obj
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.as_ref())
            .and_then(|selector| selector.match_labels.clone())
            .unwrap_or_default()
    }

    pub fn match_label_selector(&self) -> String {
        selector_string(&self.match_labels())
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.obj.metadata.labels.clone().unwrap_or_default()
    }

    pub fn label_selector(&self) -> String {
        selector_string(&self.labels())
    }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.obj.spec.as_ref().and_then(|spec| spec.template.as_ref())
    }

    /// The pod template hash of the revision currently rolled out.
    pub fn current_pod_hash(&self) -> Option<&str> {
        self.obj
            .status
            .as_ref()
            .and_then(|status| status.current_pod_hash.as_deref())
    }

    pub fn containers(&self) -> &[K8sContainer] {
        self.pod_template()
            .and_then(|template| template.spec.as_ref())
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default()
    }

    pub fn find_container(&self, name: &str) -> Option<&K8sContainer> {
        self.containers().iter().find(|c| c.name == name)
    }

    pub fn find_container_mut(&mut self, name: &str) -> Option<&mut K8sContainer> {
        self.obj
            .spec
            .as_mut()?
            .template
            .as_mut()?
            .spec
            .as_mut()?
            .containers
            .iter_mut()
            .find(|c| c.name == name)
    }

    /// Merge-patch local changes onto the cluster object. Strategic merge is
    /// not available for custom resources.
    pub async fn patch(&mut self) -> Result<()> {
        self.obj = self
            .api()
            .patch(self.name(), &PatchParams::default(), &Patch::Merge(&self.obj))
            .await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        info!("deleting rollout '{}'", self.name());
        self.api()
            .delete(self.name(), &DeleteParams::default())
            .await?;
        Ok(())
    }

    /// Refresh the underlying Rollout resource.
    pub async fn refresh(&mut self) -> Result<()> {
        self.obj = self.api().get(self.name()).await?;
        Ok(())
    }

    /// Rollbacks are automated by the Argo controller and cannot be
    /// triggered through the resource.
    pub async fn rollback(&mut self) -> Result<()> {
        Err(Error::UnsupportedOperation(
            "rollback is not available for Argo Rollouts; rollbacks are automated by the rollout controller"
                .to_string(),
        ))
    }

    pub async fn is_ready(&self) -> Result<bool> {
        let obj = self.api().get(self.name()).await?;
        Ok(rollout_replicas_ready(obj.status.as_ref()))
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let rollout = &*self;
        let condition = Condition::new(format!("rollout '{}' ready", rollout.name()), move || {
            rollout.is_ready()
        });
        wait_for_condition(condition, timeout, DEFAULT_POLL_INTERVAL, false).await
    }

    /// Wait for the rollout to disappear from the cluster. A 404 is
    /// success; any other API error aborts the wait.
    pub async fn wait_until_deleted(&self, timeout: Duration) -> Result<()> {
        let api = self.api();
        let name = self.name().to_string();
        let condition = Condition::new(format!("rollout '{name}' deleted"), || {
            let api = api.clone();
            let name = name.clone();
            async move { Ok(api.get_opt(&name).await?.is_none()) }
        });
        wait_for_condition(condition, timeout, DEFAULT_POLL_INTERVAL, true).await
    }

    pub async fn get_pods(&self) -> Result<Vec<Pod>> {
        debug!("getting pods for rollout '{}'", self.name());
        let pods: Api<K8sPod> = Api::namespaced(self.client.clone(), self.namespace());
        let lp = ListParams::default().labels(&self.match_label_selector());
        let list = pods.list(&lp).await?;
        Ok(list
            .items
            .into_iter()
            .map(|obj| Pod::new(self.client.clone(), obj))
            .collect())
    }

    /// Only the pods carrying the current revision's pod template hash.
    pub async fn get_latest_pods(&self) -> Result<Vec<Pod>> {
        let pod_hash = self
            .current_pod_hash()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Controller(format!(
                    "rollout '{}' reports no current pod hash",
                    self.name()
                ))
            })?;

        Ok(self
            .get_pods()
            .await?
            .into_iter()
            .filter(|pod| {
                pod.obj()
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(ROLLOUT_POD_TEMPLATE_HASH_LABEL))
                    == Some(&pod_hash)
            })
            .collect())
    }

    /// Total container restarts across the rollout's pods. Pods deleted
    /// mid-enumeration are skipped.
    pub async fn restart_count(&self) -> Result<i32> {
        let mut count = 0;
        for pod in self.get_pods().await? {
            match pod.restart_count().await {
                Ok(restarts) => count += restarts,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(count)
    }

    /// Patch local changes to the cluster and poll the blue/green status
    /// until the active selector matches the preview selector.
    pub async fn rollout(&mut self, timeout: Duration) -> Result<()> {
        info!(
            "applying adjustments to rollout '{}' and waiting for blue/green convergence",
            self.name()
        );
        self.patch().await?;

        let api = self.api();
        let selector = self.label_selector();
        let started = tokio::time::Instant::now();

        loop {
            // Sleep first to give the rollout controller a chance to sync.
            tokio::time::sleep(POLL_INTERVAL).await;

            let list = api.list(&ListParams::default().labels(&selector)).await?;
            let observed = list
                .items
                .into_iter()
                .find(|rollout| rollout.metadata.name.as_deref() == Some(self.name()));

            if let Some(observed) = observed {
                let mut converged = false;
                if let Some(status) = observed.status.as_ref() {
                    check_latest_condition(status.conditions.as_deref().unwrap_or_default())?;
                    converged = blue_green_converged(status);
                }
                if converged {
                    info!(
                        "adjustments to rollout '{}' rolled out successfully",
                        self.name()
                    );
                    self.obj = observed;
                    return Ok(());
                }
            }

            if started.elapsed() > timeout {
                return Err(Error::rejected(
                    RejectionReason::Timeout,
                    "timed out waiting for active selector to match preview selector",
                ));
            }
        }
    }
}

/// Reject when the newest condition (by update time) has left the healthy
/// set. Quota exhaustion surfaces in condition messages rather than as a
/// dedicated condition type.
pub(crate) fn check_latest_condition(conditions: &[ArgoRolloutCondition]) -> Result<()> {
    let mut conditions: Vec<&ArgoRolloutCondition> = conditions.iter().collect();
    conditions.sort_by_key(|condition| condition.last_update_time);

    let Some(newest) = conditions.last() else {
        return Ok(());
    };
    if matches!(newest.type_.as_str(), "Available" | "Progressing") {
        return Ok(());
    }

    let message = newest.message.clone().unwrap_or_default();
    let reason = if message.contains("exceeded quota") {
        RejectionReason::SchedulingFailed
    } else {
        RejectionReason::Other(newest.type_.clone())
    };
    Err(Error::rejected(reason, message))
}

pub(crate) fn blue_green_converged(status: &ArgoRolloutStatus) -> bool {
    status
        .blue_green
        .as_ref()
        .map(|bg| bg.active_selector.is_some() && bg.active_selector == bg.preview_selector)
        .unwrap_or(false)
}

pub(crate) fn rollout_replicas_ready(status: Option<&ArgoRolloutStatus>) -> bool {
    let Some(status) = status else {
        return false;
    };
    matches!(
        (status.replicas, status.ready_replicas),
        (Some(total), Some(ready)) if total == ready
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn condition(type_: &str, message: Option<&str>, minute: u32) -> ArgoRolloutCondition {
        ArgoRolloutCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            reason: None,
            message: message.map(str::to_string),
            last_update_time: Some(Utc.with_ymd_and_hms(2021, 3, 14, 9, minute, 0).unwrap()),
        }
    }

    fn blue_green(active: Option<&str>, preview: Option<&str>) -> ArgoRolloutStatus {
        ArgoRolloutStatus {
            blue_green: Some(BlueGreenStatus {
                active_selector: active.map(str::to_string),
                preview_selector: preview.map(str::to_string),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn healthy_conditions_pass() {
        let conditions = vec![
            condition("Degraded", Some("old failure"), 1),
            condition("Progressing", None, 5),
        ];
        assert!(check_latest_condition(&conditions).is_ok());
        assert!(check_latest_condition(&[]).is_ok());
    }

    #[test]
    fn newest_unhealthy_condition_rejects_with_its_type() {
        let conditions = vec![
            condition("Progressing", None, 1),
            condition("Degraded", Some("pods crashed"), 5),
        ];
        let err = check_latest_condition(&conditions).unwrap_err();
        match err {
            Error::AdjustmentRejected { reason, message } => {
                assert_eq!(reason, RejectionReason::Other("Degraded".to_string()));
                assert_eq!(message, "pods crashed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn quota_exhaustion_maps_to_scheduling_failed() {
        let conditions = vec![condition(
            "InvalidSpec",
            Some("pods \"bg-app\" is forbidden: exceeded quota: compute-resources"),
            9,
        )];
        let err = check_latest_condition(&conditions).unwrap_err();
        match err {
            Error::AdjustmentRejected { reason, .. } => {
                assert_eq!(reason, RejectionReason::SchedulingFailed)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn blue_green_convergence_requires_matching_selectors() {
        assert!(blue_green_converged(&blue_green(Some("abc"), Some("abc"))));
        assert!(!blue_green_converged(&blue_green(Some("abc"), Some("def"))));
        assert!(!blue_green_converged(&blue_green(None, None)));
        assert!(!blue_green_converged(&ArgoRolloutStatus::default()));
    }

    #[test]
    fn status_parses_argo_camel_case() {
        let status: ArgoRolloutStatus = serde_json::from_value(serde_json::json!({
            "observedGeneration": "42",
            "currentPodHash": "6bf9d7c9c",
            "replicas": 2,
            "readyReplicas": 2,
            "blueGreen": { "activeSelector": "6bf9d7c9c", "previewSelector": "6bf9d7c9c" },
            "conditions": [{
                "type": "Available",
                "status": "True",
                "lastUpdateTime": "2021-03-14T09:00:00Z"
            }]
        }))
        .unwrap();
        assert_eq!(status.current_pod_hash.as_deref(), Some("6bf9d7c9c"));
        assert!(blue_green_converged(&status));
        assert!(rollout_replicas_ready(Some(&status)));
    }
}
