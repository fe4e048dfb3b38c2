use std::collections::BTreeMap;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, WatchEvent, WatchParams};
use kube::{Api, Client};
use tracing::{debug, info, warn};

use crate::core::client::kube_resources::{
    DeploymentCondition, DeploymentStatus, K8sContainer, K8sDeployment, K8sPod, PodTemplateSpec,
};
use crate::core::client::pods::Pod;
use crate::core::client::replicasets::{
    fetch_owned_replicasets, newest_replicaset, owned_by, revision,
};
use crate::core::wait::{wait_for_condition, Condition, DEFAULT_POLL_INTERVAL};
use crate::errors::{Error, RejectionReason, Result};

/// Render a label map as a Kubernetes selector string.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// State captured before a mutation is patched to the cluster. The
/// resource version tracks any write; the observed generation only moves
/// when the deployment controller begins acting on a significant change.
#[derive(Debug, Clone)]
struct RolloutBaseline {
    resource_version: String,
    observed_generation: Option<i64>,
    desired_replicas: i32,
}

/// Wrapper around a Kubernetes Deployment holding the last-read API object.
/// Local mutations (replicas, container resources) only reach the cluster
/// through `patch` or the `rollout` observer.
#[derive(Clone)]
pub struct Deployment {
    client: Client,
    obj: K8sDeployment,
}

impl Deployment {
    fn api(&self) -> Api<K8sDeployment> {
        Api::namespaced(self.client.clone(), self.namespace())
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Read a deployment by name under the given namespace.
    pub async fn read(client: &Client, name: &str, namespace: &str) -> Result<Self> {
        let deployments: Api<K8sDeployment> = Api::namespaced(client.clone(), namespace);
        let obj = deployments.get(name).await?;
        debug!("Fetched deployment: {}/{}", namespace, name);
        Ok(Deployment {
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

    pub fn observed_generation(&self) -> Option<i64> {
        self.obj
            .status
            .as_ref()
            .and_then(|status| status.observed_generation)
    }

    pub fn obj(&self) -> &K8sDeployment {
        &self.obj
    }

    /// The number of desired pods.
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

    /// Labels used for pod association.
    pub fn match_labels(&self) -> BTreeMap<String, String> {
        self.obj
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.clone())
            .unwrap_or_default()
    }

    pub fn match_label_selector(&self) -> String {
        selector_string(&self.match_labels())
    }

    /// Labels applied to the deployment itself.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.obj.metadata.labels.clone().unwrap_or_default()
    }

    pub fn label_selector(&self) -> String {
        selector_string(&self.labels())
    }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.obj.spec.as_ref().map(|spec| &spec.template)
    }

    pub fn containers(&self) -> &[K8sContainer] {
        self.obj
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
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
            .spec
            .as_mut()?
            .containers
            .iter_mut()
            .find(|c| c.name == name)
    }

    /// Append a container to the pod template, or insert it at `index`.
    pub fn insert_container(
        &mut self,
        container: K8sContainer,
        index: Option<usize>,
    ) -> Result<()> {
        let name = self.obj.metadata.name.clone().unwrap_or_default();
        let spec = self
            .obj
            .spec
            .as_mut()
            .and_then(|spec| spec.template.spec.as_mut())
            .ok_or_else(|| Error::Controller(format!("deployment '{name}' has no pod template")))?;
        match index {
            Some(index) => {
                let index = index.min(spec.containers.len());
                spec.containers.insert(index, container);
            }
            None => spec.containers.push(container),
        }
        Ok(())
    }

    /// Update the changed attributes of the deployment on the cluster.
    pub async fn patch(&mut self) -> Result<()> {
        self.obj = self
            .api()
            .patch(self.name(), &PatchParams::default(), &Patch::Strategic(&self.obj))
            .await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        info!("deleting deployment '{}'", self.name());
        self.api()
            .delete(self.name(), &DeleteParams::default())
            .await?;
        Ok(())
    }

    /// Refresh the underlying Deployment resource.
    pub async fn refresh(&mut self) -> Result<()> {
        self.obj = self.api().get_status(self.name()).await?;
        Ok(())
    }

    /// Roll the deployment back to its previous revision by restoring the
    /// pod template of the second-newest replica set, the same operation
    /// `kubectl rollout undo` performs.
    pub async fn rollback(&mut self) -> Result<()> {
        let mut replica_sets = fetch_owned_replicasets(
            &self.client,
            self.namespace(),
            &self.match_label_selector(),
            "Deployment",
            self.uid(),
        )
        .await?;
        replica_sets.sort_by_key(|rs| std::cmp::Reverse(revision(rs)));

        let previous = replica_sets.get(1).ok_or_else(|| {
            Error::Controller(format!(
                "no previous revision to roll deployment '{}' back to",
                self.name()
            ))
        })?;
        let mut template = previous
            .spec
            .as_ref()
            .and_then(|spec| spec.template.clone())
            .ok_or_else(|| {
                Error::Controller("previous replica set has no pod template".to_string())
            })?;
        if let Some(labels) = template.metadata.as_mut().and_then(|m| m.labels.as_mut()) {
            labels.remove("pod-template-hash");
        }

        info!(
            "rolling back deployment '{}' to revision {}",
            self.name(),
            revision(previous)
        );
        let patch = serde_json::json!({ "spec": { "template": template } });
        self.obj = self
            .api()
            .patch(self.name(), &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }

    /// A deployment is ready once every desired replica reports ready.
    pub async fn is_ready(&self) -> Result<bool> {
        let obj = self.api().get_status(self.name()).await?;
        Ok(replicas_ready(obj.status.as_ref()))
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deployment = &*self;
        let condition = Condition::new(
            format!("deployment '{}' ready", deployment.name()),
            move || deployment.is_ready(),
        );
        wait_for_condition(condition, timeout, DEFAULT_POLL_INTERVAL, false).await
    }

    /// Wait for the deployment to disappear from the cluster. A 404 is
    /// success; any other API error aborts the wait.
    pub async fn wait_until_deleted(&self, timeout: Duration) -> Result<()> {
        let api = self.api();
        let name = self.name().to_string();
        let condition = Condition::new(format!("deployment '{name}' deleted"), || {
            let api = api.clone();
            let name = name.clone();
            async move { Ok(api.get_opt(&name).await?.is_none()) }
        });
        wait_for_condition(condition, timeout, DEFAULT_POLL_INTERVAL, true).await
    }

    /// The pods currently associated with this deployment.
    pub async fn get_pods(&self) -> Result<Vec<Pod>> {
        debug!("getting pods for deployment '{}'", self.name());
        let pods: Api<K8sPod> = Api::namespaced(self.client.clone(), self.namespace());
        let lp = ListParams::default().labels(&self.match_label_selector());
        let list = pods.list(&lp).await?;
        Ok(list
            .items
            .into_iter()
            .map(|obj| Pod::new(self.client.clone(), obj))
            .collect())
    }

    /// Only the pods owned by the newest replica set of this deployment.
    pub async fn get_latest_pods(&self) -> Result<Vec<Pod>> {
        debug!("getting replica set for deployment '{}'", self.name());
        let replica_sets = fetch_owned_replicasets(
            &self.client,
            self.namespace(),
            &self.match_label_selector(),
            "Deployment",
            self.uid(),
        )
        .await?;
        let latest = newest_replicaset(replica_sets).ok_or_else(|| {
            Error::Controller(format!(
                "unable to locate replica set(s) for deployment '{}'",
                self.name()
            ))
        })?;
        let latest_uid = latest.metadata.uid.as_deref().unwrap_or_default();

        Ok(self
            .get_pods()
            .await?
            .into_iter()
            .filter(|pod| owned_by(&pod.obj().metadata, "ReplicaSet", latest_uid))
            .collect())
    }

    /// Total container restarts across the deployment's pods. Pods deleted
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

    /// Patch local changes to the cluster and observe the resulting rollout
    /// until it converges, is rejected, or times out.
    ///
    /// The baseline is captured from the pre-patch object so stale watch
    /// events (still reporting the prior generation) can be recognized and
    /// skipped.
    pub async fn rollout(&mut self, timeout: Duration) -> Result<()> {
        let baseline = RolloutBaseline {
            resource_version: self.resource_version().to_string(),
            observed_generation: self.observed_generation(),
            desired_replicas: self.replicas(),
        };

        info!(
            "applying adjustments to deployment '{}' and rolling out to cluster",
            self.name()
        );
        self.patch().await?;

        if self.resource_version() == baseline.resource_version {
            info!(
                "adjustments to deployment '{}' made no changes, continuing",
                self.name()
            );
            return Ok(());
        }

        let selector = self.label_selector();
        debug!(
            "watching deployment using label_selector={}, resource_version={}",
            selector, baseline.resource_version
        );
        let wp = WatchParams::default()
            .labels(&selector)
            .timeout(timeout.as_secs_f64().ceil() as u32);
        let api = self.api();

        let observed = tokio::time::timeout(timeout, async {
            let mut stream = api.watch(&wp, &baseline.resource_version).await?.boxed();
            while let Some(event) = stream.try_next().await? {
                let deployment = match event {
                    WatchEvent::Added(deployment) | WatchEvent::Modified(deployment) => deployment,
                    WatchEvent::Error(response) => {
                        return Err(Error::KubeApi(kube::Error::Api(response)))
                    }
                    _ => continue,
                };
                if deployment.metadata.name.as_deref() != Some(self.name()) {
                    continue;
                }
                let Some(status) = deployment.status.as_ref() else {
                    continue;
                };
                debug!(
                    "deployment watch yielded event for '{}': {:?}",
                    self.name(),
                    status
                );

                check_conditions(status.conditions.as_deref().unwrap_or_default())?;
                self.check_pod_conditions().await?;

                // Early events in the watch may be against the previous generation.
                if status.observed_generation == baseline.observed_generation {
                    debug!("observed generation has not changed, continuing watch");
                    continue;
                }

                if matches!(status.unavailable_replicas, Some(unavailable) if unavailable > 0) {
                    debug!(
                        "found {} unavailable replica(s), continuing watch",
                        status.unavailable_replicas.unwrap_or_default()
                    );
                    continue;
                }

                if replica_counts_converged(status, baseline.desired_replicas) {
                    info!(
                        "adjustments to deployment '{}' rolled out successfully",
                        self.name()
                    );
                    return Ok(());
                }
            }

            // The watch expired without convergence.
            Err(Error::rejected(
                RejectionReason::Timeout,
                "timed out waiting for Deployment to apply adjustment",
            ))
        })
        .await;

        match observed {
            Ok(result) => result,
            Err(_) => Err(Error::rejected(
                RejectionReason::Timeout,
                "timed out waiting for Deployment to apply adjustment",
            )),
        }
    }

    /// Reject the rollout when any pod of the newest replica set cannot be
    /// scheduled.
    async fn check_pod_conditions(&self) -> Result<()> {
        let pods = self.get_latest_pods().await?;
        let mut unschedulable = Vec::new();
        for pod in &pods {
            let conditions = pod
                .obj()
                .status
                .as_ref()
                .and_then(|status| status.conditions.as_deref())
                .unwrap_or_default();
            let messages: Vec<&str> = conditions
                .iter()
                .filter(|c| c.reason.as_deref() == Some("Unschedulable"))
                .filter_map(|c| c.message.as_deref())
                .collect();
            if !messages.is_empty() {
                unschedulable.push(format!("{} - {}", pod.name(), messages.join("; ")));
            }
        }

        if !unschedulable.is_empty() {
            warn!(
                "deployment '{}' has unschedulable pod(s): {}",
                self.name(),
                unschedulable.join(", ")
            );
            return Err(Error::rejected(
                RejectionReason::SchedulingFailed,
                format!(
                    "{} pod(s) could not be scheduled: {}",
                    unschedulable.len(),
                    unschedulable.join(", ")
                ),
            ));
        }
        Ok(())
    }
}

/// Evaluate rollout-relevant deployment conditions, failing fast on
/// rejection states.
pub(crate) fn check_conditions(conditions: &[DeploymentCondition]) -> Result<()> {
    for condition in conditions {
        match condition.type_.as_str() {
            "Available" => match condition.status.as_str() {
                // Progress is allowed; nothing further to evaluate.
                "True" => break,
                "False" | "Unknown" => {
                    debug!(
                        "Condition(Available).status == '{}' ({}): {}",
                        condition.status,
                        condition.reason.as_deref().unwrap_or_default(),
                        condition.message.as_deref().unwrap_or_default()
                    );
                }
                other => {
                    return Err(Error::AdjustmentFailure(format!(
                        "encountered unexpected condition status '{other}'"
                    )))
                }
            },
            "ReplicaFailure" => {
                return Err(Error::rejected(
                    RejectionReason::ReplicaFailure,
                    condition.message.clone().unwrap_or_default(),
                ))
            }
            "Progressing" => match condition.status.as_str() {
                "True" | "Unknown" => {
                    debug!("deployment update is progressing");
                    break;
                }
                "False" => {
                    return Err(Error::rejected(
                        RejectionReason::ProgressionFailure,
                        condition.message.clone().unwrap_or_default(),
                    ))
                }
                other => {
                    return Err(Error::AdjustmentFailure(format!(
                        "unknown deployment status condition: {other}"
                    )))
                }
            },
            _ => {}
        }
    }
    Ok(())
}

pub(crate) fn replica_counts_converged(status: &DeploymentStatus, desired: i32) -> bool {
    [
        status.replicas,
        status.available_replicas,
        status.ready_replicas,
        status.updated_replicas,
    ]
    .iter()
    .all(|count| *count == Some(desired))
}

pub(crate) fn replicas_ready(status: Option<&DeploymentStatus>) -> bool {
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

    fn condition(type_: &str, status: &str, reason: Option<&str>, message: Option<&str>) -> DeploymentCondition {
        DeploymentCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.map(str::to_string),
            message: message.map(str::to_string),
            ..Default::default()
        }
    }

    fn status(counts: [Option<i32>; 4], unavailable: Option<i32>) -> DeploymentStatus {
        DeploymentStatus {
            replicas: counts[0],
            available_replicas: counts[1],
            ready_replicas: counts[2],
            updated_replicas: counts[3],
            unavailable_replicas: unavailable,
            ..Default::default()
        }
    }

    #[test]
    fn selector_strings_are_comma_joined() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "fiber-http".to_string());
        labels.insert("role".to_string(), "web".to_string());
        assert_eq!(selector_string(&labels), "app=fiber-http,role=web");
    }

    #[test]
    fn available_true_allows_progress() {
        let conditions = vec![
            condition("Available", "True", None, None),
            // Never evaluated: Available=True short-circuits.
            condition("ReplicaFailure", "True", None, Some("boom")),
        ];
        assert!(check_conditions(&conditions).is_ok());
    }

    #[test]
    fn available_false_continues_watching() {
        let conditions = vec![condition("Available", "False", Some("MinimumReplicasUnavailable"), None)];
        assert!(check_conditions(&conditions).is_ok());
    }

    #[test]
    fn replica_failure_rejects() {
        let conditions = vec![condition(
            "ReplicaFailure",
            "True",
            Some("FailedCreate"),
            Some("pods \"web-\" is forbidden"),
        )];
        let err = check_conditions(&conditions).unwrap_err();
        match err {
            Error::AdjustmentRejected { reason, .. } => {
                assert_eq!(reason, RejectionReason::ReplicaFailure)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn progressing_false_rejects_with_progression_failure() {
        let conditions = vec![condition(
            "Progressing",
            "False",
            Some("ProgressDeadlineExceeded"),
            Some("ReplicaSet \"web-5c9f\" has timed out progressing"),
        )];
        let err = check_conditions(&conditions).unwrap_err();
        match err {
            Error::AdjustmentRejected { reason, message } => {
                assert_eq!(reason, RejectionReason::ProgressionFailure);
                assert!(message.contains("timed out progressing"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unexpected_condition_status_is_a_failure() {
        let conditions = vec![condition("Available", "Maybe", None, None)];
        assert!(matches!(
            check_conditions(&conditions).unwrap_err(),
            Error::AdjustmentFailure(_)
        ));

        let conditions = vec![condition("Progressing", "Perhaps", None, None)];
        assert!(matches!(
            check_conditions(&conditions).unwrap_err(),
            Error::AdjustmentFailure(_)
        ));
    }

    #[test]
    fn convergence_requires_all_counts_to_match() {
        assert!(replica_counts_converged(
            &status([Some(2), Some(2), Some(2), Some(2)], None),
            2
        ));
        assert!(!replica_counts_converged(
            &status([Some(2), Some(1), Some(2), Some(2)], None),
            2
        ));
        assert!(!replica_counts_converged(
            &status([Some(2), None, Some(2), Some(2)], None),
            2
        ));
    }

    #[test]
    fn readiness_requires_matching_replica_counts() {
        assert!(replicas_ready(Some(&status([Some(3), None, Some(3), None], None))));
        assert!(!replicas_ready(Some(&status([Some(3), None, Some(2), None], None))));
        assert!(!replicas_ready(Some(&status([None, None, Some(2), None], None))));
        assert!(!replicas_ready(None));
    }
}
