use std::env;
use std::path::Path;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tracing::debug;

use crate::core::client::kube_resources::{K8sDeployment, K8sPod, OwnerReference, ReplicaSet};
use crate::errors::{Error, Result};

/// Creates a Kubernetes client following the configured loading order:
/// an explicit kubeconfig path, then the default kubeconfig, then the
/// in-cluster service account when `KUBERNETES_SERVICE_HOST` is set.
pub async fn build_kube_client(
    kubeconfig: Option<&Path>,
    context: Option<&str>,
) -> Result<Client> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let config = if let Some(path) = kubeconfig {
        debug!("Using kubeconfig from '{}'", path.display());
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| Error::Configuration(format!("could not read kubeconfig: {e}")))?;
        Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| Error::Configuration(format!("invalid kubeconfig: {e}")))?
    } else if let Ok(kubeconfig) = Kubeconfig::read() {
        debug!("Using default kubeconfig");
        Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| Error::Configuration(format!("invalid kubeconfig: {e}")))?
    } else if env::var("KUBERNETES_SERVICE_HOST").is_ok() {
        debug!("Using in-cluster configuration");
        Config::incluster()
            .map_err(|e| Error::Configuration(format!("in-cluster configuration failed: {e}")))?
    } else {
        return Err(Error::Configuration(
            "unable to configure Kubernetes client: no kubeconfig file nor in-cluster environment found"
                .to_string(),
        ));
    };

    let client = Client::try_from(config)?;
    debug!("Kubernetes client initialized successfully");
    Ok(client)
}

/// The agent's own identity when it runs inside the cluster it is tuning.
/// Present only when both `POD_NAME` and `POD_NAMESPACE` are set; used to
/// register the agent's Deployment as the owner of canary pods so they are
/// garbage-collected with the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub pod_name: String,
    pub pod_namespace: String,
}

impl AgentIdentity {
    pub fn from_env() -> Option<Self> {
        match (env::var("POD_NAME"), env::var("POD_NAMESPACE")) {
            (Ok(pod_name), Ok(pod_namespace)) => Some(AgentIdentity {
                pod_name,
                pod_namespace,
            }),
            _ => None,
        }
    }
}

fn controller_of(references: Option<&Vec<OwnerReference>>) -> Option<&OwnerReference> {
    references?
        .iter()
        .find(|reference| reference.controller == Some(true))
}

/// Resolve the owner reference for canary pods: the Deployment that owns the
/// agent's own pod, found by walking pod -> replica set -> deployment.
pub async fn agent_owner_reference(
    client: &Client,
    identity: &AgentIdentity,
) -> Result<OwnerReference> {
    debug!(
        "resolving controller for agent pod '{}/{}'",
        identity.pod_namespace, identity.pod_name
    );

    let pods: Api<K8sPod> = Api::namespaced(client.clone(), &identity.pod_namespace);
    let agent_pod = pods.get(&identity.pod_name).await?;
    let pod_controller = controller_of(agent_pod.metadata.owner_references.as_ref())
        .ok_or_else(|| Error::Controller("agent pod has no controlling owner".to_string()))?;

    let replica_sets: Api<ReplicaSet> = Api::namespaced(client.clone(), &identity.pod_namespace);
    let agent_rs = replica_sets.get(&pod_controller.name).await?;
    let rs_controller = controller_of(agent_rs.metadata.owner_references.as_ref())
        .ok_or_else(|| Error::Controller("agent replica set has no controlling owner".to_string()))?;

    let deployments: Api<K8sDeployment> =
        Api::namespaced(client.clone(), &identity.pod_namespace);
    let agent_deployment = deployments.get(&rs_controller.name).await?;

    Ok(OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: agent_deployment.metadata.name.clone().unwrap_or_default(),
        uid: agent_deployment.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_requires_both_variables() {
        // Guard against environment leakage from the host running the tests.
        let had_name = env::var("POD_NAME").is_ok();
        let had_namespace = env::var("POD_NAMESPACE").is_ok();
        if !had_name && !had_namespace {
            assert_eq!(AgentIdentity::from_env(), None);
        }
    }

    #[test]
    fn controller_owner_is_selected() {
        let references = vec![
            OwnerReference {
                api_version: "apps/v1".into(),
                kind: "ReplicaSet".into(),
                name: "agent-6bf9d".into(),
                uid: "rs-uid".into(),
                controller: Some(false),
                ..Default::default()
            },
            OwnerReference {
                api_version: "apps/v1".into(),
                kind: "ReplicaSet".into(),
                name: "agent-7cd81".into(),
                uid: "rs-uid-2".into(),
                controller: Some(true),
                ..Default::default()
            },
        ];
        let owner = controller_of(Some(&references)).unwrap();
        assert_eq!(owner.name, "agent-7cd81");
    }
}
