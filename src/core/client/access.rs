use kube::api::PostParams;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::client::kube_resources::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use crate::errors::{Error, Result};

/// Kubernetes permissions granted through RBAC, expressed as the verbs the
/// agent must hold on a group's resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionSet {
    pub group: String,
    pub resources: Vec<String>,
    pub verbs: Vec<String>,
}

/// The permissions required to optimize deployments and manage tuning pods.
pub fn standard_permissions() -> Vec<PermissionSet> {
    vec![
        PermissionSet {
            group: "apps".to_string(),
            resources: vec!["deployments".to_string(), "replicasets".to_string()],
            verbs: vec![
                "get".to_string(),
                "list".to_string(),
                "watch".to_string(),
                "update".to_string(),
                "patch".to_string(),
            ],
        },
        PermissionSet {
            group: "".to_string(),
            resources: vec!["namespaces".to_string()],
            verbs: vec!["get".to_string(), "list".to_string()],
        },
        PermissionSet {
            group: "".to_string(),
            resources: vec![
                "pods".to_string(),
                "pods/logs".to_string(),
                "pods/status".to_string(),
            ],
            verbs: vec![
                "create".to_string(),
                "delete".to_string(),
                "get".to_string(),
                "list".to_string(),
                "watch".to_string(),
            ],
        },
    ]
}

/// Verify through SelfSubjectAccessReview that every required permission is
/// granted in the target namespace. The first denial fails the check.
pub async fn verify_permissions(
    client: &Client,
    namespace: &str,
    permissions: &[PermissionSet],
) -> Result<()> {
    let reviews: Api<SelfSubjectAccessReview> = Api::all(client.clone());

    for permission in permissions {
        for resource in &permission.resources {
            for verb in &permission.verbs {
                let review = SelfSubjectAccessReview {
                    spec: SelfSubjectAccessReviewSpec {
                        resource_attributes: Some(ResourceAttributes {
                            group: Some(permission.group.clone()),
                            resource: Some(resource.clone()),
                            verb: Some(verb.clone()),
                            namespace: Some(namespace.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    ..Default::default()
                };

                let response = reviews.create(&PostParams::default(), &review).await?;
                let allowed = response
                    .status
                    .map(|status| status.allowed)
                    .unwrap_or(false);
                debug!(
                    "access review: verb={} resource={} group='{}' allowed={}",
                    verb, resource, permission.group, allowed
                );
                if !allowed {
                    return Err(Error::Configuration(format!(
                        "cannot {verb} {resource} in namespace '{namespace}': permission denied"
                    )));
                }
            }
        }
    }
    Ok(())
}
