use kube::api::ListParams;
use kube::{Api, Client};
use tracing::debug;

use crate::core::client::kube_resources::{ObjectMeta, ReplicaSet};
use crate::errors::Result;

pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Whether the object is owned by the given controller kind and uid.
pub fn owned_by(metadata: &ObjectMeta, kind: &str, uid: &str) -> bool {
    metadata
        .owner_references
        .as_ref()
        .map(|references| {
            references
                .iter()
                .any(|reference| reference.kind == kind && reference.uid == uid)
        })
        .unwrap_or(false)
}

/// Fetch the replica sets owned by a controller, matched by label selector
/// and filtered down to actual ownership.
pub async fn fetch_owned_replicasets(
    client: &Client,
    namespace: &str,
    label_selector: &str,
    owner_kind: &str,
    owner_uid: &str,
) -> Result<Vec<ReplicaSet>> {
    let replica_sets: Api<ReplicaSet> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(label_selector);
    let list = replica_sets.list(&lp).await?;

    let owned: Vec<ReplicaSet> = list
        .items
        .into_iter()
        .filter(|rs| owned_by(&rs.metadata, owner_kind, owner_uid))
        .collect();
    debug!(
        "Found {} replica set(s) owned by {} '{}' in namespace '{}'",
        owned.len(),
        owner_kind,
        owner_uid,
        namespace
    );
    Ok(owned)
}

fn numeric_resource_version(rs: &ReplicaSet) -> u64 {
    rs.metadata
        .resource_version
        .as_deref()
        .and_then(|version| version.parse().ok())
        .unwrap_or(0)
}

/// The replica set with the highest resource version, i.e. the one the
/// controller most recently wrote.
pub fn newest_replicaset(mut replica_sets: Vec<ReplicaSet>) -> Option<ReplicaSet> {
    replica_sets.sort_by_key(|rs| std::cmp::Reverse(numeric_resource_version(rs)));
    replica_sets.into_iter().next()
}

/// The deployment revision recorded on a replica set, 0 when absent.
pub fn revision(rs: &ReplicaSet) -> i64 {
    rs.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(REVISION_ANNOTATION))
        .and_then(|revision| revision.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::kube_resources::OwnerReference;
    use std::collections::BTreeMap;

    fn replica_set(resource_version: &str, revision: Option<&str>) -> ReplicaSet {
        ReplicaSet {
            metadata: ObjectMeta {
                resource_version: Some(resource_version.to_string()),
                annotations: revision.map(|r| {
                    let mut annotations = BTreeMap::new();
                    annotations.insert(REVISION_ANNOTATION.to_string(), r.to_string());
                    annotations
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn ownership_matches_kind_and_uid() {
        let metadata = ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                kind: "Deployment".into(),
                uid: "dep-uid".into(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(owned_by(&metadata, "Deployment", "dep-uid"));
        assert!(!owned_by(&metadata, "Deployment", "other-uid"));
        assert!(!owned_by(&metadata, "Rollout", "dep-uid"));
        assert!(!owned_by(&ObjectMeta::default(), "Deployment", "dep-uid"));
    }

    #[test]
    fn newest_is_picked_by_numeric_resource_version() {
        let sets = vec![
            replica_set("900", None),
            replica_set("1200", None),
            replica_set("1100", None),
        ];
        let newest = newest_replicaset(sets).unwrap();
        assert_eq!(newest.metadata.resource_version.as_deref(), Some("1200"));
        assert!(newest_replicaset(vec![]).is_none());
    }

    #[test]
    fn revision_parses_annotation() {
        assert_eq!(revision(&replica_set("1", Some("7"))), 7);
        assert_eq!(revision(&replica_set("1", None)), 0);
    }
}
