use kube::{Api, Client};
use tracing::debug;

use crate::core::client::kube_resources::K8sNamespace;
use crate::errors::Result;

/// Wrapper around a Kubernetes Namespace holding the last-read API object.
#[derive(Clone)]
pub struct Namespace {
    client: Client,
    obj: K8sNamespace,
}

impl Namespace {
    fn api(client: &Client) -> Api<K8sNamespace> {
        Api::all(client.clone())
    }

    /// Read a namespace by name from the cluster.
    pub async fn read(client: &Client, name: &str) -> Result<Self> {
        let obj = Self::api(client).get(name).await?;
        debug!("Fetched namespace: {}", name);
        Ok(Namespace {
            client: client.clone(),
            obj,
        })
    }

    pub fn name(&self) -> &str {
        self.obj.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn obj(&self) -> &K8sNamespace {
        &self.obj
    }

    /// Refresh the underlying Namespace resource.
    pub async fn refresh(&mut self) -> Result<()> {
        self.obj = Self::api(&self.client).get(self.name()).await?;
        Ok(())
    }

    /// A namespace is ready once its phase is `Active`.
    pub async fn is_ready(&self) -> Result<bool> {
        let obj = Self::api(&self.client).get(self.name()).await?;
        Ok(namespace_active(&obj))
    }
}

fn namespace_active(obj: &K8sNamespace) -> bool {
    obj.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map(|phase| phase.eq_ignore_ascii_case("active"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NamespaceStatus;

    fn namespace_with_phase(phase: Option<&str>) -> K8sNamespace {
        K8sNamespace {
            status: phase.map(|phase| NamespaceStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn active_phase_is_ready() {
        assert!(namespace_active(&namespace_with_phase(Some("Active"))));
        assert!(namespace_active(&namespace_with_phase(Some("active"))));
    }

    #[test]
    fn other_phases_are_not_ready() {
        assert!(!namespace_active(&namespace_with_phase(Some("Terminating"))));
        assert!(!namespace_active(&namespace_with_phase(None)));
        assert!(!namespace_active(&K8sNamespace::default()));
    }
}
