use std::time::Duration;

use kube::{Api, Client};
use tracing::debug;

use crate::core::client::kube_resources::{Endpoints, IntOrString, K8sService, ServicePort};
use crate::core::wait::{wait_for_condition, Condition, DEFAULT_POLL_INTERVAL};
use crate::errors::{Error, Result};

/// Wrapper around a Kubernetes Service holding the last-read API object.
#[derive(Clone)]
pub struct Service {
    client: Client,
    obj: K8sService,
}

impl Service {
    fn api(&self) -> Api<K8sService> {
        Api::namespaced(self.client.clone(), self.namespace())
    }

    /// Read a service by name under the given namespace.
    pub async fn read(client: &Client, name: &str, namespace: &str) -> Result<Self> {
        let services: Api<K8sService> = Api::namespaced(client.clone(), namespace);
        let obj = services.get(name).await?;
        debug!("Fetched service: {}/{}", namespace, name);
        Ok(Service {
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

    pub fn obj(&self) -> &K8sService {
        &self.obj
    }

    /// Refresh the underlying Service resource.
    pub async fn refresh(&mut self) -> Result<()> {
        self.obj = self.api().get(self.name()).await?;
        Ok(())
    }

    /// The ports exposed by the service.
    pub fn ports(&self) -> &[ServicePort] {
        self.obj
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_deref())
            .unwrap_or_default()
    }

    /// The target port of the first service port, the port a proxying
    /// sidecar forwards traffic to. Named target ports cannot be resolved
    /// without inspecting the backing containers and are not supported.
    pub fn first_target_port(&self) -> Result<i32> {
        let port = self.ports().first().ok_or_else(|| {
            Error::Configuration(format!("service '{}' exposes no ports", self.name()))
        })?;
        match &port.target_port {
            Some(IntOrString::Int(value)) => Ok(*value),
            Some(IntOrString::String(name)) => Err(Error::Configuration(format!(
                "service '{}' uses named target port '{name}', which is not supported",
                self.name()
            ))),
            None => Ok(port.port),
        }
    }

    /// The Endpoints object backing this service, if any.
    pub async fn get_endpoints(&self) -> Result<Option<Endpoints>> {
        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), self.namespace());
        Ok(endpoints.get_opt(self.name()).await?)
    }

    /// A service is ready once it has endpoints, every subset carries at
    /// least one address, and no subset has not-ready addresses.
    pub async fn is_ready(&self) -> Result<bool> {
        let Some(endpoints) = self.get_endpoints().await? else {
            return Ok(false);
        };
        Ok(endpoints_ready(&endpoints))
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let service = &*self;
        let condition = Condition::new(format!("service '{}' ready", service.name()), move || {
            service.is_ready()
        });
        wait_for_condition(condition, timeout, DEFAULT_POLL_INTERVAL, false).await
    }
}

fn endpoints_ready(endpoints: &Endpoints) -> bool {
    let Some(subsets) = endpoints.subsets.as_ref() else {
        return false;
    };
    if subsets.is_empty() {
        return false;
    }

    subsets.iter().all(|subset| {
        let addressed = subset
            .addresses
            .as_ref()
            .map(|addresses| !addresses.is_empty())
            .unwrap_or(false);
        let none_pending = subset
            .not_ready_addresses
            .as_ref()
            .map(|addresses| addresses.is_empty())
            .unwrap_or(true);
        addressed && none_pending
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};

    fn subset(addresses: usize, not_ready: usize) -> EndpointSubset {
        let build = |n: usize| {
            (n > 0).then(|| {
                (0..n)
                    .map(|i| EndpointAddress {
                        ip: format!("10.0.0.{i}"),
                        ..Default::default()
                    })
                    .collect()
            })
        };
        EndpointSubset {
            addresses: build(addresses),
            not_ready_addresses: build(not_ready),
            ..Default::default()
        }
    }

    #[test]
    fn ready_when_all_subsets_are_addressed() {
        let endpoints = Endpoints {
            subsets: Some(vec![subset(2, 0), subset(1, 0)]),
            ..Default::default()
        };
        assert!(endpoints_ready(&endpoints));
    }

    #[test]
    fn not_ready_without_subsets() {
        assert!(!endpoints_ready(&Endpoints::default()));
        let endpoints = Endpoints {
            subsets: Some(vec![]),
            ..Default::default()
        };
        assert!(!endpoints_ready(&endpoints));
    }

    #[test]
    fn not_ready_with_unaddressed_subset() {
        let endpoints = Endpoints {
            subsets: Some(vec![subset(1, 0), subset(0, 0)]),
            ..Default::default()
        };
        assert!(!endpoints_ready(&endpoints));
    }

    #[test]
    fn not_ready_with_pending_addresses() {
        let endpoints = Endpoints {
            subsets: Some(vec![subset(1, 1)]),
            ..Default::default()
        };
        assert!(!endpoints_ready(&endpoints));
    }
}
