use std::collections::BTreeMap;

use bitflags::bitflags;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;

use crate::core::client::kube_resources::K8sContainer;

bitflags! {
    /// Which Kubernetes resource requirements an operation reads or writes.
    ///
    /// Requests establish the lower bound the scheduler reserves for a
    /// container while limits cap what it may consume. Optimization values
    /// can target either or both.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceRequirements: u8 {
        const REQUEST = 1 << 0;
        const LIMIT = 1 << 1;
        const COMPUTE = Self::REQUEST.bits() | Self::LIMIT.bits();
    }
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        ResourceRequirements::COMPUTE
    }
}

/// A single requirement, the unit the flag set is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Request,
    Limit,
}

impl Requirement {
    /// Key under `container.resources` for this requirement.
    pub fn resources_key(&self) -> &'static str {
        match self {
            Requirement::Request => "requests",
            Requirement::Limit => "limits",
        }
    }
}

impl ResourceRequirements {
    /// The individual members of this flag set, in declaration order.
    pub fn members(&self) -> Vec<Requirement> {
        let mut members = Vec::new();
        if self.contains(ResourceRequirements::REQUEST) {
            members.push(Requirement::Request);
        }
        if self.contains(ResourceRequirements::LIMIT) {
            members.push(Requirement::Limit);
        }
        members
    }

    pub fn human_readable(&self) -> String {
        let names: Vec<&str> = self
            .members()
            .iter()
            .map(|m| match m {
                Requirement::Request => "request",
                Requirement::Limit => "limit",
            })
            .collect();
        if names.is_empty() {
            "-".to_string()
        } else {
            names.join(", ")
        }
    }
}

fn requirement_map<'a>(
    container: &'a K8sContainer,
    requirement: Requirement,
) -> Option<&'a BTreeMap<String, Quantity>> {
    let resources = container.resources.as_ref()?;
    match requirement {
        Requirement::Request => resources.requests.as_ref(),
        Requirement::Limit => resources.limits.as_ref(),
    }
}

/// Retrieve resource requirement values for a container with a cascading,
/// non-exceptional fallback. Values are returned aligned to the declaration
/// order of the members in `requirements` (reversible via `reverse`); a
/// missing requirement yields `default`.
pub fn get_requirements(
    container: &K8sContainer,
    name: &str,
    requirements: ResourceRequirements,
    reverse: bool,
    default: Option<&str>,
) -> Vec<Option<String>> {
    let mut members = requirements.members();
    if reverse {
        members.reverse();
    }

    members
        .into_iter()
        .map(|member| {
            match requirement_map(container, member).and_then(|map| map.get(name)) {
                Some(quantity) => Some(quantity.0.clone()),
                None => {
                    debug!(
                        "requirement '{}' is not set for resource '{}' of container '{}'",
                        member.resources_key(),
                        name,
                        container.name
                    );
                    default.map(str::to_string)
                }
            }
        })
        .collect()
}

/// The first present requirement value in declaration order, or `None` when
/// the resource has no requirement in the given flag set. Reversing the
/// evaluation order retrieves the limit with a request fallback.
pub fn first_requirement(
    container: &K8sContainer,
    name: &str,
    requirements: ResourceRequirements,
    reverse: bool,
) -> Option<String> {
    let mut members = requirements.members();
    if reverse {
        members.reverse();
    }

    members
        .into_iter()
        .find_map(|member| requirement_map(container, member).and_then(|map| map.get(name)))
        .map(|quantity| quantity.0.clone())
}

/// Set one or more requirement values on a container. A single value is
/// broadcast to every member of `requirements`; multiple values are consumed
/// in declaration order with the first value as the fallback. With
/// `clear_others`, the resource key is removed from requirements outside the
/// flag set.
pub fn set_requirements(
    container: &mut K8sContainer,
    name: &str,
    values: &[&str],
    requirements: ResourceRequirements,
    clear_others: bool,
) {
    assert!(!values.is_empty(), "at least one requirement value is required");
    let default = values[0];
    let resources = container.resources.get_or_insert_with(Default::default);

    let mut consumed = 0;
    for member in ResourceRequirements::COMPUTE.members() {
        let map = match member {
            Requirement::Request => resources.requests.get_or_insert_with(BTreeMap::new),
            Requirement::Limit => resources.limits.get_or_insert_with(BTreeMap::new),
        };

        if requirements.members().contains(&member) {
            let value = values.get(consumed).copied().unwrap_or(default);
            consumed += 1;
            map.insert(name.to_string(), Quantity(value.to_string()));
        } else if clear_others {
            debug!(
                "clearing resource requirement '{}' for '{}'",
                member.resources_key(),
                name
            );
            map.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ResourceRequirements as K8sResourceRequirements;

    fn container_with(requests: &[(&str, &str)], limits: &[(&str, &str)]) -> K8sContainer {
        let to_map = |entries: &[(&str, &str)]| -> Option<BTreeMap<String, Quantity>> {
            if entries.is_empty() {
                return None;
            }
            Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                    .collect(),
            )
        };
        K8sContainer {
            name: "app".to_string(),
            resources: Some(K8sResourceRequirements {
                requests: to_map(requests),
                limits: to_map(limits),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn flag_members_follow_declaration_order() {
        assert_eq!(
            ResourceRequirements::COMPUTE.members(),
            vec![Requirement::Request, Requirement::Limit]
        );
        assert_eq!(
            ResourceRequirements::REQUEST.members(),
            vec![Requirement::Request]
        );
        assert_eq!(ResourceRequirements::COMPUTE.human_readable(), "request, limit");
    }

    #[test]
    fn get_returns_values_aligned_to_members() {
        let container = container_with(&[("cpu", "125m")], &[("cpu", "250m")]);
        assert_eq!(
            get_requirements(&container, "cpu", ResourceRequirements::COMPUTE, false, None),
            vec![Some("125m".to_string()), Some("250m".to_string())]
        );
        assert_eq!(
            get_requirements(&container, "memory", ResourceRequirements::COMPUTE, false, Some("1Gi")),
            vec![Some("1Gi".to_string()), Some("1Gi".to_string())]
        );
    }

    #[test]
    fn first_requirement_cascades_and_reverses() {
        let container = container_with(&[("cpu", "125m")], &[("cpu", "250m")]);
        assert_eq!(
            first_requirement(&container, "cpu", ResourceRequirements::COMPUTE, false),
            Some("125m".to_string())
        );
        assert_eq!(
            first_requirement(&container, "cpu", ResourceRequirements::COMPUTE, true),
            Some("250m".to_string())
        );

        let request_only = container_with(&[("cpu", "125m")], &[]);
        assert_eq!(
            first_requirement(&request_only, "cpu", ResourceRequirements::COMPUTE, true),
            Some("125m".to_string())
        );
        assert_eq!(
            first_requirement(&request_only, "memory", ResourceRequirements::COMPUTE, false),
            None
        );
    }

    #[test]
    fn set_broadcasts_a_single_value() {
        let mut container = container_with(&[], &[]);
        set_requirements(&mut container, "cpu", &["250m"], ResourceRequirements::COMPUTE, false);
        assert_eq!(
            get_requirements(&container, "cpu", ResourceRequirements::COMPUTE, false, None),
            vec![Some("250m".to_string()), Some("250m".to_string())]
        );
    }

    #[test]
    fn set_consumes_tuple_values_in_declaration_order() {
        let mut container = container_with(&[], &[]);
        set_requirements(
            &mut container,
            "memory",
            &["128Mi", "256Mi"],
            ResourceRequirements::COMPUTE,
            false,
        );
        assert_eq!(
            get_requirements(&container, "memory", ResourceRequirements::COMPUTE, false, None),
            vec![Some("128Mi".to_string()), Some("256Mi".to_string())]
        );
    }

    #[test]
    fn set_with_clear_others_removes_unselected_requirements() {
        let mut container = container_with(&[("cpu", "125m")], &[("cpu", "250m")]);
        set_requirements(&mut container, "cpu", &["500m"], ResourceRequirements::LIMIT, true);
        assert_eq!(
            get_requirements(&container, "cpu", ResourceRequirements::COMPUTE, false, None),
            vec![None, Some("500m".to_string())]
        );
    }

    #[test]
    fn flag_algebra_round_trip() {
        for flags in [
            ResourceRequirements::REQUEST,
            ResourceRequirements::LIMIT,
            ResourceRequirements::COMPUTE,
        ] {
            let mut container = container_with(&[("cpu", "1")], &[("cpu", "2")]);
            set_requirements(&mut container, "cpu", &["750m"], flags, true);
            for (member, value) in ResourceRequirements::COMPUTE
                .members()
                .into_iter()
                .zip(get_requirements(&container, "cpu", ResourceRequirements::COMPUTE, false, None))
            {
                if flags.members().contains(&member) {
                    assert_eq!(value, Some("750m".to_string()));
                } else {
                    assert_eq!(value, None);
                }
            }
        }
    }
}
