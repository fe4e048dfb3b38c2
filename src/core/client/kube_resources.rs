/// Re-export commonly used Kubernetes resource types from k8s-openapi
/// This module provides a centralized place for all K8s resource types

pub use k8s_openapi::api::core::v1::{
    Container as K8sContainer,
    ContainerPort,
    ContainerStatus,
    Endpoints,
    EndpointSubset,
    EnvVar,
    Namespace as K8sNamespace,
    Pod as K8sPod,
    PodCondition,
    PodSpec,
    PodStatus,
    PodTemplateSpec,
    ResourceRequirements as K8sResourceRequirements,
    Service as K8sService,
    ServicePort,
};

pub use k8s_openapi::api::apps::v1::{
    Deployment as K8sDeployment,
    DeploymentCondition,
    DeploymentStatus,
    ReplicaSet,
};

pub use k8s_openapi::api::authorization::v1::{
    ResourceAttributes,
    SelfSubjectAccessReview,
    SelfSubjectAccessReviewSpec,
};

pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector,
    ObjectMeta,
    OwnerReference,
};

pub use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
pub use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
