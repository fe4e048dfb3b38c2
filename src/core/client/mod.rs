// Kube-rs based Kubernetes client
pub mod access;
pub mod controllers;
pub mod deployments;
pub mod kube_client;
pub mod kube_resources;
pub mod namespaces;
pub mod pods;
pub mod replicasets;
pub mod rollouts;
pub mod services;
