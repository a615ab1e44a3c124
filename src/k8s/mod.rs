//! Kubernetes integration for the test app harness
//!
//! This module handles all interactions with the cluster:
//! - Building namespace, deployment, and service specs
//! - Desired-state predicates for readiness and deletion
//! - Pod metrics from the metrics API
//! - Port forwarding to pods without a stable external address

mod client;
mod conditions;
mod forwarder;
mod metrics;
mod resources;

#[cfg(test)]
pub(crate) use client::MockClusterClient;
pub use client::{ClusterClient, KubeClusterClient, LogStream, PodIo, PodStream};
pub use conditions::{
    is_deployment_ready, is_service_ingress_ready, Condition, DeploymentCondition,
    ServiceCondition,
};
pub(crate) use conditions::{load_balancer_ingress, service_ports};
pub use forwarder::PodPortForwarder;
pub use metrics::{parse_quantity, ContainerMetrics, ContainerUsage, PodMetrics};
pub use resources::{
    app_labels, app_selector, build_deployment, build_namespace, build_service,
    SERVICE_PORT, SIDECAR_CONTAINER_NAME, TEST_APP_LABEL_KEY,
};
