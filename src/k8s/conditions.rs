//! Desired-state predicates for deployments and services
//!
//! Each condition looks at one fetch result (object or error) and decides
//! whether the wait is over. [`Condition::evaluate`] turns that decision
//! into an [`Attempt`] for the polling engine.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;

use crate::error::Result;
use crate::poll::Attempt;

/// A desired state for resource kind `K`
pub trait Condition<K> {
    /// Whether the fetch result shows the desired state
    fn is_met(&self, fetched: &Result<K>) -> bool;

    /// Whether a failed fetch that does not meet the condition should be
    /// retried instead of aborting the wait
    fn tolerates_fetch_errors(&self) -> bool {
        false
    }

    /// Maps a fetch result onto a polling step. The observed object (if
    /// any) is kept so a timeout can report it.
    fn evaluate(&self, fetched: Result<K>) -> Attempt<Option<K>> {
        let met = self.is_met(&fetched);
        match fetched {
            Ok(obj) if met => Attempt::Ready(Some(obj)),
            Ok(obj) => Attempt::Waiting(Some(obj)),
            Err(_) if met => Attempt::Ready(None),
            Err(_) if self.tolerates_fetch_errors() => Attempt::Waiting(None),
            Err(err) => Attempt::Fatal(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentCondition {
    /// Spec reconciled and every desired replica ready and available
    Ready { replicas: i32 },
    /// The API server reports the deployment as not found
    Deleted,
}

impl Condition<Deployment> for DeploymentCondition {
    fn is_met(&self, fetched: &Result<Deployment>) -> bool {
        match self {
            DeploymentCondition::Ready { replicas } => fetched
                .as_ref()
                .map(|d| is_deployment_ready(d, *replicas))
                .unwrap_or(false),
            DeploymentCondition::Deleted => is_deleted(fetched),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCondition {
    /// An external endpoint exists. `node_ip_override` is set when the
    /// cluster has no load balancer and nodes are reached directly.
    IngressReady { node_ip_override: bool },
    Deleted,
}

impl Condition<Service> for ServiceCondition {
    fn is_met(&self, fetched: &Result<Service>) -> bool {
        match self {
            ServiceCondition::IngressReady { node_ip_override } => fetched
                .as_ref()
                .map(|svc| is_service_ingress_ready(svc, *node_ip_override))
                .unwrap_or(false),
            ServiceCondition::Deleted => is_deleted(fetched),
        }
    }

    fn tolerates_fetch_errors(&self) -> bool {
        // Load balancer provisioning can lag well behind service creation
        matches!(self, ServiceCondition::IngressReady { .. })
    }
}

/// True iff the spec is fully reconciled and both ready and available
/// replica counts equal `replicas`.
pub fn is_deployment_ready(deployment: &Deployment, replicas: i32) -> bool {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let status = deployment.status.as_ref();

    generation == status.and_then(|s| s.observed_generation).unwrap_or(0)
        && status.and_then(|s| s.ready_replicas).unwrap_or(0) == replicas
        && status.and_then(|s| s.available_replicas).unwrap_or(0) == replicas
}

/// True iff the service has a load balancer ingress, or a node address
/// override is in effect and the service declares at least one port.
pub fn is_service_ingress_ready(service: &Service, node_ip_override: bool) -> bool {
    if !load_balancer_ingress(service).is_empty() {
        return true;
    }

    node_ip_override && !service_ports(service).is_empty()
}

fn is_deleted<K>(fetched: &Result<K>) -> bool {
    matches!(fetched, Err(e) if e.is_not_found())
}

pub(crate) fn load_balancer_ingress(
    service: &Service,
) -> &[k8s_openapi::api::core::v1::LoadBalancerIngress] {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_deref())
        .unwrap_or_default()
}

pub(crate) fn service_ports(service: &Service) -> &[k8s_openapi::api::core::v1::ServicePort] {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default()
}
