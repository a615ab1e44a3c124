//! Test app lifecycle management
//!
//! [`AppManager`] drives one test app through setup
//! ([`LifecycleStage`] order, stopping at the first failure), exposes the
//! running pods, and tears everything down again.

mod diagnostics;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::ScaleSpec;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use strum::Display;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::k8s::{
    app_selector, build_deployment, build_namespace, build_service, load_balancer_ingress,
    service_ports, ClusterClient, Condition, DeploymentCondition, PodPortForwarder,
    ServiceCondition,
};
use crate::models::AppDescription;
use crate::poll::{poll_until, PollError, PollSettings};

/// Upper bound accepted by [`AppManager::scale_deployment_replica`]
pub const MAX_REPLICAS: i32 = 10;

/// Setup progress of an app. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleStage {
    New,
    NamespaceEnsured,
    StaleResourcesCleared,
    Created,
    ReadinessConfirmed,
    SidecarValidated,
    IngressExposed,
    Disposed,
}

/// Manages one test app in one namespace
pub struct AppManager {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    app: AppDescription,
    config: HarnessConfig,
    poll: PollSettings,
    stage: LifecycleStage,
    forwarder: Option<PodPortForwarder>,
    /// Where container logs go on dispose, resolved on first use;
    /// `None` discards them
    log_dir: OnceCell<Option<PathBuf>>,
}

impl AppManager {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: &str,
        app: AppDescription,
        config: HarnessConfig,
    ) -> Self {
        let poll = config.poll_settings();
        Self {
            client,
            namespace: namespace.to_string(),
            app,
            config,
            poll,
            stage: LifecycleStage::New,
            forwarder: None,
            log_dir: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.app.app_name
    }

    pub fn app(&self) -> &AppDescription {
        &self.app
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn stage(&self) -> LifecycleStage {
        self.stage
    }

    fn advance(&mut self, next: LifecycleStage) {
        debug_assert!(next > self.stage, "{} cannot follow {}", next, self.stage);
        debug!(app = %self.app.app_name, from = %self.stage, to = %next, "Lifecycle stage");
        self.stage = next;
    }

    /// Installs the app: namespace, clean slate, deployment, readiness,
    /// sidecar check, and ingress, in that order.
    ///
    /// May be called again after [`AppManager::dispose`] or a failed
    /// attempt; setup then starts over from the first stage.
    #[instrument(skip(self), fields(app = %self.app.app_name, namespace = %self.namespace))]
    pub async fn init(&mut self) -> Result<()> {
        if self.stage != LifecycleStage::New {
            debug!(from = %self.stage, "Restarting setup");
            self.stage = LifecycleStage::New;
        }

        self.get_or_create_namespace().await?;
        self.advance(LifecycleStage::NamespaceEnsured);

        // Creation is not idempotent, so leftovers from an earlier run go
        // first. Their logs are not captured.
        self.teardown(true, false).await?;
        self.advance(LifecycleStage::StaleResourcesCleared);

        self.deploy().await?;
        self.advance(LifecycleStage::Created);

        self.wait_until_deployment_state(DeploymentCondition::Ready {
            replicas: self.app.replicas,
        })
        .await?;
        self.advance(LifecycleStage::ReadinessConfirmed);

        if self.app.sidecar_enabled {
            self.validate_sidecar().await?;
        }
        self.advance(LifecycleStage::SidecarValidated);

        if self.app.ingress_enabled {
            self.create_ingress_service().await?;
        }
        self.advance(LifecycleStage::IngressExposed);

        self.forwarder = Some(PodPortForwarder::new(self.client.clone(), &self.namespace));
        // Report an unusable log directory now rather than at dispose
        let _ = self.log_dir().await;

        info!("App is ready");
        Ok(())
    }

    /// The container log directory, created on first use. `None` when it
    /// cannot be created, in which case logs are discarded.
    async fn log_dir(&self) -> Option<&Path> {
        self.log_dir
            .get_or_init(|| async {
                let dir = PathBuf::from(&self.config.container_log_path);
                match tokio::fs::create_dir_all(&dir).await {
                    Ok(()) => Some(dir),
                    Err(e) => {
                        warn!(
                            path = %dir.display(),
                            error = %e,
                            "Failed to create output log directory, container logs will be discarded"
                        );
                        None
                    }
                }
            })
            .await
            .as_deref()
    }

    /// Deletes the deployment and service, optionally waiting until both
    /// are gone, and closes any port forwards.
    ///
    /// Container logs are first captured into the configured log directory,
    /// whether or not setup got that far. A capture failure is logged and
    /// never stops the deletions.
    #[instrument(skip(self), fields(app = %self.app.app_name, namespace = %self.namespace))]
    pub async fn dispose(&mut self, wait: bool) -> Result<()> {
        self.teardown(wait, true).await?;
        self.stage = LifecycleStage::Disposed;
        Ok(())
    }

    async fn teardown(&mut self, wait: bool, capture_logs: bool) -> Result<()> {
        if capture_logs && self.log_dir().await.is_some() {
            if let Err(e) = self.save_container_logs().await {
                warn!(app = %self.app.app_name, error = %e, "Failed to retrieve container logs");
            }
        }

        self.delete_deployment(true).await?;
        self.delete_service(true).await?;

        if wait {
            self.wait_until_deployment_state(DeploymentCondition::Deleted)
                .await?;
            self.wait_until_service_state(ServiceCondition::Deleted)
                .await?;
        }

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.close().await;
        }

        Ok(())
    }

    /// Gets the namespace, creating it when it does not exist yet
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn get_or_create_namespace(&self) -> Result<Namespace> {
        match self.client.get_namespace(&self.namespace).await {
            Ok(ns) => Ok(ns),
            Err(e) if e.is_not_found() => {
                match self
                    .client
                    .create_namespace(&build_namespace(&self.namespace))
                    .await
                {
                    Ok(ns) => Ok(ns),
                    Err(Error::Kube(kube::Error::Api(e))) if e.code == 409 => {
                        // Someone else created it in between, that's fine
                        info!("Namespace already exists");
                        self.client.get_namespace(&self.namespace).await
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn deploy(&self) -> Result<Deployment> {
        self.client
            .create_deployment(&build_deployment(&self.namespace, &self.app))
            .await
    }

    /// Creates the service that exposes the app outside the cluster
    pub async fn create_ingress_service(&self) -> Result<Service> {
        self.client
            .create_service(&build_service(&self.namespace, &self.app))
            .await
    }

    /// Polls the deployment until `condition` holds.
    ///
    /// Returns the final deployment, or `None` when waiting for deletion.
    pub async fn wait_until_deployment_state(
        &self,
        condition: DeploymentCondition,
    ) -> Result<Option<Deployment>> {
        let client = &self.client;
        let name = &self.app.app_name;

        let result = poll_until(self.poll, move || async move {
            condition.evaluate(client.get_deployment(name).await)
        })
        .await;

        self.finish_wait("deployment", result)
    }

    /// Polls the service until `condition` holds.
    pub async fn wait_until_service_state(
        &self,
        condition: ServiceCondition,
    ) -> Result<Option<Service>> {
        let client = &self.client;
        let name = &self.app.app_name;

        let result = poll_until(self.poll, move || async move {
            condition.evaluate(client.get_service(name).await)
        })
        .await;

        self.finish_wait("service", result)
    }

    fn finish_wait<K: std::fmt::Debug>(
        &self,
        resource: &'static str,
        result: std::result::Result<Option<K>, PollError<Option<K>>>,
    ) -> Result<Option<K>> {
        match result {
            Ok(obj) => Ok(obj),
            Err(PollError::Fatal(e)) => Err(e),
            Err(PollError::Timeout { last, elapsed }) => {
                warn!(resource, name = %self.app.app_name, ?elapsed, "Timed out waiting for desired state");
                Err(Error::Timeout {
                    resource,
                    name: self.app.app_name.clone(),
                    last: format!("{:?}", last.flatten()),
                })
            }
        }
    }

    /// Deletes the deployment. With `ignore_not_found`, a missing
    /// deployment counts as success.
    pub async fn delete_deployment(&self, ignore_not_found: bool) -> Result<()> {
        match self.client.delete_deployment(&self.app.app_name).await {
            Err(e) if ignore_not_found && e.is_not_found() => Ok(()),
            other => other,
        }
    }

    pub async fn delete_service(&self, ignore_not_found: bool) -> Result<()> {
        match self.client.delete_service(&self.app.app_name).await {
            Err(e) if ignore_not_found && e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Pods of the app, failing unless exactly `replicas` are found
    async fn matching_pods(&self) -> Result<Vec<Pod>> {
        let pods = self
            .client
            .list_pods(&app_selector(&self.app.app_name))
            .await?;

        if pods.len() != self.app.replicas as usize {
            return Err(Error::ReplicaMismatch {
                app: self.app.app_name.clone(),
                expected: self.app.replicas,
                actual: pods.len(),
            });
        }

        Ok(pods)
    }

    fn require_sidecar(&self) -> Result<()> {
        if self.app.sidecar_enabled {
            Ok(())
        } else {
            Err(Error::SidecarDisabled {
                app: self.app.app_name.clone(),
            })
        }
    }

    /// Checks that every pod of the app runs the sidecar container
    #[instrument(skip(self), fields(app = %self.app.app_name))]
    pub async fn validate_sidecar(&self) -> Result<()> {
        self.require_sidecar()?;

        for pod in self.matching_pods().await? {
            let has_sidecar = pod
                .spec
                .as_ref()
                .map(|spec| {
                    spec.containers
                        .iter()
                        .any(|c| c.name == crate::k8s::SIDECAR_CONTAINER_NAME)
                })
                .unwrap_or(false);

            if !has_sidecar {
                return Err(Error::SidecarNotFound {
                    pod: pod.metadata.name.unwrap_or_default(),
                });
            }
        }

        Ok(())
    }

    /// Forwards `target_ports` of a pod to local ports and returns them.
    ///
    /// Without a pod name any pod of the app is used; which one is
    /// unspecified.
    pub async fn do_port_forwarding(
        &self,
        pod_name: Option<&str>,
        target_ports: &[u16],
    ) -> Result<Vec<u16>> {
        let forwarder = self.forwarder.as_ref().ok_or(Error::ForwarderClosed)?;

        let name = match pod_name {
            Some(name) => name.to_string(),
            None => self
                .client
                .list_pods(&app_selector(&self.app.app_name))
                .await?
                .into_iter()
                .find_map(|pod| pod.metadata.name)
                .ok_or_else(|| Error::NoPodAvailable {
                    app: self.app.app_name.clone(),
                })?,
        };

        forwarder.connect(&name, target_ports).await
    }

    /// Scales the deployment to `replicas`, which must be in `0..=10`.
    ///
    /// The local description is updated once the cluster accepts the new scale.
    #[instrument(skip(self), fields(app = %self.app.app_name))]
    pub async fn scale_deployment_replica(&mut self, replicas: i32) -> Result<()> {
        if !(0..=MAX_REPLICAS).contains(&replicas) {
            return Err(Error::ReplicasOutOfRange(replicas));
        }

        let mut scale = self
            .client
            .get_deployment_scale(&self.app.app_name)
            .await?;

        let current = scale.spec.as_ref().and_then(|s| s.replicas);
        if current == Some(replicas) {
            self.app.replicas = replicas;
            return Ok(());
        }

        scale.spec = Some(ScaleSpec {
            replicas: Some(replicas),
        });
        self.client
            .replace_deployment_scale(&self.app.app_name, &scale)
            .await?;
        self.app.replicas = replicas;

        info!(replicas, "Scaled deployment");
        Ok(())
    }

    /// Waits for the service ingress and returns its external `host:port`.
    ///
    /// Returns `None` when the ingress never became ready.
    pub async fn acquire_external_url(&self) -> Option<String> {
        info!(app = %self.app.app_name, "Waiting until service ingress is ready");

        let condition = ServiceCondition::IngressReady {
            node_ip_override: self.config.node_ip().is_some(),
        };
        match self.wait_until_service_state(condition).await {
            Ok(Some(svc)) => {
                info!(app = %self.app.app_name, "Service ingress is ready");
                self.external_url_from_service(&svc)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(app = %self.app.app_name, error = %e, "Service ingress never became ready");
                None
            }
        }
    }

    /// External `host:port` of a service: the load balancer address with
    /// the service port, or the node address override with the node port.
    pub fn external_url_from_service(&self, svc: &Service) -> Option<String> {
        let ports = service_ports(svc);
        let ingress = load_balancer_ingress(svc);

        if let (Some(lb), Some(port)) = (ingress.first(), ports.first()) {
            let address = lb
                .hostname
                .as_deref()
                .filter(|h| !h.is_empty())
                .or(lb.ip.as_deref())
                .unwrap_or_default();
            return Some(format!("{}:{}", address, port.port));
        }

        match (self.config.node_ip(), ports.first()) {
            (Some(node_ip), Some(port)) => {
                Some(format!("{}:{}", node_ip, port.node_port.unwrap_or_default()))
            }
            _ => None,
        }
    }

    #[cfg(test)]
    fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    #[cfg(test)]
    fn discarding_logs(mut self) -> Self {
        self.log_dir = OnceCell::new_with(Some(None));
        self
    }
}
