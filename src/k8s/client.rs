//! Cluster access for the harness
//!
//! [`ClusterClient`] is the narrow set of API calls the app manager needs.
//! [`KubeClusterClient`] implements it on top of `kube::Client`, scoped to
//! one namespace.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, LogParams, PostParams},
    discovery::ApiResource,
    Client, Config,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info, instrument};

use super::metrics::PodMetrics;
use crate::error::{Error, Result};

/// A bidirectional byte stream to a port inside a pod
pub trait PodIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PodIo for T {}

pub type PodStream = Box<dyn PodIo>;

/// Raw log bytes of one container, read as they arrive
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_namespace(&self, name: &str) -> Result<Namespace>;
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment>;
    async fn get_deployment(&self, name: &str) -> Result<Deployment>;
    /// Deletes with foreground propagation so pods go before the deployment
    async fn delete_deployment(&self, name: &str) -> Result<()>;
    async fn get_deployment_scale(&self, name: &str) -> Result<Scale>;
    async fn replace_deployment_scale(&self, name: &str, scale: &Scale) -> Result<Scale>;

    async fn create_service(&self, service: &Service) -> Result<Service>;
    async fn get_service(&self, name: &str) -> Result<Service>;
    async fn delete_service(&self, name: &str) -> Result<()>;

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>>;
    async fn get_pod(&self, name: &str) -> Result<Pod>;
    /// Streams the log written so far, without following it
    async fn container_log_stream(&self, pod: &str, container: &str) -> Result<LogStream>;
    async fn pod_metrics(&self, pod: &str) -> Result<PodMetrics>;

    /// Opens one forwarded connection to `port` in `pod`
    async fn open_pod_stream(&self, pod: &str, port: u16) -> Result<PodStream>;
}

/// `ClusterClient` backed by a live API server connection
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
}

impl KubeClusterClient {
    /// Connect using the default kubeconfig or in-cluster config
    #[instrument]
    pub async fn new(namespace: &str) -> Result<Self> {
        let config = Config::infer()
            .await
            .map_err(|e| Error::Kube(kube::Error::InferConfig(e)))?;
        let client = Client::try_from(config)?;

        info!("Connected to Kubernetes cluster");

        Ok(Self::from_client(client, namespace))
    }

    pub fn from_client(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    /// Namespace that namespaced calls operate in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get the inner kube Client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pod_metrics_api(&self) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: "metrics.k8s.io".to_string(),
            version: "v1beta1".to_string(),
            api_version: "metrics.k8s.io/v1beta1".to_string(),
            kind: "PodMetrics".to_string(),
            plural: "pods".to_string(),
        };
        Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Ok(namespaces.get(name).await?)
    }

    #[instrument(skip(self, namespace), fields(namespace = %namespace.metadata.name.as_deref().unwrap_or("unknown")))]
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let created = namespaces.create(&PostParams::default(), namespace).await?;
        info!("Created namespace");
        Ok(created)
    }

    #[instrument(skip(self, deployment), fields(deployment_name = %deployment.metadata.name.as_deref().unwrap_or("unknown")))]
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let created = self
            .deployments()
            .create(&PostParams::default(), deployment)
            .await?;
        info!("Created deployment");
        Ok(created)
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment> {
        Ok(self.deployments().get(name).await?)
    }

    #[instrument(skip(self))]
    async fn delete_deployment(&self, name: &str) -> Result<()> {
        self.deployments()
            .delete(name, &DeleteParams::foreground())
            .await?;
        info!(name, "Deleted deployment");
        Ok(())
    }

    async fn get_deployment_scale(&self, name: &str) -> Result<Scale> {
        Ok(self.deployments().get_scale(name).await?)
    }

    #[instrument(skip(self, scale))]
    async fn replace_deployment_scale(&self, name: &str, scale: &Scale) -> Result<Scale> {
        let data = serde_json::to_vec(scale).map_err(kube::Error::SerdeError)?;
        let updated = self
            .deployments()
            .replace_scale(name, &PostParams::default(), data)
            .await?;
        info!(name, "Updated deployment scale");
        Ok(updated)
    }

    #[instrument(skip(self, service), fields(service_name = %service.metadata.name.as_deref().unwrap_or("unknown")))]
    async fn create_service(&self, service: &Service) -> Result<Service> {
        let created = self
            .services()
            .create(&PostParams::default(), service)
            .await?;
        info!("Created service");
        Ok(created)
    }

    async fn get_service(&self, name: &str) -> Result<Service> {
        Ok(self.services().get(name).await?)
    }

    #[instrument(skip(self))]
    async fn delete_service(&self, name: &str) -> Result<()> {
        self.services()
            .delete(name, &DeleteParams::foreground())
            .await?;
        info!(name, "Deleted service");
        Ok(())
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods()
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn get_pod(&self, name: &str) -> Result<Pod> {
        Ok(self.pods().get(name).await?)
    }

    #[instrument(skip(self))]
    async fn container_log_stream(&self, pod: &str, container: &str) -> Result<LogStream> {
        let log_params = LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };
        // Bytes, not text: container output is not guaranteed to be UTF-8
        let reader = self.pods().log_stream(pod, &log_params).await?;
        Ok(Box::pin(reader.compat()))
    }

    async fn pod_metrics(&self, pod: &str) -> Result<PodMetrics> {
        let obj = self.pod_metrics_api().get(pod).await?;
        PodMetrics::from_dynamic(&obj)
    }

    #[instrument(skip(self))]
    async fn open_pod_stream(&self, pod: &str, port: u16) -> Result<PodStream> {
        let mut forwarder = self.pods().portforward(pod, &[port]).await?;
        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| Error::PortForward(format!("port {} not found in forwarder", port)))?;
        debug!(pod, port, "Opened pod stream");

        Ok(Box::new(ForwardedStream {
            stream,
            _forwarder: forwarder,
        }))
    }
}

/// Keeps the port forwarder alive for as long as its stream is in use
struct ForwardedStream<S> {
    stream: S,
    _forwarder: kube::api::Portforwarder,
}

impl<S: AsyncRead + Unpin> AsyncRead for ForwardedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ForwardedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
