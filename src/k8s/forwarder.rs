//! Local port forwarding to test app pods
//!
//! Each tunnel listens on an ephemeral localhost port and forwards every
//! accepted connection to a port inside one pod. Tunnels are grouped by pod
//! name and all share the forwarder's cluster client.
//!
//! A tunnel is only handed out after a stream to the pod port has been
//! opened; that stream serves the first accepted connection.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use super::client::{ClusterClient, PodStream};
use crate::error::{Error, Result};

/// Pause after a failed accept, e.g. when the process is out of descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct Tunnel {
    remote_port: u16,
    local_port: u16,
    task: JoinHandle<()>,
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Port forwarder for the pods of one namespace
pub struct PodPortForwarder {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    /// `None` once the forwarder has been closed
    tunnels: Mutex<Option<HashMap<String, Vec<Tunnel>>>>,
}

impl PodPortForwarder {
    pub fn new(client: Arc<dyn ClusterClient>, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            tunnels: Mutex::new(Some(HashMap::new())),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Opens one tunnel per target port to `pod` and returns the local
    /// ports, in the same order as `target_ports`.
    ///
    /// Every pod port is reached once before any tunnel is set up, so an
    /// unknown pod or a refused port fails here and leaves no tunnel behind.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn connect(&self, pod: &str, target_ports: &[u16]) -> Result<Vec<u16>> {
        let mut guard = self.tunnels.lock().await;
        let tunnels = guard.as_mut().ok_or(Error::ForwarderClosed)?;

        let mut first_streams = Vec::with_capacity(target_ports.len());
        for &remote_port in target_ports {
            first_streams.push(self.client.open_pod_stream(pod, remote_port).await?);
        }

        let mut opened = Vec::with_capacity(target_ports.len());
        for (&remote_port, first) in target_ports.iter().zip(first_streams) {
            let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
            let local_port = listener.local_addr()?.port();

            let task = tokio::spawn(serve(
                listener,
                self.client.clone(),
                pod.to_string(),
                remote_port,
                first,
            ));

            info!(pod, remote_port, local_port, "Port forward established");
            opened.push(Tunnel {
                remote_port,
                local_port,
                task,
            });
        }

        let local_ports = opened.iter().map(|t| t.local_port).collect();
        tunnels.entry(pod.to_string()).or_default().extend(opened);
        Ok(local_ports)
    }

    /// Local ports currently forwarded to `pod`, as (local, remote) pairs
    pub async fn tunnels(&self, pod: &str) -> Vec<(u16, u16)> {
        let guard = self.tunnels.lock().await;
        guard
            .as_ref()
            .and_then(|t| t.get(pod))
            .map(|list| list.iter().map(|t| (t.local_port, t.remote_port)).collect())
            .unwrap_or_default()
    }

    /// Tears down every tunnel to `pod`, leaving other pods untouched
    pub async fn disconnect(&self, pod: &str) {
        let removed = {
            let mut guard = self.tunnels.lock().await;
            guard.as_mut().and_then(|t| t.remove(pod))
        };
        if let Some(list) = removed {
            shutdown(list).await;
            debug!(pod, "Port forwards removed");
        }
    }

    /// Tears down all tunnels. The forwarder rejects new connections after this.
    pub async fn close(&self) {
        let all = self.tunnels.lock().await.take();
        if let Some(all) = all {
            for (_, list) in all {
                shutdown(list).await;
            }
            info!(namespace = %self.namespace, "Port forwarder closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.tunnels.lock().await.is_none()
    }
}

async fn shutdown(tunnels: Vec<Tunnel>) {
    for mut tunnel in tunnels {
        tunnel.task.abort();
        // Wait for the listener to be dropped so the port is really released
        let _ = (&mut tunnel.task).await;
    }
}

async fn serve(
    listener: TcpListener,
    client: Arc<dyn ClusterClient>,
    pod: String,
    port: u16,
    first: PodStream,
) {
    let mut connections = JoinSet::new();
    let mut ready = Some(first);

    loop {
        tokio::select! {
            (socket, peer) = accept_with_backoff(|| listener.accept(), &pod, port) => {
                debug!(%peer, pod = %pod, port, "Accepted forwarded connection");
                let client = client.clone();
                let pod = pod.clone();
                let upstream = ready.take();
                connections.spawn(async move {
                    if let Err(e) =
                        forward_connection(client.as_ref(), &pod, port, socket, upstream).await
                    {
                        warn!(pod = %pod, port, error = %e, "Forwarded connection failed");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Retries `accept` until it succeeds, pausing after each failure.
async fn accept_with_backoff<T, F, Fut>(mut accept: F, pod: &str, port: u16) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!(pod = %pod, port, error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn forward_connection(
    client: &dyn ClusterClient,
    pod: &str,
    port: u16,
    mut socket: TcpStream,
    upstream: Option<PodStream>,
) -> Result<()> {
    let mut upstream = match upstream {
        Some(stream) => stream,
        None => client.open_pod_stream(pod, port).await?,
    };
    tokio::io::copy_bidirectional(&mut socket, &mut upstream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::api_error;
    use crate::k8s::MockClusterClient;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Mock cluster whose pods echo back whatever they receive
    fn echo_cluster() -> Arc<dyn ClusterClient> {
        let mut mock = MockClusterClient::new();
        mock.expect_open_pod_stream().returning(|_, _| {
            let (ours, mut theirs) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while let Ok(n) = theirs.read(&mut buf).await {
                    if n == 0 || theirs.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
            let stream: PodStream = Box::new(ours);
            Ok(stream)
        });
        Arc::new(mock)
    }

    #[tokio::test]
    async fn test_connect_forwards_bytes() {
        let forwarder = PodPortForwarder::new(echo_cluster(), "e2e");
        let ports = forwarder.connect("app-0", &[3000]).await.unwrap();
        assert_eq!(ports.len(), 1);

        let mut conn = TcpStream::connect(("127.0.0.1", ports[0])).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(forwarder.tunnels("app-0").await, vec![(ports[0], 3000)]);
        forwarder.close().await;
    }

    #[tokio::test]
    async fn test_second_connection_opens_new_stream() {
        let forwarder = PodPortForwarder::new(echo_cluster(), "e2e");
        let ports = forwarder.connect("app-0", &[3000]).await.unwrap();

        for msg in [b"one", b"two"] {
            let mut conn = TcpStream::connect(("127.0.0.1", ports[0])).await.unwrap();
            conn.write_all(msg).await.unwrap();
            let mut buf = [0u8; 3];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, msg);
        }
        forwarder.close().await;
    }

    #[tokio::test]
    async fn test_connect_fails_when_pod_unreachable() {
        let mut mock = MockClusterClient::new();
        mock.expect_open_pod_stream()
            .times(1)
            .returning(|_, _| Err(api_error(404, "NotFound")));
        let forwarder = PodPortForwarder::new(Arc::new(mock), "e2e");

        let err = forwarder.connect("no-such-pod", &[3000]).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(forwarder.tunnels("no-such-pod").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_back_off() {
        let mut failures = 3;
        let start = tokio::time::Instant::now();

        let accepted = accept_with_backoff(
            || {
                let result = if failures > 0 {
                    failures -= 1;
                    Err(std::io::Error::from(std::io::ErrorKind::ConnectionAborted))
                } else {
                    Ok("conn")
                };
                std::future::ready(result)
            },
            "app-0",
            3000,
        )
        .await;

        assert_eq!(accepted, "conn");
        assert_eq!(failures, 0);
        assert!(start.elapsed() >= ACCEPT_BACKOFF * 3);
    }

    #[tokio::test]
    async fn test_multiple_ports_and_pods() {
        let forwarder = PodPortForwarder::new(echo_cluster(), "e2e");
        let a = forwarder.connect("app-0", &[3000, 50001]).await.unwrap();
        let b = forwarder.connect("app-1", &[3000]).await.unwrap();

        assert_eq!(a.len(), 2);
        assert_ne!(a[0], a[1]);
        assert_eq!(forwarder.tunnels("app-0").await.len(), 2);

        forwarder.disconnect("app-0").await;
        assert!(forwarder.tunnels("app-0").await.is_empty());
        assert_eq!(forwarder.tunnels("app-1").await, vec![(b[0], 3000)]);
    }

    #[tokio::test]
    async fn test_close_releases_all_tunnels() {
        let forwarder = PodPortForwarder::new(echo_cluster(), "e2e");
        let ports = forwarder.connect("app-0", &[3000]).await.unwrap();

        forwarder.close().await;
        assert!(forwarder.is_closed().await);
        assert!(TcpStream::connect(("127.0.0.1", ports[0])).await.is_err());
        assert!(matches!(
            forwarder.connect("app-0", &[3000]).await,
            Err(Error::ForwarderClosed)
        ));
    }
}
