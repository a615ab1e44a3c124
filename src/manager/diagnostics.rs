//! Restart counts, resource peaks, and container logs for a running app

use std::path::Path;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use super::AppManager;
use crate::error::{Error, Result};
use crate::k8s::SIDECAR_CONTAINER_NAME;
use crate::models::PodInfo;

impl AppManager {
    /// Name and IP of every pod running the app
    pub async fn get_host_details(&self) -> Result<Vec<PodInfo>> {
        self.require_sidecar()?;

        let pods = self.matching_pods().await?;
        Ok(pods
            .into_iter()
            .map(|pod| PodInfo {
                name: pod.metadata.name.unwrap_or_default(),
                ip: pod.status.and_then(|s| s.pod_ip).unwrap_or_default(),
            })
            .collect())
    }

    /// Total container restarts across all pods of the app
    #[instrument(skip(self), fields(app = %self.app.app_name))]
    pub async fn get_total_restarts(&self) -> Result<i32> {
        self.require_sidecar()?;

        let mut restarts = 0;
        for listed in self.matching_pods().await? {
            let name = listed.metadata.name.unwrap_or_default();
            // Re-read so the counters are as fresh as possible
            let pod = self.client.get_pod(&name).await?;

            restarts += pod
                .status
                .and_then(|s| s.container_statuses)
                .unwrap_or_default()
                .iter()
                .map(|c| c.restart_count)
                .sum::<i32>();
        }

        Ok(restarts)
    }

    /// Peak CPU (milli-cores) and memory (MB) of the sidecar containers, or
    /// of the app containers when `sidecar` is false.
    ///
    /// Fails with [`Error::ContainerClassAbsent`] when no pod has a
    /// container of the requested kind.
    #[instrument(skip(self), fields(app = %self.app.app_name))]
    pub async fn get_cpu_and_memory(&self, sidecar: bool) -> Result<(i64, f64)> {
        let pods = self.get_host_details().await?;

        let mut peak: Option<(i64, f64)> = None;
        for pod in &pods {
            let metrics = self.client.pod_metrics(&pod.name).await?;

            for container in metrics
                .containers
                .iter()
                .filter(|c| (c.name == SIDECAR_CONTAINER_NAME) == sidecar)
            {
                let cpu = container.usage.cpu_millis()?;
                let memory = container.usage.memory_mb()?;
                peak = Some(match peak {
                    Some((max_cpu, max_memory)) => (max_cpu.max(cpu), max_memory.max(memory)),
                    None => (cpu, memory),
                });
            }
        }

        peak.ok_or_else(|| Error::ContainerClassAbsent {
            app: self.app.app_name.clone(),
            namespace: self.namespace.clone(),
            sidecar,
        })
    }

    /// Writes the logs of every container of every pod to
    /// `<log dir>/<pod>.<container>.log`. Stops at the first failure.
    #[instrument(skip(self), fields(app = %self.app.app_name))]
    pub async fn save_container_logs(&self) -> Result<()> {
        let Some(dir) = self.log_dir().await else {
            debug!("No container log directory, skipping log capture");
            return Ok(());
        };
        self.require_sidecar()?;

        for pod in self.matching_pods().await? {
            let pod_name = pod.metadata.name.unwrap_or_default();
            let containers = pod.spec.map(|s| s.containers).unwrap_or_default();

            for container in containers {
                self.save_one_log(dir, &pod_name, &container.name).await?;
            }
        }

        Ok(())
    }

    async fn save_one_log(&self, dir: &Path, pod: &str, container: &str) -> Result<()> {
        let mut logs = self.client.container_log_stream(pod, container).await?;

        let filename = dir.join(format!("{}.{}.log", pod, container));
        let mut file = tokio::fs::File::create(&filename).await?;
        let bytes = tokio::io::copy(&mut logs, &mut file).await?;
        file.flush().await?;

        info!(file = %filename.display(), bytes, "Saved container logs");
        Ok(())
    }
}
