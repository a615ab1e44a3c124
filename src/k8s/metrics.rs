//! Pod resource usage from the metrics API (`metrics.k8s.io/v1beta1`)

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::DynamicObject;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Point-in-time usage of every container in one pod
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodMetrics {
    #[serde(default)]
    pub containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerMetrics {
    pub name: String,
    pub usage: ContainerUsage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerUsage {
    pub cpu: Quantity,
    pub memory: Quantity,
}

impl PodMetrics {
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self> {
        serde_json::from_value(obj.data.clone()).map_err(|e| {
            Error::Metrics(format!(
                "invalid PodMetrics for {}: {}",
                obj.metadata.name.as_deref().unwrap_or("unknown"),
                e
            ))
        })
    }
}

impl ContainerUsage {
    /// CPU in milli-cores, rounded up
    pub fn cpu_millis(&self) -> Result<i64> {
        let millis = parse_quantity(&self.cpu.0)? * 1000.0;
        // drop float noise from the suffix multiplication before rounding up
        Ok(((millis * 1e6).round() / 1e6).ceil() as i64)
    }

    pub fn memory_bytes(&self) -> Result<i64> {
        Ok(parse_quantity(&self.memory.0)?.round() as i64)
    }

    /// Memory as a decimal-megabyte approximation: whole KiB times 0.001024
    pub fn memory_mb(&self) -> Result<f64> {
        Ok((self.memory_bytes()? / 1024) as f64 * 0.001024)
    }
}

const SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parses a Kubernetes quantity string ("250m", "128Mi", "1e3", "2") into
/// its value in base units.
pub fn parse_quantity(qty: &str) -> Result<f64> {
    let qty = qty.trim();
    let invalid = || Error::Metrics(format!("invalid quantity '{}'", qty));

    // Binary suffixes first so "Mi" is not read as "M"
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| qty.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((qty, 1.0));

    if number.is_empty() {
        return Err(invalid());
    }

    let value: f64 = number.parse().map_err(|_| invalid())?;
    Ok(value * multiplier)
}
