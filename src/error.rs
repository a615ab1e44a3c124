//! Error types for the test app harness

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("expected number of pods for {app}: {expected}, received: {actual}")]
    ReplicaMismatch {
        app: String,
        expected: i32,
        actual: usize,
    },

    #[error("cannot find sidecar in pod {pod}")]
    SidecarNotFound { pod: String },

    #[error("sidecar is not enabled for app {app}")]
    SidecarDisabled { app: String },

    #[error("container (sidecar={sidecar}) not found in pods for app {app} in namespace {namespace}")]
    ContainerClassAbsent {
        app: String,
        namespace: String,
        sidecar: bool,
    },

    #[error("{0} is out of range")]
    ReplicasOutOfRange(i32),

    #[error("{resource} {name:?} is not in desired state, received: {last}")]
    Timeout {
        resource: &'static str,
        name: String,
        last: String,
    },

    #[error("no pod found for app {app}")]
    NoPodAvailable { app: String },

    #[error("port forwarder is closed")]
    ForwarderClosed,

    #[error("port forward failed: {0}")]
    PortForward(String),

    #[error("metrics error: {0}")]
    Metrics(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// True when the API server reported that the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// True for a deadline error produced by the polling engine.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} (test)", reason),
        reason: reason.to_string(),
        code,
    }))
}
