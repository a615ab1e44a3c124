//! Test App Harness Library
//!
//! Deploys containerized test applications into a Kubernetes namespace for
//! end-to-end tests, waits until they are ready, exposes them for traffic,
//! reports on their pods, and tears them down again.

pub mod config;
pub mod error;
pub mod k8s;
pub mod manager;
pub mod models;
pub mod poll;

pub use config::HarnessConfig;
pub use error::{Error, Result};
pub use manager::{AppManager, LifecycleStage, MAX_REPLICAS};
pub use models::{AppDescription, PodInfo};
