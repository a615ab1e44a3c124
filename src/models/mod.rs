//! Data models for the test app harness

mod app;

pub use app::{AppDescription, PodInfo, DEFAULT_APP_PORT};
