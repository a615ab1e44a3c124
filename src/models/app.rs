use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default port the test app container listens on
pub const DEFAULT_APP_PORT: i32 = 3000;

/// Description of one test application
///
/// Everything except `replicas` is fixed once the app manager is created;
/// scaling updates `replicas` together with the deployment's scale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppDescription {
    pub app_name: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Whether a sidecar is injected into every pod of the app
    #[serde(default)]
    pub sidecar_enabled: bool,

    /// Whether the app is exposed through an externally reachable service
    #[serde(default)]
    pub ingress_enabled: bool,

    pub image_name: String,

    #[serde(default)]
    pub registry_name: Option<String>,

    #[serde(default = "default_app_port")]
    pub app_port: i32,

    /// Extra pod annotations, e.g. sidecar injection settings
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

fn default_replicas() -> i32 {
    1
}

fn default_app_port() -> i32 {
    DEFAULT_APP_PORT
}

impl AppDescription {
    pub fn new(app_name: impl Into<String>, image_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            replicas: default_replicas(),
            sidecar_enabled: false,
            ingress_enabled: false,
            image_name: image_name.into(),
            registry_name: None,
            app_port: default_app_port(),
            annotations: BTreeMap::new(),
        }
    }

    /// Full image reference, prefixed with the registry when one is set
    pub fn image(&self) -> String {
        match self.registry_name.as_deref() {
            Some(registry) if !registry.is_empty() => {
                format!("{}/{}", registry.trim_end_matches('/'), self.image_name)
            }
            _ => self.image_name.clone(),
        }
    }

    /// Parse a description from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

/// Name and address of a pod running the app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub ip: String,
}
