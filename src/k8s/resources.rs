//! Kubernetes resource builders for test apps
//!
//! Functions to create Namespace, Deployment, and Service specs from an
//! [`AppDescription`]

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Namespace, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::models::AppDescription;

/// Label key whose value is the app name on every pod of a test app
pub const TEST_APP_LABEL_KEY: &str = "testapp";

/// Reserved name of the injected sidecar container
pub const SIDECAR_CONTAINER_NAME: &str = "sidecar";

/// Port the service exposes, forwarded to the app port
pub const SERVICE_PORT: i32 = 3000;

const MANAGED_BY: (&str, &str) = ("app.kubernetes.io/managed-by", "testapp-harness");

/// Label selector string matching every pod of `app_name`
pub fn app_selector(app_name: &str) -> String {
    format!("{}={}", TEST_APP_LABEL_KEY, app_name)
}

/// Create labels for an app resource
pub fn app_labels(app_name: &str) -> BTreeMap<String, String> {
    [
        (MANAGED_BY.0.to_string(), MANAGED_BY.1.to_string()),
        (TEST_APP_LABEL_KEY.to_string(), app_name.to_string()),
    ]
    .into_iter()
    .collect()
}

pub fn build_namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                [(MANAGED_BY.0.to_string(), MANAGED_BY.1.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Pod annotations: sidecar injection settings plus any the app declares
fn pod_annotations(app: &AppDescription) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();

    if app.sidecar_enabled {
        annotations.insert("sidecar.testapp.io/inject".to_string(), "true".to_string());
        annotations.insert("sidecar.testapp.io/app-id".to_string(), app.app_name.clone());
        annotations.insert(
            "sidecar.testapp.io/app-port".to_string(),
            app.app_port.to_string(),
        );
    }

    annotations.extend(app.annotations.clone());
    annotations
}

pub fn build_deployment(namespace: &str, app: &AppDescription) -> Deployment {
    let labels = app_labels(&app.app_name);

    Deployment {
        metadata: ObjectMeta {
            name: Some(app.app_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(app.replicas),
            selector: LabelSelector {
                match_labels: Some(
                    [(TEST_APP_LABEL_KEY.to_string(), app.app_name.clone())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(pod_annotations(app)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: app.app_name.clone(),
                        image: Some(app.image()),
                        image_pull_policy: Some("Always".to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: app.app_port,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service exposing the app; a LoadBalancer when ingress is enabled
pub fn build_service(namespace: &str, app: &AppDescription) -> Service {
    let service_type = if app.ingress_enabled {
        "LoadBalancer"
    } else {
        "ClusterIP"
    };

    Service {
        metadata: ObjectMeta {
            name: Some(app.app_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels(&app.app_name)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(
                [(TEST_APP_LABEL_KEY.to_string(), app.app_name.clone())]
                    .into_iter()
                    .collect(),
            ),
            ports: Some(vec![ServicePort {
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(app.app_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some(service_type.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
