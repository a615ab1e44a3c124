//! Tests for app descriptions and lifecycle reporting
//!
//! These tests verify how app descriptions are read from YAML and how
//! lifecycle stages and errors are presented.

use testapp_harness::{AppDescription, Error, LifecycleStage, MAX_REPLICAS};

#[test]
fn test_app_description_from_yaml() {
    let yaml = r#"
appName: echo
replicas: 3
sidecarEnabled: true
ingressEnabled: true
imageName: e2e-echo:latest
registryName: registry.local:5000/
appPort: 8080
annotations:
  example.com/team: qa
"#;

    let app = AppDescription::from_yaml(yaml).unwrap();
    assert_eq!(app.app_name, "echo");
    assert_eq!(app.replicas, 3);
    assert!(app.sidecar_enabled);
    assert!(app.ingress_enabled);
    assert_eq!(app.app_port, 8080);
    assert_eq!(app.image(), "registry.local:5000/e2e-echo:latest");
    assert_eq!(
        app.annotations.get("example.com/team").map(String::as_str),
        Some("qa")
    );
}

#[test]
fn test_app_description_defaults() {
    let app = AppDescription::from_yaml("appName: echo\nimageName: e2e-echo\n").unwrap();

    assert_eq!(app, AppDescription::new("echo", "e2e-echo"));
    assert_eq!(app.replicas, 1);
    assert_eq!(app.app_port, 3000);
    assert!(!app.sidecar_enabled);
    assert_eq!(app.image(), "e2e-echo");
}

#[test]
fn test_app_description_requires_name_and_image() {
    assert!(AppDescription::from_yaml("imageName: e2e-echo\n").is_err());
    assert!(AppDescription::from_yaml("appName: echo\n").is_err());
}

#[test]
fn test_lifecycle_stage_display_and_order() {
    assert_eq!(LifecycleStage::New.to_string(), "new");
    assert_eq!(
        LifecycleStage::StaleResourcesCleared.to_string(),
        "stale_resources_cleared"
    );
    assert_eq!(LifecycleStage::IngressExposed.to_string(), "ingress_exposed");

    assert!(LifecycleStage::NamespaceEnsured < LifecycleStage::Created);
    assert!(LifecycleStage::SidecarValidated < LifecycleStage::IngressExposed);
    assert!(LifecycleStage::IngressExposed < LifecycleStage::Disposed);
}

#[test]
fn test_error_messages() {
    let err = Error::ReplicaMismatch {
        app: "echo".to_string(),
        expected: 3,
        actual: 2,
    };
    assert_eq!(
        err.to_string(),
        "expected number of pods for echo: 3, received: 2"
    );

    let err = Error::ReplicasOutOfRange(MAX_REPLICAS + 1);
    assert_eq!(err.to_string(), "11 is out of range");
    assert!(!err.is_not_found());
    assert!(!err.is_timeout());
}
