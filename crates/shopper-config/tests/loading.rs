use std::collections::HashMap;

use shopper_config::{load_with, ConfigError};

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name: &str| map.get(name).cloned()
}

#[test]
fn defaults_apply_with_no_file_and_no_env() {
    let settings = load_with(None, &env_of(&[])).unwrap();
    assert!(settings.deployment_id.starts_with("shopper-"));
    assert!(settings.vastai.is_none());
    assert!(settings.tensordock.is_none());
    assert_eq!(settings.reconcile_interval.as_secs(), 60);
    assert!(settings.auto_destroy_orphans);
    assert_eq!(settings.shutdown_max_parallel, 5);
    assert_eq!(settings.server_url, "http://localhost:8080");
}

#[test]
fn yaml_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    std::fs::write(
        &path,
        r#"
deployment_id: dep-prod-1
reconcile_interval_secs: 30
auto_destroy_orphans: false
port: 9090
providers:
  vastai:
    api_key: key-from-file
"#,
    )
    .unwrap();

    let settings = load_with(Some(&path), &env_of(&[])).unwrap();
    assert_eq!(settings.deployment_id, "dep-prod-1");
    assert_eq!(settings.reconcile_interval.as_secs(), 30);
    assert!(!settings.auto_destroy_orphans);
    assert_eq!(settings.port, 9090);
    assert_eq!(settings.vastai.unwrap().api_key, "key-from-file");
}

#[test]
fn env_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    std::fs::write(
        &path,
        r#"
deployment_id: dep-from-file
providers:
  vastai:
    api_key: key-from-file
"#,
    )
    .unwrap();

    let env = env_of(&[
        ("GPU_SHOPPER_DEPLOYMENT_ID", "dep-from-env"),
        ("VASTAI_API_KEY", "key-from-env"),
        ("GPU_SHOPPER_URL", "http://gpu.example.com:8080"),
    ]);
    let settings = load_with(Some(&path), &env).unwrap();
    assert_eq!(settings.deployment_id, "dep-from-env");
    assert_eq!(settings.vastai.unwrap().api_key, "key-from-env");
    assert_eq!(settings.server_url, "http://gpu.example.com:8080");
}

#[test]
fn tensordock_requires_both_credentials() {
    let err = load_with(None, &env_of(&[("TENSORDOCK_AUTH_ID", "id-only")])).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));

    let settings = load_with(
        None,
        &env_of(&[
            ("TENSORDOCK_AUTH_ID", "auth"),
            ("TENSORDOCK_API_TOKEN", "token"),
        ]),
    )
    .unwrap();
    let td = settings.tensordock.unwrap();
    assert_eq!(td.auth_id, "auth");
    assert_eq!(td.api_token, "token");
}

#[test]
fn malformed_yaml_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    std::fs::write(&path, "port: [not a number").unwrap();

    let err = load_with(Some(&path), &env_of(&[])).unwrap_err();
    assert!(matches!(err, ConfigError::YamlParse { .. }));
}
