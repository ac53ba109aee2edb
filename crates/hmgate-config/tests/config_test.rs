#![allow(clippy::unwrap_used)]
// Loading config files and translating them into a CentralConfig.

use std::fs;
use std::path::Path;
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::ExposeSecret;

use hmgate_config::{ConfigError, load_central_config, load_config_from, save_config};
use hmgate_core::{Pattern, TlsVerification};

// ── Helpers ─────────────────────────────────────────────────────────

fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

const MINIMAL: &str = r#"
central_id = "home"
callback_bind = "127.0.0.1:9126"
persist = false

[interfaces.hmip]
url = "http://192.168.1.20:2010"
backend_interface = "HmIP-RF"
"#;

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = load_config_from(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(cfg.central_id, "hmgate");
    assert_eq!(cfg.health.probe_interval_secs, 15);
    assert_eq!(cfg.health.reconnect_backoff_secs, 120);
    assert!(cfg.cache.enabled);
    assert!(cfg.interfaces.is_empty());
}

#[test]
fn test_minimal_file_translates_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "config.toml", MINIMAL);

    let central = load_central_config(&path).unwrap();
    assert_eq!(central.central_id, "home");
    assert_eq!(central.callback_bind, "127.0.0.1:9126".parse().unwrap());
    assert_eq!(central.callback_host, "127.0.0.1");
    assert_eq!(central.storage_dir, None);
    assert_eq!(central.cache.default_max_age, Duration::from_secs(300));
    assert_eq!(central.health.failure_threshold, 3);
    assert_eq!(central.request.max_concurrent, 3);
    assert_eq!(central.request.timeout, Duration::from_secs(5));

    let iface = &central.interfaces[0];
    assert_eq!(iface.interface_id, "hmip");
    assert_eq!(iface.url.as_str(), "http://192.168.1.20:2010/");
    assert!(iface.legacy_url.is_none());
    assert!(iface.credentials.is_none());
    assert_eq!(iface.tls, TlsVerification::SystemDefaults);
}

#[test]
fn test_rule_files_precede_inline_rules() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "rules.toml", r#"
[[rule]]
action = "ignore"
device_type = "HmIP-*"
parameter = "LOW_BAT"
"#);
    let path = write(dir.path(), "config.toml", r#"
callback_bind = "127.0.0.1:9126"
persist = false
rule_files = ["rules.toml"]

[interfaces.hmip]
url = "http://192.168.1.20:2010"
backend_interface = "HmIP-RF"

[[rule]]
action = "unignore"
device_type = "HmIP-SWDO"
parameter = "LOW_BAT"
channel = 0
"#);

    let central = load_central_config(&path).unwrap();
    let rules = central.rules.rules();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].device_type, "HmIP-*".parse::<Pattern>().unwrap());
    assert_eq!(rules[1].channel, Some(0));
}

#[test]
fn test_schema_file_extends_builtin_table() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "schemas.toml", r#"
[schema.acme_relay]
kind = "switch"
primary_channel = 0
field = [{ field = "state", parameter = "STATE" }]

[[device]]
device_type = "ACME-RELAY"
schema = "acme_relay"
channels = [1]
"#);
    let path = write(
        dir.path(),
        "config.toml",
        &MINIMAL.replacen(
            "persist = false",
            "persist = false\nschema_files = [\"schemas.toml\"]",
            1,
        ),
    );

    let central = load_central_config(&path).unwrap();
    assert!(central.schemas.schema("acme_relay").is_some());
    assert!(central.schemas.schema("ip_switch").is_some());
    assert_eq!(central.schemas.plan("ACME-RELAY").customs.len(), 1);
}

#[test]
fn test_dangling_schema_mapping_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "schemas.toml", r#"
[[device]]
device_type = "ACME-RELAY"
schema = "nowhere"
"#);
    let path = write(
        dir.path(),
        "config.toml",
        &MINIMAL.replacen(
            "persist = false",
            "persist = false\nschema_files = [\"schemas.toml\"]",
            1,
        ),
    );

    let err = load_central_config(&path).unwrap_err();
    assert!(
        matches!(err, ConfigError::Validation { ref field, .. } if field == "schema_files"),
        "got {err:?}"
    );
}

#[test]
fn test_unreadable_rule_file_names_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "config.toml",
        &MINIMAL.replacen("persist = false", "persist = false\nrule_files = [\"missing.toml\"]", 1),
    );

    match load_central_config(&path).unwrap_err() {
        ConfigError::Rules { path, .. } => assert!(path.ends_with("missing.toml")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_plaintext_password_and_tls_options() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "config.toml", r#"
callback_bind = "0.0.0.0:9126"
callback_host = "192.168.1.50"
persist = false

[interfaces.rf]
url = "https://192.168.1.20:42001"
backend_interface = "BidCos-RF"
legacy_url = "https://192.168.1.20"
username = "admin"
password = "hunter2"
insecure = true
"#);

    let central = load_central_config(&path).unwrap();
    assert_eq!(central.callback_host, "192.168.1.50");
    let iface = &central.interfaces[0];
    let creds = iface.credentials.as_ref().unwrap();
    assert_eq!(creds.username, "admin");
    assert_eq!(creds.password.expose_secret(), "hunter2");
    assert_eq!(iface.tls, TlsVerification::DangerAcceptInvalid);
    assert_eq!(iface.legacy_url.as_ref().unwrap().host_str(), Some("192.168.1.20"));
}

#[test]
fn test_username_without_password_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "config.toml", r#"
callback_bind = "0.0.0.0:9126"
persist = false

[interfaces.hmgate-test-no-password]
url = "http://192.168.1.20:2010"
backend_interface = "HmIP-RF"
username = "admin"
password_env = "HMGATE_TEST_PASSWORD_THAT_IS_NEVER_SET"
"#);

    let err = load_central_config(&path).unwrap_err();
    assert!(matches!(err, ConfigError::NoCredentials { .. }), "got {err:?}");
}

#[test]
fn test_validation_errors() {
    let dir = tempfile::tempdir().unwrap();

    let path = write(dir.path(), "no-ifaces.toml", "callback_bind = \"0.0.0.0:0\"\n");
    assert!(matches!(
        load_central_config(&path),
        Err(ConfigError::Validation { ref field, .. }) if field == "interfaces"
    ));

    let path = write(
        dir.path(),
        "bad-bind.toml",
        &MINIMAL.replace("127.0.0.1:9126", "not-an-address"),
    );
    assert!(matches!(
        load_central_config(&path),
        Err(ConfigError::Validation { ref field, .. }) if field == "callback_bind"
    ));

    let path = write(
        dir.path(),
        "bad-url.toml",
        &MINIMAL.replace("http://192.168.1.20:2010", "not a url"),
    );
    assert!(matches!(
        load_central_config(&path),
        Err(ConfigError::Validation { ref field, .. }) if field == "interfaces.hmip.url"
    ));
}

#[test]
fn test_saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let source = write(dir.path(), "config.toml", MINIMAL);
    let cfg = load_config_from(&source).unwrap();

    let copy = dir.path().join("nested").join("copy.toml");
    save_config(&cfg, &copy).unwrap();
    let reloaded = load_config_from(&copy).unwrap();
    assert_eq!(reloaded.central_id, cfg.central_id);
    assert_eq!(reloaded.interfaces.keys().collect::<Vec<_>>(), vec!["hmip"]);
}
