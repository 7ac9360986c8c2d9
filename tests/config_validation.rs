//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use opwire::config::{LoggingConfig, NetworkConfig, QuicConfig, ServerConfig, TransportKind};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_zero_worker_capacity() {
    let mut config = NetworkConfig::default();
    config.server.worker_capacity = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Worker capacity must be greater than 0")));
}

#[test]
fn test_excessive_worker_capacity() {
    let mut config = NetworkConfig::default();
    config.server.worker_capacity = 2_000_000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Worker capacity too large")));
}

#[test]
fn test_short_read_timeout() {
    let mut config = NetworkConfig::default();
    config.server.read_timeout = Duration::from_millis(10);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Read timeout too short")));
}

#[test]
fn test_long_shutdown_grace() {
    let mut config = NetworkConfig::default();
    config.server.shutdown_grace = Duration::from_secs(120);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Shutdown grace period too long")));
}

#[test]
fn test_cert_without_key() {
    let mut config = NetworkConfig::default();
    config.server.cert_file = Some(PathBuf::from("cert.pem"));

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("cert_file and key_file must be set together")));
}

#[test]
fn test_quic_requires_certificate() {
    let mut config = NetworkConfig::default();
    config.server.transport = TransportKind::Quic;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("QUIC transport requires cert_file and key_file")));

    config.server.cert_file = Some(PathBuf::from("cert.pem"));
    config.server.key_file = Some(PathBuf::from("key.pem"));
    assert!(config.validate().is_empty());
}

#[test]
fn test_quic_keep_alive_must_be_below_idle_timeout() {
    let mut config = NetworkConfig::default();
    config.server.transport = TransportKind::Quic;
    config.server.cert_file = Some(PathBuf::from("cert.pem"));
    config.server.key_file = Some(PathBuf::from("key.pem"));
    config.quic.keep_alive = Duration::from_secs(60);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("keep-alive")));
}

#[test]
fn test_quic_section_ignored_for_tcp() {
    let mut config = NetworkConfig::default();
    config.quic.max_streams = 0;
    assert!(config.validate().is_empty());
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_long_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = "a".repeat(100);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name too long")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(!errors.is_empty());
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_outputs() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(!errors.is_empty());
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_with_valid_config() {
    let config = NetworkConfig::default();
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let result = config.validate_strict();
    assert!(result.is_err());

    if let Err(e) = result {
        let error_str = e.to_string();
        assert!(error_str.contains("Configuration validation failed"));
    }
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NetworkConfig::default();

    config.server.address = String::new();
    config.server.worker_capacity = 0;
    config.server.read_timeout = Duration::ZERO;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 4,
        "Expected at least 4 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_toml_round_trip() {
    let dir = std::env::temp_dir().join(format!("opwire-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("opwire.toml");

    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = "0.0.0.0:7443".to_string();
        c.server.transport = TransportKind::Udp;
        c.server.read_timeout = Duration::from_secs(5);
        c.quic.allow_0rtt = true;
    });
    config.save_to_file(&path).expect("save");

    let loaded = NetworkConfig::from_file(&path).expect("load");
    assert_eq!(loaded.server.address, "0.0.0.0:7443");
    assert_eq!(loaded.server.transport, TransportKind::Udp);
    assert_eq!(loaded.server.read_timeout, Duration::from_secs(5));
    assert!(loaded.quic.allow_0rtt);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_partial_toml_uses_defaults() {
    let config = NetworkConfig::from_toml(
        r#"
        [server]
        transport = "quic"
        shutdown_grace = 500

        [logging]
        log_level = "warn"
        "#,
    )
    .expect("parse");

    assert_eq!(config.server.transport, TransportKind::Quic);
    assert_eq!(config.server.shutdown_grace, Duration::from_millis(500));
    assert_eq!(config.server.address, "127.0.0.1:9000");
    assert_eq!(config.quic.max_streams, 1000);
    assert_eq!(config.logging.log_level, Level::WARN);
}

#[test]
fn test_unknown_transport_is_rejected() {
    let result = NetworkConfig::from_toml("[server]\ntransport = \"sctp\"\n");
    assert!(result.is_err());
}

#[test]
fn test_valid_production_config() {
    let config = NetworkConfig {
        server: ServerConfig {
            address: "0.0.0.0:8443".to_string(),
            transport: TransportKind::Quic,
            worker_capacity: 50_000,
            read_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            cert_file: Some(PathBuf::from("/etc/opwire/cert.pem")),
            key_file: Some(PathBuf::from("/etc/opwire/key.pem")),
            debug: false,
        },
        quic: QuicConfig {
            idle_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            max_streams: 256,
            allow_0rtt: false,
            enable_datagrams: true,
        },
        logging: LoggingConfig {
            app_name: "production-server".to_string(),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: true,
        },
    };

    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Production config should be valid, got: {:?}",
        errors
    );
}

#[test]
fn test_debug_flag_raises_log_level() {
    let mut config = NetworkConfig::default();
    config.server.debug = true;
    assert_eq!(config.effective_logging().log_level, Level::DEBUG);
}
