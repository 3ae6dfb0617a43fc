use census::conf::{load_config, CensusConfig, CensusConfigError};
use census::utils::testing::TEST_CONFIG_FILE;

use std::{io::Write, path::Path, time::Duration};

#[test]
fn test_load_raw_config() {
    let config = load_config(Path::new(TEST_CONFIG_FILE)).unwrap();
    let timeout = config.get_int("discovery.timeout_ms").unwrap();
    assert_eq!(timeout, 1500);
}

#[test]
fn test_load_census_config() {
    let config = CensusConfig::load(Path::new(TEST_CONFIG_FILE)).unwrap();
    assert_eq!(config.kafka.request_timeout(), Duration::from_secs(2));
    assert_eq!(
        config.kafka.endpoint().bootstrap_servers(),
        "localhost:9092,localhost:9093"
    );
    assert_eq!(config.detail.stub_topic.as_deref(), Some("asdf"));
}

#[test]
fn test_partial_config_keeps_defaults() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "discovery:\n  timeout_ms: 250").unwrap();

    let config = CensusConfig::load(file.path()).unwrap();
    assert_eq!(config.discovery.timeout(), Duration::from_millis(250));
    assert!(config.discovery.include_internal);
    assert_eq!(config.kafka.brokers, ["localhost:9092"]);
    assert!(config.detail.stub_topic.is_none());
}

#[test]
fn test_env_placeholders_are_expanded() {
    std::env::set_var("CENSUS_CONF_TEST_BROKER", "kafka.internal:29092");
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "kafka:\n  brokers:\n    - ${{CENSUS_CONF_TEST_BROKER}}\n  request_timeout_ms: 500"
    )
    .unwrap();

    let config = CensusConfig::load(file.path()).unwrap();
    assert_eq!(config.kafka.brokers, ["kafka.internal:29092"]);
    assert_eq!(config.kafka.request_timeout(), Duration::from_millis(500));
}

#[test]
fn test_missing_env_placeholder_fails() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "kafka:\n  password: ${{CENSUS_CONF_TEST_NEVER_SET}}").unwrap();

    let error = CensusConfig::load(file.path()).unwrap_err();
    assert!(matches!(error, CensusConfigError::EnvExpansionError(_)));
}

#[test]
fn test_toml_config_is_supported() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[detail]\nstub_topic = \"demo\"").unwrap();

    let config = CensusConfig::load(file.path()).unwrap();
    assert_eq!(config.detail.stub_topic.as_deref(), Some("demo"));
}

#[test]
fn test_commented_out_section_keeps_defaults() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "kafka:\n  request_timeout_ms: 700\ndiscovery:\n  # timeout_ms: 10\n\
         detail:\n  # stub_topic: asdf"
    )
    .unwrap();

    let config = CensusConfig::load(file.path()).unwrap();
    assert_eq!(config.kafka.request_timeout(), Duration::from_millis(700));
    assert_eq!(config.discovery.timeout(), Duration::from_millis(3000));
    assert!(config.detail.stub_topic.is_none());
}
