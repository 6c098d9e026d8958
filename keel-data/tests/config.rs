use keel_data::{ConfigError, DataConfig};
use serial_test::serial;
use std::io::Write;

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = DataConfig::from_yaml_file(dir.path().join("absent.yaml")).unwrap();
    assert_eq!(config, DataConfig::default());
}

#[test]
fn test_file_values_are_read() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
cache:
  enabled: false
  key_prefix: "shop:"
  default_ttl_secs: 30
paging:
  default_page_size: 5
  max_page_size: 50
"#
    )
    .unwrap();

    let config = DataConfig::from_yaml_file(file.path()).unwrap();
    assert!(!config.cache.enabled);
    assert_eq!(config.cache.key_prefix, "shop:");
    assert_eq!(config.cache.default_ttl_secs, 30);
    assert_eq!(config.paging.default_page_size, 5);
    assert_eq!(config.paging.max_page_size, 50);
}

#[test]
fn test_invalid_file_is_a_load_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "paging:\n  max_page_size: lots").unwrap();
    assert!(matches!(
        DataConfig::from_yaml_file(file.path()),
        Err(ConfigError::Load(_))
    ));
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "cache:\n  key_prefix: \"file:\"").unwrap();

    std::env::set_var("KEEL_CACHE_KEY_PREFIX", "env:");
    std::env::set_var("KEEL_PAGING_DEFAULT_PAGE_SIZE", "7");
    let config = DataConfig::load(file.path());
    std::env::remove_var("KEEL_CACHE_KEY_PREFIX");
    std::env::remove_var("KEEL_PAGING_DEFAULT_PAGE_SIZE");

    let config = config.unwrap();
    assert_eq!(config.cache.key_prefix, "env:");
    assert_eq!(config.paging.default_page_size, 7);
}

#[test]
#[serial]
fn test_unparsable_environment_value_is_invalid() {
    std::env::set_var("KEEL_CACHE_ENABLED", "maybe");
    let result = DataConfig::default().apply_env_overrides();
    std::env::remove_var("KEEL_CACHE_ENABLED");

    match result {
        Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, "KEEL_CACHE_ENABLED"),
        other => panic!("expected an invalid value error, got {other:?}"),
    }
}
