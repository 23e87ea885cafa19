use cd_core::config::{Config, ConfigSource, Strategy};

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.log_level, "info");
    assert!(!cfg.daemon.one_shot);
    assert_eq!(cfg.daemon.strategy, Strategy::Auto);
    assert_eq!(cfg.daemon.cycle_interval_ms, 1_000);
    assert_eq!(cfg.fleet.primary_node, "home");
    assert_eq!(cfg.fleet.share_percent, 0.0);
    assert_eq!(cfg.targets.max_targets, 20);
    assert_eq!(cfg.batch.max_batches_per_target, 0);
    assert_eq!(cfg.batch.batch_window_ms, 1_000);
    assert_eq!(cfg.batch.grace_period_ms, 150);
    assert_eq!(cfg.legacy.yield_threshold, 0.75);
    assert_eq!(cfg.income.max_samples, 2_000);
    assert_eq!(cfg.operations.extract_cost, 1.70);
    assert_eq!(cfg.operations.counteract_cost, 1.75);
    assert_eq!(cfg.operations.restore_cost, 1.75);
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("primary_node"));

    let parsed = Config::from_toml(&toml_str).expect("parse toml back");
    assert_eq!(parsed, cfg);
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[daemon]
one_shot = true
strategy = "throughput"

[batch]
extraction_fraction = 0.25

[operations]
restore_cost = 2.0
"#;
    let cfg = Config::from_toml(partial).expect("parse partial");
    assert!(cfg.daemon.one_shot);
    assert_eq!(cfg.daemon.strategy, Strategy::Throughput);
    assert_eq!(cfg.batch.extraction_fraction, 0.25);
    // defaults should fill in the rest
    assert_eq!(cfg.batch.batch_window_ms, 1_000);
    assert_eq!(cfg.fleet.primary_node, "home");
    assert_eq!(cfg.operations.restore_cost, 2.0);
    assert_eq!(cfg.operations.counteract_cost, 1.75);
}

#[test]
fn invalid_share_percent_fails_validation() {
    let mut cfg = Config::default();
    cfg.fleet.share_percent = 100.0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("share_percent"));
}

#[test]
fn invalid_extraction_fraction_fails_validation() {
    let err = Config::from_toml("[batch]\nextraction_fraction = 1.5\n")
        .expect_err("validation should fail");
    assert!(err.to_string().contains("extraction_fraction"));
}

#[test]
fn source_picks_up_changes_and_keeps_last_good() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[targets]\nmax_targets = 3\n").expect("write");

    let mut source = ConfigSource::new(&path);
    assert_eq!(source.current().targets.max_targets, 3);

    std::fs::write(&path, "[targets]\nmax_targets = 7\n").expect("write");
    assert_eq!(source.refresh().targets.max_targets, 7);

    std::fs::write(&path, "[targets]\nmax_targets = \"many\"\n").expect("write");
    assert_eq!(source.refresh().targets.max_targets, 7, "bad file keeps previous config");

    std::fs::remove_file(&path).expect("remove");
    assert_eq!(source.refresh().targets.max_targets, 7);
}

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = ConfigSource::new(dir.path().join("absent.toml"));
    assert_eq!(source.current(), &Config::default());
}
