use std::fs;
use zerogrid::config::Config;

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("config.yaml");

    let mut cfg = Config::default();
    cfg.charger.port = "/dev/ttyACM1".to_string();
    cfg.inverter.port = Some("/dev/ttyUSB3".to_string());
    cfg.controller.max_change_ratio = Some(1.5);
    cfg.logging.file = path.with_extension("log").to_string_lossy().to_string();

    cfg.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();

    assert_eq!(loaded.charger.port, "/dev/ttyACM1");
    assert_eq!(loaded.inverter.port.as_deref(), Some("/dev/ttyUSB3"));
    assert_eq!(loaded.controller.max_change_ratio, Some(1.5));
    assert_eq!(loaded.logging.file, cfg.logging.file);
}

#[test]
fn partial_yaml_fills_in_defaults() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(
        tmp.path(),
        "controller:\n  kp: 0.8\nrpc:\n  port: 7000\n",
    )
    .unwrap();
    let cfg = Config::load(Some(tmp.path())).unwrap();
    assert_eq!(cfg.controller.kp, 0.8);
    assert_eq!(cfg.controller.ki, 0.05);
    assert_eq!(cfg.rpc.port, 7000);
    assert_eq!(cfg.rpc.max_workers, 20);
    assert_eq!(cfg.inverter.max_power, 900);
    assert!(cfg.validate().is_ok());
}

#[test]
fn config_validation_errors() {
    let mut cfg = Config::default();
    assert!(cfg.validate().is_ok());

    cfg.charger.port.clear();
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.charger.retries = 0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.inverter.start_power = 1000;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.controller.min_output_kw = 0.5;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.controller.max_change_ratio = Some(0.0);
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.rpc.max_workers = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn from_file_with_invalid_yaml_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), "controller: [unclosed").unwrap();
    assert!(Config::from_file(tmp.path()).is_err());
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("absent.yaml"))).is_err());
}
