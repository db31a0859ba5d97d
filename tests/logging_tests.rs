use tracing::Level;
use zerogrid::config::LoggingConfig;
use zerogrid::logging::{LogContext, get_logger, get_logger_with_context, init_logging, parse_log_level};

#[test]
fn parse_accepts_aliases() {
    assert_eq!(parse_log_level("warning").unwrap(), Level::WARN);
    assert_eq!(parse_log_level("CRITICAL").unwrap(), Level::ERROR);
    assert_eq!(parse_log_level("Trace").unwrap(), Level::TRACE);
    assert!(parse_log_level("loud").is_err());
}

#[test]
fn init_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoggingConfig {
        level: "DEBUG".to_string(),
        file: dir.path().join("zerogrid.log").to_string_lossy().to_string(),
        console_output: false,
        ..LoggingConfig::default()
    };
    assert!(init_logging(&config).is_ok());
    assert!(init_logging(&config).is_ok());

    let logger = get_logger("meter");
    assert_eq!(logger.component(), "meter");
    logger.info("logging ready");
}

#[test]
fn context_logger_keeps_component() {
    let logger = get_logger_with_context(
        LogContext::new("charger")
            .with_device("/dev/ttyUSB0")
            .with_field("address", "1".to_string()),
    );
    assert_eq!(logger.component(), "charger");
    logger.debug("context attached");
}
