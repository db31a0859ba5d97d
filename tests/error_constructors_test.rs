use zerogrid::error::ZeroGridError;

#[test]
fn error_constructors_group_1() {
    assert!(matches!(
        ZeroGridError::transport("x"),
        ZeroGridError::Transport { .. }
    ));
    assert!(matches!(
        ZeroGridError::protocol("x"),
        ZeroGridError::Protocol { .. }
    ));
    assert!(matches!(
        ZeroGridError::timeout("x"),
        ZeroGridError::Timeout { .. }
    ));
    assert!(matches!(
        ZeroGridError::command("x"),
        ZeroGridError::Command { .. }
    ));
}

#[test]
fn error_constructors_group_2() {
    assert!(matches!(
        ZeroGridError::safety("x"),
        ZeroGridError::Safety { .. }
    ));
    assert!(matches!(
        ZeroGridError::config("x"),
        ZeroGridError::Config { .. }
    ));
    assert!(matches!(
        ZeroGridError::validation("f", "m"),
        ZeroGridError::Validation { .. }
    ));
    assert!(matches!(ZeroGridError::io("x"), ZeroGridError::Io { .. }));
    assert!(matches!(
        ZeroGridError::cancelled("x"),
        ZeroGridError::Cancelled { .. }
    ));
}

#[test]
fn only_transport_faults_trigger_reconnect() {
    assert!(ZeroGridError::transport("port vanished").is_connection_error());
    assert!(!ZeroGridError::protocol("bad crc").is_connection_error());
    assert!(!ZeroGridError::timeout("no reply").is_connection_error());
    assert!(!ZeroGridError::command("unknown").is_connection_error());
}

#[test]
fn conversions_keep_the_message() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
    let err: ZeroGridError = io.into();
    assert!(err.to_string().contains("pipe gone"));

    let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: ZeroGridError = json.into();
    assert!(matches!(err, ZeroGridError::Serialization { .. }));
}
