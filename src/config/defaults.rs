use super::*;

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            timeout_ms: 2000,
            required_codes: vec!["1-0:1.7.0".to_string(), "1-0:2.7.0".to_string()],
        }
    }
}

impl Default for ChargerConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            address: 1,
            timeout_ms: 500,
            retries: 3,
            retry_delay_ms: 200,
            reconnect_backoff_ms: 5000,
        }
    }
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 4800,
            timeout_ms: 500,
            max_power: 900,
            send_interval_ms: 500,
            start_power: 0,
            reconnect_backoff_ms: 5000,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kp: 0.5,
            ki: 0.05,
            kd: 0.01,
            setpoint: 0.0,
            min_output_kw: -1.8,
            max_output_kw: 0.9,
            deadband_kw: 0.02,
            max_change_ratio: None,
            charge_voltage: 57.0,
            max_charging_current: 30.0,
            poll_interval_ms: 500,
            cycle_timeout_ms: 10_000,
            max_stale_cycles: 5,
            log_file: "data_log.csv".to_string(),
            remote: None,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 6030,
            max_workers: 20,
            idle_timeout_secs: 10,
            health_interval_secs: 2,
            request_timeout_ms: 2000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/zerogrid.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}
