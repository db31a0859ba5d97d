/// Human-readable description of well-known DSMR codes (normalized form).
/// Unknown codes give an empty string.
pub fn describe(code: &str) -> &'static str {
    match code {
        "1-3:0.2.8" => "DSMR version",
        "0-0:1.0.0" => "Timestamp",
        "0-0:96.1.1" => "Equipment identifier",
        "1-0:1.8.1" => "Meter reading electricity delivered to client (tariff 1) in kWh",
        "1-0:1.8.2" => "Meter reading electricity delivered to client (tariff 2) in kWh",
        "1-0:2.8.1" => "Meter reading electricity delivered by client (tariff 1) in kWh",
        "1-0:2.8.2" => "Meter reading electricity delivered by client (tariff 2) in kWh",
        "0-0:96.14.0" => "Tariff indicator electricity",
        "1-0:1.7.0" => "Actual electricity power delivered (+P) in kW",
        "1-0:2.7.0" => "Actual electricity power received (-P) in kW",
        "0-0:96.7.21" => "Number of power failures in any phase",
        "0-0:96.7.9" => "Number of long power failures in any phase",
        "1-0:99.97.0" => "Power failure event log",
        "1-0:32.32.0" => "Number of voltage sags in phase L1",
        "1-0:52.32.0" => "Number of voltage sags in phase L2",
        "1-0:72.32.0" => "Number of voltage sags in phase L3",
        "1-0:32.36.0" => "Number of voltage swells in phase L1",
        "1-0:52.36.0" => "Number of voltage swells in phase L2",
        "1-0:72.36.0" => "Number of voltage swells in phase L3",
        "1-0:32.7.0" => "Voltage in phase L1 (V)",
        "1-0:52.7.0" => "Voltage in phase L2 (V)",
        "1-0:72.7.0" => "Voltage in phase L3 (V)",
        "1-0:31.7.0" => "Current in phase L1 (A)",
        "1-0:51.7.0" => "Current in phase L2 (A)",
        "1-0:71.7.0" => "Current in phase L3 (A)",
        "1-0:21.7.0" => "Instantaneous active power L1 (+P) in kW",
        "1-0:41.7.0" => "Instantaneous active power L2 (+P) in kW",
        "1-0:61.7.0" => "Instantaneous active power L3 (+P) in kW",
        "1-0:22.7.0" => "Instantaneous active power L1 (-P) in kW",
        "1-0:42.7.0" => "Instantaneous active power L2 (-P) in kW",
        "1-0:62.7.0" => "Instantaneous active power L3 (-P) in kW",
        "1-0:1.4.0" => "Electricity delivered to client (total) in kWh",
        "1-0:2.4.0" => "Electricity delivered by client (total) in kWh",
        "0-1:24.1.0" => "Gas meter device type",
        "0-1:96.1.0" => "Gas meter equipment identifier",
        "0-1:24.2.1" => "Gas meter reading in m3",
        "0-0:96.13.0" => "Text message from utility",
        "0-0:96.3.10" => "Switch position of load management device",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_codes() {
        assert!(describe("1-0:1.7.0").contains("delivered"));
        assert_eq!(describe("9-9:9.9.9"), "");
    }
}
