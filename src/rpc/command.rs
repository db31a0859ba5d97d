//! Allow-listed command table for the remote surface.
//!
//! A request is `{"cmd": name, "args": [...], "kwargs": {...}}`. Each name
//! maps to one typed [`Command`]; anything else is rejected here, before a
//! device lock is taken.

use crate::error::{Result, ZeroGridError};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
}

impl Request {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.to_string(), value.into());
        self
    }

    /// First of the named kwargs that is present, else the positional
    /// argument at `position`
    fn param(&self, names: &[&str], position: usize) -> Option<&Value> {
        names
            .iter()
            .find_map(|name| self.kwargs.get(*name))
            .or_else(|| self.args.get(position))
    }

    fn required(&self, names: &[&str], position: usize) -> Result<&Value> {
        self.param(names, position).ok_or_else(|| {
            ZeroGridError::command(format!("{} requires argument '{}'", self.cmd, names[0]))
        })
    }

    fn number(&self, names: &[&str], position: usize) -> Result<f64> {
        let value = self.required(names, position)?;
        value.as_f64().ok_or_else(|| {
            ZeroGridError::command(format!(
                "{}: '{}' must be a number, got {}",
                self.cmd, names[0], value
            ))
        })
    }

    fn flag(&self, names: &[&str], position: usize) -> Result<bool> {
        let value = self.required(names, position)?;
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
            other => Err(ZeroGridError::command(format!(
                "{}: '{}' must be a boolean, got {}",
                self.cmd, names[0], other
            ))),
        }
    }

    fn register_value(&self, names: &[&str], position: usize) -> Result<u16> {
        let v = self.number(names, position)?;
        if !(0.0..=f64::from(u16::MAX)).contains(&v) {
            return Err(ZeroGridError::command(format!(
                "{}: '{}' out of range: {}",
                self.cmd, names[0], v
            )));
        }
        Ok(v.round() as u16)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetStatus,
    GetState,
    Update,
    UpdateBattery,
    GetPower,
    SetPower { watts: i64, via_inverter: bool },
    GetId,
    GetSn,
    GetFw,
    GetIntTempC,
    GetIntTempF,
    GetVSet,
    SetVSet(f64),
    GetISet,
    SetISet(f64),
    GetVOut,
    GetIOut,
    GetPOut,
    GetVIn,
    IsKeypadLocked,
    GetProtection,
    GetMode,
    IsOutput,
    SetOutput(bool),
    GetPreset,
    SetPreset(u16),
    IsBuzzer,
    SetBuzzer(bool),
    IsBootPower,
    SetBootPower(bool),
    GetBacklight,
    SetBacklight(u16),
    GetDateTime,
    SetDateTime(NaiveDateTime),
}

/// Every accepted command name
pub const COMMAND_NAMES: &[&str] = &[
    "get_status",
    "get_state",
    "update",
    "update_battery",
    "get_power",
    "set_power",
    "get_id",
    "get_sn",
    "get_fw",
    "get_int_temp_c",
    "get_int_temp_f",
    "get_v_set",
    "set_v_set",
    "get_i_set",
    "set_i_set",
    "get_v_out",
    "get_i_out",
    "get_p_out",
    "get_v_in",
    "is_keypad_locked",
    "get_protection",
    "get_mode",
    "is_output",
    "set_output",
    "get_preset",
    "set_preset",
    "is_buzzer",
    "set_buzzer",
    "is_boot_power",
    "set_boot_power",
    "get_backlight",
    "set_backlight",
    "get_date_time",
    "set_date_time",
];

impl Command {
    pub fn parse(request: &Request) -> Result<Self> {
        let command = match request.cmd.as_str() {
            "get_status" => Command::GetStatus,
            "get_state" => Command::GetState,
            "update" => Command::Update,
            "update_battery" => Command::UpdateBattery,
            "get_power" => Command::GetPower,
            "set_power" => {
                let watts = request.number(&["power_watts", "power"], 0)?;
                let via_inverter = match request.param(&["via_inverter"], 1) {
                    Some(_) => request.flag(&["via_inverter"], 1)?,
                    None => true,
                };
                Command::SetPower {
                    watts: watts.round() as i64,
                    via_inverter,
                }
            }
            "get_id" => Command::GetId,
            "get_sn" => Command::GetSn,
            "get_fw" => Command::GetFw,
            "get_int_temp_c" => Command::GetIntTempC,
            "get_int_temp_f" => Command::GetIntTempF,
            "get_v_set" => Command::GetVSet,
            "set_v_set" => Command::SetVSet(request.number(&["v_set", "volts"], 0)?),
            "get_i_set" => Command::GetISet,
            "set_i_set" => Command::SetISet(request.number(&["i_set", "amps"], 0)?),
            "get_v_out" => Command::GetVOut,
            "get_i_out" => Command::GetIOut,
            "get_p_out" => Command::GetPOut,
            "get_v_in" => Command::GetVIn,
            "is_keypad_locked" => Command::IsKeypadLocked,
            "get_protection" => Command::GetProtection,
            "get_mode" => Command::GetMode,
            "is_output" => Command::IsOutput,
            "set_output" => Command::SetOutput(request.flag(&["output", "on"], 0)?),
            "get_preset" => Command::GetPreset,
            "set_preset" => Command::SetPreset(request.register_value(&["preset"], 0)?),
            "is_buzzer" => Command::IsBuzzer,
            "set_buzzer" => Command::SetBuzzer(request.flag(&["buzzer", "on"], 0)?),
            "is_boot_power" => Command::IsBootPower,
            "set_boot_power" => Command::SetBootPower(request.flag(&["boot_power", "on"], 0)?),
            "get_backlight" => Command::GetBacklight,
            "set_backlight" => {
                Command::SetBacklight(request.register_value(&["backlight", "level"], 0)?)
            }
            "get_date_time" => Command::GetDateTime,
            "set_date_time" => {
                let value = request.required(&["date_time", "at"], 0)?;
                let text = value.as_str().ok_or_else(|| {
                    ZeroGridError::command("set_date_time expects an ISO 8601 string")
                })?;
                let at = text.parse::<NaiveDateTime>().map_err(|e| {
                    ZeroGridError::command(format!("set_date_time: invalid timestamp '{}': {}", text, e))
                })?;
                Command::SetDateTime(at)
            }
            other => {
                return Err(ZeroGridError::command(format!("Unknown command: {}", other)));
            }
        };
        Ok(command)
    }

    /// Whether executing this needs the charger session
    pub fn targets_charger(&self) -> bool {
        !matches!(
            self,
            Command::GetStatus | Command::GetPower | Command::SetPower { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<Command> {
        let request: Request = serde_json::from_value(value).unwrap();
        Command::parse(&request)
    }

    #[test]
    fn set_power_argument_shapes() {
        let expected = Command::SetPower {
            watts: 5000,
            via_inverter: true,
        };
        assert_eq!(
            parse(json!({"cmd": "set_power", "kwargs": {"power_watts": 5000}})).unwrap(),
            expected
        );
        assert_eq!(
            parse(json!({"cmd": "set_power", "kwargs": {"power": 5000}})).unwrap(),
            expected
        );
        assert_eq!(parse(json!({"cmd": "set_power", "args": [5000]})).unwrap(), expected);
        assert_eq!(
            parse(json!({"cmd": "set_power", "args": [250.4], "kwargs": {"via_inverter": false}}))
                .unwrap(),
            Command::SetPower {
                watts: 250,
                via_inverter: false
            }
        );
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        let err = parse(json!({"cmd": "__init__"})).unwrap_err();
        assert!(matches!(err, ZeroGridError::Command { .. }));
        assert!(parse(json!({"cmd": "set_power"})).is_err());
        assert!(parse(json!({"cmd": "set_v_set", "args": ["high"]})).is_err());
        assert!(parse(json!({"cmd": "set_preset", "args": [-1]})).is_err());
    }

    #[test]
    fn every_listed_name_parses_or_needs_arguments() {
        for name in COMMAND_NAMES {
            match Command::parse(&Request::new(*name)) {
                Ok(_) => {}
                Err(ZeroGridError::Command { message }) => {
                    assert!(message.contains("requires"), "{}: {}", name, message)
                }
                Err(other) => panic!("{}: {}", name, other),
            }
        }
    }

    #[test]
    fn parses_typed_setters() {
        assert_eq!(
            parse(json!({"cmd": "set_v_set", "args": [57.0]})).unwrap(),
            Command::SetVSet(57.0)
        );
        assert_eq!(
            parse(json!({"cmd": "set_output", "args": [true]})).unwrap(),
            Command::SetOutput(true)
        );
        assert!(matches!(
            parse(json!({"cmd": "set_date_time", "args": ["2024-05-01T12:30:00"]})).unwrap(),
            Command::SetDateTime(_)
        ));
    }

    #[test]
    fn only_inverter_and_status_commands_skip_the_charger() {
        for cmd in ["get_status", "get_power"] {
            assert!(!parse(json!({"cmd": cmd})).unwrap().targets_charger(), "{cmd}");
        }
        assert!(!parse(json!({"cmd": "set_power", "args": [100]})).unwrap().targets_charger());
        for cmd in ["get_id", "get_v_out", "get_state"] {
            assert!(parse(json!({"cmd": cmd})).unwrap().targets_charger(), "{cmd}");
        }
        assert!(parse(json!({"cmd": "set_output", "args": [true]})).unwrap().targets_charger());
    }
}
