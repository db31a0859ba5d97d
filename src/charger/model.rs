use serde::Serialize;
use std::fmt;

/// Known RD60xx-family models, classified by the identification register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ChargerModel {
    Rd6024,
    Rd6018,
    Rd6012,
    Rd6012P,
    Rd6006,
    Rd6006P,
    Rk6006,
    #[default]
    Unknown,
}

/// Register-unit scale factors: physical value = register / multiplier
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Multipliers {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    /// Input voltage is reported at a fixed scale on every model
    pub input_voltage: f64,
}

impl Default for Multipliers {
    fn default() -> Self {
        Self {
            voltage: 100.0,
            current: 100.0,
            power: 100.0,
            input_voltage: 100.0,
        }
    }
}

impl ChargerModel {
    pub fn from_id(id: u16) -> Self {
        match id {
            60241.. => ChargerModel::Rd6024,
            60180..=60189 => ChargerModel::Rd6018,
            60120..=60124 => ChargerModel::Rd6012,
            60125..=60129 => ChargerModel::Rd6012P,
            60060..=60064 => ChargerModel::Rd6006,
            60065 => ChargerModel::Rd6006P,
            60066 => ChargerModel::Rk6006,
            _ => ChargerModel::Unknown,
        }
    }

    /// Fixed scale table. The RD6012P current scale depends on the selected
    /// range on real hardware; the high range (1000) is used throughout.
    pub fn multipliers(self) -> Multipliers {
        let base = Multipliers::default();
        match self {
            ChargerModel::Rd6012P => Multipliers {
                voltage: 1000.0,
                current: 1000.0,
                power: 1000.0,
                ..base
            },
            ChargerModel::Rd6006 => Multipliers {
                current: 1000.0,
                ..base
            },
            ChargerModel::Rd6006P => Multipliers {
                voltage: 1000.0,
                current: 10000.0,
                power: 1000.0,
                ..base
            },
            ChargerModel::Rk6006 => Multipliers {
                current: 1000.0,
                ..base
            },
            ChargerModel::Rd6024
            | ChargerModel::Rd6018
            | ChargerModel::Rd6012
            | ChargerModel::Unknown => base,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChargerModel::Rd6024 => "RD6024",
            ChargerModel::Rd6018 => "RD6018",
            ChargerModel::Rd6012 => "RD6012",
            ChargerModel::Rd6012P => "RD6012P",
            ChargerModel::Rd6006 => "RD6006",
            ChargerModel::Rd6006P => "RD6006P",
            ChargerModel::Rk6006 => "RK6006",
            ChargerModel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ChargerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_id_ranges() {
        assert_eq!(ChargerModel::from_id(60181), ChargerModel::Rd6018);
        assert_eq!(ChargerModel::from_id(60241), ChargerModel::Rd6024);
        assert_eq!(ChargerModel::from_id(60300), ChargerModel::Rd6024);
        assert_eq!(ChargerModel::from_id(60125), ChargerModel::Rd6012P);
        assert_eq!(ChargerModel::from_id(60062), ChargerModel::Rd6006);
        assert_eq!(ChargerModel::from_id(60065), ChargerModel::Rd6006P);
        assert_eq!(ChargerModel::from_id(60066), ChargerModel::Rk6006);
        assert_eq!(ChargerModel::from_id(0), ChargerModel::Unknown);
        assert_eq!(ChargerModel::from_id(60200), ChargerModel::Unknown);
    }

    #[test]
    fn scale_tables() {
        assert_eq!(ChargerModel::Rd6018.multipliers().current, 100.0);
        assert_eq!(ChargerModel::Rd6006.multipliers().current, 1000.0);
        let p = ChargerModel::Rd6006P.multipliers();
        assert_eq!((p.voltage, p.current, p.power), (1000.0, 10000.0, 1000.0));
        assert_eq!(ChargerModel::Unknown.multipliers(), Multipliers::default());
    }
}
