use serde::Serialize;

pub const IMPORT_POWER: &str = "1-0:1.7.0";
pub const EXPORT_POWER: &str = "1-0:2.7.0";
pub const L1_POWER: &str = "1-0:21.7.0";
pub const L2_POWER: &str = "1-0:41.7.0";
pub const L3_POWER: &str = "1-0:61.7.0";

/// One coded value from a telegram
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reading {
    /// Normalized code, e.g. `1-0:1.7.0`
    pub code: String,
    /// Raw value text as it appeared on the wire
    pub value: String,
    pub unit: Option<String>,
}

impl Reading {
    pub fn new(code: impl Into<String>, value: &str, unit: Option<&str>) -> Self {
        Self {
            code: code.into(),
            value: value.to_string(),
            unit: unit.map(str::to_string),
        }
    }

    /// Numeric interpretation of the value, if it has one
    pub fn value_f64(&self) -> Option<f64> {
        self.value.trim().parse::<f64>().ok()
    }
}

/// One complete meter burst.
///
/// `sequence` is assigned by the reader and only advances when a new
/// telegram is accepted, so two reads returning the same sequence mean the
/// second one was the stale fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telegram {
    pub sequence: u64,
    readings: Vec<Reading>,
}

impl Telegram {
    pub fn new(sequence: u64, readings: Vec<Reading>) -> Self {
        Self { sequence, readings }
    }

    /// First reading with the given code
    pub fn get(&self, code: &str) -> Option<&Reading> {
        self.readings.iter().find(|r| r.code == code)
    }

    /// Numeric value for a code; absent or non-numeric codes give `None`
    pub fn value(&self, code: &str) -> Option<f64> {
        self.get(code).and_then(Reading::value_f64)
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Whether every required code is present
    pub fn is_complete<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.iter().all(|c| self.get(c.as_ref()).is_some())
    }

    /// Required codes that are absent
    pub fn missing<'a, S: AsRef<str>>(&self, required: &'a [S]) -> Vec<&'a str> {
        required
            .iter()
            .map(AsRef::as_ref)
            .filter(|c| self.get(c).is_none())
            .collect()
    }
}

/// Active power figures extracted from a telegram, all in kW
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PowerSample {
    pub import_kw: Option<f64>,
    pub export_kw: Option<f64>,
    pub l1_kw: Option<f64>,
    pub l2_kw: Option<f64>,
    pub l3_kw: Option<f64>,
}

impl PowerSample {
    pub fn from_telegram(telegram: &Telegram) -> Self {
        Self {
            import_kw: telegram.value(IMPORT_POWER),
            export_kw: telegram.value(EXPORT_POWER),
            l1_kw: telegram.value(L1_POWER),
            l2_kw: telegram.value(L2_POWER),
            l3_kw: telegram.value(L3_POWER),
        }
    }

    /// Import minus export; positive means the house is drawing from the grid
    pub fn net_kw(&self) -> Option<f64> {
        Some(self.import_kw? - self.export_kw?)
    }
}
