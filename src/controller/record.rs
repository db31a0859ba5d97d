//! Append-only CSV record of every control cycle, kept for offline tuning.

use crate::error::Result;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// One row of the cycle log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlRecord {
    pub timestamp: String,
    #[serde(rename = "import_kW")]
    pub import_kw: Option<f64>,
    #[serde(rename = "export_kW")]
    pub export_kw: Option<f64>,
    #[serde(rename = "power_diff_kW")]
    pub error_kw: Option<f64>,
    pub p_term: Option<f64>,
    pub i_term: Option<f64>,
    pub d_term: Option<f64>,
    #[serde(rename = "unclamped_kW")]
    pub unclamped_kw: Option<f64>,
    #[serde(rename = "pid_power_kW")]
    pub output_kw: Option<f64>,
    #[serde(rename = "L1_kW")]
    pub l1_kw: Option<f64>,
    #[serde(rename = "L2_kW")]
    pub l2_kw: Option<f64>,
    #[serde(rename = "L3_kW")]
    pub l3_kw: Option<f64>,
    pub inverter_w: Option<u16>,
    pub charger_a: Option<f64>,
    pub outcome: String,
}

pub struct CycleLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CycleLog {
    /// Open for appending; the header row is only written to a new or empty
    /// file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let has_rows = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(!has_rows)
            .from_writer(file);
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write and flush one row
    pub fn append(&mut self, record: &ControlRecord) -> Result<()> {
        self.writer.serialize(record)?;
        self.writer.flush()?;
        Ok(())
    }
}
