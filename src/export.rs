use std::io;

use serde::Serialize;

use crate::models::{ResultRecord, NOT_AVAILABLE};

pub const STATUS_ATTENTION: &str = "Needs attention";
pub const STATUS_NORMAL: &str = "Normal";

/// One spreadsheet row. `index` is 1-based and follows the on-screen order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    #[serde(rename = "#")]
    pub index: usize,
    #[serde(rename = "Student")]
    pub student: String,
    #[serde(rename = "Student ID")]
    pub student_id: String,
    #[serde(rename = "Faculty")]
    pub faculty: String,
    #[serde(rename = "Group")]
    pub group: String,
    #[serde(rename = "Score")]
    pub score: f64,
    #[serde(rename = "Status")]
    pub status: &'static str,
    #[serde(rename = "Level")]
    pub level: String,
    #[serde(rename = "Completed at")]
    pub completed_at: String,
}

pub fn export_rows(records: &[ResultRecord]) -> Vec<ExportRow> {
    records
        .iter()
        .enumerate()
        .map(|(i, record)| ExportRow {
            index: i + 1,
            student: record.student_name.clone(),
            student_id: record
                .student_id_number
                .clone()
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            faculty: record.department_name.clone(),
            group: record.group_name.clone(),
            score: record.total_score,
            status: if record.has_unresolved_attention() {
                STATUS_ATTENTION
            } else {
                STATUS_NORMAL
            },
            level: record
                .interpretation_level
                .clone()
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            completed_at: record
                .completed_at
                .map(|ts| ts.format("%d.%m.%Y %H:%M").to_string())
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        })
        .collect()
}

pub fn write_csv<W: io::Write>(rows: &[ExportRow], writer: W) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
