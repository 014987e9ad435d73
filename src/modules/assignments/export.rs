use anyhow::{Context, Result};
use uuid::Uuid;

use super::{models::UNKNOWN_IDENTITY, store::ExportRow};

const HEADER: [&str; 4] = ["Student Name", "Roll Number", "Score", "Remarks"];

/// Render the marks sheet. The header row is written even when there are no rows.
pub fn render_marks_csv(rows: &[ExportRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(HEADER)
        .context("failed to write CSV header")?;

    for row in rows {
        let score = row.score.unwrap_or(0).to_string();
        writer
            .write_record([
                non_blank_or_unknown(row.student_name.as_deref()),
                non_blank_or_unknown(row.roll_number.as_deref()),
                score.as_str(),
                row.remarks.as_deref().unwrap_or(""),
            ])
            .context("failed to write CSV row")?;
    }

    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("failed to flush CSV writer: {err}"))
}

pub fn marks_filename(assignment_id: Uuid, timestamp_ms: i64) -> String {
    format!("marks_{assignment_id}_{timestamp_ms}.csv")
}

fn non_blank_or_unknown(value: Option<&str>) -> &str {
    match value {
        Some(value) if !value.is_empty() => value,
        _ => UNKNOWN_IDENTITY,
    }
}
