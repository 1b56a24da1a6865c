//! Reporting helpers: result sanity checks, the CSV artifact, and the
//! narrative.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::exec::ColumnInfo;

/// Rows encoded into the CSV artifact. Everything past this count is
/// reported through `total_rows` and the truncation flag only.
pub const CSV_ROW_CAP: usize = 1000;

/// Rows included in the inline preview.
pub const PREVIEW_ROWS: usize = 30;

/// The downloadable result artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultArtifact {
    /// Base64 over the UTF-8 CSV bytes of the first 1000 rows.
    pub csv_base64: String,
    pub columns: Vec<ColumnInfo>,
    pub preview: Vec<Vec<Value>>,
    pub total_rows: usize,
    pub truncated: bool,
}

/// The user-facing narrative with the model's confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Narrative {
    pub text: String,
    pub confidence: f64,
}

/// One sanity-check warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanityWarning {
    pub column: String,
    pub message: String,
}

/// Per-column null rate plus any warnings worth surfacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanityReport {
    pub row_count: usize,
    pub null_rates: Vec<(String, f64)>,
    pub warnings: Vec<SanityWarning>,
}

/// Build the CSV artifact: header plus at most [`CSV_ROW_CAP`] rows,
/// base64-encoded, with a [`PREVIEW_ROWS`]-row inline preview.
pub fn build_artifact(
    columns: &[ColumnInfo],
    rows: &[Vec<Value>],
    truncated: bool,
) -> Result<ResultArtifact, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(columns.iter().map(|c| c.name.as_str()))?;
    for row in rows.iter().take(CSV_ROW_CAP) {
        writer.write_record(row.iter().map(csv_cell))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(std::io::Error::other(e.to_string())))?;

    Ok(ResultArtifact {
        csv_base64: BASE64.encode(&bytes),
        columns: columns.to_vec(),
        preview: rows.iter().take(PREVIEW_ROWS).cloned().collect(),
        total_rows: rows.len(),
        truncated,
    })
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Scan a result for null rates, negative counts, and implausible
/// percentages.
pub fn sanity_check(columns: &[ColumnInfo], rows: &[Vec<Value>]) -> SanityReport {
    let row_count = rows.len();
    let mut null_rates = Vec::with_capacity(columns.len());
    let mut warnings = Vec::new();

    for (i, column) in columns.iter().enumerate() {
        let nulls = rows.iter().filter(|r| is_null(r.get(i))).count();
        let rate = if row_count == 0 {
            0.0
        } else {
            nulls as f64 / row_count as f64
        };
        null_rates.push((column.name.clone(), rate));
        if rate > 0.5 && row_count > 0 {
            warnings.push(SanityWarning {
                column: column.name.clone(),
                message: format!("{:.0}% of values are null", rate * 100.0),
            });
        }

        let lower = column.name.to_lowercase();
        let count_like =
            lower.contains("count") || lower.contains("cnt") || lower.starts_with("num_");
        let percent_like =
            lower.contains("pct") || lower.contains("percent") || lower.ends_with("_rate");

        if count_like {
            let negatives = rows
                .iter()
                .filter(|r| number_at(r, i).map(|n| n < 0.0).unwrap_or(false))
                .count();
            if negatives > 0 {
                warnings.push(SanityWarning {
                    column: column.name.clone(),
                    message: format!("{negatives} negative values in a count column"),
                });
            }
        }
        if percent_like {
            let implausible = rows
                .iter()
                .filter(|r| {
                    number_at(r, i)
                        .map(|n| !(0.0..=100.0).contains(&n))
                        .unwrap_or(false)
                })
                .count();
            if implausible > 0 {
                warnings.push(SanityWarning {
                    column: column.name.clone(),
                    message: format!("{implausible} values outside [0, 100] in a percentage column"),
                });
            }
        }
    }

    SanityReport {
        row_count,
        null_rates,
        warnings,
    }
}

fn is_null(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

fn number_at(row: &[Value], i: usize) -> Option<f64> {
    row.get(i).and_then(|v| v.as_f64())
}
