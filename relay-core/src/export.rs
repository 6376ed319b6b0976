//! File export of normalized indicators
//!
//! CSV output always ends with the tags column; JSON output is a single-line
//! array of objects.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::Indicator;

/// Errors from writing an export
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Output file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

/// How much of each indicator to write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldLevel {
    /// Only the value
    Values,
    /// Value and type
    ValuesAndType,
    /// Value, type, tags, first/last seen
    #[default]
    Common,
    /// Everything the feed returned
    All,
}

const TAGS: &str = "tags";

/// Scalar columns (everything but tags) for one indicator at `level`
fn scalar_fields(indicator: &Indicator, level: FieldLevel) -> Vec<(String, Value)> {
    let mut fields = vec![("value".to_string(), Value::from(indicator.value.clone()))];
    if level == FieldLevel::Values {
        return fields;
    }
    fields.push((
        "indicatorType".to_string(),
        Value::from(indicator.indicator_type.as_str()),
    ));
    if level == FieldLevel::ValuesAndType {
        return fields;
    }
    fields.push(("firstSeen".to_string(), opt_value(indicator.first_seen)));
    fields.push(("lastSeen".to_string(), opt_value(indicator.last_seen)));
    if level == FieldLevel::All {
        fields.push(("origin".to_string(), opt_value(indicator.origin.clone())));
        fields.push(("externalId".to_string(), opt_value(indicator.external_id.clone())));
        for (key, value) in &indicator.extra {
            if key != TAGS {
                fields.push((key.clone(), value.clone()));
            }
        }
    }
    fields
}

fn opt_value<T: Into<Value>>(value: Option<T>) -> Value {
    value.map(Into::into).unwrap_or(Value::Null)
}

fn includes_tags(level: FieldLevel) -> bool {
    matches!(level, FieldLevel::Common | FieldLevel::All)
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// CSV header for a batch: the first indicator's columns, tags last
pub fn csv_header(indicators: &[Indicator], level: FieldLevel) -> Vec<String> {
    let mut header: Vec<String> = indicators
        .first()
        .map(|first| scalar_fields(first, level).into_iter().map(|(k, _)| k).collect())
        .unwrap_or_default();
    if includes_tags(level) {
        header.retain(|column| column != TAGS);
        header.push(TAGS.to_string());
    }
    header
}

/// Write indicators as CSV.
///
/// With `split_tags` every tag gets its own trailing field; otherwise tags
/// are joined with `|` in one field.
pub fn write_csv<W: Write>(
    indicators: &[Indicator],
    level: FieldLevel,
    split_tags: bool,
    writer: W,
) -> Result<(), ExportError> {
    let header = csv_header(indicators, level);
    let mut out = csv::WriterBuilder::new().flexible(true).from_writer(writer);
    out.write_record(&header)?;

    for indicator in indicators {
        let fields: Map<String, Value> = scalar_fields(indicator, level).into_iter().collect();
        let mut row: Vec<String> = header
            .iter()
            .filter(|column| column.as_str() != TAGS)
            .map(|column| fields.get(column).map(cell).unwrap_or_default())
            .collect();

        if includes_tags(level) {
            if split_tags {
                row.extend(indicator.tags.iter().cloned());
            } else {
                row.push(indicator.joined_tags("|"));
            }
        }
        out.write_record(&row)?;
    }

    out.flush()?;
    Ok(())
}

/// Write indicators as a single-line JSON array
pub fn write_json<W: Write>(
    indicators: &[Indicator],
    level: FieldLevel,
    mut writer: W,
) -> Result<(), ExportError> {
    let records: Vec<Map<String, Value>> = indicators
        .iter()
        .map(|indicator| {
            let mut record: Map<String, Value> = scalar_fields(indicator, level).into_iter().collect();
            if includes_tags(level) {
                record.insert(TAGS.to_string(), Value::from(indicator.tags.clone()));
            }
            record
        })
        .collect();

    serde_json::to_writer(&mut writer, &records)?;
    writer.flush()?;
    Ok(())
}

/// Columns of the report-centric CSV
pub const REPORT_COLUMNS: [&str; 5] = [
    "report_id",
    "report_title",
    "report_tags",
    "indicator_value",
    "indicator_type",
];

/// One indicator of one report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub report_id: String,
    pub report_title: String,
    /// `;`-joined enclave tags of the report
    pub report_tags: String,
    pub indicator_value: String,
    pub indicator_type: String,
}

/// Write report rows as CSV; the header is written even with no rows
pub fn write_report_csv<W: Write>(rows: &[ReportRow], writer: W) -> Result<(), ExportError> {
    let mut out = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
    out.write_record(REPORT_COLUMNS)?;
    for row in rows {
        out.serialize(row)?;
    }
    out.flush()?;
    Ok(())
}

/// Write the report-centric CSV file
pub fn export_reports_to_path(rows: &[ReportRow], path: &Path) -> Result<(), ExportError> {
    write_report_csv(rows, BufWriter::new(File::create(path)?))?;
    info!("Wrote {} report indicators to {}", rows.len(), path.display());
    Ok(())
}

/// `<prefix>_<YYYYmmdd_HHMMSS>.<ext>`
pub fn default_filename(prefix: &str, format: ExportFormat, now: DateTime<Utc>) -> String {
    format!(
        "{}_{}.{}",
        prefix,
        now.format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

/// Write an export file
pub fn export_to_path(
    indicators: &[Indicator],
    path: &Path,
    format: ExportFormat,
    level: FieldLevel,
    split_tags: bool,
) -> Result<(), ExportError> {
    let writer = BufWriter::new(File::create(path)?);
    match format {
        ExportFormat::Csv => write_csv(indicators, level, split_tags, writer)?,
        ExportFormat::Json => write_json(indicators, level, writer)?,
    }
    info!("Wrote {} indicators to {}", indicators.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IndicatorType;
    use chrono::TimeZone;

    fn sample() -> Vec<Indicator> {
        let mut first = Indicator::new(IndicatorType::Domain, "evil.com").with_tags(&["a", "b"]);
        first.first_seen = Some(1);
        first.last_seen = Some(2);
        first.extra.insert("zeta".to_string(), Value::from("z"));
        first.extra.insert("weight".to_string(), Value::from(3));
        vec![first, Indicator::new(IndicatorType::Ip4, "1.2.3.4")]
    }

    fn csv_string(indicators: &[Indicator], level: FieldLevel, split: bool) -> String {
        let mut buf = Vec::new();
        write_csv(indicators, level, split, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_tags_column_is_last() {
        for level in [FieldLevel::Common, FieldLevel::All] {
            let header = csv_header(&sample(), level);
            assert_eq!(header.last().map(String::as_str), Some("tags"));
            assert_eq!(header.iter().filter(|c| c.as_str() == "tags").count(), 1);
        }
        let header = csv_header(&sample(), FieldLevel::All);
        assert!(header.contains(&"zeta".to_string()));
    }

    #[test]
    fn test_csv_joined_and_split_tags() {
        let joined = csv_string(&sample(), FieldLevel::Common, false);
        let mut lines = joined.lines();
        assert_eq!(lines.next(), Some("value,indicatorType,firstSeen,lastSeen,tags"));
        assert_eq!(lines.next(), Some("evil.com,DOMAIN,1,2,a|b"));
        assert_eq!(lines.next(), Some("1.2.3.4,IP4,,,"));

        let split = csv_string(&sample(), FieldLevel::Common, true);
        assert_eq!(split.lines().nth(1), Some("evil.com,DOMAIN,1,2,a,b"));
    }

    #[test]
    fn test_report_csv_shape() {
        let rows = vec![ReportRow {
            report_id: "r-1".to_string(),
            report_title: "Phish, wave 3".to_string(),
            report_tags: "phishing;retail".to_string(),
            indicator_value: "evil.com".to_string(),
            indicator_type: "URL".to_string(),
        }];
        let mut buf = Vec::new();
        write_report_csv(&rows, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("report_id,report_title,report_tags,indicator_value,indicator_type")
        );
        assert_eq!(lines.next(), Some("r-1,\"Phish, wave 3\",phishing;retail,evil.com,URL"));
        assert_eq!(lines.next(), None);

        let mut empty = Vec::new();
        write_report_csv(&[], &mut empty).unwrap();
        assert_eq!(String::from_utf8(empty).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_values_only_csv() {
        let csv = csv_string(&sample(), FieldLevel::Values, false);
        assert_eq!(csv, "value\nevil.com\n1.2.3.4\n");
    }

    #[test]
    fn test_json_is_single_line_array() {
        let mut buf = Vec::new();
        write_json(&sample(), FieldLevel::ValuesAndType, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains('\n'));

        let parsed: Vec<Map<String, Value>> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["indicatorType"], "DOMAIN");
        assert!(!parsed[0].contains_key("tags"));
    }

    #[test]
    fn test_default_filename() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 8, 5, 9).unwrap();
        assert_eq!(
            default_filename("trustar_iocs", ExportFormat::Csv, now),
            "trustar_iocs_20240310_080509.csv"
        );
    }

    #[test]
    fn test_export_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        export_to_path(&sample(), &path, ExportFormat::Json, FieldLevel::Common, false).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with('['));
        assert!(text.contains("\"tags\":[\"a\",\"b\"]"));
    }
}
