//! Tabular upload parsing and the per-row import report.

use crate::error::AppError;
use std::collections::HashMap;

/// One data row keyed by header.
pub type Row = HashMap<String, String>;

pub trait TabularParser: Send + Sync {
    /// Parse `bytes` into rows. Every value is kept as text.
    fn parse(&self, bytes: &[u8]) -> Result<Vec<Row>, AppError>;
}

/// Comma separated values with a mandatory header line.
#[derive(Clone, Copy, Debug, Default)]
pub struct CsvParser;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

impl TabularParser for CsvParser {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<Row>, AppError> {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| AppError::Validation(format!("unreadable header line: {}", e)))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(AppError::Validation("the file has no header line".into()));
        }

        let mut rows = Vec::new();
        for (i, record) in reader.records().enumerate() {
            let record = record.map_err(|e| AppError::Validation(format!("line {}: {}", i + 2, e)))?;
            let row = headers
                .iter()
                .enumerate()
                .map(|(col, h)| (h.clone(), record.get(col).unwrap_or_default().to_string()))
                .collect();
            rows.push(row);
        }
        Ok(rows)
    }
}

/// True when every cell is empty or whitespace.
pub fn is_blank_row(row: &Row) -> bool {
    row.values().all(|v| v.trim().is_empty())
}

/// `row,status,message` report, one line per outcome.
pub fn write_report<'a>(
    lines: impl IntoIterator<Item = (usize, &'a str, &'a str)>,
) -> Result<Vec<u8>, AppError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(["row", "status", "message"])
        .map_err(|e| AppError::Internal(e.to_string()))?;
    for (row, status, message) in lines {
        writer
            .write_record([row.to_string().as_str(), status, message])
            .map_err(|e| AppError::Internal(e.to_string()))?;
    }
    writer.into_inner().map_err(|e| AppError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bom_short_rows_and_quoted_cells() {
        let input = b"\xEF\xBB\xBFname, email\n\"Smith, Ann\",ann@x.io\nBob\n";
        let rows = CsvParser.parse(input).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "Smith, Ann");
        assert_eq!(rows[0]["email"], "ann@x.io");
        assert_eq!(rows[1]["email"], "");
        assert!(!is_blank_row(&rows[1]));
    }

    #[test]
    fn report_has_header_and_escapes_messages() {
        let bytes = write_report([(1, "success", "7"), (2, "error", "a, b")]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "row,status,message\n1,success,7\n2,error,\"a, b\"\n");
    }
}
