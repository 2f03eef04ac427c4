use serde_json::{Map, Value};

use crate::error::{ExportError, ExportResult};

/// Rows ready for serialization: every value already rendered to text,
/// pseudonymized and disclosure-controlled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl NormalizedTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) -> ExportResult<()> {
        if row.len() != self.columns.len() {
            return Err(ExportError::Format(format!(
                "row has {} values for {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Serializes a table into one export file.
pub trait Formatter: Send + Sync {
    fn format(&self, table: &NormalizedTable) -> ExportResult<Vec<u8>>;
    fn extension(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvFormatter;

impl Formatter for CsvFormatter {
    fn format(&self, table: &NormalizedTable) -> ExportResult<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::CRLF)
            .from_writer(Vec::new());
        writer
            .write_record(&table.columns)
            .map_err(|e| ExportError::Format(e.to_string()))?;
        for row in &table.rows {
            writer
                .write_record(row)
                .map_err(|e| ExportError::Format(e.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|e| ExportError::Format(e.to_string()))
    }

    fn extension(&self) -> &'static str {
        "csv"
    }
}

/// One JSON object per row, keyed by column name.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesFormatter;

impl Formatter for JsonLinesFormatter {
    fn format(&self, table: &NormalizedTable) -> ExportResult<Vec<u8>> {
        let mut out = Vec::new();
        for row in &table.rows {
            let object: Map<String, Value> = table
                .columns
                .iter()
                .cloned()
                .zip(row.iter().cloned().map(Value::String))
                .collect();
            serde_json::to_writer(&mut out, &Value::Object(object))
                .map_err(|e| ExportError::Format(e.to_string()))?;
            out.push(b'\n');
        }
        Ok(out)
    }

    fn extension(&self) -> &'static str {
        "jsonl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_table() -> NormalizedTable {
        let mut table = NormalizedTable::new(vec!["PersonalID".into(), "Note".into()]);
        table
            .push_row(vec!["AB12".into(), "said \"hi\", left".into()])
            .unwrap();
        table
    }

    #[test]
    fn test_csv_quotes() {
        let bytes = CsvFormatter.format(&make_table()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "PersonalID,Note\r\nAB12,\"said \"\"hi\"\", left\"\r\n");
    }

    #[test]
    fn test_jsonl_rows() {
        let bytes = JsonLinesFormatter.format(&make_table()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        let v: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(v["PersonalID"], "AB12");
    }

    #[test]
    fn test_push_row_checks_width() {
        let mut table = NormalizedTable::new(vec!["a".into()]);
        assert!(table.push_row(vec!["1".into(), "2".into()]).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_header_only_csv() {
        let table = NormalizedTable::new(vec!["a".into(), "b".into()]);
        let text = String::from_utf8(CsvFormatter.format(&table).unwrap()).unwrap();
        assert_eq!(text, "a,b\r\n");
    }
}
