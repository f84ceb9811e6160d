// 📄 CSV / TSV input and output
//
// Operator spreadsheets come in as CSV or TSV with a header row. Rows are kept
// as column → text maps so extra output columns can be appended without a
// fixed schema. Also hosts the table export.

use crate::error::Result;
use crate::progress::ProgressReporter;
use crate::record::value_at_path;
use crate::store::{scan_all, KeyValueStore};
use csv::{ReaderBuilder, WriterBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Csv,
    Tsv,
}

impl TextFormat {
    pub fn delimiter(self) -> u8 {
        match self {
            TextFormat::Csv => b',',
            TextFormat::Tsv => b'\t',
        }
    }

    /// `.tsv` / `.tab` files are tab separated, everything else is CSV
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("tsv") || ext.eq_ignore_ascii_case("tab") => {
                TextFormat::Tsv
            }
            _ => TextFormat::Csv,
        }
    }
}

pub type Row = BTreeMap<String, String>;

/// Header-ordered rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

impl Sheet {
    pub fn read(path: &Path) -> Result<Self> {
        Self::read_from(File::open(path)?, TextFormat::from_path(path))
    }

    pub fn read_from<R: Read>(reader: R, format: TextFormat) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .delimiter(format.delimiter())
            .flexible(true)
            .from_reader(reader);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            // Short rows are padded with empty cells
            let row = headers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.clone(), record.get(i).unwrap_or("").trim().to_string()))
                .collect();
            rows.push(row);
        }

        Ok(Sheet { headers, rows })
    }

    /// Append a column to the header if not already present
    pub fn add_column(&mut self, name: &str) {
        if !self.headers.iter().any(|h| h == name) {
            self.headers.push(name.to_string());
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        self.write_to(File::create(path)?, TextFormat::from_path(path))
    }

    pub fn write_to<W: Write>(&self, writer: W, format: TextFormat) -> Result<()> {
        let mut writer = WriterBuilder::new()
            .delimiter(format.delimiter())
            .from_writer(writer);

        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(
                self.headers
                    .iter()
                    .map(|h| row.get(h).map(String::as_str).unwrap_or("")),
            )?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Deserialize rows into a typed struct by header name
pub fn read_typed<T: DeserializeOwned, R: Read>(reader: R, format: TextFormat) -> Result<Vec<T>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(format.delimiter())
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut rows = Vec::new();
    for result in reader.deserialize() {
        rows.push(result?);
    }
    Ok(rows)
}

// ============================================================================
// TABLE EXPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportSpec {
    /// Dotted paths into each item; also used as the header row
    pub columns: Vec<String>,
    /// Items with an empty value in any of these columns are left out
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub scanned: usize,
    pub written: usize,
    pub filtered: usize,
}

/// Text form of a cell: strings verbatim, null/missing empty, structures as JSON
pub fn render_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn export_store<S, W>(
    store: &S,
    spec: &ExportSpec,
    writer: W,
    format: TextFormat,
    reporter: Option<&ProgressReporter>,
) -> Result<ExportSummary>
where
    S: KeyValueStore + ?Sized,
    W: Write,
{
    let mut writer = WriterBuilder::new()
        .delimiter(format.delimiter())
        .from_writer(writer);
    writer.write_record(&spec.columns)?;

    let mut summary = ExportSummary::default();
    scan_all(store, |page| {
        for record in page {
            summary.scanned += 1;
            let item = record.to_item();
            let cells: Vec<String> = spec
                .columns
                .iter()
                .map(|c| render_cell(value_at_path(&item, c)))
                .collect();

            let missing_required = spec
                .required
                .iter()
                .any(|r| render_cell(value_at_path(&item, r)).is_empty());
            if missing_required {
                summary.filtered += 1;
                continue;
            }

            writer.write_record(&cells)?;
            summary.written += 1;
        }
        if let Some(reporter) = reporter {
            reporter.report(summary.scanned, &format!("{} written", summary.written));
        }
        Ok(())
    })?;
    writer.flush()?;

    info!(
        "Finished export of {} - scanned {} rows, wrote {}, filtered {}",
        store.name(),
        summary.scanned,
        summary.written,
        summary.filtered
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VersionedRecord;
    use crate::store::MemoryTable;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_read_keeps_header_order_and_pads_short_rows() {
        let input = "Name,Property Reference,Action on Assure\nJo Bloggs,12 34\n";
        let sheet = Sheet::read_from(input.as_bytes(), TextFormat::Csv).unwrap();

        assert_eq!(sheet.headers, vec!["Name", "Property Reference", "Action on Assure"]);
        assert_eq!(sheet.rows[0]["Property Reference"], "12 34");
        assert_eq!(sheet.rows[0]["Action on Assure"], "");
    }

    #[test]
    fn test_write_appends_new_columns() {
        let mut sheet = Sheet::read_from("Name\nJo\n".as_bytes(), TextFormat::Csv).unwrap();
        sheet.add_column("mmh_id");
        sheet.add_column("mmh_id");
        sheet.rows[0].insert("mmh_id".to_string(), "p1".to_string());

        let mut out = Vec::new();
        sheet.write_to(&mut out, TextFormat::Tsv).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Name\tmmh_id\nJo\tp1\n");
    }

    #[test]
    fn test_read_typed_tsv() {
        #[derive(Deserialize)]
        struct Line {
            property_ref: String,
            payment_ref: String,
        }

        let input = "property_ref\tpayment_ref\n00012345\t 228001234 \n";
        let rows: Vec<Line> = read_typed(input.as_bytes(), TextFormat::Tsv).unwrap();
        assert_eq!(rows[0].property_ref, "00012345");
        assert_eq!(rows[0].payment_ref, "228001234");
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(TextFormat::from_path(Path::new("fixes.tsv")), TextFormat::Tsv);
        assert_eq!(TextFormat::from_path(Path::new("alerts.csv")), TextFormat::Csv);
        assert_eq!(TextFormat::from_path(Path::new("noext")), TextFormat::Csv);
    }

    #[test]
    fn test_export_dotted_columns_and_required_filter() {
        let table = MemoryTable::new("Assets").with_page_size(2);
        table.insert(
            VersionedRecord::new("a1")
                .with_version(1)
                .with_field("assetId", json!("00000001"))
                .with_field("tenure", json!({"id": "t1"})),
        );
        table.insert(VersionedRecord::new("a2").with_field("assetId", json!("00000002")));
        table.insert(
            VersionedRecord::new("a3")
                .with_field("assetId", json!(3))
                .with_field("tenure", json!({"id": "t3"})),
        );

        let spec = ExportSpec {
            columns: vec!["id".into(), "assetId".into(), "tenure.id".into(), "versionNumber".into()],
            required: vec!["tenure.id".into()],
        };
        let mut out = Vec::new();
        let summary = export_store(&table, &spec, &mut out, TextFormat::Csv, None).unwrap();

        assert_eq!(summary, ExportSummary { scanned: 3, written: 2, filtered: 1 });
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "id,assetId,tenure.id,versionNumber\na1,00000001,t1,1\na3,3,t3,\n"
        );
    }
}
