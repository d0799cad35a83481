use crate::config::local::ExportsConfig;
use crate::db::models::ExportFlags;
use crate::error::{ExportError, Result};
use crate::query::QueryResult;
use rust_xlsxwriter::{Format, Workbook};
use serde_json::Value;
use std::fmt;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "xlsx" => Ok(ExportFormat::Xlsx),
            other => Err(format!("unknown export format: {}", other)),
        }
    }
}

/// Files written for one tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportArtifacts {
    pub csv: Option<PathBuf>,
    pub xlsx: Option<PathBuf>,
}

impl ExportArtifacts {
    pub fn is_empty(&self) -> bool {
        self.csv.is_none() && self.xlsx.is_none()
    }
}

/// Writes result sets as `result_tid_<tracker_id>.<ext>` under one directory.
#[derive(Debug, Clone)]
pub struct ExportWriter {
    directory: PathBuf,
    base_url: String,
}

impl ExportWriter {
    pub fn new(config: &ExportsConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn ensure_directory(&self) -> Result<()> {
        fs::create_dir_all(&self.directory).map_err(ExportError::from)?;
        Ok(())
    }

    pub fn path_for(&self, tracker_id: i64, format: ExportFormat) -> PathBuf {
        self.directory
            .join(format!("result_tid_{}.{}", tracker_id, format.extension()))
    }

    /// Stable download URL of an artifact.
    pub fn url_for(&self, tracker_id: i64, format: ExportFormat) -> String {
        format!("{}/{}/result/{}", self.base_url, tracker_id, format.extension())
    }

    /// Writes every format requested in `flags`. Blocking.
    pub fn write(
        &self,
        tracker_id: i64,
        result: &QueryResult,
        flags: ExportFlags,
    ) -> Result<ExportArtifacts> {
        let mut artifacts = ExportArtifacts::default();

        if flags.csv {
            let path = self.path_for(tracker_id, ExportFormat::Csv);
            write_atomically(&path, |tmp| write_csv(tmp, result))?;
            artifacts.csv = Some(path);
        }

        if flags.xlsx {
            let path = self.path_for(tracker_id, ExportFormat::Xlsx);
            write_atomically(&path, |tmp| write_xlsx(tmp, result))?;
            artifacts.xlsx = Some(path);
        }

        if !artifacts.is_empty() {
            info!(
                tracker_id = tracker_id,
                rows = result.row_count(),
                csv = artifacts.csv.is_some(),
                xlsx = artifacts.xlsx.is_some(),
                "Export files written"
            );
        }
        Ok(artifacts)
    }

    /// Removes whatever artifacts exist for a tracker. Missing files are fine.
    pub fn remove(&self, tracker_id: i64) -> Result<()> {
        for format in [ExportFormat::Csv, ExportFormat::Xlsx] {
            match fs::remove_file(self.path_for(tracker_id, format)) {
                Ok(()) => debug!(tracker_id = tracker_id, format = %format, "Artifact removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ExportError::from(e).into()),
            }
        }
        Ok(())
    }

    /// Runs `write` on the blocking pool.
    pub async fn write_in_background(
        &self,
        tracker_id: i64,
        result: QueryResult,
        flags: ExportFlags,
    ) -> Result<ExportArtifacts> {
        let writer = self.clone();
        tokio::task::spawn_blocking(move || writer.write(tracker_id, &result, flags))
            .await
            .map_err(|e| ExportError::Io(format!("export task failed: {}", e)))?
    }
}

/// Writes to a sibling temp file and renames it into place, so readers
/// never observe a partial artifact.
fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let tmp = path.with_extension("part");
    if let Err(e) = write(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path).map_err(ExportError::from)?;
    debug!(path = %path.display(), "Artifact written");
    Ok(())
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

pub fn write_csv(path: &Path, result: &QueryResult) -> Result<()> {
    let file = File::create(path).map_err(ExportError::from)?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));

    writer.write_record(&result.header).map_err(ExportError::from)?;
    for row in &result.rows {
        let record: Vec<String> = result.ordered_cells(row).map(cell_text).collect();
        writer.write_record(&record).map_err(ExportError::from)?;
    }

    writer.flush().map_err(ExportError::from)?;
    Ok(())
}

pub fn write_xlsx(path: &Path, result: &QueryResult) -> Result<()> {
    let mut workbook = build_workbook(result)?;
    workbook.save(path).map_err(ExportError::from)?;
    Ok(())
}

/// Renders the workbook in memory, for mail attachments.
pub fn xlsx_bytes(result: &QueryResult) -> Result<Vec<u8>> {
    let mut workbook = build_workbook(result)?;
    let bytes = workbook.save_to_buffer().map_err(ExportError::from)?;
    Ok(bytes)
}

fn build_workbook(result: &QueryResult) -> Result<Workbook> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let sheet = workbook.add_worksheet();

    for (col, name) in result.header.iter().enumerate() {
        sheet
            .write_string_with_format(0, col as u16, name, &bold)
            .map_err(ExportError::from)?;
    }

    for (index, row) in result.rows.iter().enumerate() {
        let line = index as u32 + 1;
        for (col, value) in result.ordered_cells(row).enumerate() {
            let col = col as u16;
            match value {
                Value::Null => {}
                Value::Bool(b) => {
                    sheet.write_boolean(line, col, *b).map_err(ExportError::from)?;
                }
                Value::Number(n) => match n.as_f64() {
                    Some(f) => {
                        sheet.write_number(line, col, f).map_err(ExportError::from)?;
                    }
                    None => {
                        sheet
                            .write_string(line, col, n.to_string())
                            .map_err(ExportError::from)?;
                    }
                },
                other => {
                    sheet
                        .write_string(line, col, cell_text(other))
                        .map_err(ExportError::from)?;
                }
            }
        }
    }

    Ok(workbook)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> QueryResult {
        let row = json!({"id": 1, "name": "a"});
        QueryResult {
            header: vec!["id".to_string(), "name".to_string()],
            rows: vec![row.as_object().cloned().unwrap_or_default()],
            truncated: false,
        }
    }

    fn writer(dir: &TempDir) -> ExportWriter {
        ExportWriter::new(&ExportsConfig {
            directory: dir.path().to_path_buf(),
            base_url: "/trackers/".to_string(),
            result_valid_seconds: 60,
        })
    }

    #[test]
    fn test_csv_round_trip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let artifacts = writer(&dir)
            .write(42, &sample(), ExportFlags { csv: true, xlsx: false })
            .expect("export should succeed");

        let path = artifacts.csv.expect("csv path");
        assert!(path.ends_with("result_tid_42.csv"));

        let mut reader = csv::Reader::from_path(&path).expect("Failed to open csv");
        let header: Vec<String> = reader
            .headers()
            .expect("header")
            .iter()
            .map(str::to_string)
            .collect();
        assert_eq!(header, vec!["id", "name"]);

        let records: Vec<csv::StringRecord> =
            reader.records().collect::<std::result::Result<_, _>>().expect("rows");
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0][0], "1");
        assert_eq!(&records[0][1], "a");
    }

    #[test]
    fn test_xlsx_written_without_leftover_temp_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let artifacts = writer(&dir)
            .write(7, &sample(), ExportFlags { csv: false, xlsx: true })
            .expect("export should succeed");

        let path = artifacts.xlsx.expect("xlsx path");
        assert!(path.exists());
        assert!(!path.with_extension("part").exists());
        assert!(artifacts.csv.is_none());
    }

    #[test]
    fn test_no_flags_writes_nothing() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let artifacts = writer(&dir)
            .write(1, &sample(), ExportFlags::default())
            .expect("export should succeed");

        assert!(artifacts.is_empty());
        assert_eq!(fs::read_dir(dir.path()).expect("read dir").count(), 0);
    }

    #[test]
    fn test_xlsx_bytes_are_a_zip_container() {
        let bytes = xlsx_bytes(&sample()).expect("workbook should render");
        assert!(bytes.starts_with(b"PK"));
    }

    #[test]
    fn test_remove_deletes_artifacts() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let writer = writer(&dir);
        writer
            .write(5, &sample(), ExportFlags { csv: true, xlsx: true })
            .expect("export should succeed");

        writer.remove(5).expect("remove should succeed");
        assert_eq!(fs::read_dir(dir.path()).expect("read dir").count(), 0);

        writer.remove(5).expect("removing twice is fine");
    }

    #[test]
    fn test_url_for_artifact() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        assert_eq!(
            writer(&dir).url_for(9, ExportFormat::Xlsx),
            "/trackers/9/result/xlsx"
        );
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>(), Ok(ExportFormat::Csv));
        assert!("pdf".parse::<ExportFormat>().is_err());
    }

    #[tokio::test]
    async fn test_write_in_background() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let artifacts = writer(&dir)
            .write_in_background(3, sample(), ExportFlags { csv: true, xlsx: true })
            .await
            .expect("export should succeed");

        assert!(artifacts.csv.is_some());
        assert!(artifacts.xlsx.is_some());
    }
}
