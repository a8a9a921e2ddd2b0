//! One parquet file per report instance in a directory, with a manifest.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use udr_core::{Headlines, Report, Reporter, SinkConstraints, SinkError, SinkKind};

use crate::{file_stem, io_error};

const SINK: &str = "parquet";
pub const MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ParquetManifestFile {
    pub name: String,
    pub title: String,
    pub group: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

struct Pending {
    report: Report,
    headlines: Headlines,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// The workbook-style sink: every report and sub-report becomes
/// `<dir>/<instance>.parquet`. Headlines, title and group are stored as
/// file key/value metadata.
pub struct ParquetSink {
    dir: PathBuf,
    pending: Vec<Pending>,
    removed: Vec<String>,
}

impl ParquetSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pending: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, instance: &str) -> PathBuf {
        self.dir.join(format!("{}.parquet", file_stem(instance)))
    }

    fn write(&self, pending: &Pending) -> Result<ParquetManifestFile, SinkError> {
        let path = self.path_for(&pending.report.instance_name());
        let render = |message: String| SinkError::Render {
            sink: SINK,
            message: format!("{}: {message}", path.display()),
        };

        let schema = Arc::new(Schema::new(
            pending
                .columns
                .iter()
                .map(|c| Field::new(c.as_str(), DataType::Utf8, false))
                .collect::<Vec<_>>(),
        ));
        let arrays: Vec<ArrayRef> = (0..pending.columns.len())
            .map(|i| {
                let values = StringArray::from(
                    pending
                        .rows
                        .iter()
                        .map(|row| row.get(i).map(String::as_str).unwrap_or_default())
                        .collect::<Vec<_>>(),
                );
                Arc::new(values) as ArrayRef
            })
            .collect();
        let batch = RecordBatch::try_new(schema, arrays).map_err(|e| render(e.to_string()))?;

        let mut metadata = vec![
            KeyValue::new("udr.title".to_string(), pending.report.title.clone()),
            KeyValue::new("udr.group".to_string(), pending.report.group.clone()),
        ];
        for (name, value) in &pending.headlines {
            metadata.push(KeyValue::new(format!("udr.headline.{name}"), value.clone()));
        }
        let props = WriterProperties::builder()
            .set_key_value_metadata(Some(metadata))
            .build();

        let file = File::create(&path).map_err(io_error(&path))?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
            .map_err(|e| render(e.to_string()))?;
        writer.write(&batch).map_err(|e| render(e.to_string()))?;
        writer.close().map_err(|e| render(e.to_string()))?;

        manifest_entry(&pending.report, &self.dir, &path, pending.rows.len())
    }
}

fn manifest_entry(
    report: &Report,
    dir: &Path,
    path: &Path,
    rows: usize,
) -> Result<ParquetManifestFile, SinkError> {
    let bytes = std::fs::read(path).map_err(io_error(path))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(ParquetManifestFile {
        name: report.instance_name(),
        title: report.title.clone(),
        group: report.group.clone(),
        path: path
            .strip_prefix(dir)
            .unwrap_or(path)
            .display()
            .to_string(),
        rows,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

impl Reporter for ParquetSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Workbook
    }

    fn constraints(&self) -> SinkConstraints {
        SinkConstraints {
            max_title_len: 31,
            distinct_group_title: true,
            max_reports: 0,
        }
    }

    fn extension(&self) -> &'static str {
        "parquet"
    }

    fn prepare(&mut self, report: &Report) -> Result<(), SinkError> {
        self.pending.push(Pending {
            report: report.clone(),
            headlines: Headlines::new(),
            columns: Vec::new(),
            rows: Vec::new(),
        });
        Ok(())
    }

    fn add_headline(&mut self, name: &str, value: &str) {
        if let Some(current) = self.pending.last_mut() {
            current.headlines.push((name.to_string(), value.to_string()));
        }
    }

    fn update_table(&mut self, columns: &[String], rows: Vec<Vec<String>>) {
        if let Some(current) = self.pending.last_mut() {
            current.columns = columns.to_vec();
            current.rows = rows;
        }
    }

    fn remove(&mut self, report: &Report) -> Result<(), SinkError> {
        let instance = report.instance_name();
        let path = self.path_for(&instance);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed report file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(SinkError::Io { path, source }),
        }
        self.removed.push(instance);
        Ok(())
    }

    /// Write every pending report, then merge the results into the
    /// directory manifest.
    fn render(&mut self) -> Result<(), SinkError> {
        std::fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let manifest_path = self.dir.join(MANIFEST);
        let mut entries: BTreeMap<String, ParquetManifestFile> = read_manifest(&manifest_path)
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();
        for name in &self.removed {
            entries.remove(name);
        }

        for pending in std::mem::take(&mut self.pending) {
            if pending.columns.is_empty() {
                warn!(report = %pending.report.name, "report has no columns, skipping");
                continue;
            }
            let entry = self.write(&pending)?;
            entries.insert(entry.name.clone(), entry);
        }

        let manifest = ParquetManifest {
            schema_version: 1,
            files: entries.into_values().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest).map_err(|e| SinkError::Render {
            sink: SINK,
            message: e.to_string(),
        })?;
        std::fs::write(&manifest_path, bytes).map_err(io_error(&manifest_path))?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct ManifestFiles {
    files: Vec<StoredFile>,
}

#[derive(serde::Deserialize)]
struct StoredFile {
    name: String,
    title: String,
    group: String,
    path: String,
    rows: usize,
    sha256: String,
    bytes: u64,
}

fn read_manifest(path: &Path) -> Vec<ParquetManifestFile> {
    let Ok(bytes) = std::fs::read(path) else {
        return Vec::new();
    };
    match serde_json::from_slice::<ManifestFiles>(&bytes) {
        Ok(stored) => stored
            .files
            .into_iter()
            .map(|f| ParquetManifestFile {
                name: f.name,
                title: f.title,
                group: f.group,
                path: f.path,
                rows: f.rows,
                sha256: f.sha256,
                bytes: f.bytes,
            })
            .collect(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable manifest");
            Vec::new()
        }
    }
}
