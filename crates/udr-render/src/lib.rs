//! Report sinks: delimited text, a parquet directory, an HTML document and
//! plain aligned tables.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use udr_core::{Reporter, SinkError, UnknownName};

pub mod columnar;
pub mod delimited;
pub mod html;
pub mod table;

pub use columnar::{ParquetManifest, ParquetManifestFile, ParquetSink};
pub use delimited::DelimitedSink;
pub use html::HtmlSink;
pub use table::TableSink;

pub const CRATE_NAME: &str = "udr-render";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Csv,
    Parquet,
    Html,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Table => "table",
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
            OutputFormat::Html => "html",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "table" | "text" => Ok(OutputFormat::Table),
            "csv" => Ok(OutputFormat::Csv),
            "parquet" | "workbook" => Ok(OutputFormat::Parquet),
            "html" => Ok(OutputFormat::Html),
            _ => Err(UnknownName(s.to_string())),
        }
    }
}

/// Build a sink for `format`. Without an output path text formats go to
/// stdout, parquet goes to `default_dir` and HTML to `report.html` inside it.
pub fn sink_for(
    format: OutputFormat,
    output: Option<&Path>,
    default_dir: &Path,
) -> Result<Box<dyn Reporter>, SinkError> {
    Ok(match format {
        OutputFormat::Table => match output {
            Some(path) => Box::new(TableSink::create(path)?),
            None => Box::new(TableSink::stdout()),
        },
        OutputFormat::Csv => match output {
            Some(path) => Box::new(DelimitedSink::create(path)?),
            None => Box::new(DelimitedSink::stdout()),
        },
        OutputFormat::Parquet => Box::new(ParquetSink::new(
            output.map(Path::to_path_buf).unwrap_or_else(|| default_dir.to_path_buf()),
        )),
        OutputFormat::Html => Box::new(HtmlSink::new(
            output
                .map(Path::to_path_buf)
                .unwrap_or_else(|| default_dir.join("report.html")),
        )),
    })
}

/// A file name safe on every platform, derived from a report instance name.
pub fn file_stem(instance: &str) -> String {
    instance
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub(crate) fn io_error(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> SinkError {
    let path = path.into();
    move |source| SinkError::Io { path, source }
}
