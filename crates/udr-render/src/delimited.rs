//! CSV output of a single report. Headlines precede the table as
//! `<!>name,value` lines.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use udr_core::{Headlines, Report, Reporter, SinkConstraints, SinkError, SinkKind};

use crate::io_error;

const SINK: &str = "delimited";

pub struct DelimitedSink {
    writer: Option<csv::Writer<Box<dyn Write + Send>>>,
    target: PathBuf,
    report: Option<Report>,
    headlines: Headlines,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl DelimitedSink {
    pub fn new(writer: Box<dyn Write + Send>, target: impl Into<PathBuf>) -> Self {
        Self {
            writer: Some(
                csv::WriterBuilder::new()
                    .flexible(true)
                    .from_writer(writer),
            ),
            target: target.into(),
            report: None,
            headlines: Headlines::new(),
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn create(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let file = File::create(path).map_err(io_error(path))?;
        Ok(Self::new(Box::new(file), path))
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()), "<stdout>")
    }

    fn render_error(err: csv::Error) -> SinkError {
        SinkError::Render {
            sink: SINK,
            message: err.to_string(),
        }
    }
}

impl Reporter for DelimitedSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Delimited
    }

    fn constraints(&self) -> SinkConstraints {
        SinkConstraints {
            max_reports: 1,
            ..SinkConstraints::default()
        }
    }

    fn extension(&self) -> &'static str {
        "csv"
    }

    fn prepare(&mut self, report: &Report) -> Result<(), SinkError> {
        if self.report.is_some() {
            return Err(SinkError::TooManyReports { sink: SINK, max: 1 });
        }
        self.report = Some(report.clone());
        Ok(())
    }

    fn add_headline(&mut self, name: &str, value: &str) {
        self.headlines.push((name.to_string(), value.to_string()));
    }

    fn update_table(&mut self, columns: &[String], rows: Vec<Vec<String>>) {
        self.columns = columns.to_vec();
        self.rows = rows;
    }

    fn remove(&mut self, _report: &Report) -> Result<(), SinkError> {
        Ok(())
    }

    fn render(&mut self) -> Result<(), SinkError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        if self.report.is_none() {
            return Ok(());
        }
        for (name, value) in &self.headlines {
            writer
                .write_record([format!("<!>{name}").as_str(), value.as_str()])
                .map_err(Self::render_error)?;
        }
        writer
            .write_record(&self.columns)
            .map_err(Self::render_error)?;
        for row in &self.rows {
            writer.write_record(row).map_err(Self::render_error)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(io_error(&self.target))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_headlines_then_table_and_refuses_a_second_report() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out/gateways.csv");
        let mut sink = DelimitedSink::create(&path).expect("create");
        let report = Report {
            name: "gateways".into(),
            ..Report::default()
        };
        sink.prepare(&report).expect("prepare");
        sink.add_headline("Generated", "2026-10-19");
        sink.update_table(
            &["Gateway".to_string(), "Probes".to_string()],
            vec![vec!["GW1".into(), "2".into()], vec!["GW,2".into(), "0".into()]],
        );
        assert!(matches!(
            sink.prepare(&report),
            Err(SinkError::TooManyReports { max: 1, .. })
        ));
        sink.render().expect("render");
        sink.close().expect("close");

        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(
            text,
            "<!>Generated,2026-10-19\nGateway,Probes\nGW1,2\n\"GW,2\",0\n"
        );
    }
}
