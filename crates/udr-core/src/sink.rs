//! The boundary between the report executor and output renderers.

use std::path::PathBuf;

use crate::report::{ConditionalFormat, ReportType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Text,
    Delimited,
    Workbook,
    Html,
    Dashboard,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Text => "text",
            SinkKind::Delimited => "delimited",
            SinkKind::Workbook => "workbook",
            SinkKind::Html => "html",
            SinkKind::Dashboard => "dashboard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SinkConstraints {
    /// Zero means unlimited.
    pub max_title_len: usize,
    pub distinct_group_title: bool,
    /// Zero means unlimited.
    pub max_reports: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub name: String,
    pub title: String,
    pub group: String,
    pub kind: ReportType,
    /// Set on sub-reports of a split report.
    pub split_value: Option<String>,
    pub scramble_columns: Vec<String>,
    pub conditional_format: Vec<ConditionalFormat>,
    pub freeze_to_column: Option<String>,
}

impl Report {
    /// Stable identifier for destinations keyed per report instance.
    pub fn instance_name(&self) -> String {
        match &self.split_value {
            Some(value) => format!("{}-{}", self.name, value),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{sink} sink: {message}")]
    Render { sink: &'static str, message: String },
    #[error("{sink} sink accepts at most {max} report(s)")]
    TooManyReports { sink: &'static str, max: usize },
}

/// A renderer receiving reports one at a time.
///
/// For each report the executor calls `prepare`, then any number of
/// `add_headline` calls, then `update_table` with the full column list and
/// rows. `render` is called once after all reports, followed by `close`.
pub trait Reporter: Send {
    fn kind(&self) -> SinkKind;

    fn constraints(&self) -> SinkConstraints {
        SinkConstraints::default()
    }

    fn extension(&self) -> &'static str;

    fn prepare(&mut self, report: &Report) -> Result<(), SinkError>;

    fn add_headline(&mut self, name: &str, value: &str);

    fn update_table(&mut self, columns: &[String], rows: Vec<Vec<String>>);

    /// Drop whatever the sink holds for a report that no longer exists.
    fn remove(&mut self, report: &Report) -> Result<(), SinkError>;

    fn render(&mut self) -> Result<(), SinkError>;

    fn close(&mut self) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_instances_carry_value() {
        let mut report = Report {
            name: "gateway-detail".into(),
            ..Report::default()
        };
        assert_eq!(report.instance_name(), "gateway-detail");
        report.split_value = Some("GW1".into());
        assert_eq!(report.instance_name(), "gateway-detail-GW1");
    }
}
