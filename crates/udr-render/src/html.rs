//! A single HTML document holding every report, used for the browser
//! output and for email bodies.

use std::path::{Path, PathBuf};

use askama::Template;
use tracing::debug;
use udr_core::{Report, Reporter, SinkConstraints, SinkError, SinkKind};

use crate::{file_stem, io_error};

const SINK: &str = "html";

#[derive(Debug, Clone)]
struct Headline {
    name: String,
    value: String,
}

#[derive(Debug, Clone)]
struct Cell {
    value: String,
    class: String,
}

#[derive(Debug, Clone)]
struct Section {
    id: String,
    instance: String,
    title: String,
    group: String,
    headlines: Vec<Headline>,
    columns: Vec<Cell>,
    rows: Vec<Vec<Cell>>,
    report: Report,
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportDocument<'a> {
    title: &'a str,
    sections: &'a [Section],
}

pub struct HtmlSink {
    path: Option<PathBuf>,
    title: String,
    sections: Vec<Section>,
}

impl HtmlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            title: "Usage Reports".to_string(),
            sections: Vec::new(),
        }
    }

    pub fn detached() -> Self {
        Self {
            path: None,
            title: "Usage Reports".to_string(),
            sections: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn document(&self) -> Result<String, SinkError> {
        ReportDocument {
            title: &self.title,
            sections: &self.sections,
        }
        .render()
        .map_err(|e| SinkError::Render {
            sink: SINK,
            message: e.to_string(),
        })
    }
}

fn style_row(report: &Report, columns: &[String], row: Vec<String>) -> Vec<Cell> {
    let frozen = frozen_width(report, columns);
    row.into_iter()
        .enumerate()
        .map(|(i, value)| {
            let mut classes = Vec::new();
            if i < frozen {
                classes.push("frozen".to_string());
            }
            let column = columns.get(i).map(String::as_str).unwrap_or_default();
            for format in &report.conditional_format {
                if format.column.eq_ignore_ascii_case(column) && format.matches(&value) {
                    classes.push(format!("udr-{}", format.style));
                }
            }
            Cell {
                value,
                class: classes.join(" "),
            }
        })
        .collect()
}

/// Number of leading columns kept in view, up to and including the
/// configured freeze column.
fn frozen_width(report: &Report, columns: &[String]) -> usize {
    report
        .freeze_to_column
        .as_deref()
        .and_then(|name| columns.iter().position(|c| c.eq_ignore_ascii_case(name)))
        .map(|i| i + 1)
        .unwrap_or(0)
}

impl Reporter for HtmlSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Html
    }

    fn constraints(&self) -> SinkConstraints {
        SinkConstraints::default()
    }

    fn extension(&self) -> &'static str {
        "html"
    }

    fn prepare(&mut self, report: &Report) -> Result<(), SinkError> {
        let instance = report.instance_name();
        self.sections.retain(|s| s.instance != instance);
        self.sections.push(Section {
            id: file_stem(&instance),
            instance,
            title: report.title.clone(),
            group: report.group.clone(),
            headlines: Vec::new(),
            columns: Vec::new(),
            rows: Vec::new(),
            report: report.clone(),
        });
        Ok(())
    }

    fn add_headline(&mut self, name: &str, value: &str) {
        if let Some(section) = self.sections.last_mut() {
            section.headlines.push(Headline {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
    }

    fn update_table(&mut self, columns: &[String], rows: Vec<Vec<String>>) {
        let Some(section) = self.sections.last_mut() else {
            return;
        };
        let frozen = frozen_width(&section.report, columns);
        section.columns = columns
            .iter()
            .enumerate()
            .map(|(i, c)| Cell {
                value: c.clone(),
                class: if i < frozen { "frozen".into() } else { String::new() },
            })
            .collect();
        section.rows = rows
            .into_iter()
            .map(|row| style_row(&section.report, columns, row))
            .collect();
    }

    fn remove(&mut self, report: &Report) -> Result<(), SinkError> {
        let instance = report.instance_name();
        self.sections.retain(|s| s.instance != instance);
        Ok(())
    }

    fn render(&mut self) -> Result<(), SinkError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let document = self.document()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        std::fs::write(&path, document).map_err(io_error(&path))?;
        debug!(path = %path.display(), sections = self.sections.len(), "wrote html report");
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}
