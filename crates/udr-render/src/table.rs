//! Plain aligned text for terminals.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use udr_core::{Headlines, Report, Reporter, SinkError, SinkKind};

use crate::io_error;

struct Block {
    report: Report,
    headlines: Headlines,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

pub struct TableSink {
    out: Box<dyn Write + Send>,
    target: PathBuf,
    blocks: Vec<Block>,
}

impl TableSink {
    pub fn new(out: Box<dyn Write + Send>, target: impl Into<PathBuf>) -> Self {
        Self {
            out,
            target: target.into(),
            blocks: Vec::new(),
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
}

fn format_block(block: &Block) -> String {
    let mut text = String::new();
    let heading = match block.report.group.as_str() {
        "" => block.report.title.clone(),
        group => format!("{} / {}", group, block.report.title),
    };
    text.push_str(&heading);
    text.push('\n');
    text.push_str(&"=".repeat(heading.chars().count()));
    text.push('\n');

    let label_width = block
        .headlines
        .iter()
        .map(|(name, _)| name.chars().count())
        .max()
        .unwrap_or(0);
    for (name, value) in &block.headlines {
        text.push_str(&format!("{name:<label_width$}  {value}\n"));
    }
    if !block.headlines.is_empty() {
        text.push('\n');
    }

    let mut widths: Vec<usize> = block.columns.iter().map(|c| c.chars().count()).collect();
    for row in &block.rows {
        for (i, cell) in row.iter().enumerate() {
            let len = cell.chars().count();
            match widths.get_mut(i) {
                Some(w) => *w = (*w).max(len),
                None => widths.push(len),
            }
        }
    }
    let line = |cells: &[String]| -> String {
        let padded: Vec<String> = widths
            .iter()
            .enumerate()
            .map(|(i, &w)| format!("{:<w$}", cells.get(i).map(String::as_str).unwrap_or_default()))
            .collect();
        format!("{}\n", padded.join("  ").trim_end())
    };
    text.push_str(&line(&block.columns));
    let rule: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    text.push_str(&line(&rule));
    for row in &block.rows {
        text.push_str(&line(row));
    }
    text
}

impl Reporter for TableSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Text
    }

    fn extension(&self) -> &'static str {
        "txt"
    }

    fn prepare(&mut self, report: &Report) -> Result<(), SinkError> {
        self.blocks.push(Block {
            report: report.clone(),
            headlines: Headlines::new(),
            columns: Vec::new(),
            rows: Vec::new(),
        });
        Ok(())
    }

    fn add_headline(&mut self, name: &str, value: &str) {
        if let Some(block) = self.blocks.last_mut() {
            block.headlines.push((name.to_string(), value.to_string()));
        }
    }

    fn update_table(&mut self, columns: &[String], rows: Vec<Vec<String>>) {
        if let Some(block) = self.blocks.last_mut() {
            block.columns = columns.to_vec();
            block.rows = rows;
        }
    }

    fn remove(&mut self, report: &Report) -> Result<(), SinkError> {
        let instance = report.instance_name();
        self.blocks.retain(|b| b.report.instance_name() != instance);
        Ok(())
    }

    fn render(&mut self) -> Result<(), SinkError> {
        let text = self
            .blocks
            .iter()
            .map(format_block)
            .collect::<Vec<_>>()
            .join("\n");
        self.out
            .write_all(text.as_bytes())
            .map_err(io_error(&self.target))?;
        self.blocks.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.out.flush().map_err(io_error(&self.target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn aligns_columns_under_a_heading() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("probes.txt");
        let mut sink = TableSink::create(&path).expect("create");
        sink.prepare(&Report {
            name: "probes".into(),
            title: "Probes".into(),
            group: "Inventory".into(),
            ..Report::default()
        })
        .expect("prepare");
        sink.add_headline("Total", "2");
        sink.update_table(
            &["Gateway".to_string(), "Host".to_string()],
            vec![
                vec!["GW1".into(), "host1".into()],
                vec!["GATEWAY2".into(), "h2".into()],
            ],
        );
        sink.render().expect("render");
        sink.close().expect("close");

        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(
            text,
            "Inventory / Probes\n\
             ==================\n\
             Total  2\n\
             \n\
             Gateway   Host\n\
             --------  -----\n\
             GW1       host1\n\
             GATEWAY2  h2\n"
        );
    }
}
