//! The email cycle: an HTML body built from the configured reports, with
//! the parquet reports attached, handed to a mail transport.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use udr_core::{CancelToken, Config, Expander, Lookup, ReportSelection, Reporter};
use udr_render::{HtmlSink, ParquetSink};
use udr_storage::Store;
use uuid::Uuid;

use crate::derive::DerivedTableBuilder;
use crate::lists::ListStore;
use crate::report::ReportExecutor;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding message headers: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailMessage {
    pub to: Vec<String>,
    pub from: Option<String>,
    pub subject: String,
    #[serde(skip)]
    pub html_body: String,
    pub attachments: Vec<PathBuf>,
}

/// Delivery is somebody else's job; a transport only has to accept the
/// finished message.
pub trait MailTransport: Send + Sync {
    fn send(&self, message: &MailMessage) -> Result<PathBuf, EmailError>;
}

/// Drops each message into its own directory for an external mailer:
/// `message.json`, `body.html` and copies of the attachments.
#[derive(Debug, Clone)]
pub struct OutboxTransport {
    dir: PathBuf,
}

impl OutboxTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> EmailError + '_ {
    move |source| EmailError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl MailTransport for OutboxTransport {
    fn send(&self, message: &MailMessage) -> Result<PathBuf, EmailError> {
        let name = format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), Uuid::new_v4().simple());
        let dir = self.dir.join(name);
        std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let body = dir.join("body.html");
        std::fs::write(&body, &message.html_body).map_err(io_error(&body))?;

        let mut copied = Vec::new();
        for attachment in &message.attachments {
            let Some(file_name) = attachment.file_name() else {
                continue;
            };
            let target = dir.join(file_name);
            std::fs::copy(attachment, &target).map_err(io_error(attachment))?;
            copied.push(target);
        }

        let headers = MailMessage {
            attachments: copied,
            ..message.clone()
        };
        let path = dir.join("message.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&headers)?).map_err(io_error(&path))?;
        Ok(dir)
    }
}

fn parquet_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
        .collect();
    files.sort();
    files
}

/// Returns the transport's location for the message, or `None` when no
/// recipients are configured.
pub async fn email_cycle(
    config: &Config,
    store: &Store,
    transport: &dyn MailTransport,
    cancel: CancelToken,
) -> Result<Option<PathBuf>> {
    let settings = &config.email;
    if settings.to.is_empty() {
        warn!("email has no recipients, skipping");
        return Ok(None);
    }

    let now = Local::now();
    let lookup = Lookup::new()
        .literal("date", now.format("%Y-%m-%d").to_string())
        .literal("time", now.format("%H:%M:%S").to_string());
    let subject = Expander::new(config)
        .with(&lookup)
        .text(&settings.subject)
        .context("expanding email subject")?;

    let selection = ReportSelection::parse(&settings.body_reports)
        .with_context(|| format!("parsing body reports {:?}", settings.body_reports))?;
    let executor = ReportExecutor::new(config, cancel);
    let mut body = HtmlSink::detached().with_title(subject.clone());

    let lists_path = config.pipeline.lists_path();
    let lists = ListStore::new(&lists_path)
        .load()
        .with_context(|| format!("loading lists from {}", lists_path.display()))?;
    let builder = DerivedTableBuilder::new(config, lists)?;

    let mut tx = store.begin().await.context("starting email transaction")?;
    builder.rebuild(&mut tx, None).await?;
    executor
        .run(&mut tx, &mut body, &selection)
        .await
        .context("building email body")?;

    let mut attachments = Vec::new();
    if settings.attach_workbook {
        let dir = config.pipeline.output_path().join("email");
        let mut workbook = ParquetSink::new(&dir);
        executor
            .run(&mut tx, &mut workbook, &ReportSelection::all())
            .await
            .context("building email attachments")?;
        workbook.render().context("writing email attachments")?;
        attachments = parquet_files(&dir);
    }
    tx.commit().await.context("finishing email transaction")?;

    let message = MailMessage {
        to: settings.to.clone(),
        from: settings.from.clone(),
        subject,
        html_body: body.document().context("rendering email body")?,
        attachments,
    };
    let location = transport.send(&message).context("sending email")?;
    info!(
        to = message.to.len(),
        attachments = message.attachments.len(),
        location = %location.display(),
        "email queued"
    );
    Ok(Some(location))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::seeded_store;
    use tempfile::tempdir;
    use udr_storage::query_column;

    #[tokio::test]
    async fn cycle_derives_then_writes_body_and_attachments_to_the_outbox() {
        let dir = tempdir().expect("tempdir");
        let extra = format!(
            "email:\n  to: [ops@example.com]\n  subject: Usage ${{date}}\n  outbox: {}/outbox\n",
            dir.path().display()
        );
        let (config, store) = seeded_store(dir.path(), &extra).await;

        let transport = OutboxTransport::new(config.email.outbox_path());
        let location = email_cycle(&config, &store, &transport, CancelToken::never())
            .await
            .expect("email")
            .expect("queued");

        let body = std::fs::read_to_string(location.join("body.html")).expect("body");
        assert!(body.contains("Summary"));
        assert!(body.contains("Gateways"));
        assert!(!body.contains("Probes</h2>"));

        let headers: serde_json::Value =
            serde_json::from_slice(&std::fs::read(location.join("message.json")).expect("json"))
                .expect("parse");
        let subject = headers["subject"].as_str().expect("subject");
        assert!(subject.starts_with("Usage 20"), "{subject}");
        assert!(location.join("summary.parquet").exists());

        let mut conn = store.pool().acquire().await.expect("conn");
        let probes = query_column(
            &mut conn,
            "SELECT probeName FROM active_probes ORDER BY probeName",
            &[],
        )
        .await
        .expect("derived probes");
        assert_eq!(probes, vec!["host1", "host2"]);
    }

    #[tokio::test]
    async fn no_recipients_means_no_message() {
        let dir = tempdir().expect("tempdir");
        let (config, store) = seeded_store(dir.path(), "").await;
        let transport = OutboxTransport::new(dir.path().join("outbox"));
        let sent = email_cycle(&config, &store, &transport, CancelToken::never())
            .await
            .expect("email");
        assert!(sent.is_none());
        assert!(!dir.path().join("outbox").exists());
    }
}
