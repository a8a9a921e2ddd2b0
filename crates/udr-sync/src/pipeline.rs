//! One pipeline run: ingest commits in its own transaction, then derivation
//! and every sink's reports share a second one.

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteConnection;
use tracing::{error, info, info_span, warn, Instrument};
use udr_core::{CancelToken, Config, ReportSelection, Reporter};
use udr_ingest::{loaded_labels, IngestedSource, Ingestor};
use udr_render::{sink_for, OutputFormat};
use udr_storage::{ensure_schema, record_version, Store};

use crate::derive::{DerivedTableBuilder, RebuildSummary};
use crate::lists::ListStore;
use crate::report::{ReportExecutor, RunSummary};

pub async fn open_store(config: &Config) -> Result<Store> {
    let path = config.db.path();
    let store = Store::open(&path, config.db.on_open.as_deref())
        .await
        .with_context(|| format!("opening database {}", path.display()))?;
    let outcome = ensure_schema(&store, &config.db.schema_updates)
        .await
        .context("applying schema updates")?;
    if !outcome.applied.is_empty() {
        info!(from = outcome.from, to = outcome.to, "schema updated");
    }
    record_version(&store, config.db.version.as_ref(), env!("CARGO_PKG_VERSION")).await;
    Ok(store)
}

/// The sinks named by `pipeline.outputs`, writing under the output directory.
pub fn configured_sinks(config: &Config) -> Result<Vec<Box<dyn Reporter>>> {
    let dir = config.pipeline.output_path();
    config
        .pipeline
        .outputs
        .iter()
        .map(|name| {
            let format = OutputFormat::from_str(name)
                .with_context(|| format!("unknown output format {name:?}"))?;
            sink_for(format, None, &dir).with_context(|| format!("creating {format} output"))
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reload sources whose modification time has not changed.
    pub force: bool,
    pub scramble: bool,
    /// Stop after the ingest transaction commits.
    pub ingest_only: bool,
    pub selection: ReportSelection,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub sources: Vec<IngestedSource>,
    pub rebuild: Option<RebuildSummary>,
    pub reports: RunSummary,
}

async fn publish_to(
    executor: &ReportExecutor<'_>,
    conn: &mut SqliteConnection,
    sink: &mut dyn Reporter,
    selection: &ReportSelection,
) -> Result<RunSummary> {
    let kind = sink.kind().as_str();
    let published = async {
        let summary = executor
            .run(conn, sink, selection)
            .await
            .with_context(|| format!("publishing reports to the {kind} sink"))?;
        sink.render()
            .with_context(|| format!("rendering the {kind} sink"))?;
        Ok::<_, anyhow::Error>(summary)
    }
    .await;
    let closed = sink
        .close()
        .with_context(|| format!("closing the {kind} sink"));
    let summary = published?;
    closed?;
    Ok(summary)
}

pub struct Pipeline<'a> {
    config: &'a Config,
    store: &'a Store,
    cancel: CancelToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, store: &'a Store, cancel: CancelToken) -> Self {
        Self {
            config,
            store,
            cancel,
        }
    }

    pub async fn ingest(&self, force: bool) -> Result<Vec<IngestedSource>> {
        let ingestor = Ingestor::new(self.config, self.cancel.clone())
            .context("preparing ingest")?
            .force(force);
        let mut tx = self.store.begin().await.context("starting ingest transaction")?;
        let sources = ingestor
            .ingest_all(&mut tx)
            .await
            .context("ingesting sources")?;
        tx.commit().await.context("committing ingest")?;
        Ok(sources)
    }

    /// A failing sink does not stop the others. The rebuilt tables commit
    /// either way and the first sink error is returned afterwards.
    pub async fn derive_and_report(
        &self,
        loaded: Option<&[String]>,
        sinks: &mut [Box<dyn Reporter>],
        options: &RunOptions,
    ) -> Result<(RebuildSummary, RunSummary)> {
        let lists_path = self.config.pipeline.lists_path();
        let lists = ListStore::new(&lists_path)
            .load()
            .with_context(|| format!("loading lists from {}", lists_path.display()))?;
        let builder = DerivedTableBuilder::new(self.config, lists)?;

        let mut tx = self.store.begin().await.context("starting report transaction")?;
        let rebuild = builder.rebuild(&mut tx, loaded).await?;

        let executor =
            ReportExecutor::new(self.config, self.cancel.clone()).scramble(options.scramble);
        let mut total = RunSummary::default();
        let mut first_error = None;
        for sink in sinks.iter_mut() {
            if self.cancel.is_cancelled() {
                warn!("run cancelled before every sink was published");
                break;
            }
            match publish_to(&executor, &mut tx, sink.as_mut(), &options.selection).await {
                Ok(summary) => {
                    total.published += summary.published;
                    total.removed += summary.removed;
                    total.failed.extend(summary.failed);
                }
                Err(err) => {
                    error!(sink = sink.kind().as_str(), error = ?err, "sink failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        tx.commit().await.context("committing report transaction")?;
        match first_error {
            Some(err) => Err(err),
            None => Ok((rebuild, total)),
        }
    }

    pub async fn run(
        &self,
        options: &RunOptions,
        sinks: &mut [Box<dyn Reporter>],
    ) -> Result<RunOutcome> {
        let span = info_span!("run", ingest_only = options.ingest_only);
        async move {
            let sources = self.ingest(options.force).await?;
            let mut outcome = RunOutcome {
                sources,
                ..RunOutcome::default()
            };
            if options.ingest_only {
                return Ok(outcome);
            }
            if self.cancel.is_cancelled() {
                info!("run cancelled after ingest");
                return Ok(outcome);
            }

            let loaded = loaded_labels(&outcome.sources);
            let (rebuild, reports) = self
                .derive_and_report(Some(&loaded), sinks, options)
                .await?;
            info!(
                sources = outcome.sources.len(),
                loaded = loaded.len(),
                published = reports.published,
                failed = reports.failed.len(),
                "run complete"
            );
            outcome.rebuild = Some(rebuild);
            outcome.reports = reports;
            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{config_for, RecordingSink};
    use tempfile::tempdir;
    use udr_core::SinkKind;
    use udr_storage::query_column;

    #[tokio::test]
    async fn run_ingests_then_publishes_to_every_sink() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("probes.csv"),
            "Req Number,ParentRequestingComponent,RequestingComponent,Component,Item,Description,Number\n\
1,gateway:GW1,gateway:GW1,plugin,cpu,itrsrh1:7036 [abcd],1\n\
2,gateway:GW1,gateway:GW1,binary,netprobe,itrsrh1:7036 [abcd],1\n",
        )
        .expect("write");
        let config = config_for(dir.path(), "");
        let store = open_store(&config).await.expect("store");
        let pipeline = Pipeline::new(&config, &store, CancelToken::never());

        let mut sinks: Vec<Box<dyn Reporter>> = vec![
            Box::new(RecordingSink::new(SinkKind::Text)),
            Box::new(RecordingSink::new(SinkKind::Workbook)),
        ];
        let options = RunOptions {
            selection: ReportSelection::parse("summary,probes").expect("selection"),
            ..RunOptions::default()
        };
        let outcome = pipeline.run(&options, &mut sinks).await.expect("run");

        assert_eq!(outcome.sources.len(), 1);
        assert_eq!(outcome.reports.published, 4);
        assert!(outcome.reports.failed.is_empty());
        let mut conn = store.pool().acquire().await.expect("conn");
        let probes = query_column(&mut conn, "SELECT probeName FROM active_probes", &[])
            .await
            .expect("probes");
        assert_eq!(probes, vec!["itrsrh1"]);
    }

    #[tokio::test]
    async fn ingest_only_leaves_derived_tables_alone() {
        let dir = tempdir().expect("tempdir");
        let config = config_for(dir.path(), "");
        let store = open_store(&config).await.expect("store");
        let pipeline = Pipeline::new(&config, &store, CancelToken::never());
        let options = RunOptions {
            ingest_only: true,
            ..RunOptions::default()
        };
        let outcome = pipeline.run(&options, &mut []).await.expect("run");
        assert!(outcome.rebuild.is_none());

        let mut conn = store.pool().acquire().await.expect("conn");
        let tables = query_column(
            &mut conn,
            "SELECT name FROM sqlite_master WHERE name = 'active_probes'",
            &[],
        )
        .await
        .expect("tables");
        assert!(tables.is_empty());
    }

    #[tokio::test]
    async fn failing_sink_still_commits_derived_tables() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("probes.csv"),
            "Req Number,ParentRequestingComponent,RequestingComponent,Component,Item,Description,Number\n\
1,gateway:GW1,gateway:GW1,binary,netprobe,itrsrh1:7036 [abcd],1\n",
        )
        .expect("write");
        let config = config_for(dir.path(), "");
        let store = open_store(&config).await.expect("store");
        let pipeline = Pipeline::new(&config, &store, CancelToken::never());

        let mut sinks: Vec<Box<dyn Reporter>> = vec![
            Box::new(RecordingSink::new(SinkKind::Workbook).failing_render()),
            Box::new(RecordingSink::new(SinkKind::Text)),
        ];
        let err = pipeline
            .run(&RunOptions::default(), &mut sinks)
            .await
            .expect_err("sink failure surfaces");
        assert!(format!("{err:#}").contains("disk full"), "{err:#}");

        let mut conn = store.pool().acquire().await.expect("conn");
        let probes = query_column(&mut conn, "SELECT probeName FROM active_probes", &[])
            .await
            .expect("probes");
        assert_eq!(probes, vec!["itrsrh1"]);
    }

    #[test]
    fn configured_outputs_build_sinks() {
        let dir = tempdir().expect("tempdir");
        let config = config_for(dir.path(), "");
        let sinks = configured_sinks(&config).expect("sinks");
        let kinds: Vec<SinkKind> = sinks.iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, vec![SinkKind::Workbook, SinkKind::Html]);

        let mut config = config;
        config.pipeline.outputs = vec!["xlsx".to_string()];
        assert!(configured_sinks(&config).is_err());
    }
}
