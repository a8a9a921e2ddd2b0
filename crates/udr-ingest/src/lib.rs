//! Ingestion of licence extracts, summaries and detail reports into the store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reqwest::Url;
use sqlx::sqlite::SqliteConnection;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use udr_core::config::expand_home;
use udr_core::{
    iso_time, table_statement, CancelToken, Config, ExpandError, FactKind, SourceKind,
    SourceRecord, SourceStatus, SqlParam,
};
use udr_storage::{
    exec, exec_batch, prepare, scalar_text, FetchError, FetchSettings, LicenceFetcher, StoreError,
};

pub mod detail;
pub mod extract;
pub mod summary;

pub use detail::{facts_for_row, load_details, parse_address, DetailColumns, DetailKind};
pub use extract::{extract_label, split_sections, ExtractSections};
pub use summary::{load_summary, parse_summary, LicenceSummary, TokenUsage};

pub const CRATE_NAME: &str = "udr-ingest";

pub const SUMMARY_PATH: &str = "licensing/licences.csv";
pub const DETAILS_PATH: &str = "licensing/all_licences.csv";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("cannot find section starting {0:?}")]
    MissingSection(&'static str),
    #[error("cannot locate end of section {0:?}")]
    UnterminatedSection(&'static str),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("line {line}: {message}")]
    Row { line: u64, message: String },
    #[error("missing column {0:?}")]
    MissingColumn(String),
    #[error("line {line}: unknown binary type {item:?}")]
    UnknownBinary { item: String, line: u64 },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error("preparing {table} statements: {source}")]
    Prepare {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
    #[error("invalid source url {url}: {message}")]
    Url { url: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn csv_reader(bytes: &[u8]) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(bytes)
}

#[derive(Debug, Clone)]
pub struct Statements {
    creates: Vec<(String, String)>,
    pub upsert_source: String,
    pub last_seen: String,
    pub licences: String,
    pub tokens: String,
    facts: HashMap<FactKind, String>,
}

impl Statements {
    pub fn from_config(config: &Config) -> Result<Self, IngestError> {
        let db = &config.db;
        let mut creates = vec![
            (
                db.sources.table.clone(),
                table_statement(config, &db.sources.table, &db.sources.create)?,
            ),
            (
                db.licences.table.clone(),
                table_statement(config, &db.licences.table, &db.licences.create)?,
            ),
            (
                db.tokens.table.clone(),
                table_statement(config, &db.tokens.table, &db.tokens.create)?,
            ),
        ];
        let mut facts = HashMap::new();
        for (kind, table) in db.facts.iter() {
            creates.push((
                table.table.clone(),
                table_statement(config, &table.table, &table.create)?,
            ));
            facts.insert(kind, table_statement(config, &table.table, &table.insert)?);
        }

        Ok(Self {
            creates,
            upsert_source: table_statement(config, &db.sources.table, &db.sources.upsert)?,
            last_seen: table_statement(config, &db.sources.table, &db.sources.last_seen)?,
            licences: table_statement(config, &db.licences.table, &db.licences.insert)?,
            tokens: table_statement(config, &db.tokens.table, &db.tokens.insert)?,
            facts,
        })
    }

    pub fn fact(&self, kind: FactKind) -> &str {
        self.facts.get(&kind).map(String::as_str).unwrap_or_default()
    }

    /// Create every target table, then compile every insert. Any failure
    /// here stops the pass.
    pub async fn prepare(&self, conn: &mut SqliteConnection) -> Result<(), IngestError> {
        for (table, create) in &self.creates {
            exec_batch(conn, create)
                .await
                .map_err(|source| IngestError::Prepare {
                    table: table.clone(),
                    source,
                })?;
        }
        let inserts = [
            ("sources", self.upsert_source.as_str()),
            ("sources", self.last_seen.as_str()),
            ("licences", self.licences.as_str()),
            ("tokens", self.tokens.as_str()),
        ]
        .into_iter()
        .chain(FactKind::ALL.iter().map(|k| (k.as_str(), self.fact(*k))));
        for (table, sql) in inserts {
            prepare(conn, sql)
                .await
                .map_err(|source| IngestError::Prepare {
                    table: table.to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Glob of three-section extract files.
    Extracts(String),
    /// A licence daemon base URL.
    Http(Url),
    /// Glob of plain summary or detail CSV files.
    Files(String),
}

impl Locator {
    pub fn from_source(source: &str) -> Result<Self, IngestError> {
        let lower = source.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let url = Url::parse(source).map_err(|err| IngestError::Url {
                url: source.to_string(),
                message: err.to_string(),
            })?;
            return Ok(Locator::Http(url));
        }
        Ok(Locator::Files(source.to_string()))
    }

    /// Extracts first, then sources, in configuration order.
    pub fn from_config(config: &Config) -> Result<Vec<Self>, IngestError> {
        let mut locators: Vec<Locator> = config
            .pipeline
            .extracts
            .iter()
            .map(|p| Locator::Extracts(p.clone()))
            .collect();
        for source in &config.pipeline.sources {
            locators.push(Locator::from_source(source)?);
        }
        Ok(locators)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedSource {
    pub record: SourceRecord,
    pub facts: usize,
    /// Unchanged since the last pass; nothing was loaded.
    pub skipped: bool,
}

impl IngestedSource {
    pub fn label(&self) -> &str {
        &self.record.label
    }
}

pub fn loaded_labels(sources: &[IngestedSource]) -> Vec<String> {
    sources
        .iter()
        .filter(|s| !s.skipped)
        .map(|s| s.record.label.clone())
        .collect()
}

pub struct Ingestor<'a> {
    config: &'a Config,
    statements: Statements,
    fetcher: Option<LicenceFetcher>,
    cancel: CancelToken,
    force: bool,
}

impl<'a> Ingestor<'a> {
    pub fn new(config: &'a Config, cancel: CancelToken) -> Result<Self, IngestError> {
        let wants_http = config.pipeline.sources.iter().any(|s| {
            let lower = s.to_ascii_lowercase();
            lower.starts_with("http://") || lower.starts_with("https://")
        });
        let fetcher = if wants_http {
            Some(LicenceFetcher::new(FetchSettings {
                timeout: config.pipeline.http_timeout,
                skip_verify: config.pipeline.http_skip_verify,
                ca_bundle: config.pipeline.http_ca_bundle.as_deref().map(expand_home),
                ..FetchSettings::default()
            })?)
        } else {
            None
        };
        Ok(Self {
            config,
            statements: Statements::from_config(config)?,
            fetcher,
            cancel,
            force: false,
        })
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn statements(&self) -> &Statements {
        &self.statements
    }

    pub async fn ingest_all(
        &self,
        conn: &mut SqliteConnection,
    ) -> Result<Vec<IngestedSource>, IngestError> {
        self.statements.prepare(conn).await?;
        let mut out = Vec::new();
        for locator in Locator::from_config(self.config)? {
            if self.cancel.is_cancelled() {
                info!("ingest cancelled");
                break;
            }
            out.extend(self.ingest(conn, &locator).await?);
        }
        let loaded = out.iter().filter(|s| !s.skipped).count();
        info!(sources = out.len(), loaded, "ingest complete");
        Ok(out)
    }

    pub async fn ingest(
        &self,
        conn: &mut SqliteConnection,
        locator: &Locator,
    ) -> Result<Vec<IngestedSource>, IngestError> {
        match locator {
            Locator::Extracts(pattern) => {
                self.ingest_files(conn, pattern, FileLayout::Extract).await
            }
            Locator::Files(pattern) => self.ingest_files(conn, pattern, FileLayout::Plain).await,
            Locator::Http(url) => {
                let span = info_span!("ingest_http", url = %url);
                Ok(vec![self.ingest_http(conn, url).instrument(span).await?])
            }
        }
    }

    fn is_fresh(&self, observed: DateTime<Utc>) -> bool {
        let stale_after = self.config.pipeline.stale_after;
        if stale_after.is_zero() {
            return true;
        }
        match (Utc::now() - observed).to_std() {
            Ok(age) => age <= stale_after,
            Err(_) => true,
        }
    }

    async fn upsert_source(
        &self,
        conn: &mut SqliteConnection,
        record: &SourceRecord,
    ) -> Result<(), IngestError> {
        let params = [
            SqlParam::from(record.label.as_str()),
            SqlParam::from(record.kind.as_str()),
            SqlParam::from(record.path.as_str()),
            SqlParam::from(iso_time(record.observed)),
            SqlParam::from(record.status.as_db_text()),
            SqlParam::Bool(record.valid),
        ];
        exec(conn, &self.statements.upsert_source, &params).await?;
        Ok(())
    }

    async fn unchanged(
        &self,
        conn: &mut SqliteConnection,
        label: &str,
        observed: DateTime<Utc>,
    ) -> Result<bool, IngestError> {
        if self.force {
            return Ok(false);
        }
        let last = scalar_text(conn, &self.statements.last_seen, &[label.into()]).await?;
        Ok(last.as_deref() == Some(iso_time(observed).as_str()))
    }

    fn record(
        &self,
        label: String,
        kind: SourceKind,
        path: String,
        observed: DateTime<Utc>,
        status: SourceStatus,
    ) -> SourceRecord {
        let valid = status == SourceStatus::Ok && self.is_fresh(observed);
        SourceRecord {
            label,
            kind,
            path,
            observed,
            valid,
            status,
        }
    }

    async fn ingest_files(
        &self,
        conn: &mut SqliteConnection,
        pattern: &str,
        layout: FileLayout,
    ) -> Result<Vec<IngestedSource>, IngestError> {
        let pattern = expand_home(pattern).to_string_lossy().into_owned();
        debug!(pattern, "looking for files");
        let mut matches: Vec<PathBuf> = glob::glob(&pattern)?
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(error = %err, "unreadable glob match");
                    None
                }
            })
            .collect();
        matches.sort();
        if matches.is_empty() {
            warn!(pattern, "no files match");
        }

        let mut out = Vec::new();
        for path in matches {
            if self.cancel.is_cancelled() {
                info!("ingest cancelled between files");
                break;
            }
            let span = info_span!("ingest_file", path = %path.display());
            let result = match layout {
                FileLayout::Extract => self.ingest_extract(conn, &path).instrument(span).await?,
                FileLayout::Plain => Some(self.ingest_plain(conn, &path).instrument(span).await?),
            };
            out.extend(result);
        }
        Ok(out)
    }

    async fn ingest_extract(
        &self,
        conn: &mut SqliteConnection,
        path: &Path,
    ) -> Result<Option<IngestedSource>, IngestError> {
        let (observed, bytes) = match read_file(path).await {
            Ok(read) => read,
            Err(err) => {
                error!(error = %err, "cannot read extract");
                return Ok(None);
            }
        };
        let sections = match split_sections(&bytes) {
            Ok(sections) => sections,
            Err(err) => {
                error!(error = %err, "not a licence extract");
                return Ok(None);
            }
        };
        let licence = match sections.licence() {
            Ok(licence) => licence,
            Err(err) => {
                error!(error = %err, "unreadable extract summary");
                return Ok(None);
            }
        };
        let Some(label) = extract_label(&licence) else {
            warn!("extract has no licence name or expiry, skipping");
            return Ok(None);
        };

        let path_text = display_path(path);
        if self.unchanged(conn, &label, observed).await? {
            debug!(label, "unchanged since last pass");
            let record = self.record(label, SourceKind::Extract, path_text, observed, SourceStatus::Ok);
            return Ok(Some(IngestedSource {
                record,
                facts: 0,
                skipped: true,
            }));
        }

        let time = iso_time(observed);
        load_summary(conn, &self.statements, &licence, &label, &time).await?;
        let (status, facts) =
            match load_details(conn, &self.statements, sections.details, &label, &time).await {
                Ok(counts) => (SourceStatus::Ok, counts.total()),
                Err(err) => {
                    error!(label, error = %err, "extract details failed");
                    (SourceStatus::Error(err.to_string()), 0)
                }
            };

        let record = self.record(label, SourceKind::Extract, path_text, observed, status);
        self.upsert_source(conn, &record).await?;
        info!(label = %record.label, facts, valid = record.valid, "loaded extract");
        Ok(Some(IngestedSource {
            record,
            facts,
            skipped: false,
        }))
    }

    async fn ingest_plain(
        &self,
        conn: &mut SqliteConnection,
        path: &Path,
    ) -> Result<IngestedSource, IngestError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (label, is_summary) = match stem.strip_suffix("_summary") {
            Some(base) => (format!("file:{base}"), true),
            None => (format!("file:{stem}"), false),
        };
        let path_text = display_path(path);

        let (observed, bytes) = match read_file(path).await {
            Ok(read) => read,
            Err(err) => {
                error!(error = %err, "cannot read source file");
                let record = self.record(
                    label,
                    SourceKind::File,
                    path_text,
                    Utc::now(),
                    SourceStatus::Error(err.to_string()),
                );
                self.upsert_source(conn, &record).await?;
                return Ok(IngestedSource {
                    record,
                    facts: 0,
                    skipped: false,
                });
            }
        };

        if self.unchanged(conn, &label, observed).await? {
            debug!(label, "unchanged since last pass");
            let record = self.record(label, SourceKind::File, path_text, observed, SourceStatus::Ok);
            return Ok(IngestedSource {
                record,
                facts: 0,
                skipped: true,
            });
        }

        let time = iso_time(observed);
        let (status, facts) = if is_summary {
            match parse_summary(&bytes) {
                Ok(licence) => {
                    let tokens = load_summary(conn, &self.statements, &licence, &label, &time).await?;
                    (SourceStatus::Ok, tokens)
                }
                Err(err) => (SourceStatus::Error(err.to_string()), 0),
            }
        } else {
            match load_details(conn, &self.statements, &bytes, &label, &time).await {
                Ok(counts) => (SourceStatus::Ok, counts.total()),
                Err(err) => (SourceStatus::Error(err.to_string()), 0),
            }
        };
        if let SourceStatus::Error(message) = &status {
            error!(label, error = %message, "source file failed");
        }

        let record = self.record(label, SourceKind::File, path_text, observed, status);
        self.upsert_source(conn, &record).await?;
        info!(label = %record.label, facts, valid = record.valid, "loaded file");
        Ok(IngestedSource {
            record,
            facts,
            skipped: false,
        })
    }

    async fn ingest_http(
        &self,
        conn: &mut SqliteConnection,
        url: &Url,
    ) -> Result<IngestedSource, IngestError> {
        let kind = if url.scheme() == "https" {
            SourceKind::Https
        } else {
            SourceKind::Http
        };
        let label = format!("{}:{}", url.scheme(), url.host_str().unwrap_or_default());
        let base = url.as_str().trim_end_matches('/').to_string();

        match self.load_http(conn, &base, &label).await {
            Ok((observed, facts)) => {
                let record = self.record(label, kind, base, observed, SourceStatus::Ok);
                self.upsert_source(conn, &record).await?;
                info!(label = %record.label, facts, valid = record.valid, "loaded licence daemon");
                Ok(IngestedSource {
                    record,
                    facts,
                    skipped: false,
                })
            }
            Err(IngestError::Store(err)) => Err(IngestError::Store(err)),
            Err(err) => {
                error!(label, error = %err, "licence daemon fetch failed");
                let record = self.record(
                    label,
                    kind,
                    base,
                    Utc::now(),
                    SourceStatus::Error(err.to_string()),
                );
                self.upsert_source(conn, &record).await?;
                Ok(IngestedSource {
                    record,
                    facts: 0,
                    skipped: false,
                })
            }
        }
    }

    /// Summary then details; the observed time is the latest `Last-Modified`
    /// seen, else now.
    async fn load_http(
        &self,
        conn: &mut SqliteConnection,
        base: &str,
        label: &str,
    ) -> Result<(DateTime<Utc>, usize), IngestError> {
        let Some(fetcher) = &self.fetcher else {
            return Err(IngestError::Url {
                url: base.to_string(),
                message: "no HTTP client configured".to_string(),
            });
        };

        let summary = fetcher.fetch(&format!("{base}/{SUMMARY_PATH}")).await?;
        let mut observed = summary.last_modified.unwrap_or_else(Utc::now);
        let licence = parse_summary(&summary.body)?;
        load_summary(conn, &self.statements, &licence, label, &iso_time(observed)).await?;

        let details = fetcher.fetch(&format!("{base}/{DETAILS_PATH}")).await?;
        if let Some(modified) = details.last_modified {
            observed = modified;
        }
        let counts =
            load_details(conn, &self.statements, &details.body, label, &iso_time(observed)).await?;
        Ok((observed, counts.total()))
    }
}

#[derive(Debug, Clone, Copy)]
enum FileLayout {
    Extract,
    Plain,
}

async fn read_file(path: &Path) -> Result<(DateTime<Utc>, Vec<u8>), IngestError> {
    let io = |source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let meta = tokio::fs::metadata(path).await.map_err(io)?;
    if meta.is_dir() {
        return Err(io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "is a directory",
        )));
    }
    let modified: DateTime<Utc> = meta.modified().map_err(io)?.into();
    let bytes = tokio::fs::read(path).await.map_err(io)?;
    Ok((modified, bytes))
}

fn display_path(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use udr_storage::{query_column, scalar_i64, Store};

    fn config_for(dir: &Path, extra: &str) -> Config {
        Config::from_yaml_str(&format!(
            "pipeline:\n  extracts: [\"{}/*.lic\"]\n  sources: [\"{}/*.csv\"]\n  stale-after: 0\n{extra}",
            dir.display(),
            dir.display()
        ))
        .expect("config")
    }

    async fn count(store: &Store, sql: &str) -> i64 {
        let mut conn = store.pool().acquire().await.expect("conn");
        scalar_i64(&mut conn, sql).await.expect("count")
    }

    #[tokio::test]
    async fn extract_loads_every_fact_kind_and_skips_when_unchanged() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("acme.lic"), extract::tests::sample_extract()).expect("write");
        let config = config_for(dir.path(), "");
        let store = Store::open(dir.path().join("udr.db"), None).await.expect("open");

        let ingestor = Ingestor::new(&config, CancelToken::never()).expect("ingestor");
        let mut tx = store.begin().await.expect("begin");
        let first = ingestor.ingest_all(&mut tx).await.expect("ingest");
        tx.commit().await.expect("commit");

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].label(), "extract:ACME Prod_2026-12-31");
        assert_eq!(first[0].facts, 6);
        assert!(first[0].record.valid);
        for table in ["probes", "samplers", "ca_samplers", "gw_samplers", "gw_components", "gateways", "licences"] {
            assert_eq!(count(&store, &format!("SELECT COUNT(*) FROM {table}")).await, 1, "{table}");
        }
        assert_eq!(count(&store, "SELECT COUNT(*) FROM tokens").await, 2);
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM sources WHERE status = 'OK' AND valid = 1").await,
            1
        );

        let mut tx = store.begin().await.expect("begin");
        let second = ingestor.ingest_all(&mut tx).await.expect("ingest");
        tx.commit().await.expect("commit");
        assert!(second[0].skipped);
        assert!(loaded_labels(&second).is_empty());
        assert_eq!(count(&store, "SELECT COUNT(*) FROM samplers").await, 1);
    }

    #[tokio::test]
    async fn bad_detail_row_marks_source_as_error() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("probes.csv"),
            "Req Number,ParentRequestingComponent,RequestingComponent,Component,Item,Description,Number\n\
1,gateway:GW1,gateway:GW1,plugin,cpu,itrsrh1:7036 [abcd],1\n\
2,gateway:GW1,gateway:GW1,binary,licd,itrsrh1:7036 [abcd],1\n\
3,gateway:GW1,gateway:GW1,plugin,disk,itrsrh1:7036 [abcd],1\n",
        )
        .expect("write");
        std::fs::write(
            dir.path().join("acme_summary.csv"),
            "licenceName,ACME\nexpiry,01 March 2027\nmode,Normal\nGroup,Token,Total,Used,Free\nOverall,server,10,4,6\n",
        )
        .expect("write");
        let config = config_for(dir.path(), "");
        let store = Store::open(dir.path().join("udr.db"), None).await.expect("open");

        let ingestor = Ingestor::new(&config, CancelToken::never()).expect("ingestor");
        let mut tx = store.begin().await.expect("begin");
        let sources = ingestor.ingest_all(&mut tx).await.expect("ingest");
        tx.commit().await.expect("commit");

        let labels: Vec<&str> = sources.iter().map(IngestedSource::label).collect();
        assert_eq!(labels, vec!["file:acme", "file:probes"]);

        let mut conn = store.pool().acquire().await.expect("conn");
        let status = query_column(
            &mut conn,
            "SELECT status || '/' || valid FROM sources ORDER BY source",
            &[],
        )
        .await
        .expect("status");
        assert_eq!(status[0], "OK/1");
        assert!(status[1].starts_with("ERROR: line 3"), "{}", status[1]);
        assert!(status[1].ends_with("/0"));
        drop(conn);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM samplers").await, 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM tokens").await, 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_any_file() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("acme.lic"), extract::tests::sample_extract()).expect("write");
        let config = config_for(dir.path(), "");
        let store = Store::open(dir.path().join("udr.db"), None).await.expect("open");
        let (handle, token) = udr_core::cancel_pair();
        handle.cancel();

        let ingestor = Ingestor::new(&config, token).expect("ingestor");
        let mut tx = store.begin().await.expect("begin");
        let sources = ingestor.ingest_all(&mut tx).await.expect("ingest");
        tx.commit().await.expect("commit");
        assert!(sources.is_empty());
    }

    #[test]
    fn locators_classify_sources() {
        assert!(matches!(
            Locator::from_source("https://licd.example.com:7041").expect("url"),
            Locator::Http(_)
        ));
        assert_eq!(
            Locator::from_source("~/licd/*.csv").expect("glob"),
            Locator::Files("~/licd/*.csv".into())
        );
    }
}
