//! Rebuilds every table reports read from: filter, grouping, ignore and
//! plugin tables, the active/inactive fact views and the report tables.

use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info, warn};
use udr_core::config::{expand_home, FilterTable, GroupTable, IgnoreTable, PluginTable};
use udr_core::expand::{ignore_lookup, sql_quote};
use udr_core::{
    iso_time, table_statement, Category, Config, Expander, ListKind, Lookup, SqlParam,
};
use udr_storage::{exec, exec_batch, FetchSettings, LicenceFetcher};

use crate::lists::Lists;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    pub invalidated: u64,
    pub filters: usize,
    pub groups: usize,
    pub ignored: usize,
    pub plugins: usize,
    pub derived_tables: usize,
}

pub struct DerivedTableBuilder<'a> {
    config: &'a Config,
    lists: Lists,
    fetcher: Option<LicenceFetcher>,
}

fn is_url(source: &str) -> bool {
    let lower = source.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

impl<'a> DerivedTableBuilder<'a> {
    pub fn new(config: &'a Config, lists: Lists) -> Result<Self> {
        let wants_http = config
            .ignore
            .values()
            .any(|i| i.source.as_deref().is_some_and(is_url));
        let fetcher = if wants_http {
            Some(
                LicenceFetcher::new(FetchSettings {
                    timeout: config.pipeline.http_timeout,
                    skip_verify: config.pipeline.http_skip_verify,
                    ..FetchSettings::default()
                })
                .context("building HTTP client for ignore lists")?,
            )
        } else {
            None
        };
        Ok(Self {
            config,
            lists,
            fetcher,
        })
    }

    /// `valid_sources` are exempt from the age-based validity update; pass
    /// the labels loaded in the preceding ingest. `None` exempts nothing.
    pub async fn rebuild(
        &self,
        conn: &mut SqliteConnection,
        valid_sources: Option<&[String]>,
    ) -> Result<RebuildSummary> {
        let started = Instant::now();
        let mut summary = RebuildSummary::default();

        self.run_post_insert(conn).await?;
        summary.invalidated = self.update_valid(conn, valid_sources).await?;

        for kind in [ListKind::Include, ListKind::Exclude] {
            for (category, table) in self.config.filters.tables(kind) {
                self.create(conn, &table.table, &table.create).await?;
                summary.filters += self.load_filters(conn, kind, *category, table).await?;
            }
        }
        for (category, table) in &self.config.filters.groups {
            self.create(conn, &table.table, &table.create).await?;
            summary.groups += self.load_groups(conn, *category, table).await?;
        }
        for (name, ignore) in &self.config.ignore {
            self.create(conn, &ignore.table, &ignore.create).await?;
            summary.ignored += self.load_ignore(conn, name, ignore).await?;
        }

        let ignores = ignore_lookup(self.config);
        for (_, table) in self.config.db.facts.iter() {
            if let Some(sql) = &table.create_active {
                self.derive(conn, &ignores, &table.table, sql).await?;
                summary.derived_tables += 1;
            }
        }
        for (_, table) in self.config.db.facts.iter() {
            if let Some(sql) = &table.create_inactive {
                self.derive(conn, &ignores, &table.table, sql).await?;
                summary.derived_tables += 1;
            }
        }

        for (name, plugin) in &self.config.plugins {
            self.create(conn, &plugin.table, &plugin.create).await?;
            summary.plugins += self.load_plugins(conn, name, plugin).await?;
        }

        for statement in &self.config.db.report_tables {
            self.derive(conn, &ignores, &statement.table, &statement.create)
                .await?;
            summary.derived_tables += 1;
        }

        if let Some(update) = &self.config.db.reporting_update {
            let sql = Expander::new(self.config)
                .sql(update)
                .context("expanding db.reporting-update")?;
            exec_batch(conn, &sql)
                .await
                .context("running db.reporting-update")?;
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            invalidated = summary.invalidated,
            filters = summary.filters,
            groups = summary.groups,
            derived = summary.derived_tables,
            "reporting tables rebuilt"
        );
        Ok(summary)
    }

    async fn run_post_insert(&self, conn: &mut SqliteConnection) -> Result<()> {
        for (kind, table) in self.config.db.facts.iter() {
            let Some(template) = &table.post_insert else {
                continue;
            };
            let sql = table_statement(self.config, &table.table, template)
                .with_context(|| format!("expanding post-insert for {}", kind.as_str()))?;
            exec_batch(conn, &sql)
                .await
                .with_context(|| format!("post-insert for {}", table.table))?;
            debug!(table = %table.table, "post-insert hook ran");
        }
        Ok(())
    }

    async fn update_valid(
        &self,
        conn: &mut SqliteConnection,
        valid_sources: Option<&[String]>,
    ) -> Result<u64> {
        let sources = &self.config.db.sources;
        let exempt = valid_sources
            .unwrap_or_default()
            .iter()
            .map(|s| sql_quote(s))
            .collect::<Vec<_>>()
            .join(", ");
        let lookup = Lookup::new()
            .fragment("table", sources.table.as_str())
            .fragment("sources", exempt);
        let sql = Expander::new(self.config)
            .with(&lookup)
            .sql(&sources.update_valid)
            .context("expanding db.sources.update-valid")?;

        let now = Utc::now();
        let stale_after = self.config.pipeline.stale_after;
        let oldest: DateTime<Utc> = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::UNIX_EPOCH);
        let params = [
            SqlParam::Int(i64::try_from(stale_after.as_secs()).unwrap_or(i64::MAX)),
            SqlParam::from(iso_time(oldest)),
        ];
        let updated = exec(conn, &sql, &params)
            .await
            .context("updating source validity")?;
        debug!(updated, oldest = %iso_time(oldest), "source validity updated");
        Ok(updated)
    }

    async fn create(&self, conn: &mut SqliteConnection, table: &str, template: &str) -> Result<()> {
        let sql = table_statement(self.config, table, template)
            .with_context(|| format!("expanding create for {table}"))?;
        exec_batch(conn, &sql)
            .await
            .with_context(|| format!("creating {table}"))
    }

    async fn derive(
        &self,
        conn: &mut SqliteConnection,
        ignores: &Lookup,
        table: &str,
        template: &str,
    ) -> Result<()> {
        let own = Lookup::new().fragment("table", table);
        let sql = Expander::new(self.config)
            .with(ignores)
            .with(&own)
            .sql(template)
            .with_context(|| format!("expanding derived statement for {table}"))?;
        exec_batch(conn, &sql)
            .await
            .with_context(|| format!("deriving from {table}"))
    }

    /// Side-file entries win; without any, the configured defaults load
    /// with origin `default`.
    async fn load_filters(
        &self,
        conn: &mut SqliteConnection,
        kind: ListKind,
        category: Category,
        table: &FilterTable,
    ) -> Result<usize> {
        exec(conn, &format!("DELETE FROM {}", table.table), &[])
            .await
            .with_context(|| format!("clearing {}", table.table))?;
        let insert = table_statement(self.config, &table.table, &table.insert)?;

        let entries = self.lists.filters(kind, category);
        let rows: Vec<[SqlParam; 5]> = if entries.is_empty() {
            table
                .default
                .iter()
                .map(|name| {
                    [
                        SqlParam::from(name.as_str()),
                        SqlParam::from(""),
                        SqlParam::from("default"),
                        SqlParam::from(""),
                        SqlParam::from(""),
                    ]
                })
                .collect()
        } else {
            entries
                .iter()
                .map(|e| {
                    [
                        SqlParam::from(e.name.as_str()),
                        SqlParam::from(e.user.as_str()),
                        SqlParam::from(e.origin.as_str()),
                        SqlParam::from(e.comment.as_str()),
                        SqlParam::from(iso_time(e.timestamp)),
                    ]
                })
                .collect()
        };

        for params in &rows {
            exec(conn, &insert, params)
                .await
                .with_context(|| format!("loading {}", table.table))?;
        }
        debug!(kind = kind.as_str(), category = %category, rows = rows.len(), "filters loaded");
        Ok(rows.len())
    }

    async fn load_groups(
        &self,
        conn: &mut SqliteConnection,
        category: Category,
        table: &GroupTable,
    ) -> Result<usize> {
        exec(conn, &format!("DELETE FROM {}", table.table), &[])
            .await
            .with_context(|| format!("clearing {}", table.table))?;
        let insert = table_statement(self.config, &table.table, &table.insert)?;

        let groups = self.lists.groups(category);
        let mut rows: Vec<[SqlParam; 6]> = Vec::new();
        if groups.is_empty() {
            for (name, pattern) in default_groups(&table.default) {
                rows.push([
                    SqlParam::from(name),
                    SqlParam::from(pattern),
                    SqlParam::from(""),
                    SqlParam::from("default"),
                    SqlParam::from(""),
                    SqlParam::from(""),
                ]);
            }
        } else {
            for group in groups {
                for pattern in &group.patterns {
                    rows.push([
                        SqlParam::from(group.name.as_str()),
                        SqlParam::from(pattern.as_str()),
                        SqlParam::from(group.user.as_str()),
                        SqlParam::from(group.origin.as_str()),
                        SqlParam::from(group.comment.as_str()),
                        SqlParam::from(iso_time(group.timestamp)),
                    ]);
                }
            }
        }

        for params in &rows {
            exec(conn, &insert, params)
                .await
                .with_context(|| format!("loading {}", table.table))?;
        }
        Ok(rows.len())
    }

    /// One value per line from the configured source, falling back to the
    /// inline content when the source cannot be read.
    async fn load_ignore(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        ignore: &IgnoreTable,
    ) -> Result<usize> {
        let mut text = None;
        if let Some(source) = ignore.source.as_deref().filter(|s| !s.is_empty()) {
            match self.read_source(source).await {
                Ok(body) => text = Some(body),
                Err(err) => warn!(ignore = name, source, error = %err, "ignore source unreadable, using inline content"),
            }
        }
        let text = text.or_else(|| ignore.content.clone()).unwrap_or_default();

        exec(conn, &format!("DELETE FROM {}", ignore.table), &[])
            .await
            .with_context(|| format!("clearing {}", ignore.table))?;
        let insert = table_statement(self.config, &ignore.table, &ignore.insert)?;
        let values = single_column_values(&text);
        for value in &values {
            exec(conn, &insert, &[SqlParam::from(value.as_str())])
                .await
                .with_context(|| format!("loading {}", ignore.table))?;
        }
        debug!(ignore = name, rows = values.len(), "ignore list loaded");
        Ok(values.len())
    }

    async fn read_source(&self, source: &str) -> Result<String> {
        if is_url(source) {
            let fetcher = self
                .fetcher
                .as_ref()
                .context("no HTTP client for ignore source")?;
            let response = fetcher.fetch(source).await?;
            return Ok(String::from_utf8_lossy(&response.body).into_owned());
        }
        let path = expand_home(source);
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    async fn load_plugins(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        plugin: &PluginTable,
    ) -> Result<usize> {
        exec(conn, &format!("DELETE FROM {}", plugin.table), &[])
            .await
            .with_context(|| format!("clearing {}", plugin.table))?;
        let insert = table_statement(self.config, &plugin.table, &plugin.insert)?;
        for value in &plugin.values {
            exec(conn, &insert, &[SqlParam::from(value.as_str())])
                .await
                .with_context(|| format!("loading plugins.{name}"))?;
        }
        Ok(plugin.values.len())
    }
}

fn csv_lines(text: &str) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes())
}

/// `name,glob` lines; lines with fewer than two fields are skipped.
fn default_groups(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for record in csv_lines(text).records() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "skipping unreadable group line");
                continue;
            }
        };
        if record.len() < 2 || record[0].is_empty() || record[1].is_empty() {
            debug!(line = ?record, "skipping short group line");
            continue;
        }
        out.push((record[0].to_string(), record[1].to_string()));
    }
    out
}

fn single_column_values(text: &str) -> Vec<String> {
    csv_lines(text)
        .records()
        .filter_map(|record| record.ok())
        .filter_map(|record| record.get(0).map(str::to_string))
        .filter(|value| !value.is_empty())
        .collect()
}
