//! Resolves report definitions into result tables and hands them to a sink.

use std::collections::BTreeMap;

use chrono::Local;
use sqlx::sqlite::SqliteConnection;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use udr_core::{
    scramble_columns, CancelToken, Config, ExpandError, Expander, Headlines, Lookup, Report,
    ReportDefinition, ReportSelection, ReportType, Reporter, Selected, SinkError, SinkKind, Table,
};
use udr_storage::{query_column, query_headlines, query_to_table, scalar_text, StoreError};

const SCRAMBLED: &str = "********";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("unknown report {0:?}")]
    Unknown(String),
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("report {0:?} has no query")]
    NoQuery(String),
    #[error("indirect report {0:?} produced an empty query")]
    EmptyIndirect(String),
    #[error("split report {0:?} needs split-column and split-values-query")]
    SplitDefinition(String),
    #[error("report {report:?} uses unknown grouping {grouping:?}")]
    Grouping { report: String, grouping: String },
    #[error("{sink} output takes exactly one report, selection matched {matched}")]
    Selection { sink: &'static str, matched: usize },
    #[error("report {0:?} is not a standard or summary report")]
    NotExplainable(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub published: usize,
    pub removed: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportListing {
    pub name: String,
    pub group: String,
    pub title: String,
    pub kind: ReportType,
    pub dashboard: bool,
    pub workbook: bool,
}

pub fn list_reports(config: &Config) -> Vec<ReportListing> {
    let mut out: Vec<ReportListing> = config
        .reports
        .values()
        .map(|def| ReportListing {
            name: def.name.clone(),
            group: def.group.clone(),
            title: def.display_title().to_string(),
            kind: def.kind,
            dashboard: def.enable_for_dashboard.unwrap_or(true),
            workbook: def.enable_for_workbook.unwrap_or(true),
        })
        .collect();
    out.sort_by(|a, b| (&a.group, &a.title, &a.name).cmp(&(&b.group, &b.title, &b.name)));
    out
}

pub struct ReportExecutor<'a> {
    config: &'a Config,
    scramble: bool,
    cancel: CancelToken,
    hostname: String,
    username: String,
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

impl<'a> ReportExecutor<'a> {
    pub fn new(config: &'a Config, cancel: CancelToken) -> Self {
        Self {
            config,
            scramble: false,
            cancel,
            hostname: local_hostname(),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_default(),
        }
    }

    /// Mask host and user names and the configured columns of every report.
    pub fn scramble(mut self, scramble: bool) -> Self {
        self.scramble = scramble;
        self
    }

    fn base_lookup(&self, def: &ReportDefinition) -> Lookup {
        let now = Local::now();
        let (hostname, username) = if self.scramble {
            (SCRAMBLED, SCRAMBLED)
        } else {
            (self.hostname.as_str(), self.username.as_str())
        };
        Lookup::new()
            .literal("hostname", hostname)
            .literal("username", username)
            .literal("date", now.format("%Y-%m-%d").to_string())
            .literal("time", now.format("%H:%M:%S").to_string())
            .literal("datetime", now.format("%Y-%m-%dT%H:%M:%S%:z").to_string())
            .literal("report-name", def.name.as_str())
            .literal("report-group", def.group.as_str())
    }

    /// Named reports run whatever their sink flags say. A workbook always
    /// gets its enabled summary reports.
    pub async fn run(
        &self,
        conn: &mut SqliteConnection,
        sink: &mut dyn Reporter,
        selection: &ReportSelection,
    ) -> Result<RunSummary, ReportError> {
        let kind = sink.kind();
        let mut chosen: Vec<(&ReportDefinition, Option<String>, bool)> = Vec::new();
        for def in self.config.reports.values() {
            let enabled = def.enabled_for(kind);
            if selection.is_all() {
                if enabled || def.kind == ReportType::Split {
                    chosen.push((def, None, enabled));
                }
                continue;
            }
            match selection.select(&def.name) {
                Selected::All => chosen.push((def, None, true)),
                Selected::Only(value) => chosen.push((def, Some(value), true)),
                Selected::No => {
                    if kind == SinkKind::Workbook && def.kind == ReportType::Summary && enabled {
                        chosen.push((def, None, true));
                    }
                }
            }
        }
        chosen.sort_by_key(|(def, _, _)| {
            let rank = match def.kind {
                ReportType::Summary => 0,
                ReportType::Split => 2,
                _ => 1,
            };
            (rank, def.name.clone())
        });

        let max = sink.constraints().max_reports;
        if max > 0 && (chosen.is_empty() || chosen.len() > max) {
            return Err(ReportError::Selection {
                sink: kind.as_str(),
                matched: chosen.len(),
            });
        }

        let mut summary = RunSummary::default();
        for (def, only, enabled) in chosen {
            if self.cancel.is_cancelled() {
                info!("report run cancelled");
                break;
            }
            let span = info_span!("report", name = %def.name, kind = def.kind.as_str());
            match self
                .dispatch(conn, sink, def, only.as_deref(), enabled, &Lookup::new(), &mut summary)
                .instrument(span)
                .await
            {
                Ok(()) => {}
                Err(ReportError::Sink(err)) => return Err(ReportError::Sink(err)),
                Err(err) => {
                    error!(report = %def.name, error = %err, "report failed");
                    summary.failed.push(def.name.clone());
                }
            }
        }
        info!(
            sink = kind.as_str(),
            published = summary.published,
            removed = summary.removed,
            failed = summary.failed.len(),
            "reports published"
        );
        Ok(summary)
    }

    pub async fn publish(
        &self,
        conn: &mut SqliteConnection,
        sink: &mut dyn Reporter,
        name: &str,
        lookup: &Lookup,
    ) -> Result<RunSummary, ReportError> {
        let def = self
            .config
            .reports
            .get(name)
            .ok_or_else(|| ReportError::Unknown(name.to_string()))?;
        let mut summary = RunSummary::default();
        let enabled = def.enabled_for(sink.kind());
        self.dispatch(conn, sink, def, None, enabled, lookup, &mut summary)
            .await?;
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        conn: &mut SqliteConnection,
        sink: &mut dyn Reporter,
        def: &ReportDefinition,
        only: Option<&str>,
        enabled: bool,
        extra: &Lookup,
        summary: &mut RunSummary,
    ) -> Result<(), ReportError> {
        let base = self.base_lookup(def);
        match def.kind {
            ReportType::Standard | ReportType::Summary => {
                let expander = Expander::new(self.config).with(&base).with(extra);
                let table = self.run_query(conn, def, &expander).await?;
                let headlines = self.headlines(conn, def, &expander).await?;
                self.emit(sink, def, None, &expander, headlines, table)?;
                summary.published += 1;
            }
            ReportType::Indirect => {
                let expander = Expander::new(self.config).with(&base).with(extra);
                let generated = scalar_text(conn, &expander.sql(&def.query)?, &[])
                    .await?
                    .filter(|q| !q.trim().is_empty())
                    .ok_or_else(|| ReportError::EmptyIndirect(def.name.clone()))?;
                let mut table = query_to_table(conn, &generated).await?;
                if table.is_header_only() {
                    debug!(report = %def.name, "indirect report returned no rows");
                    return Ok(());
                }
                self.apply_columns(def, &mut table);
                let headlines = self.headlines(conn, def, &expander).await?;
                self.emit(sink, def, None, &expander, headlines, table)?;
                summary.published += 1;
            }
            ReportType::Split => {
                self.split(conn, sink, def, only, enabled, &base, extra, summary)
                    .await?;
            }
            ReportType::PluginGroups => {
                let table = self.plugin_groups(conn, def, &base, extra).await?;
                let expander = Expander::new(self.config).with(&base).with(extra);
                let headlines = self.headlines(conn, def, &expander).await?;
                self.emit(sink, def, None, &expander, headlines, table)?;
                summary.published += 1;
            }
        }
        Ok(())
    }

    async fn run_query(
        &self,
        conn: &mut SqliteConnection,
        def: &ReportDefinition,
        expander: &Expander<'_>,
    ) -> Result<Table, ReportError> {
        if def.query.trim().is_empty() {
            return Err(ReportError::NoQuery(def.name.clone()));
        }
        let sql = expander.sql(&def.query)?;
        let mut table = query_to_table(conn, &sql).await?;
        self.apply_columns(def, &mut table);
        Ok(table)
    }

    fn apply_columns(&self, def: &ReportDefinition, table: &mut Table) {
        if !def.columns.is_empty() && !table.rename_columns(&def.columns) {
            warn!(
                report = %def.name,
                configured = def.columns.len(),
                returned = table.columns.len(),
                "column names do not match the query width, keeping query names"
            );
        }
    }

    async fn headlines(
        &self,
        conn: &mut SqliteConnection,
        def: &ReportDefinition,
        expander: &Expander<'_>,
    ) -> Result<Headlines, ReportError> {
        match def.headlines.as_deref().filter(|h| !h.trim().is_empty()) {
            Some(template) => Ok(query_headlines(conn, &expander.sql(template)?).await?),
            None => Ok(Headlines::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn split(
        &self,
        conn: &mut SqliteConnection,
        sink: &mut dyn Reporter,
        def: &ReportDefinition,
        only: Option<&str>,
        enabled: bool,
        base: &Lookup,
        extra: &Lookup,
        summary: &mut RunSummary,
    ) -> Result<(), ReportError> {
        let (Some(column), Some(values_query)) = (&def.split_column, &def.split_values_query) else {
            return Err(ReportError::SplitDefinition(def.name.clone()));
        };
        let expander = Expander::new(self.config).with(base).with(extra);
        let mut values = query_column(conn, &expander.sql(values_query)?, &[]).await?;
        values.sort();
        values.dedup();

        let mut gone = Vec::new();
        if !enabled {
            gone = values.clone();
            values.clear();
        } else if let Some(all_query) = &def.split_values_all_query {
            gone = query_column(conn, &expander.sql(all_query)?, &[])
                .await?
                .into_iter()
                .filter(|v| !values.contains(v))
                .collect();
            gone.sort();
            gone.dedup();
        }
        for value in &gone {
            let bound = split_binding(column, value);
            let expander = Expander::new(self.config)
                .with(base)
                .with(extra)
                .with(&bound);
            let title = self.title(sink, def, &expander)?;
            sink.remove(&self.report_for(def, Some(value.as_str()), title))?;
            summary.removed += 1;
        }

        if let Some(only) = only {
            values.retain(|v| v == only);
        }

        for value in values {
            if self.cancel.is_cancelled() {
                break;
            }
            let bound = split_binding(column, &value);
            let expander = Expander::new(self.config)
                .with(base)
                .with(extra)
                .with(&bound);
            let result = async {
                let table = self.run_query(conn, def, &expander).await?;
                let headlines = self.headlines(conn, def, &expander).await?;
                self.emit(sink, def, Some(value.as_str()), &expander, headlines, table)
            }
            .await;
            match result {
                Ok(()) => summary.published += 1,
                Err(ReportError::Sink(err)) => return Err(ReportError::Sink(err)),
                Err(err) => {
                    error!(report = %def.name, value = %value, error = %err, "split value failed");
                    summary.failed.push(format!("{}-{value}", def.name));
                }
            }
        }
        Ok(())
    }

    /// Concatenate the query result for every non-empty filter of the
    /// grouping, in `grouping-order` then name order.
    async fn plugin_groups(
        &self,
        conn: &mut SqliteConnection,
        def: &ReportDefinition,
        base: &Lookup,
        extra: &Lookup,
    ) -> Result<Table, ReportError> {
        let grouping_name = def.grouping.clone().unwrap_or_default();
        let grouping: &BTreeMap<String, String> =
            self.config
                .groupings
                .get(&grouping_name)
                .ok_or_else(|| ReportError::Grouping {
                    report: def.name.clone(),
                    grouping: grouping_name.clone(),
                })?;

        let mut order: Vec<&String> = def
            .grouping_order
            .iter()
            .filter(|name| grouping.contains_key(*name))
            .collect();
        for name in grouping.keys() {
            if !order.contains(&name) {
                order.push(name);
            }
        }

        let mut combined = Table::default();
        for group in order {
            let filter = &grouping[group];
            if filter.trim().is_empty() {
                debug!(group = %group, "empty grouping filter skipped");
                continue;
            }
            let bound = Lookup::new()
                .literal("group", group.as_str())
                .fragment("filter", filter.as_str());
            let expander = Expander::new(self.config)
                .with(base)
                .with(extra)
                .with(&bound);
            let table = self.run_query(conn, def, &expander).await?;
            if combined.columns.is_empty() {
                combined.columns = table.columns;
            }
            combined.rows.extend(table.rows);
        }
        Ok(combined)
    }

    fn report_for(&self, def: &ReportDefinition, value: Option<&str>, title: String) -> Report {
        Report {
            name: def.name.clone(),
            title,
            group: def.group.clone(),
            kind: def.kind,
            split_value: value.map(str::to_string),
            scramble_columns: if self.scramble {
                def.scramble_columns.clone()
            } else {
                Vec::new()
            },
            conditional_format: def.conditional_format.clone(),
            freeze_to_column: def.freeze_to_column.clone(),
        }
    }

    fn title(
        &self,
        sink: &dyn Reporter,
        def: &ReportDefinition,
        expander: &Expander<'_>,
    ) -> Result<String, ReportError> {
        let constraints = sink.constraints();
        let mut title = expander.text(def.display_title())?;
        if constraints.distinct_group_title && title == def.group {
            title = format!("{title} [{}]", def.name);
        }
        if constraints.max_title_len > 0 && title.chars().count() > constraints.max_title_len {
            title = title.chars().take(constraints.max_title_len).collect();
        }
        Ok(title)
    }

    fn emit(
        &self,
        sink: &mut dyn Reporter,
        def: &ReportDefinition,
        value: Option<&str>,
        expander: &Expander<'_>,
        headlines: Headlines,
        table: Table,
    ) -> Result<(), ReportError> {
        let title = self.title(sink, def, expander)?;
        let report = self.report_for(def, value, title);
        sink.prepare(&report)?;
        for (name, value) in &headlines {
            sink.add_headline(name, value);
        }
        let Table { columns, mut rows } = table;
        if self.scramble {
            scramble_columns(&columns, &def.scramble_columns, &mut rows);
        }
        sink.update_table(&columns, rows);
        Ok(())
    }

    pub async fn explain(&self, conn: &mut SqliteConnection, name: &str) -> Result<String, ReportError> {
        let def = self
            .config
            .reports
            .get(name)
            .ok_or_else(|| ReportError::Unknown(name.to_string()))?;
        if !matches!(def.kind, ReportType::Standard | ReportType::Summary) {
            return Err(ReportError::NotExplainable(name.to_string()));
        }
        let base = self.base_lookup(def);
        let sql = Expander::new(self.config).with(&base).sql(&def.query)?;
        let plan = query_to_table(conn, &format!("EXPLAIN QUERY PLAN {sql}")).await?;
        Ok(render_plan(&plan))
    }
}

fn split_binding(column: &str, value: &str) -> Lookup {
    Lookup::new()
        .fragment("split-column", column)
        .literal("value", value)
}

/// `id, parent, notused, detail` rows, children indented under parents.
fn render_plan(plan: &Table) -> String {
    let nodes: Vec<(i64, i64, &str)> = plan
        .rows
        .iter()
        .filter(|row| row.len() >= 4)
        .map(|row| {
            (
                row[0].parse().unwrap_or_default(),
                row[1].parse().unwrap_or_default(),
                row[3].as_str(),
            )
        })
        .collect();

    fn walk(nodes: &[(i64, i64, &str)], parent: i64, depth: usize, out: &mut String) {
        for (id, _, detail) in nodes.iter().filter(|(_, p, _)| *p == parent) {
            out.push_str(&"  ".repeat(depth));
            out.push_str(detail);
            out.push('\n');
            if *id != parent {
                walk(nodes, *id, depth + 1, out);
            }
        }
    }

    let mut out = String::new();
    walk(&nodes, 0, 0, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::DerivedTableBuilder;
    use crate::lists::Lists;
    use crate::testutil::{seeded_store, RecordingSink};
    use tempfile::tempdir;
    use udr_core::{SinkConstraints, SinkKind};
    use udr_storage::{exec, Store};

    async fn derived(dir: &std::path::Path, extra: &str) -> (Config, Store) {
        let (config, store) = seeded_store(dir, extra).await;
        let builder = DerivedTableBuilder::new(&config, Lists::default()).expect("builder");
        let mut tx = store.begin().await.expect("begin");
        builder.rebuild(&mut tx, None).await.expect("rebuild");
        tx.commit().await.expect("commit");
        (config, store)
    }

    #[tokio::test]
    async fn run_orders_summary_first_and_split_last() {
        let dir = tempdir().expect("tempdir");
        let (config, store) = derived(dir.path(), "").await;
        let executor = ReportExecutor::new(&config, CancelToken::never());
        let mut sink = RecordingSink::new(SinkKind::Text);
        let mut tx = store.begin().await.expect("begin");
        let summary = executor
            .run(&mut tx, &mut sink, &ReportSelection::all())
            .await
            .expect("run");
        tx.commit().await.expect("commit");

        assert!(summary.failed.is_empty(), "{:?}", summary.failed);
        let names: Vec<String> = sink.prepared.iter().map(Report::instance_name).collect();
        assert_eq!(names.first().map(String::as_str), Some("summary"));
        let first_split = names
            .iter()
            .position(|n| n.starts_with("gateway-detail-"))
            .expect("split present");
        assert!(names[first_split..].iter().all(|n| n.starts_with("gateway-detail-")));
        assert_eq!(&names[first_split..], ["gateway-detail-GW1", "gateway-detail-GW2"]);
        assert!(!names.contains(&"stale-sources".to_string()));
        assert_eq!(sink.tables[0].0, vec!["Item", "Value"]);
    }

    #[tokio::test]
    async fn dropped_split_value_is_removed_once() {
        let dir = tempdir().expect("tempdir");
        let (config, store) = derived(dir.path(), "").await;
        let mut tx = store.begin().await.expect("begin");
        exec(
            &mut tx,
            "INSERT INTO samplers (gateway, plugin, probeName, probePort, tokenID, number, individual, time, source) \
             VALUES ('GW0', 'cpu', 'old', '7036', 'x', 1, 0, '2019-01-01T00:00:00Z', 'file:gone')",
            &[],
        )
        .await
        .expect("insert");
        let executor = ReportExecutor::new(&config, CancelToken::never());
        let mut sink = RecordingSink::new(SinkKind::Workbook);
        let selection = ReportSelection::parse("gateway-detail").expect("selection");
        executor.run(&mut tx, &mut sink, &selection).await.expect("run");
        tx.commit().await.expect("commit");

        let removed: Vec<String> = sink.removed.iter().map(Report::instance_name).collect();
        assert_eq!(removed, vec!["gateway-detail-GW0"]);
        assert_eq!(sink.removed[0].title, "Gateway GW0");
        assert_eq!(sink.prepared.len(), 2);
        assert_eq!(sink.prepared[0].title, "Gateway GW1");
    }

    #[tokio::test]
    async fn disabled_split_removes_values_under_their_published_titles() {
        let dir = tempdir().expect("tempdir");
        let (mut config, store) = derived(dir.path(), "").await;
        if let Some(def) = config.reports.get_mut("gateway-detail") {
            def.enable_for_dashboard = Some(false);
            def.title = "Detail for gateway ${value}".to_string();
        }
        let executor = ReportExecutor::new(&config, CancelToken::never());
        let mut sink = RecordingSink::new(SinkKind::Dashboard).with_constraints(SinkConstraints {
            max_title_len: 20,
            ..SinkConstraints::default()
        });
        let mut tx = store.begin().await.expect("begin");
        executor
            .run(&mut tx, &mut sink, &ReportSelection::all())
            .await
            .expect("run");
        tx.commit().await.expect("commit");

        assert!(!sink.prepared.iter().any(|r| r.name == "gateway-detail"));
        let removed: Vec<(String, String)> = sink
            .removed
            .iter()
            .map(|r| (r.instance_name(), r.title.clone()))
            .collect();
        assert_eq!(
            removed,
            vec![
                ("gateway-detail-GW1".to_string(), "Detail for gateway G".to_string()),
                ("gateway-detail-GW2".to_string(), "Detail for gateway G".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn named_reports_ignore_sink_enable_flags() {
        let dir = tempdir().expect("tempdir");
        let (config, store) = derived(dir.path(), "").await;
        let executor = ReportExecutor::new(&config, CancelToken::never());
        let mut tx = store.begin().await.expect("begin");

        let mut all = RecordingSink::new(SinkKind::Dashboard);
        executor
            .run(&mut tx, &mut all, &ReportSelection::all())
            .await
            .expect("all");
        assert!(!all.prepared.iter().any(|r| r.name == "excluded-samplers"));

        let mut named = RecordingSink::new(SinkKind::Dashboard);
        executor
            .run(&mut tx, &mut named, &ReportSelection::parse("excluded-samplers").expect("sel"))
            .await
            .expect("named");
        tx.commit().await.expect("commit");
        let names: Vec<&str> = named.prepared.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["excluded-samplers"]);
    }

    #[tokio::test]
    async fn workbooks_always_carry_the_summary() {
        let dir = tempdir().expect("tempdir");
        let (config, store) = derived(dir.path(), "").await;
        let executor = ReportExecutor::new(&config, CancelToken::never());
        let selection = ReportSelection::parse("gateways").expect("sel");
        let mut tx = store.begin().await.expect("begin");

        let mut workbook = RecordingSink::new(SinkKind::Workbook);
        executor.run(&mut tx, &mut workbook, &selection).await.expect("workbook");
        let mut text = RecordingSink::new(SinkKind::Text);
        executor.run(&mut tx, &mut text, &selection).await.expect("text");
        tx.commit().await.expect("commit");

        let names = |sink: &RecordingSink| -> Vec<String> {
            sink.prepared.iter().map(|r| r.name.clone()).collect()
        };
        assert_eq!(names(&workbook), vec!["summary", "gateways"]);
        assert_eq!(names(&text), vec!["gateways"]);
    }

    #[tokio::test]
    async fn failing_split_value_does_not_stop_the_others() {
        let dir = tempdir().expect("tempdir");
        let (mut config, store) = derived(dir.path(), "").await;
        if let Some(def) = config.reports.get_mut("gateway-detail") {
            def.query = "SELECT x FROM detail_${value}".to_string();
        }
        let mut tx = store.begin().await.expect("begin");
        exec(&mut tx, "CREATE TABLE detail_GW2 (x TEXT)", &[])
            .await
            .expect("create");
        let executor = ReportExecutor::new(&config, CancelToken::never());
        let mut sink = RecordingSink::new(SinkKind::Text);
        let summary = executor
            .run(&mut tx, &mut sink, &ReportSelection::parse("gateway-detail").expect("sel"))
            .await
            .expect("run");
        tx.commit().await.expect("commit");

        assert_eq!(summary.failed, vec!["gateway-detail-GW1"]);
        assert_eq!(summary.published, 1);
        let names: Vec<String> = sink.prepared.iter().map(Report::instance_name).collect();
        assert_eq!(names, vec!["gateway-detail-GW2"]);
    }

    #[tokio::test]
    async fn indirect_report_with_no_rows_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let (config, store) = derived(dir.path(), "").await;
        let executor = ReportExecutor::new(&config, CancelToken::never());
        let mut sink = RecordingSink::new(SinkKind::Text);
        let mut tx = store.begin().await.expect("begin");
        let summary = executor
            .publish(&mut tx, &mut sink, "stale-sources", &Lookup::new())
            .await
            .expect("publish");
        tx.commit().await.expect("commit");
        assert_eq!(summary.published, 0);
        assert!(sink.prepared.is_empty());
        assert!(sink.tables.is_empty());
    }

    #[tokio::test]
    async fn plugin_groups_concatenate_in_grouping_order() {
        let dir = tempdir().expect("tempdir");
        let (config, store) = derived(dir.path(), "").await;
        let executor = ReportExecutor::new(&config, CancelToken::never());
        let mut sink = RecordingSink::new(SinkKind::Text);
        let mut tx = store.begin().await.expect("begin");
        executor
            .publish(&mut tx, &mut sink, "plugin-groups", &Lookup::new())
            .await
            .expect("publish");
        tx.commit().await.expect("commit");

        let (columns, rows) = &sink.tables[0];
        assert_eq!(columns, &vec!["Family", "Plugin", "Instances", "Gateways"]);
        let families: Vec<&str> = rows.iter().map(|r| r[0].as_str()).collect();
        assert_eq!(families, vec!["Core", "Cloud"]);
    }

    #[tokio::test]
    async fn scramble_masks_lookup_and_columns() {
        let dir = tempdir().expect("tempdir");
        let (config, store) = derived(dir.path(), "").await;
        let executor = ReportExecutor::new(&config, CancelToken::never()).scramble(true);
        let mut sink = RecordingSink::new(SinkKind::Text);
        let mut tx = store.begin().await.expect("begin");
        executor
            .run(&mut tx, &mut sink, &ReportSelection::parse("summary,gateways").expect("sel"))
            .await
            .expect("run");
        tx.commit().await.expect("commit");

        assert!(sink
            .headlines
            .iter()
            .any(|(n, v)| n == "Host" && v == SCRAMBLED));
        let (_, rows) = &sink.tables[1];
        assert_eq!(rows[0][0], "G**");
    }

    #[tokio::test]
    async fn single_report_sinks_need_exactly_one_match() {
        let dir = tempdir().expect("tempdir");
        let (config, store) = derived(dir.path(), "").await;
        let executor = ReportExecutor::new(&config, CancelToken::never());
        let mut sink = RecordingSink::new(SinkKind::Delimited).with_constraints(SinkConstraints {
            max_reports: 1,
            ..SinkConstraints::default()
        });
        let mut tx = store.begin().await.expect("begin");
        let err = executor
            .run(&mut tx, &mut sink, &ReportSelection::parse("g*").expect("sel"))
            .await
            .expect_err("two reports");
        assert!(matches!(err, ReportError::Selection { matched: 2, .. }));
        executor
            .run(&mut tx, &mut sink, &ReportSelection::parse("gateways").expect("sel"))
            .await
            .expect("one report");
        tx.commit().await.expect("commit");
        assert_eq!(sink.prepared.len(), 1);
    }

    #[tokio::test]
    async fn explain_renders_plan_tree() {
        let dir = tempdir().expect("tempdir");
        let (config, store) = derived(dir.path(), "").await;
        let executor = ReportExecutor::new(&config, CancelToken::never());
        let mut conn = store.pool().acquire().await.expect("conn");
        let plan = executor.explain(&mut conn, "probes").await.expect("explain");
        assert!(plan.contains("active_probes"), "{plan}");
        assert!(matches!(
            executor.explain(&mut conn, "gateway-detail").await,
            Err(ReportError::NotExplainable(_))
        ));
    }

    #[test]
    fn listing_sorts_by_group_then_title() {
        let config = Config::from_yaml_str("{}").expect("config");
        let listing = list_reports(&config);
        let keys: Vec<(&str, &str)> = listing
            .iter()
            .map(|l| (l.group.as_str(), l.title.as_str()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(listing.iter().any(|l| l.name == "stale-sources" && !l.dashboard));
    }
}
