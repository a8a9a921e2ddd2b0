//! Typed configuration loaded from embedded defaults plus an operator overlay.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_yaml::Value;
use thiserror::Error;

use crate::report::ReportDefinition;
use crate::{Category, FactKind, ListKind};

pub const DEFAULTS_YAML: &str = include_str!("../../../config/defaults.yaml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid identifier {value:?} at {path}")]
    Identifier { path: String, value: String },
    #[error("invalid duration {0:?}")]
    Duration(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub pipeline: PipelineSettings,
    pub db: DbConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub ignore: BTreeMap<String, IgnoreTable>,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginTable>,
    #[serde(default)]
    pub groupings: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub reports: BTreeMap<String, ReportDefinition>,
    #[serde(default)]
    pub email: EmailSettings,
    #[serde(skip)]
    raw: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PipelineSettings {
    /// HTTP(S) endpoints or plain CSV file globs.
    #[serde(default)]
    pub sources: Vec<String>,
    /// File globs of three-section extract files.
    #[serde(default)]
    pub extracts: Vec<String>,
    #[serde(default, deserialize_with = "de_duration")]
    pub stale_after: Duration,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub email_schedule: Option<String>,
    #[serde(default = "default_http_timeout", deserialize_with = "de_duration")]
    pub http_timeout: Duration,
    #[serde(default)]
    pub http_skip_verify: bool,
    #[serde(default)]
    pub http_ca_bundle: Option<String>,
    pub lists_file: String,
    pub pid_file: String,
    pub output_dir: String,
    /// Sinks a scheduled run publishes to, by output format name.
    #[serde(default = "default_outputs")]
    pub outputs: Vec<String>,
}

impl PipelineSettings {
    pub fn lists_path(&self) -> PathBuf {
        expand_home(&self.lists_file)
    }

    pub fn pid_path(&self) -> PathBuf {
        expand_home(&self.pid_file)
    }

    pub fn output_path(&self) -> PathBuf {
        expand_home(&self.output_dir)
    }
}

fn default_outputs() -> Vec<String> {
    vec!["parquet".to_string(), "html".to_string()]
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(15)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DbConfig {
    pub file: String,
    #[serde(default)]
    pub on_open: Option<String>,
    #[serde(default)]
    pub schema_updates: BTreeMap<u32, SchemaUpdate>,
    #[serde(default)]
    pub version: Option<VersionTable>,
    pub sources: SourcesTable,
    pub licences: TableStatements,
    pub tokens: TableStatements,
    pub facts: FactTables,
    #[serde(default)]
    pub report_tables: Vec<NamedStatement>,
    #[serde(default)]
    pub reporting_update: Option<String>,
}

impl DbConfig {
    pub fn path(&self) -> PathBuf {
        expand_home(&self.file)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchemaUpdate {
    pub check: String,
    #[serde(default)]
    pub update: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VersionTable {
    pub create: String,
    /// `?1` is the running version string.
    pub insert: String,
}

/// `upsert`: ?1 source, ?2 sourceType, ?3 path, ?4 time, ?5 status, ?6 valid.
/// `update-valid`: ?1 stale-after seconds (0 disables), ?2 oldest valid time,
/// with `${sources}` bound to the exempt labels.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourcesTable {
    pub table: String,
    pub create: String,
    pub upsert: String,
    pub update_valid: String,
    pub last_seen: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableStatements {
    pub table: String,
    pub create: String,
    pub insert: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FactTable {
    pub table: String,
    pub create: String,
    pub insert: String,
    #[serde(default)]
    pub post_insert: Option<String>,
    #[serde(default)]
    pub create_active: Option<String>,
    #[serde(default)]
    pub create_inactive: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FactTables {
    pub probes: FactTable,
    pub samplers: FactTable,
    pub ca_samplers: FactTable,
    pub gw_samplers: FactTable,
    pub gw_components: FactTable,
    pub gateways: FactTable,
}

impl FactTables {
    pub fn get(&self, kind: FactKind) -> &FactTable {
        match kind {
            FactKind::Probe => &self.probes,
            FactKind::Sampler => &self.samplers,
            FactKind::CaSampler => &self.ca_samplers,
            FactKind::GatewaySampler => &self.gw_samplers,
            FactKind::GatewayComponent => &self.gw_components,
            FactKind::Gateway => &self.gateways,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (FactKind, &FactTable)> {
        FactKind::ALL.into_iter().map(move |kind| (kind, self.get(kind)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NamedStatement {
    pub table: String,
    pub create: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FiltersConfig {
    #[serde(default)]
    pub include: BTreeMap<Category, FilterTable>,
    #[serde(default)]
    pub exclude: BTreeMap<Category, FilterTable>,
    #[serde(default)]
    pub groups: BTreeMap<Category, GroupTable>,
}

impl FiltersConfig {
    pub fn tables(&self, kind: ListKind) -> &BTreeMap<Category, FilterTable> {
        match kind {
            ListKind::Include => &self.include,
            ListKind::Exclude => &self.exclude,
        }
    }
}

/// `insert`: ?1 name, ?2 user, ?3 origin, ?4 comment, ?5 timestamp.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FilterTable {
    pub table: String,
    #[serde(default = "default_filter_create")]
    pub create: String,
    #[serde(default = "default_filter_insert")]
    pub insert: String,
    #[serde(default)]
    pub default: Vec<String>,
}

fn default_filter_create() -> String {
    "CREATE TABLE IF NOT EXISTS ${table} (name TEXT NOT NULL PRIMARY KEY, user TEXT, origin TEXT, comment TEXT, timestamp TEXT)".to_string()
}

fn default_filter_insert() -> String {
    "INSERT INTO ${table} (name, user, origin, comment, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)"
        .to_string()
}

/// `insert`: ?1 grouping, ?2 pattern, ?3 user, ?4 origin, ?5 comment, ?6 timestamp.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GroupTable {
    pub table: String,
    #[serde(default = "default_group_create")]
    pub create: String,
    #[serde(default = "default_group_insert")]
    pub insert: String,
    /// `name,glob` lines.
    #[serde(default)]
    pub default: String,
}

fn default_group_create() -> String {
    "CREATE TABLE IF NOT EXISTS ${table} (grouping TEXT NOT NULL, pattern TEXT NOT NULL, user TEXT, origin TEXT, comment TEXT, timestamp TEXT, PRIMARY KEY (grouping, pattern))".to_string()
}

fn default_group_insert() -> String {
    "INSERT INTO ${table} (grouping, pattern, user, origin, comment, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6)".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IgnoreTable {
    pub column: String,
    pub table: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default = "default_single_create")]
    pub create: String,
    #[serde(default = "default_single_insert")]
    pub insert: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginTable {
    pub table: String,
    #[serde(default = "default_single_create")]
    pub create: String,
    #[serde(default = "default_single_insert")]
    pub insert: String,
    #[serde(default)]
    pub values: Vec<String>,
}

fn default_single_create() -> String {
    "CREATE TABLE IF NOT EXISTS ${table} (name TEXT NOT NULL PRIMARY KEY)".to_string()
}

fn default_single_insert() -> String {
    "INSERT OR IGNORE INTO ${table} (name) VALUES (?1)".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EmailSettings {
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_body_reports")]
    pub body_reports: String,
    #[serde(default)]
    pub attach_workbook: bool,
    #[serde(default = "default_outbox")]
    pub outbox: String,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            to: Vec::new(),
            from: None,
            subject: default_subject(),
            body_reports: default_body_reports(),
            attach_workbook: false,
            outbox: default_outbox(),
        }
    }
}

impl EmailSettings {
    pub fn outbox_path(&self) -> PathBuf {
        expand_home(&self.outbox)
    }
}

fn default_subject() -> String {
    "Usage report ${date}".to_string()
}

fn default_body_reports() -> String {
    "*summary*".to_string()
}

fn default_outbox() -> String {
    "~/.local/state/udr/outbox".to_string()
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut raw: Value =
            serde_yaml::from_str(DEFAULTS_YAML).map_err(|source| ConfigError::Parse {
                origin: "embedded defaults".to_string(),
                source,
            })?;
        if let Some(path) = path {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let overlay: Value =
                serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                    origin: path.display().to_string(),
                    source,
                })?;
            merge_values(&mut raw, overlay);
        }
        Self::from_value(raw)
    }

    /// `load` driven by `UDR_CONFIG`, then the `UDR_DB`, `UDR_LISTS` and
    /// `UDR_STALE_AFTER` overrides.
    pub fn from_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var("UDR_CONFIG").ok().map(PathBuf::from);
        let mut config = Self::load(path.or(env_path.as_deref()))?;
        if let Ok(db) = std::env::var("UDR_DB") {
            config.db.file = db;
        }
        if let Ok(lists) = std::env::var("UDR_LISTS") {
            config.pipeline.lists_file = lists;
        }
        if let Ok(stale) = std::env::var("UDR_STALE_AFTER") {
            config.pipeline.stale_after = parse_duration(&stale)?;
        }
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let mut raw: Value =
            serde_yaml::from_str(DEFAULTS_YAML).map_err(|source| ConfigError::Parse {
                origin: "embedded defaults".to_string(),
                source,
            })?;
        let overlay: Value = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            origin: "inline".to_string(),
            source,
        })?;
        merge_values(&mut raw, overlay);
        Self::from_value(raw)
    }

    fn from_value(raw: Value) -> Result<Self, ConfigError> {
        let mut config: Config =
            serde_yaml::from_value(raw.clone()).map_err(|source| ConfigError::Parse {
                origin: "configuration".to_string(),
                source,
            })?;
        config.raw = raw;
        for (name, report) in config.reports.iter_mut() {
            if report.name.is_empty() {
                report.name = name.clone();
            }
        }
        config.validate_identifiers()?;
        Ok(config)
    }

    /// Every configured table or column name must be a plain identifier.
    fn validate_identifiers(&self) -> Result<(), ConfigError> {
        let mut checks: Vec<(String, &str)> = vec![
            ("db.sources.table".to_string(), self.db.sources.table.as_str()),
            ("db.licences.table".to_string(), self.db.licences.table.as_str()),
            ("db.tokens.table".to_string(), self.db.tokens.table.as_str()),
        ];
        for (kind, table) in self.db.facts.iter() {
            checks.push((format!("db.facts.{}.table", kind.as_str()), table.table.as_str()));
        }
        for (i, statement) in self.db.report_tables.iter().enumerate() {
            checks.push((format!("db.report-tables[{i}].table"), statement.table.as_str()));
        }
        for kind in [ListKind::Include, ListKind::Exclude] {
            for (category, table) in self.filters.tables(kind) {
                checks.push((
                    format!("filters.{}.{}.table", kind.as_str(), category),
                    table.table.as_str(),
                ));
            }
        }
        for (category, table) in &self.filters.groups {
            checks.push((format!("filters.groups.{category}.table"), table.table.as_str()));
        }
        for (name, ignore) in &self.ignore {
            checks.push((format!("ignore.{name}.table"), ignore.table.as_str()));
            checks.push((format!("ignore.{name}.column"), ignore.column.as_str()));
        }
        for (name, plugin) in &self.plugins {
            checks.push((format!("plugins.{name}.table"), plugin.table.as_str()));
        }
        for (name, report) in &self.reports {
            if let Some(column) = &report.split_column {
                checks.push((format!("reports.{name}.split-column"), column.as_str()));
            }
        }

        for (path, value) in checks {
            if !is_identifier(value) {
                return Err(ConfigError::Identifier {
                    path,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// A scalar at a dotted path, rendered as text. Sequences join with commas.
    pub fn lookup_path(&self, path: &str) -> Option<String> {
        match walk(&self.raw, path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Sequence(items) => Some(
                items
                    .iter()
                    .filter_map(scalar_text)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => None,
        }
    }

    /// A list of scalars at a dotted path; a single scalar becomes a one-item list.
    pub fn string_list(&self, path: &str) -> Vec<String> {
        match walk(&self.raw, path) {
            Some(Value::Sequence(items)) => items.iter().filter_map(scalar_text).collect(),
            Some(other) => scalar_text(other).into_iter().collect(),
            None => Vec::new(),
        }
    }
}

fn walk<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        current = match current {
            Value::Mapping(map) => map
                .get(Value::String(part.to_string()))
                .or_else(|| part.parse::<u64>().ok().and_then(|n| map.get(Value::from(n))))?,
            Value::Sequence(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Deep-merge `overlay` into `base`; mappings merge key by key, anything else replaces.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, Value::Null) if !matches!(base, Value::Null) => {}
        (base, overlay) => *base = overlay,
    }
}

pub fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse `0`, `90s`, `15m`, `12h`, `3d`, `2w` and concatenations like `1d12h`.
/// A bare number is seconds.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let text = input.trim();
    if text.is_empty() {
        return Ok(Duration::ZERO);
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            'w' => 604_800,
            _ => return Err(ConfigError::Duration(input.to_string())),
        };
        let n: u64 = digits
            .parse()
            .map_err(|_| ConfigError::Duration(input.to_string()))?;
        total = total.saturating_add(n.saturating_mul(unit));
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(ConfigError::Duration(input.to_string()));
    }
    Ok(Duration::from_secs(total))
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(Duration::ZERO),
        Value::Number(n) => Ok(Duration::from_secs(n.as_u64().unwrap_or_default())),
        Value::String(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "expected a duration, found {other:?}"
        ))),
    }
}
