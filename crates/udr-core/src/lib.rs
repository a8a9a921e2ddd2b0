//! Core domain model, configuration and template expansion for UDR.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub mod cancel;
pub mod config;
pub mod expand;
pub mod report;
pub mod sink;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use config::{Config, ConfigError};
pub use expand::{table_statement, Binding, Dialect, ExpandError, Expander, Lookup};
pub use report::{ConditionalFormat, FormatTest, ReportDefinition, ReportSelection, ReportType, Selected};
pub use sink::{Report, Reporter, SinkConstraints, SinkError, SinkKind};

pub const CRATE_NAME: &str = "udr-core";

/// Render a timestamp the way every table in the store expects it.
pub fn iso_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Http,
    Https,
    File,
    Extract,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Http => "http",
            SourceKind::Https => "https",
            SourceKind::File => "file",
            SourceKind::Extract => "extract",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceStatus {
    Ok,
    Error(String),
}

impl SourceStatus {
    pub fn as_db_text(&self) -> String {
        match self {
            SourceStatus::Ok => "OK".to_string(),
            SourceStatus::Error(message) => format!("ERROR: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub label: String,
    pub kind: SourceKind,
    pub path: String,
    pub observed: DateTime<Utc>,
    pub valid: bool,
    pub status: SourceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Bool(bool),
    Null,
}

impl SqlParam {
    pub fn text_or_null(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => SqlParam::Text(v.to_string()),
            _ => SqlParam::Null,
        }
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

/// Host, port and token parsed out of a `host:port [token]` description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeAddress {
    pub host: String,
    pub port: String,
    pub token: String,
    pub individual: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactKind {
    Probe,
    Sampler,
    CaSampler,
    GatewaySampler,
    GatewayComponent,
    Gateway,
}

impl FactKind {
    pub const ALL: [FactKind; 6] = [
        FactKind::Probe,
        FactKind::Sampler,
        FactKind::CaSampler,
        FactKind::GatewaySampler,
        FactKind::GatewayComponent,
        FactKind::Gateway,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactKind::Probe => "probe",
            FactKind::Sampler => "sampler",
            FactKind::CaSampler => "ca-sampler",
            FactKind::GatewaySampler => "gateway-sampler",
            FactKind::GatewayComponent => "gateway-component",
            FactKind::Gateway => "gateway",
        }
    }
}

/// `params` yields the values for the table's configured insert statement,
/// in the numbered order documented in `config/defaults.yaml`. The observed
/// time and source label are always the last two parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fact {
    Probe {
        gateway: String,
        address: ProbeAddress,
        os: Option<String>,
        version: Option<String>,
    },
    Sampler {
        gateway: String,
        plugin: String,
        address: ProbeAddress,
        number: i64,
    },
    CaSampler {
        gateway: String,
        plugin: String,
        entity: String,
        address: Option<ProbeAddress>,
        number: i64,
    },
    GatewaySampler {
        gateway: String,
        plugin: String,
        number: i64,
    },
    GatewayComponent {
        gateway: String,
        component: String,
        number: i64,
    },
    Gateway {
        gateway: String,
        host: Option<String>,
        port: Option<String>,
        version: Option<String>,
    },
}

impl Fact {
    pub fn kind(&self) -> FactKind {
        match self {
            Fact::Probe { .. } => FactKind::Probe,
            Fact::Sampler { .. } => FactKind::Sampler,
            Fact::CaSampler { .. } => FactKind::CaSampler,
            Fact::GatewaySampler { .. } => FactKind::GatewaySampler,
            Fact::GatewayComponent { .. } => FactKind::GatewayComponent,
            Fact::Gateway { .. } => FactKind::Gateway,
        }
    }

    pub fn gateway(&self) -> &str {
        match self {
            Fact::Probe { gateway, .. }
            | Fact::Sampler { gateway, .. }
            | Fact::CaSampler { gateway, .. }
            | Fact::GatewaySampler { gateway, .. }
            | Fact::GatewayComponent { gateway, .. }
            | Fact::Gateway { gateway, .. } => gateway,
        }
    }

    pub fn params(&self, time: &str, source: &str) -> Vec<SqlParam> {
        let mut params = match self {
            Fact::Probe {
                gateway,
                address,
                os,
                version,
            } => vec![
                gateway.as_str().into(),
                address.host.as_str().into(),
                address.port.as_str().into(),
                address.token.as_str().into(),
                SqlParam::text_or_null(os.as_deref()),
                SqlParam::text_or_null(version.as_deref()),
            ],
            Fact::Sampler {
                gateway,
                plugin,
                address,
                number,
            } => vec![
                gateway.as_str().into(),
                plugin.as_str().into(),
                address.host.as_str().into(),
                address.port.as_str().into(),
                address.token.as_str().into(),
                SqlParam::Int(*number),
                SqlParam::Bool(address.individual),
            ],
            Fact::CaSampler {
                gateway,
                plugin,
                entity,
                address,
                number,
            } => vec![
                gateway.as_str().into(),
                plugin.as_str().into(),
                entity.as_str().into(),
                SqlParam::text_or_null(address.as_ref().map(|a| a.host.as_str())),
                SqlParam::text_or_null(address.as_ref().map(|a| a.port.as_str())),
                SqlParam::text_or_null(address.as_ref().map(|a| a.token.as_str())),
                SqlParam::Int(*number),
            ],
            Fact::GatewaySampler {
                gateway,
                plugin,
                number,
            } => vec![
                gateway.as_str().into(),
                plugin.as_str().into(),
                SqlParam::Int(*number),
            ],
            Fact::GatewayComponent {
                gateway,
                component,
                number,
            } => vec![
                gateway.as_str().into(),
                component.as_str().into(),
                SqlParam::Int(*number),
            ],
            Fact::Gateway {
                gateway,
                host,
                port,
                version,
            } => vec![
                gateway.as_str().into(),
                SqlParam::text_or_null(host.as_deref()),
                SqlParam::text_or_null(port.as_deref()),
                SqlParam::text_or_null(version.as_deref()),
            ],
        };
        params.push(time.into());
        params.push(source.into());
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Include,
    Exclude,
}

impl ListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::Include => "include",
            ListKind::Exclude => "exclude",
        }
    }
}

impl FromStr for ListKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "include" | "includes" => Ok(ListKind::Include),
            "exclude" | "excludes" => Ok(ListKind::Exclude),
            _ => Err(UnknownName(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownName(pub String);

impl fmt::Display for UnknownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown name {:?}", self.0)
    }
}

impl std::error::Error for UnknownName {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[serde(alias = "gateways")]
    Gateway,
    #[serde(alias = "servers")]
    Server,
    #[serde(alias = "sources")]
    Source,
    #[serde(alias = "hostids")]
    Hostid,
    #[serde(alias = "plugins")]
    Plugin,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Gateway,
        Category::Server,
        Category::Source,
        Category::Hostid,
        Category::Plugin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Gateway => "gateway",
            Category::Server => "server",
            Category::Source => "source",
            Category::Hostid => "hostid",
            Category::Plugin => "plugin",
        }
    }

    /// Column in the fact tables that this category filters on.
    pub fn fact_column(&self) -> &'static str {
        match self {
            Category::Gateway => "gateway",
            Category::Server => "probeName",
            Category::Source => "source",
            Category::Hostid => "tokenID",
            Category::Plugin => "plugin",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gateway" | "gateways" => Ok(Category::Gateway),
            "server" | "servers" => Ok(Category::Server),
            "source" | "sources" => Ok(Category::Source),
            "hostid" | "hostids" => Ok(Category::Hostid),
            "plugin" | "plugins" => Ok(Category::Plugin),
            _ => Err(UnknownName(s.to_string())),
        }
    }
}

/// One persisted allow/deny entry, unique by name within its category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterEntry {
    pub name: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub origin: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub origin: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn is_header_only(&self) -> bool {
        self.rows.is_empty()
    }

    /// Replace the header with configured names when the widths agree.
    pub fn rename_columns(&mut self, names: &[String]) -> bool {
        if names.is_empty() || names.len() != self.columns.len() {
            return false;
        }
        self.columns = names.to_vec();
        true
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

pub type Headlines = Vec<(String, String)>;

pub fn scramble_columns(columns: &[String], scramble: &[String], rows: &mut [Vec<String>]) {
    let targets: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| scramble.iter().any(|s| s.eq_ignore_ascii_case(c)))
        .map(|(i, _)| i)
        .collect();
    if targets.is_empty() {
        return;
    }
    for row in rows.iter_mut() {
        for &i in &targets {
            if let Some(cell) = row.get_mut(i) {
                *cell = scramble_value(cell);
            }
        }
    }
}

/// Keep the first character and mask the rest.
pub fn scramble_value(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => {
            let mut out = String::with_capacity(value.len());
            out.push(first);
            out.extend(chars.map(|_| '*'));
            out
        }
        None => String::new(),
    }
}
