//! `${...}` placeholder expansion for configured SQL and title templates.
//!
//! Resolution order for a placeholder name:
//! `values:<path>`, `filters:<alias>:<categories>`, `env:<NAME>`, bound
//! lookups (last bound wins), then a dotted configuration path.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::{Category, ListKind};

const MAX_DEPTH: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpandError {
    #[error("unterminated placeholder in {0:?}")]
    Unterminated(String),
    #[error("unknown placeholder ${{{0}}}")]
    Unknown(String),
    #[error("unknown filter category {0:?}")]
    Category(String),
    #[error("placeholders nested too deeply at ${{{0}}}")]
    TooDeep(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Data; single quotes are doubled in SQL.
    Literal(String),
    /// Trusted SQL text; inserted verbatim.
    Fragment(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sql,
    Text,
}

#[derive(Debug, Clone, Default)]
pub struct Lookup {
    entries: BTreeMap<String, Binding>,
}

impl Lookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn literal(mut self, name: &str, value: impl Into<String>) -> Self {
        self.entries
            .insert(name.to_string(), Binding::Literal(value.into()));
        self
    }

    pub fn fragment(mut self, name: &str, value: impl Into<String>) -> Self {
        self.entries
            .insert(name.to_string(), Binding::Fragment(value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.entries.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.entries.get(name)? {
            Binding::Literal(v) | Binding::Fragment(v) => Some(v.as_str()),
        }
    }
}

pub fn escape_sql_literal(value: &str) -> String {
    value.replace('\'', "''")
}

pub fn sql_quote(value: &str) -> String {
    format!("'{}'", escape_sql_literal(value))
}

#[derive(Debug, Clone)]
pub struct Expander<'a> {
    config: &'a Config,
    lookups: Vec<&'a Lookup>,
}

impl<'a> Expander<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            lookups: Vec::new(),
        }
    }

    pub fn with(mut self, lookup: &'a Lookup) -> Self {
        self.lookups.push(lookup);
        self
    }

    pub fn sql(&self, template: &str) -> Result<String, ExpandError> {
        self.expand(template, Dialect::Sql, 0)
    }

    pub fn text(&self, template: &str) -> Result<String, ExpandError> {
        self.expand(template, Dialect::Text, 0)
    }

    fn expand(&self, template: &str, dialect: Dialect, depth: usize) -> Result<String, ExpandError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| ExpandError::Unterminated(template.to_string()))?;
            let key = after[..end].trim();
            out.push_str(&self.resolve(key, dialect, depth)?);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve(&self, key: &str, dialect: Dialect, depth: usize) -> Result<String, ExpandError> {
        if let Some(path) = key.strip_prefix("values:") {
            return Ok(values_clause(&self.config.string_list(path)));
        }
        if let Some(spec) = key.strip_prefix("filters:") {
            return filter_clause(self.config, spec);
        }
        if let Some(name) = key.strip_prefix("env:") {
            let value = std::env::var(name).unwrap_or_default();
            return Ok(match dialect {
                Dialect::Sql => escape_sql_literal(&value),
                Dialect::Text => value,
            });
        }
        if let Some(binding) = self.lookups.iter().rev().find_map(|l| l.get(key)) {
            return Ok(match (binding, dialect) {
                (Binding::Literal(v), Dialect::Sql) => escape_sql_literal(v),
                (Binding::Literal(v), Dialect::Text) | (Binding::Fragment(v), _) => v.clone(),
            });
        }
        if key.contains('.') {
            if let Some(value) = self.config.lookup_path(key) {
                if !value.contains("${") {
                    return Ok(value);
                }
                if depth >= MAX_DEPTH {
                    return Err(ExpandError::TooDeep(key.to_string()));
                }
                return self.expand(&value, dialect, depth + 1);
            }
        }
        Err(ExpandError::Unknown(key.to_string()))
    }
}

/// Expand a statement owned by `table`, with `${table}` bound to its name.
pub fn table_statement(
    config: &Config,
    table: &str,
    template: &str,
) -> Result<String, ExpandError> {
    let lookup = Lookup::new().fragment("table", table);
    Expander::new(config).with(&lookup).sql(template)
}

/// `UNION ALL VALUES ('a'), ('b')`, or nothing for an empty list. Templates
/// guard the CTE with `SELECT 1 WHERE 1 == 0` so both forms stay valid SQL.
pub fn values_clause(values: &[String]) -> String {
    if values.is_empty() {
        return String::new();
    }
    let rows = values
        .iter()
        .map(|v| format!("({})", sql_quote(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UNION ALL VALUES {rows}")
}

/// `alias:cat1,cat2` → `EXISTS (include) AND NOT EXISTS (exclude)` per
/// category, all joined with `AND`. An empty alias leaves columns unqualified.
fn filter_clause(config: &Config, spec: &str) -> Result<String, ExpandError> {
    let (alias, categories) = match spec.split_once(':') {
        Some((alias, categories)) => (alias.trim(), categories),
        None => ("", spec),
    };

    let mut parts = Vec::new();
    for name in categories.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let category: Category = name
            .parse()
            .map_err(|_| ExpandError::Category(name.to_string()))?;
        let column = if alias.is_empty() {
            category.fact_column().to_string()
        } else {
            format!("{alias}.{}", category.fact_column())
        };

        let mut found = false;
        if let Some(include) = config.filters.tables(ListKind::Include).get(&category) {
            parts.push(format!(
                "EXISTS (SELECT 1 FROM {t} WHERE {column} GLOB {t}.name)",
                t = include.table
            ));
            found = true;
        }
        if let Some(exclude) = config.filters.tables(ListKind::Exclude).get(&category) {
            parts.push(format!(
                "NOT EXISTS (SELECT 1 FROM {t} WHERE {column} GLOB {t}.name)",
                t = exclude.table
            ));
            found = true;
        }
        if !found {
            warn!(category = %category, "no filter tables configured for category");
        }
    }

    if parts.is_empty() {
        return Ok("1".to_string());
    }
    Ok(parts.join(" AND "))
}

/// `col NOT IN table` for each requested ignore column, or `1` when none
/// are configured.
pub fn ignore_clause(config: &Config, columns: &[&str]) -> String {
    let configured: Vec<(&str, &str)> = config
        .ignore
        .values()
        .map(|i| (i.column.as_str(), i.table.as_str()))
        .collect();

    let wanted: Vec<&str> = if columns.is_empty() {
        configured.iter().map(|(c, _)| *c).collect()
    } else {
        columns.to_vec()
    };

    let mut parts = Vec::new();
    for column in wanted {
        match configured.iter().find(|(c, _)| *c == column) {
            Some((c, table)) => parts.push(format!("{c} NOT IN {table}")),
            None => debug!(column, "no ignore table configured for column, skipping"),
        }
    }
    if parts.is_empty() {
        "1".to_string()
    } else {
        parts.join(" AND ")
    }
}

pub fn ignore_lookup(config: &Config) -> Lookup {
    let without_plugin: Vec<&str> = config
        .ignore
        .values()
        .map(|i| i.column.as_str())
        .filter(|c| *c != "plugin")
        .collect();

    let no_plugin = if without_plugin.is_empty() {
        "1".to_string()
    } else {
        ignore_clause(config, &without_plugin)
    };

    Lookup::new()
        .fragment("ignore-all", ignore_clause(config, &[]))
        .fragment("ignore-all-no-plugin", no_plugin)
        .fragment("ignore-gateway-source", ignore_clause(config, &["gateway", "source"]))
}
