//! Declarative report definitions and report-name selection.

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::sink::SinkKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportType {
    #[default]
    Standard,
    Summary,
    Indirect,
    Split,
    PluginGroups,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::Standard => "standard",
            ReportType::Summary => "summary",
            ReportType::Indirect => "indirect",
            ReportType::Split => "split",
            ReportType::PluginGroups => "plugin-groups",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatTest {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

/// Styles a cell when its value passes `test` against `value`. Numeric
/// comparison is used when both sides parse as numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConditionalFormat {
    pub column: String,
    pub test: FormatTest,
    pub value: String,
    #[serde(default = "default_style")]
    pub style: String,
}

fn default_style() -> String {
    "warning".to_string()
}

impl ConditionalFormat {
    pub fn matches(&self, cell: &str) -> bool {
        if self.test == FormatTest::Contains {
            return cell.contains(&self.value);
        }
        let ordering = match (cell.trim().parse::<f64>(), self.value.trim().parse::<f64>()) {
            (Ok(a), Ok(b)) => a.partial_cmp(&b),
            _ => Some(cell.cmp(self.value.as_str())),
        };
        let Some(ordering) = ordering else {
            return false;
        };
        match self.test {
            FormatTest::Eq => ordering.is_eq(),
            FormatTest::Ne => ordering.is_ne(),
            FormatTest::Lt => ordering.is_lt(),
            FormatTest::Le => ordering.is_le(),
            FormatTest::Gt => ordering.is_gt(),
            FormatTest::Ge => ordering.is_ge(),
            FormatTest::Contains => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReportDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub group: String,
    #[serde(rename = "type", default)]
    pub kind: ReportType,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub headlines: Option<String>,
    #[serde(default)]
    pub split_column: Option<String>,
    #[serde(default)]
    pub split_values_query: Option<String>,
    #[serde(default, alias = "split-values-query-all")]
    pub split_values_all_query: Option<String>,
    /// Name of a `groupings` map for plugin-groups reports.
    #[serde(default)]
    pub grouping: Option<String>,
    #[serde(default)]
    pub grouping_order: Vec<String>,
    #[serde(default)]
    pub conditional_format: Vec<ConditionalFormat>,
    #[serde(default)]
    pub freeze_to_column: Option<String>,
    #[serde(default, alias = "enable-for-dataview")]
    pub enable_for_dashboard: Option<bool>,
    #[serde(default, alias = "enable-for-xlsx")]
    pub enable_for_workbook: Option<bool>,
    #[serde(default)]
    pub scramble_columns: Vec<String>,
}

impl ReportDefinition {
    pub fn enabled_for(&self, kind: SinkKind) -> bool {
        match kind {
            SinkKind::Dashboard => self.enable_for_dashboard.unwrap_or(true),
            SinkKind::Workbook => self.enable_for_workbook.unwrap_or(true),
            SinkKind::Text | SinkKind::Delimited | SinkKind::Html => true,
        }
    }

    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.name
        } else {
            &self.title
        }
    }
}

#[derive(Debug, Clone)]
struct Selector {
    pattern: Pattern,
    value: Option<String>,
}

/// Comma-separated report-name globs, each optionally suffixed `:<value>`
/// to restrict a split report to one value. Empty selects everything.
#[derive(Debug, Clone, Default)]
pub struct ReportSelection {
    selectors: Vec<Selector>,
}

/// What a selection says about one report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selected {
    No,
    All,
    Only(String),
}

impl ReportSelection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self, glob::PatternError> {
        let mut selectors = Vec::new();
        for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = match part.split_once(':') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (part, None),
            };
            selectors.push(Selector {
                pattern: Pattern::new(name)?,
                value,
            });
        }
        Ok(Self { selectors })
    }

    pub fn is_all(&self) -> bool {
        self.selectors.is_empty()
    }

    pub fn select(&self, name: &str) -> Selected {
        if self.selectors.is_empty() {
            return Selected::All;
        }
        for selector in &self.selectors {
            if selector.pattern.matches(name) {
                return match &selector.value {
                    Some(value) => Selected::Only(value.clone()),
                    None => Selected::All,
                };
            }
        }
        Selected::No
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_matches_globs_and_values() {
        let selection = ReportSelection::parse("gateway-*:GW1, plugin-usage").expect("parse");
        assert_eq!(selection.select("gateway-detail"), Selected::Only("GW1".into()));
        assert_eq!(selection.select("plugin-usage"), Selected::All);
        assert_eq!(selection.select("summary"), Selected::No);
        assert_eq!(ReportSelection::all().select("anything"), Selected::All);
    }

    #[test]
    fn definition_parses_kebab_fields_and_aliases() {
        let def: ReportDefinition = serde_yaml::from_str(
            "title: Per gateway\ntype: plugin-groups\nsplit-values-query-all: SELECT 1\nenable-for-xlsx: false\n",
        )
        .expect("parse");
        assert_eq!(def.kind, ReportType::PluginGroups);
        assert_eq!(def.split_values_all_query.as_deref(), Some("SELECT 1"));
        assert!(!def.enabled_for(SinkKind::Workbook));
        assert!(def.enabled_for(SinkKind::Dashboard));
    }

    #[test]
    fn conditional_format_compares_numbers_then_text() {
        let rule = ConditionalFormat {
            column: "free".into(),
            test: FormatTest::Lt,
            value: "10".into(),
            style: "critical".into(),
        };
        assert!(rule.matches("9"));
        assert!(!rule.matches("10"));
        assert!(!rule.matches("100"));
        let contains = ConditionalFormat {
            test: FormatTest::Contains,
            value: "ERROR".into(),
            ..rule
        };
        assert!(contains.matches("ERROR: timeout"));
    }
}
