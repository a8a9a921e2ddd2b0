//! Licence summaries: name/value metadata followed by a token table.

use chrono::NaiveDate;
use sqlx::sqlite::SqliteConnection;
use tracing::{error, warn};
use udr_core::SqlParam;
use udr_storage::exec;

use crate::{csv_reader, ExtractError, IngestError, Statements};

pub const EXPIRY_FORMAT: &str = "%d %B %Y";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LicenceSummary {
    pub expiry: Option<NaiveDate>,
    pub mode: String,
    pub name: String,
    pub hostname: String,
    pub hostid: String,
    pub tokens: Vec<TokenUsage>,
}

/// One `Overall` row of the token table. `None` totals are unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenUsage {
    pub token: String,
    pub total: Option<String>,
    pub used: String,
    pub free: Option<String>,
}

impl LicenceSummary {
    /// Monitoring licences carry metadata only.
    pub fn is_monitoring(&self) -> bool {
        self.mode == "monitoring"
    }
}

fn limited(value: &str) -> Option<String> {
    if value.eq_ignore_ascii_case("unlimited") || value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

pub fn parse_summary(bytes: &[u8]) -> Result<LicenceSummary, ExtractError> {
    let mut reader = csv_reader(bytes);
    let mut summary = LicenceSummary::default();
    let mut records = reader.records();

    let header = loop {
        let Some(record) = records.next() else {
            return Ok(summary);
        };
        let record = record?;
        if record.len() > 2 {
            break record;
        }
        if record.len() != 2 {
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            return Err(ExtractError::Row {
                line,
                message: "expected a name,value pair".to_string(),
            });
        }
        let value = record[1].to_string();
        match record[0].to_ascii_lowercase().as_str() {
            "expiry" => match NaiveDate::parse_from_str(&value, EXPIRY_FORMAT) {
                Ok(date) => summary.expiry = Some(date),
                Err(err) => error!(value, error = %err, "unparseable licence expiry"),
            },
            "mode" => summary.mode = value.to_ascii_lowercase(),
            "licencename" => summary.name = value,
            "hostname" => summary.hostname = value,
            "hostid" => summary.hostid = value,
            _ => {}
        }
    };

    if summary.is_monitoring() {
        return Ok(summary);
    }

    let position = |name: &str| {
        header
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .ok_or_else(|| ExtractError::MissingColumn(name.to_string()))
    };
    let group = position("group")?;
    let token = position("token")?;
    let total = position("total")?;
    let used = position("used")?;
    let free = position("free")?;

    for record in records {
        let record = record?;
        if record.len() != header.len() {
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            warn!(line, "token row has the wrong column count, skipping");
            continue;
        }
        if &record[group] != "Overall" {
            continue;
        }
        summary.tokens.push(TokenUsage {
            token: record[token].to_string(),
            total: limited(&record[total]),
            used: record[used].to_string(),
            free: limited(&record[free]),
        });
    }
    Ok(summary)
}

pub async fn load_summary(
    conn: &mut SqliteConnection,
    statements: &Statements,
    summary: &LicenceSummary,
    source: &str,
    time: &str,
) -> Result<usize, IngestError> {
    let mut written = 0;
    if !summary.is_monitoring() {
        for token in &summary.tokens {
            let params = [
                SqlParam::from(token.token.as_str()),
                SqlParam::text_or_null(token.total.as_deref()),
                SqlParam::from(token.used.as_str()),
                SqlParam::text_or_null(token.free.as_deref()),
                SqlParam::from(time),
                SqlParam::from(source),
            ];
            match exec(conn, &statements.tokens, &params).await {
                Ok(_) => written += 1,
                Err(err) => error!(source, token = %token.token, error = %err, "inserting token"),
            }
        }
    }

    let expiry = summary.expiry.map(|d| d.format("%Y-%m-%d").to_string());
    let params = [
        SqlParam::from(source),
        SqlParam::text_or_null(expiry.as_deref()),
        SqlParam::text_or_null(Some(summary.mode.as_str())),
        SqlParam::text_or_null(Some(summary.name.as_str())),
        SqlParam::text_or_null(Some(summary.hostname.as_str())),
        SqlParam::text_or_null(Some(summary.hostid.as_str())),
    ];
    exec(conn, &statements.licences, &params).await?;
    Ok(written)
}
