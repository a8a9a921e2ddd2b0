//! Detail rows: one licensed component per line, dispatched on `component`.

use std::collections::HashMap;
use std::sync::OnceLock;

use csv::StringRecord;
use regex::Regex;
use sqlx::sqlite::SqliteConnection;
use tracing::{error, warn};
use udr_core::{Fact, FactKind, ProbeAddress};
use udr_storage::exec;

use crate::{csv_reader, ExtractError, Statements};

/// Layouts with at least this many columns carry host and port columns.
pub const EXTENDED_COLUMNS: usize = 22;

const INDIVIDUAL: &str = "INDIVIDUAL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailKind {
    Binary,
    Plugin,
    CaPlugin,
    GatewayComponent,
    GatewayPlugin,
    Unknown(String),
}

impl From<&str> for DetailKind {
    fn from(value: &str) -> Self {
        match value {
            "binary" => DetailKind::Binary,
            "plugin" => DetailKind::Plugin,
            "ca_plugin" => DetailKind::CaPlugin,
            "gateway_component" => DetailKind::GatewayComponent,
            "gateway-plugin" => DetailKind::GatewayPlugin,
            other => DetailKind::Unknown(other.to_string()),
        }
    }
}

fn address_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(.+?):(\d+)\s\[(.*)\]$").ok())
        .as_ref()
}

/// `host:port [token]`.
pub fn parse_address(description: &str) -> Option<ProbeAddress> {
    let caps = address_pattern()?.captures(description)?;
    let token = caps[3].trim_matches(|c| c == '[' || c == ']');
    let individual = token == INDIVIDUAL;
    Some(ProbeAddress {
        host: caps[1].to_string(),
        port: caps[2].to_string(),
        token: if individual {
            INDIVIDUAL.to_string()
        } else {
            caps[3].to_string()
        },
        individual,
    })
}

#[derive(Debug, Clone)]
pub struct DetailColumns {
    index: HashMap<String, usize>,
    extended: bool,
}

impl DetailColumns {
    pub fn from_header(header: &StringRecord) -> Self {
        let index = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().to_ascii_lowercase().replace(' ', ""), i))
            .collect();
        Self {
            index,
            extended: header.len() >= EXTENDED_COLUMNS,
        }
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    fn get<'r>(&self, record: &'r StringRecord, name: &str) -> &'r str {
        self.index
            .get(name)
            .and_then(|i| record.get(*i))
            .map(str::trim)
            .unwrap_or("")
    }

    fn opt(&self, record: &StringRecord, name: &str) -> Option<String> {
        let value = self.get(record, name);
        (!value.is_empty()).then(|| value.to_string())
    }

    fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn extended_address(&self, record: &StringRecord) -> ProbeAddress {
        let host_id = self.get(record, "host_id");
        let individual = self
            .get(record, "description")
            .contains(&format!("[{INDIVIDUAL}]"));
        ProbeAddress {
            host: self.get(record, "host_name").to_string(),
            port: self.get(record, "port").to_string(),
            token: if individual {
                INDIVIDUAL.to_string()
            } else {
                host_id.to_string()
            },
            individual,
        }
    }

    fn address(&self, record: &StringRecord, line: u64) -> Result<ProbeAddress, ExtractError> {
        if self.extended {
            return Ok(self.extended_address(record));
        }
        let description = self.get(record, "description");
        parse_address(description).ok_or_else(|| ExtractError::Row {
            line,
            message: format!("description {description:?} is not `host:port [token]`"),
        })
    }
}

/// The facts one detail row contributes. Unknown components yield none.
pub fn facts_for_row(
    columns: &DetailColumns,
    record: &StringRecord,
    line: u64,
) -> Result<Vec<Fact>, ExtractError> {
    let gateway = columns
        .get(record, "requestingcomponent")
        .trim_start_matches("gateway:")
        .to_string();
    let item = columns.get(record, "item").to_string();
    let number: i64 = columns.get(record, "number").parse().unwrap_or_default();

    let facts = match DetailKind::from(columns.get(record, "component")) {
        DetailKind::Binary => {
            if item != "netprobe" {
                return Err(ExtractError::UnknownBinary { item, line });
            }
            vec![Fact::Probe {
                gateway,
                address: columns.address(record, line)?,
                os: columns.opt(record, "os"),
                version: columns.opt(record, "version"),
            }]
        }
        DetailKind::Plugin => vec![Fact::Sampler {
            gateway,
            plugin: item,
            address: columns.address(record, line)?,
            number,
        }],
        DetailKind::CaPlugin => {
            let entity = if columns.is_extended() {
                columns.get(record, "managed_entity")
            } else {
                columns.get(record, "description")
            };
            let address = columns
                .has("host_name")
                .then(|| columns.extended_address(record));
            vec![Fact::CaSampler {
                gateway,
                plugin: item,
                entity: entity.to_string(),
                address,
                number,
            }]
        }
        DetailKind::GatewayComponent => {
            let mut facts = vec![Fact::GatewayComponent {
                gateway: gateway.clone(),
                component: item.clone(),
                number,
            }];
            if item == "gateway" {
                facts.push(Fact::Gateway {
                    gateway,
                    host: columns.opt(record, "gateway_host"),
                    port: columns.opt(record, "gateway_port"),
                    version: columns.opt(record, "version"),
                });
            }
            facts
        }
        DetailKind::GatewayPlugin => vec![Fact::GatewaySampler {
            gateway,
            plugin: item,
            number,
        }],
        DetailKind::Unknown(component) => {
            warn!(component, line, "ignoring unknown detail component");
            Vec::new()
        }
    };
    Ok(facts)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailCounts {
    pub inserted: HashMap<FactKind, usize>,
    pub failed: usize,
}

impl DetailCounts {
    pub fn total(&self) -> usize {
        self.inserted.values().sum()
    }
}

/// Insert every fact in a detail document. A malformed row stops the
/// document; rows already inserted stay. Failed inserts are logged and skipped.
pub async fn load_details(
    conn: &mut SqliteConnection,
    statements: &Statements,
    bytes: &[u8],
    source: &str,
    time: &str,
) -> Result<DetailCounts, ExtractError> {
    let mut reader = csv_reader(bytes);
    let mut records = reader.records();
    let mut counts = DetailCounts::default();

    let Some(header) = records.next() else {
        return Ok(counts);
    };
    let columns = DetailColumns::from_header(&header?);

    for record in records {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        for fact in facts_for_row(&columns, &record, line)? {
            let kind = fact.kind();
            match exec(conn, statements.fact(kind), &fact.params(time, source)).await {
                Ok(_) => *counts.inserted.entry(kind).or_default() += 1,
                Err(err) => {
                    counts.failed += 1;
                    error!(source, line, kind = kind.as_str(), error = %err, "inserting fact");
                }
            }
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(names: &[&str]) -> DetailColumns {
        DetailColumns::from_header(&StringRecord::from(names.to_vec()))
    }

    const CLASSIC: [&str; 7] = [
        "Req Number",
        "ParentRequestingComponent",
        "RequestingComponent",
        "Component",
        "Item",
        "Description",
        "Number",
    ];

    fn row(fields: &[&str]) -> StringRecord {
        StringRecord::from(fields.to_vec())
    }

    #[test]
    fn address_pattern_and_individual_tokens() {
        let address = parse_address("itrsrh1:7036 [abcd]").expect("address");
        assert_eq!(address.host, "itrsrh1");
        assert_eq!(address.port, "7036");
        assert_eq!(address.token, "abcd");
        assert!(!address.individual);

        let individual = parse_address("host-a:7036 [INDIVIDUAL]").expect("address");
        assert!(individual.individual);
        assert_eq!(individual.token, "INDIVIDUAL");

        assert!(parse_address("no port here").is_none());
    }

    #[test]
    fn binary_and_plugin_rows_share_probe_fields() {
        let columns = header(&CLASSIC);
        let probe = facts_for_row(
            &columns,
            &row(&["1", "gateway:GW1", "gateway:GW1", "binary", "netprobe", "itrsrh1:7036 [abcd]", "1"]),
            2,
        )
        .expect("probe");
        let sampler = facts_for_row(
            &columns,
            &row(&["2", "gateway:GW1", "gateway:GW1", "plugin", "cpu", "itrsrh1:7036 [abcd]", "3"]),
            3,
        )
        .expect("sampler");

        let (Fact::Probe { gateway: g1, address: a1, .. }, Fact::Sampler { gateway: g2, address: a2, number, .. }) =
            (&probe[0], &sampler[0])
        else {
            panic!("unexpected facts: {probe:?} {sampler:?}");
        };
        assert_eq!(g1, "GW1");
        assert_eq!(g1, g2);
        assert_eq!(a1, a2);
        assert_eq!(*number, 3);
    }

    #[test]
    fn gateway_component_for_gateway_also_records_gateway() {
        let columns = header(&CLASSIC);
        let facts = facts_for_row(
            &columns,
            &row(&["1", "gateway:GW1", "gateway:GW1", "gateway_component", "gateway", "", "1"]),
            2,
        )
        .expect("facts");
        let kinds: Vec<FactKind> = facts.iter().map(Fact::kind).collect();
        assert_eq!(kinds, vec![FactKind::GatewayComponent, FactKind::Gateway]);
        assert!(facts.iter().all(|f| f.gateway() == "GW1"));

        let other = facts_for_row(
            &columns,
            &row(&["2", "gateway:GW1", "gateway:GW1", "gateway_component", "database-logging", "", "1"]),
            3,
        )
        .expect("facts");
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn bad_rows_are_file_level_errors_and_unknowns_are_skipped() {
        let columns = header(&CLASSIC);
        assert!(matches!(
            facts_for_row(
                &columns,
                &row(&["1", "gateway:GW1", "gateway:GW1", "binary", "licd", "h:1 [t]", "1"]),
                2,
            ),
            Err(ExtractError::UnknownBinary { .. })
        ));
        assert!(matches!(
            facts_for_row(
                &columns,
                &row(&["1", "gateway:GW1", "gateway:GW1", "plugin", "cpu", "garbage", "1"]),
                2,
            ),
            Err(ExtractError::Row { line: 2, .. })
        ));
        let unknown = facts_for_row(
            &columns,
            &row(&["1", "gateway:GW1", "gateway:GW1", "widget", "x", "", "1"]),
            2,
        )
        .expect("unknown");
        assert!(unknown.is_empty());
    }

    #[test]
    fn extended_layout_reads_address_columns() {
        let mut names: Vec<String> = CLASSIC.iter().map(|s| s.to_string()).collect();
        names.extend(
            ["host_name", "port", "host_id", "managed_entity", "gateway_host", "gateway_port"]
                .iter()
                .map(|s| s.to_string()),
        );
        while names.len() < EXTENDED_COLUMNS {
            names.push(format!("extra_{}", names.len()));
        }
        let columns = DetailColumns::from_header(&StringRecord::from(names.clone()));
        assert!(columns.is_extended());

        let mut fields: Vec<String> = vec![
            "1", "gateway:GW2", "gateway:GW2", "plugin", "fkm", "[INDIVIDUAL]", "4", "probe-b", "7036",
            "hid-9", "", "", "",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        fields.resize(names.len(), String::new());
        let facts = facts_for_row(&columns, &StringRecord::from(fields), 2).expect("facts");
        let Fact::Sampler { address, number, .. } = &facts[0] else {
            panic!("expected sampler");
        };
        assert_eq!(address.host, "probe-b");
        assert_eq!(address.token, "INDIVIDUAL");
        assert!(address.individual);
        assert_eq!(*number, 4);
    }
}
