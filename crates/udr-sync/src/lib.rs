//! Orchestration for UDR: side-file lists, derived tables, report execution,
//! the two-transaction pipeline, the scheduler, process control and email.

pub mod control;
pub mod derive;
pub mod email;
pub mod lists;
pub mod pipeline;
pub mod report;
pub mod schedule;

pub use control::{read_pid_file, remove_pid_file, stop, write_pid_file, StopError, StopOutcome};
pub use derive::{DerivedTableBuilder, RebuildSummary};
pub use email::{email_cycle, EmailError, MailMessage, MailTransport, OutboxTransport};
pub use lists::{ListError, ListStore, Lists, Provenance};
pub use pipeline::{configured_sinks, open_store, Pipeline, RunOptions, RunOutcome};
pub use report::{list_reports, ReportError, ReportExecutor, ReportListing, RunSummary};
pub use schedule::{normalize_cron, run_scheduler, JobKind, SchedulerState, StartMode};

pub const CRATE_NAME: &str = "udr-sync";

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;

    use sqlx::sqlite::SqliteConnection;
    use udr_core::{
        CancelToken, Config, Report, Reporter, SinkConstraints, SinkError, SinkKind, Table,
    };
    use udr_ingest::Ingestor;
    use udr_storage::{query_to_table, Store};

    const DETAILS: &str = "\
Req Number,ParentRequestingComponent,RequestingComponent,Component,Item,Description,Number
1,gateway:GW1,gateway:GW1,gateway_component,gateway,,1
2,gateway:GW1,gateway:GW1,binary,netprobe,host1:7036 [abcd],1
3,gateway:GW1,gateway:GW1,plugin,cpu,host1:7036 [abcd],2
4,gateway:GW2,gateway:GW2,binary,netprobe,host2:7036 [efgh],1
5,gateway:GW2,gateway:GW2,plugin,aws-cloudwatch,host2:7036 [efgh],1
";

    pub fn config_for(dir: &Path, extra: &str) -> Config {
        Config::from_yaml_str(&format!(
            "pipeline:\n  sources: [\"{d}/*.csv\"]\n  lists-file: {d}/lists.yaml\n  pid-file: {d}/udr.pid\n  output-dir: {d}/reports\ndb:\n  file: {d}/udr.db\n{extra}",
            d = dir.display()
        ))
        .expect("config")
    }

    /// A store holding one detail file (`file:details`) with two gateways.
    pub async fn seeded_store(dir: &Path, extra: &str) -> (Config, Store) {
        std::fs::write(dir.join("details.csv"), DETAILS).expect("write details");
        let config = config_for(dir, extra);
        let store = crate::pipeline::open_store(&config).await.expect("store");
        let ingestor = Ingestor::new(&config, CancelToken::never()).expect("ingestor");
        let mut tx = store.begin().await.expect("begin");
        ingestor.ingest_all(&mut tx).await.expect("ingest");
        tx.commit().await.expect("commit");
        (config, store)
    }

    pub async fn table_rows(conn: &mut SqliteConnection, table: &str) -> Table {
        let mut out = query_to_table(conn, &format!("SELECT * FROM {table}"))
            .await
            .expect("select");
        out.rows.sort();
        out
    }

    pub struct RecordingSink {
        kind: SinkKind,
        constraints: SinkConstraints,
        pub prepared: Vec<Report>,
        pub removed: Vec<Report>,
        pub tables: Vec<(Vec<String>, Vec<Vec<String>>)>,
        pub headlines: Vec<(String, String)>,
        fail_render: bool,
    }

    impl RecordingSink {
        pub fn new(kind: SinkKind) -> Self {
            Self {
                kind,
                constraints: SinkConstraints::default(),
                prepared: Vec::new(),
                removed: Vec::new(),
                tables: Vec::new(),
                headlines: Vec::new(),
                fail_render: false,
            }
        }

        pub fn failing_render(mut self) -> Self {
            self.fail_render = true;
            self
        }

        pub fn with_constraints(mut self, constraints: SinkConstraints) -> Self {
            self.constraints = constraints;
            self
        }
    }

    impl Reporter for RecordingSink {
        fn kind(&self) -> SinkKind {
            self.kind
        }

        fn constraints(&self) -> SinkConstraints {
            self.constraints
        }

        fn extension(&self) -> &'static str {
            "rec"
        }

        fn prepare(&mut self, report: &Report) -> Result<(), SinkError> {
            self.prepared.push(report.clone());
            Ok(())
        }

        fn add_headline(&mut self, name: &str, value: &str) {
            self.headlines.push((name.to_string(), value.to_string()));
        }

        fn update_table(&mut self, columns: &[String], rows: Vec<Vec<String>>) {
            self.tables.push((columns.to_vec(), rows));
        }

        fn remove(&mut self, report: &Report) -> Result<(), SinkError> {
            self.removed.push(report.clone());
            Ok(())
        }

        fn render(&mut self) -> Result<(), SinkError> {
            if self.fail_render {
                return Err(SinkError::Render {
                    sink: "recording",
                    message: "disk full".to_string(),
                });
            }
            Ok(())
        }

        fn close(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }
}
