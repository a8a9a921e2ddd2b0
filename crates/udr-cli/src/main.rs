use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use udr_core::{cancel_pair, CancelToken, Category, Config, ListKind, ReportSelection};
use udr_render::{sink_for, OutputFormat};
use udr_sync::{
    email_cycle, list_reports, open_store, run_scheduler, stop, ListStore, Lists, OutboxTransport,
    Pipeline, Provenance, ReportExecutor, RunOptions, StartMode, StopOutcome,
};

#[derive(Debug, Parser)]
#[command(name = "udr")]
#[command(about = "Usage data reporter: ingest licence usage extracts and publish reports")]
struct Cli {
    /// Operator configuration merged over the built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest every configured source and rebuild derived tables.
    Fetch {
        /// Reload sources even when unchanged.
        #[arg(long)]
        force: bool,
    },
    /// Rebuild derived tables and publish reports.
    Report {
        /// Report name globs, optionally `name:value` for one split value.
        names: Vec<String>,
        #[arg(long, default_value = "table")]
        format: OutputFormat,
        #[arg(long)]
        output: Option<PathBuf>,
        /// Mask host, user and configured columns.
        #[arg(long)]
        scramble: bool,
    },
    /// Rebuild derived tables, build the report email and queue it in the outbox.
    Email,
    /// Run the scheduler.
    Start {
        #[arg(long, conflicts_with = "on_start")]
        once: bool,
        #[arg(long)]
        on_start: bool,
    },
    /// Stop a running scheduler.
    Stop {
        #[arg(long)]
        kill: bool,
    },
    /// Stop a running scheduler, then run a new one in the foreground.
    Restart {
        #[arg(long)]
        on_start: bool,
    },
    /// List configured reports.
    List,
    /// Show the query plan for a report.
    Explain { name: String },
    /// Add filter entries or group patterns.
    Add {
        #[command(subcommand)]
        target: AddTarget,
    },
    /// Remove filter entries or group patterns.
    Remove {
        #[command(subcommand)]
        target: RemoveTarget,
    },
    /// Exclude names from reports (shorthand for `add exclude`).
    Ignore {
        #[arg(long, default_value = "gateway")]
        category: Category,
        #[arg(long, default_value = "")]
        comment: String,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Show the entries in the lists file.
    Filters {
        #[arg(long, value_enum)]
        kind: Option<FilterView>,
    },
}

#[derive(Debug, Subcommand)]
enum AddTarget {
    Include {
        category: Category,
        #[arg(required = true)]
        names: Vec<String>,
        #[arg(long, default_value = "")]
        comment: String,
    },
    Exclude {
        category: Category,
        #[arg(required = true)]
        names: Vec<String>,
        #[arg(long, default_value = "")]
        comment: String,
    },
    Group {
        category: Category,
        group: String,
        #[arg(required = true)]
        patterns: Vec<String>,
        #[arg(long, default_value = "")]
        comment: String,
    },
}

#[derive(Debug, Subcommand)]
enum RemoveTarget {
    Include {
        category: Category,
        #[arg(required = true)]
        names: Vec<String>,
    },
    Exclude {
        category: Category,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Without patterns the whole group goes.
    Group {
        category: Category,
        group: String,
        patterns: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FilterView {
    Include,
    Exclude,
    Group,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("UDR_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cancellation tripped by Ctrl-C.
fn interruptible() -> CancelToken {
    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing the current step");
            handle.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Start { once, on_start } => {
            let mode = if once {
                StartMode::Once
            } else if on_start {
                StartMode::OnStart
            } else {
                StartMode::Schedule
            };
            return run_scheduler(cli.config, mode).await;
        }
        Commands::Restart { on_start } => {
            let config = load_config(&cli.config)?;
            let outcome = stop(&config.pipeline.pid_path(), false).await?;
            info!(?outcome, "previous scheduler stopped");
            let mode = if on_start {
                StartMode::OnStart
            } else {
                StartMode::Schedule
            };
            return run_scheduler(cli.config, mode).await;
        }
        command => {
            let config = load_config(&cli.config)?;
            run_command(&config, command).await
        }
    }
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    Config::from_env(path.as_deref()).context("loading configuration")
}

async fn run_command(config: &Config, command: Commands) -> Result<()> {
    let lists = ListStore::new(config.pipeline.lists_path());
    match command {
        Commands::Fetch { force } => {
            let store = open_store(config).await?;
            let options = RunOptions {
                force,
                ..RunOptions::default()
            };
            let outcome = Pipeline::new(config, &store, interruptible())
                .run(&options, &mut [])
                .await?;
            store.close().await;
            let invalidated = outcome.rebuild.map_or(0, |r| r.invalidated);
            println!(
                "fetched {} source(s), {invalidated} derived row(s) invalidated",
                outcome.sources.len()
            );
        }
        Commands::Report {
            names,
            format,
            output,
            scramble,
        } => {
            let selection = ReportSelection::parse(&names.join(","))
                .with_context(|| format!("parsing report names {names:?}"))?;
            let mut sinks =
                vec![sink_for(format, output.as_deref(), &config.pipeline.output_path())?];
            let options = RunOptions {
                scramble,
                selection,
                ..RunOptions::default()
            };
            let store = open_store(config).await?;
            let (_, summary) = Pipeline::new(config, &store, interruptible())
                .derive_and_report(None, &mut sinks, &options)
                .await?;
            store.close().await;
            if !summary.failed.is_empty() {
                warn!(failed = ?summary.failed, "some reports failed");
            }
            info!(format = %format, published = summary.published, "reports published");
        }
        Commands::Email => {
            let store = open_store(config).await?;
            let transport = OutboxTransport::new(config.email.outbox_path());
            let queued = email_cycle(config, &store, &transport, interruptible()).await;
            store.close().await;
            match queued? {
                Some(location) => println!("queued {}", location.display()),
                None => println!("no recipients configured"),
            }
        }
        Commands::Stop { kill } => {
            let pid_path = config.pipeline.pid_path();
            match stop(&pid_path, kill).await? {
                StopOutcome::NotRunning => println!("not running"),
                StopOutcome::Terminated => println!("stopped"),
                StopOutcome::Killed => println!("killed"),
            }
        }
        Commands::List => {
            let listing = list_reports(config);
            let width = listing.iter().map(|l| l.name.len()).max().unwrap_or(4).max(4);
            println!("{:<width$}  {:<10}  {:<14}  TITLE", "NAME", "GROUP", "TYPE");
            for l in listing {
                println!(
                    "{:<width$}  {:<10}  {:<14}  {}",
                    l.name,
                    l.group,
                    l.kind.as_str(),
                    l.title
                );
            }
        }
        Commands::Explain { name } => {
            let store = open_store(config).await?;
            let mut conn = store.pool().acquire().await.context("acquiring connection")?;
            let plan = ReportExecutor::new(config, CancelToken::never())
                .explain(&mut conn, &name)
                .await?;
            drop(conn);
            store.close().await;
            println!("{plan}");
        }
        Commands::Add { target } => match target {
            AddTarget::Include {
                category,
                names,
                comment,
            } => {
                let n = lists.add_filters(
                    ListKind::Include,
                    category,
                    &names,
                    &Provenance::command_line(comment),
                )?;
                println!("{n} include {category} entr(ies) written");
            }
            AddTarget::Exclude {
                category,
                names,
                comment,
            } => {
                let n = lists.add_filters(
                    ListKind::Exclude,
                    category,
                    &names,
                    &Provenance::command_line(comment),
                )?;
                println!("{n} exclude {category} entr(ies) written");
            }
            AddTarget::Group {
                category,
                group,
                patterns,
                comment,
            } => {
                lists.add_group(category, &group, &patterns, &Provenance::command_line(comment))?;
                println!("group {group} updated");
            }
        },
        Commands::Remove { target } => match target {
            RemoveTarget::Include { category, names } => {
                let n = lists.remove_filters(ListKind::Include, category, &names)?;
                println!("{n} include {category} entr(ies) removed");
            }
            RemoveTarget::Exclude { category, names } => {
                let n = lists.remove_filters(ListKind::Exclude, category, &names)?;
                println!("{n} exclude {category} entr(ies) removed");
            }
            RemoveTarget::Group {
                category,
                group,
                patterns,
            } => {
                if !lists.remove_group(category, &group, &patterns)? {
                    bail!("no {category} group named {group:?}");
                }
                println!("group {group} updated");
            }
        },
        Commands::Ignore {
            category,
            comment,
            names,
        } => {
            let n = lists.add_filters(
                ListKind::Exclude,
                category,
                &names,
                &Provenance::command_line(comment),
            )?;
            println!("{n} {category} entr(ies) ignored");
        }
        Commands::Filters { kind } => {
            let current = lists.load()?;
            print_lists(&current, kind);
        }
        Commands::Start { .. } | Commands::Restart { .. } => {}
    }
    Ok(())
}

fn print_lists(lists: &Lists, view: Option<FilterView>) {
    let show = |v: FilterView| view.map_or(true, |want| want == v);
    for (kind, view_kind, map) in [
        (ListKind::Include, FilterView::Include, &lists.include),
        (ListKind::Exclude, FilterView::Exclude, &lists.exclude),
    ] {
        if !show(view_kind) {
            continue;
        }
        for (category, entries) in map {
            for entry in entries {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    kind.as_str(),
                    category,
                    entry.name,
                    entry.user,
                    entry.timestamp.to_rfc3339(),
                    entry.comment
                );
            }
        }
    }
    if show(FilterView::Group) {
        for (category, groups) in &lists.groups {
            for group in groups {
                println!(
                    "group\t{}\t{}\t{}\t{}\t{}",
                    category,
                    group.name,
                    group.patterns.join(","),
                    group.user,
                    group.comment
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_line_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_report_and_rejects_conflicting_start_modes() {
        let cli = Cli::try_parse_from(["udr", "report", "gateway-*:GW1", "--format", "csv"])
            .expect("report");
        match cli.command {
            Commands::Report { names, format, .. } => {
                assert_eq!(names, vec!["gateway-*:GW1"]);
                assert_eq!(format, OutputFormat::Csv);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["udr", "start", "--once", "--on-start"]).is_err());

        let cli = Cli::try_parse_from(["udr", "ignore", "GW1", "--category", "servers"])
            .expect("ignore");
        assert!(matches!(
            cli.command,
            Commands::Ignore { category: Category::Server, .. }
        ));
    }
}
