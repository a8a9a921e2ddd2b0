//! Cron-driven main and email cycles, at most one of each kind at a time.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use udr_core::{cancel_pair, CancelToken, Config};
use uuid::Uuid;

use crate::control::{remove_pid_file, write_pid_file};
use crate::email::{email_cycle, OutboxTransport};
use crate::pipeline::{configured_sinks, open_store, Pipeline, RunOptions};

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type JobTask = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Main,
    Email,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Main => "main",
            JobKind::Email => "email",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// One full run, then exit.
    Once,
    /// A full run now, then follow the schedule.
    OnStart,
    /// An ingest-only pass now, then follow the schedule.
    Schedule,
}

/// Five-field expressions gain a leading seconds field. Blank means no job.
pub fn normalize_cron(expr: &str) -> Option<String> {
    let expr = expr.trim();
    if expr.is_empty() {
        return None;
    }
    if expr.split_whitespace().count() == 5 {
        Some(format!("0 {expr}"))
    } else {
        Some(expr.to_string())
    }
}

#[derive(Debug, Clone, Default)]
struct Singleton(Arc<AtomicBool>);

struct Running(Arc<AtomicBool>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Singleton {
    fn try_enter(&self) -> Option<Running> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Running(self.0.clone()))
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Run `task` unless another run of the same kind holds the guard.
async fn guarded(kind: JobKind, guard: Singleton, task: JobTask) -> bool {
    let Some(_running) = guard.try_enter() else {
        warn!(job = kind.as_str(), "previous run still in progress, trigger dropped");
        return false;
    };
    info!(job = kind.as_str(), "job started");
    task().await;
    info!(job = kind.as_str(), "job finished");
    true
}

pub struct SchedulerState {
    scheduler: JobScheduler,
    jobs: HashMap<JobKind, (Uuid, String)>,
    guards: HashMap<JobKind, Singleton>,
}

impl SchedulerState {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        Ok(Self {
            scheduler,
            jobs: HashMap::new(),
            guards: HashMap::new(),
        })
    }

    fn guard(&mut self, kind: JobKind) -> Singleton {
        self.guards.entry(kind).or_default().clone()
    }

    pub fn schedule(&self, kind: JobKind) -> Option<&str> {
        self.jobs.get(&kind).map(|(_, cron)| cron.as_str())
    }

    /// Swap the job for `kind`. Returns false when the schedule is unchanged.
    pub async fn replace(
        &mut self,
        kind: JobKind,
        schedule: Option<&str>,
        task: JobTask,
    ) -> Result<bool> {
        let cron = schedule.and_then(normalize_cron);
        if self.jobs.get(&kind).map(|(_, c)| c) == cron.as_ref() {
            return Ok(false);
        }

        if let Some((id, old)) = self.jobs.remove(&kind) {
            self.scheduler
                .remove(&id)
                .await
                .with_context(|| format!("removing {} job", kind.as_str()))?;
            info!(job = kind.as_str(), cron = %old, "job removed");
        }
        let Some(cron) = cron else {
            return Ok(true);
        };

        let guard = self.guard(kind);
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let task = task.clone();
            let guard = guard.clone();
            Box::pin(async move {
                guarded(kind, guard, task).await;
            })
        })
        .with_context(|| format!("creating {} job for cron {cron}", kind.as_str()))?;
        let id = self
            .scheduler
            .add(job)
            .await
            .with_context(|| format!("adding {} job", kind.as_str()))?;
        info!(job = kind.as_str(), cron = %cron, "job scheduled");
        self.jobs.insert(kind, (id, cron));
        Ok(true)
    }

    /// Run `task` now in the background, behind the same guard as the
    /// scheduled job of that kind.
    pub fn spawn_now(&mut self, kind: JobKind, task: JobTask) {
        let guard = self.guard(kind);
        tokio::spawn(guarded(kind, guard, task));
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await.context("starting scheduler")
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.scheduler.shutdown().await.context("stopping scheduler")
    }
}

async fn main_cycle(config: &Config, cancel: CancelToken, ingest_only: bool) -> Result<()> {
    let store = open_store(config).await?;
    let mut sinks = if ingest_only {
        Vec::new()
    } else {
        configured_sinks(config)?
    };
    let options = RunOptions {
        ingest_only,
        ..RunOptions::default()
    };
    let result = Pipeline::new(config, &store, cancel)
        .run(&options, &mut sinks)
        .await;
    store.close().await;
    result.map(|_| ())
}

async fn email_job_cycle(config: &Config, cancel: CancelToken) -> Result<()> {
    let store = open_store(config).await?;
    let transport = OutboxTransport::new(config.email.outbox_path());
    let result = email_cycle(config, &store, &transport, cancel).await;
    store.close().await;
    result.map(|_| ())
}

fn main_job(config: watch::Receiver<Arc<Config>>, cancel: CancelToken, ingest_only: bool) -> JobTask {
    Arc::new(move || -> JobFuture {
        let config = config.borrow().clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            if let Err(err) = main_cycle(&config, cancel, ingest_only).await {
                error!(error = ?err, "run failed");
            }
        })
    })
}

fn email_job(config: watch::Receiver<Arc<Config>>, cancel: CancelToken) -> JobTask {
    Arc::new(move || -> JobFuture {
        let config = config.borrow().clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            if let Err(err) = email_job_cycle(&config, cancel).await {
                error!(error = ?err, "email failed");
            }
        })
    })
}

fn blank_to_none(schedule: &Option<String>) -> Option<&str> {
    schedule.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Drive the pipeline until SIGTERM or Ctrl-C. SIGHUP reloads the
/// configuration and replaces any job whose schedule changed.
pub async fn run_scheduler(config_path: Option<PathBuf>, mode: StartMode) -> Result<()> {
    let config = Arc::new(Config::from_env(config_path.as_deref()).context("loading configuration")?);
    let (handle, cancel) = cancel_pair();

    if mode == StartMode::Once {
        return main_cycle(&config, cancel, false).await;
    }

    let pid_path = config.pipeline.pid_path();
    write_pid_file(&pid_path)
        .with_context(|| format!("writing pid file {}", pid_path.display()))?;

    let (config_tx, config_rx) = watch::channel(config.clone());
    let main_task = main_job(config_rx.clone(), cancel.clone(), false);
    let email_task = email_job(config_rx.clone(), cancel.clone());

    let result = async {
        let mut state = SchedulerState::new().await?;
        state
            .replace(JobKind::Main, blank_to_none(&config.pipeline.schedule), main_task.clone())
            .await?;
        state
            .replace(
                JobKind::Email,
                blank_to_none(&config.pipeline.email_schedule),
                email_task.clone(),
            )
            .await?;
        state.start().await?;

        match mode {
            StartMode::OnStart => state.spawn_now(JobKind::Main, main_task.clone()),
            StartMode::Schedule => {
                state.spawn_now(JobKind::Main, main_job(config_rx.clone(), cancel.clone(), true))
            }
            StartMode::Once => {}
        }

        wait_for_signals(&mut state, config_path.as_deref(), &config_tx, &main_task, &email_task)
            .await?;

        handle.cancel();
        state.shutdown().await
    }
    .await;

    remove_pid_file(&pid_path);
    info!("scheduler stopped");
    result
}

async fn reload(
    state: &mut SchedulerState,
    config_path: Option<&std::path::Path>,
    config_tx: &watch::Sender<Arc<Config>>,
    main_task: &JobTask,
    email_task: &JobTask,
) {
    let fresh = match Config::from_env(config_path) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(error = %err, "reload failed, keeping the previous configuration");
            return;
        }
    };
    config_tx.send_replace(fresh.clone());
    for (kind, schedule, task) in [
        (JobKind::Main, blank_to_none(&fresh.pipeline.schedule), main_task),
        (JobKind::Email, blank_to_none(&fresh.pipeline.email_schedule), email_task),
    ] {
        if let Err(err) = state.replace(kind, schedule, task.clone()).await {
            error!(job = kind.as_str(), error = ?err, "could not replace job");
        }
    }
    info!("configuration reloaded");
}

#[cfg(unix)]
async fn wait_for_signals(
    state: &mut SchedulerState,
    config_path: Option<&std::path::Path>,
    config_tx: &watch::Sender<Arc<Config>>,
    main_task: &JobTask,
    email_task: &JobTask,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received");
                reload(state, config_path, config_tx, main_task, email_task).await;
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(
    _state: &mut SchedulerState,
    _config_path: Option<&std::path::Path>,
    _config_tx: &watch::Sender<Arc<Config>>,
    _main_task: &JobTask,
    _email_task: &JobTask,
) -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{oneshot, Mutex};

    fn noop() -> JobTask {
        Arc::new(|| Box::pin(async {}) as JobFuture)
    }

    #[test]
    fn five_field_crons_gain_seconds() {
        assert_eq!(normalize_cron("0 3 * * *").as_deref(), Some("0 0 3 * * *"));
        assert_eq!(normalize_cron(" 0 0 3 * * * ").as_deref(), Some("0 0 3 * * *"));
        assert_eq!(normalize_cron("   "), None);
        assert_eq!(blank_to_none(&Some(String::new())), None);
    }

    #[tokio::test]
    async fn overlapping_triggers_are_dropped() {
        let guard = Singleton::default();
        let runs = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release = Arc::new(Mutex::new(Some(release_rx)));
        let task: JobTask = {
            let runs = runs.clone();
            Arc::new(move || {
                let runs = runs.clone();
                let release = release.clone();
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let pending = release.lock().await.take();
                    if let Some(rx) = pending {
                        let _ = rx.await;
                    }
                }) as JobFuture
            })
        };

        let first = tokio::spawn(guarded(JobKind::Main, guard.clone(), task.clone()));
        while !guard.is_running() {
            tokio::task::yield_now().await;
        }
        assert!(!guarded(JobKind::Main, guard.clone(), task.clone()).await);
        let _ = release_tx.send(());
        assert!(first.await.expect("join"));
        assert!(!guard.is_running());
        assert!(guarded(JobKind::Main, guard, task).await);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replace_swaps_jobs_only_when_the_schedule_changes() {
        let mut state = SchedulerState::new().await.expect("scheduler");
        assert!(state
            .replace(JobKind::Main, Some("0 3 * * *"), noop())
            .await
            .expect("add"));
        assert_eq!(state.schedule(JobKind::Main), Some("0 0 3 * * *"));
        assert!(!state
            .replace(JobKind::Main, Some("0 0 3 * * *"), noop())
            .await
            .expect("unchanged"));
        assert!(state
            .replace(JobKind::Main, Some("30 4 * * *"), noop())
            .await
            .expect("swap"));
        assert_eq!(state.schedule(JobKind::Main), Some("0 30 4 * * *"));
        assert!(state.replace(JobKind::Main, None, noop()).await.expect("remove"));
        assert_eq!(state.schedule(JobKind::Main), None);
        assert_eq!(state.schedule(JobKind::Email), None);
    }
}
