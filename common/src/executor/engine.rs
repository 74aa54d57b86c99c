// Process execution engine
// Launches due plan items as child processes and drives their job runs to a
// terminal state from back-channel messages and process exit.

use super::launcher::{ChildProcess, LaunchRequest, ProcessLauncher};
use super::workdir::{self, RunMetadata};
use crate::backchannel::{BackChannelMessage, MessageSink};
use crate::clock::Clock;
use crate::config::ExecutorSettings;
use crate::errors::{ExecutionError, StorageError};
use crate::models::{JobRun, JobRunState, PlannedJobRun};
use crate::scheduler::{JobExecutor, SchedulerEvent};
use crate::storage::JobRepository;
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the execution engine
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub job_run_directory: PathBuf,
    pub max_concurrent_processes: usize,
    pub poll_interval: Duration,
    /// Runs still in `Starting`/`Started` after this long are failed
    pub start_timeout: Option<Duration>,
    /// Items already this far past their start when first seen are omitted
    pub omit_overdue_after: chrono::Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&ExecutorSettings::default())
    }
}

impl From<&ExecutorSettings> for ExecutorConfig {
    fn from(settings: &ExecutorSettings) -> Self {
        Self {
            job_run_directory: settings.job_run_directory.clone(),
            max_concurrent_processes: settings.max_concurrent_processes,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            start_timeout: settings.start_timeout_seconds.map(Duration::from_secs),
            omit_overdue_after: chrono::Duration::seconds(settings.omit_overdue_after_seconds as i64),
        }
    }
}

#[derive(Default)]
struct PlanState {
    items: Vec<PlannedJobRun>,
    /// When this engine instance first saw each item
    first_seen: HashMap<Uuid, DateTime<Utc>>,
    /// Items already launched, omitted or skipped
    handled: HashSet<Uuid>,
}

struct TrackedRun {
    run: JobRun,
    progress_reported: bool,
    /// Set once the child reported `Ended`
    ended: bool,
    kill: Option<oneshot::Sender<()>>,
}

type Tracker = Arc<Mutex<TrackedRun>>;

/// Supervises job run processes
pub struct ExecutionEngine {
    config: ExecutorConfig,
    repository: Arc<dyn JobRepository>,
    launcher: Arc<dyn ProcessLauncher>,
    clock: Arc<dyn Clock>,
    backchannel_url: String,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    capacity: Arc<Semaphore>,
    plan: Mutex<PlanState>,
    trackers: Mutex<HashMap<Uuid, Tracker>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ExecutionEngine {
    pub fn new(
        config: ExecutorConfig,
        repository: Arc<dyn JobRepository>,
        launcher: Arc<dyn ProcessLauncher>,
        clock: Arc<dyn Clock>,
        backchannel_url: impl Into<String>,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
        let capacity = Arc::new(Semaphore::new(config.max_concurrent_processes));

        Self {
            config,
            repository,
            launcher,
            clock,
            backchannel_url: backchannel_url.into(),
            events,
            capacity,
            plan: Mutex::new(PlanState::default()),
            trackers: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Spawn the polling loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    }

    /// Stop polling; running children are left alone
    pub fn stop(&self) {
        info!("Stopping execution engine");
        let _ = self.shutdown_tx.send(());
    }

    /// Number of runs with a live tracker
    pub async fn active_runs(&self) -> usize {
        self.trackers.lock().await.len()
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_concurrent_processes = self.config.max_concurrent_processes,
            backchannel_url = %self.backchannel_url,
            "Starting execution engine"
        );

        let mut poll_interval = interval(self.config.poll_interval);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    let launched = self.poll_once().await;
                    if launched > 0 {
                        debug!(launched = launched, "Launched due job runs");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping execution engine");
                    break;
                }
            }
        }

        info!("Execution engine stopped");
    }

    /// Launch every due item while capacity lasts; returns how many started
    pub async fn poll_once(self: &Arc<Self>) -> usize {
        let now = self.clock.now();
        let due: Vec<(PlannedJobRun, DateTime<Utc>)> = {
            let state = self.plan.lock().await;
            let mut due: Vec<_> = state
                .items
                .iter()
                .filter(|item| item.planned_start_utc <= now && !state.handled.contains(&item.unique_id))
                .map(|item| {
                    let first_seen = state.first_seen.get(&item.unique_id).copied().unwrap_or(now);
                    (item.clone(), first_seen)
                })
                .collect();
            due.sort_by_key(|(item, _)| item.planned_start_utc);
            due
        };

        let mut launched = 0;
        for (item, first_seen) in due {
            if first_seen - item.planned_start_utc > self.config.omit_overdue_after {
                self.mark_handled(item.unique_id).await;
                self.omit(&item).await;
                continue;
            }

            let permit = match self.capacity.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(
                        correlation_id = %item.unique_id,
                        "No free process slot, waiting for the next tick"
                    );
                    break;
                }
            };

            self.mark_handled(item.unique_id).await;
            if self.launch(&item, permit).await {
                launched += 1;
            }
        }

        launched
    }

    async fn mark_handled(&self, uid: Uuid) {
        self.plan.lock().await.handled.insert(uid);
    }

    async fn unmark_handled(&self, uid: Uuid) {
        self.plan.lock().await.handled.remove(&uid);
    }

    #[instrument(skip(self, item), fields(correlation_id = %item.unique_id))]
    async fn omit(&self, item: &PlannedJobRun) {
        let mut run = match self.repository.get_job_run_by_unique_id(item.unique_id).await {
            Ok(Some(run)) if run.is_pending() => run,
            Ok(_) => return,
            Err(e) => {
                error!(error = %e, "Failed to load overdue job run");
                self.unmark_handled(item.unique_id).await;
                return;
            }
        };

        run.state = JobRunState::Omitted;
        if let Err(e) = self.repository.update_job_run(&run).await {
            error!(error = %e, "Failed to mark job run as omitted");
            return;
        }

        warn!(
            job_run_id = run.id,
            planned_start_utc = %item.planned_start_utc,
            "Job run omitted, its planned start passed before it could be started"
        );
        telemetry::record_job_run_omitted(run.job_id);
        self.notify_ended(item.unique_id);
    }

    /// Preparing → Starting → Started; the permit moves into the supervisor
    #[instrument(skip(self, item, permit), fields(correlation_id = %item.unique_id))]
    async fn launch(self: &Arc<Self>, item: &PlannedJobRun, permit: OwnedSemaphorePermit) -> bool {
        let uid = item.unique_id;
        let run = match self.repository.get_job_run_by_unique_id(uid).await {
            Ok(Some(run)) if run.is_pending() => run,
            Ok(Some(run)) => {
                debug!(state = %run.state, "Job run is no longer scheduled, skipping");
                return false;
            }
            Ok(None) => {
                warn!("Planned job run not found in storage");
                return false;
            }
            Err(e) => {
                error!(error = %e, "Failed to load planned job run");
                self.unmark_handled(uid).await;
                return false;
            }
        };

        let tracker = Arc::new(Mutex::new(TrackedRun {
            run,
            progress_reported: false,
            ended: false,
            kill: None,
        }));
        let mut tracked = tracker.lock().await;

        tracked.run.state = JobRunState::Preparing;
        if let Err(e) = self.repository.update_job_run(&tracked.run).await {
            error!(error = %e, "Failed to mark job run as preparing");
            self.unmark_handled(uid).await;
            return false;
        }
        self.trackers.lock().await.insert(uid, tracker.clone());

        let workdir = match self.prepare(&tracked.run).await {
            Ok(dir) => dir,
            Err(e) => {
                error!(error = %e, "Failed to prepare job run");
                self.fail_launch(&mut tracked, &e.to_string()).await;
                return false;
            }
        };

        self.advance(&mut tracked.run, JobRunState::Starting).await;

        let request = LaunchRequest {
            job_run_id: tracked.run.id,
            correlation_id: uid,
            backchannel_url: self.backchannel_url.clone(),
            workdir,
        };
        let child = match self.launcher.launch(&request).await {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Failed to launch job run process");
                self.fail_launch(&mut tracked, &e.to_string()).await;
                return false;
            }
        };

        tracked.run.pid = child.id();
        tracked.run.actual_start_utc = Some(self.clock.now());
        self.advance(&mut tracked.run, JobRunState::Started).await;

        let (kill_tx, kill_rx) = oneshot::channel();
        tracked.kill = Some(kill_tx);

        info!(
            job_run_id = tracked.run.id,
            pid = ?tracked.run.pid,
            "Job run process started"
        );
        drop(tracked);

        telemetry::update_running_processes(self.active_runs().await);
        tokio::spawn(self.clone().supervise(uid, child, kill_rx, permit));
        if let Some(timeout) = self.config.start_timeout {
            tokio::spawn(self.clone().watch_start(uid, timeout));
        }

        true
    }

    async fn prepare(&self, run: &JobRun) -> Result<PathBuf, ExecutionError> {
        let job = self
            .repository
            .get_job(run.job_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("Job not found: {}", run.job_id)))?;
        let trigger = self.repository.get_trigger_by_id(run.trigger_id).await?;

        let metadata = RunMetadata::new(run, &job, trigger.as_ref());
        workdir::prepare_run_directory(&self.config.job_run_directory, run, &metadata).await
    }

    async fn fail_launch(&self, tracked: &mut TrackedRun, reason: &str) {
        if tracked.run.state == JobRunState::Preparing {
            self.advance(&mut tracked.run, JobRunState::Starting).await;
        }
        tracked.run.actual_end_utc = Some(self.clock.now());
        self.advance(&mut tracked.run, JobRunState::Failed).await;

        self.trackers.lock().await.remove(&tracked.run.unique_id);
        telemetry::record_job_run_failed(tracked.run.job_id, "launch");
        warn!(job_run_id = tracked.run.id, reason = reason, "Job run failed to launch");
        self.notify_ended(tracked.run.unique_id);
    }

    /// Wait for the child to exit (or kill it on request) and finalise the run
    async fn supervise(
        self: Arc<Self>,
        uid: Uuid,
        mut child: Box<dyn ChildProcess>,
        mut kill_rx: oneshot::Receiver<()>,
        _permit: OwnedSemaphorePermit,
    ) {
        let exit = tokio::select! {
            exit = child.wait() => exit,
            Ok(()) = &mut kill_rx => {
                if let Err(e) = child.start_kill() {
                    warn!(correlation_id = %uid, error = %e, "Failed to kill job run process");
                }
                child.wait().await
            }
        };

        let exit_code = match exit {
            Ok(code) => code,
            Err(e) => {
                error!(correlation_id = %uid, error = %e, "Lost track of job run process");
                -1
            }
        };

        self.finalize(uid, exit_code).await;
        telemetry::update_running_processes(self.active_runs().await);
    }

    /// Process exit decides the final state
    #[instrument(skip(self))]
    async fn finalize(&self, uid: Uuid, exit_code: i32) {
        let Some(tracker) = self.trackers.lock().await.remove(&uid) else {
            return;
        };
        let mut tracked = tracker.lock().await;
        if tracked.run.state.is_terminal() {
            debug!(state = %tracked.run.state, "Job run already finalised");
            return;
        }

        let now = self.clock.now();
        tracked.run.exit_code = Some(exit_code);
        tracked.run.actual_end_utc = Some(now);
        if let Some(start) = tracked.run.actual_start_utc {
            let seconds = (now - start).num_milliseconds() as f64 / 1000.0;
            telemetry::record_job_run_duration(tracked.run.job_id, seconds);
        }

        if exit_code == 0 {
            if tracked.run.state < JobRunState::Finishing {
                self.advance(&mut tracked.run, JobRunState::Finishing).await;
            }
            self.advance(&mut tracked.run, JobRunState::Collecting).await;
            if tracked.progress_reported {
                tracked.run.progress = Some(100.0);
            }
            self.advance(&mut tracked.run, JobRunState::Completed).await;
            telemetry::record_job_run_completed(tracked.run.job_id);
            info!(job_run_id = tracked.run.id, "Job run completed");
        } else {
            self.advance(&mut tracked.run, JobRunState::Failed).await;
            telemetry::record_job_run_failed(tracked.run.job_id, "exit_code");
            warn!(job_run_id = tracked.run.id, exit_code = exit_code, "Job run failed");
        }

        self.notify_ended(uid);
    }

    /// Fail runs that never got past `Started` in time
    async fn watch_start(self: Arc<Self>, uid: Uuid, timeout: Duration) {
        tokio::time::sleep(timeout).await;

        let Some(tracker) = self.trackers.lock().await.get(&uid).cloned() else {
            return;
        };
        let mut tracked = tracker.lock().await;
        if !matches!(tracked.run.state, JobRunState::Starting | JobRunState::Started) {
            return;
        }

        warn!(
            correlation_id = %uid,
            timeout_seconds = timeout.as_secs_f64(),
            "Job run did not connect in time, killing process"
        );
        tracked.run.actual_end_utc = Some(self.clock.now());
        self.advance(&mut tracked.run, JobRunState::Failed).await;
        telemetry::record_job_run_failed(tracked.run.job_id, "start_timeout");

        if let Some(kill) = tracked.kill.take() {
            let _ = kill.send(());
        }
        self.notify_ended(uid);
    }

    /// Move to `next` and persist; storage errors are logged
    async fn advance(&self, run: &mut JobRun, next: JobRunState) {
        if let Err(e) = self.apply(run, next).await {
            error!(
                correlation_id = %run.unique_id,
                state = %next,
                error = %e,
                "Failed to persist job run state"
            );
        }
    }

    async fn apply(&self, run: &mut JobRun, next: JobRunState) -> Result<(), ExecutionError> {
        if !run.state.can_transition_to(next) {
            warn!(
                correlation_id = %run.unique_id,
                from = %run.state,
                to = %next,
                "Ignoring invalid job run transition"
            );
            return Ok(());
        }
        run.state = next;
        self.repository.update_job_run(run).await?;
        Ok(())
    }

    fn notify_ended(&self, uid: Uuid) {
        if self.events.send(SchedulerEvent::JobRunEnded(uid)).is_err() {
            warn!(correlation_id = %uid, "Scheduler is gone, job run end not delivered");
        }
    }
}

#[async_trait]
impl JobExecutor for ExecutionEngine {
    async fn on_plan_changed(&self, plan: Vec<PlannedJobRun>) -> Result<(), ExecutionError> {
        let now = self.clock.now();
        let mut state = self.plan.lock().await;

        let current: HashSet<Uuid> = plan.iter().map(|item| item.unique_id).collect();
        state.first_seen.retain(|uid, _| current.contains(uid));
        state.handled.retain(|uid| current.contains(uid));
        for item in &plan {
            state.first_seen.entry(item.unique_id).or_insert(now);
        }

        debug!(plan_size = plan.len(), "Execution plan replaced");
        state.items = plan;
        Ok(())
    }
}

#[async_trait]
impl MessageSink for ExecutionEngine {
    #[instrument(skip(self), fields(kind = message.kind()))]
    async fn deliver(
        &self,
        correlation_id: Uuid,
        message: BackChannelMessage,
    ) -> Result<(), ExecutionError> {
        let tracker = self
            .trackers
            .lock()
            .await
            .get(&correlation_id)
            .cloned()
            .ok_or(ExecutionError::UnknownJobRun(correlation_id))?;
        let mut tracked = tracker.lock().await;
        if tracked.run.state.is_terminal() {
            return Err(ExecutionError::UnknownJobRun(correlation_id));
        }
        if tracked.ended {
            debug!(state = %tracked.run.state, "Ignoring message after ended");
            return Ok(());
        }

        match message {
            BackChannelMessage::Started => {
                if tracked.run.state >= JobRunState::Connected {
                    debug!(state = %tracked.run.state, "Duplicate started message");
                    return Ok(());
                }
                self.apply(&mut tracked.run, JobRunState::Connected).await?;
                self.apply(&mut tracked.run, JobRunState::Initializing).await?;
            }
            BackChannelMessage::Progress { percent } => {
                if tracked.run.state >= JobRunState::Finishing || percent.is_nan() {
                    debug!(state = %tracked.run.state, "Ignoring progress");
                    return Ok(());
                }
                let percent = percent.clamp(0.0, 100.0);
                tracked.run.progress = Some(percent);
                tracked.progress_reported = true;
                tracked.run.estimated_end_utc =
                    estimate_end(tracked.run.actual_start_utc, self.clock.now(), percent);

                if tracked.run.state < JobRunState::Processing {
                    self.apply(&mut tracked.run, JobRunState::Processing).await?;
                } else {
                    self.repository.update_job_run(&tracked.run).await?;
                }
            }
            BackChannelMessage::Ended { exit_code } => {
                tracked.ended = true;
                tracked.run.exit_code = Some(exit_code);
                if exit_code == 0 && tracked.run.state < JobRunState::Finishing {
                    self.apply(&mut tracked.run, JobRunState::Finishing).await?;
                } else {
                    self.repository.update_job_run(&tracked.run).await?;
                }
            }
        }

        debug!(state = %tracked.run.state, "Back-channel message applied");
        Ok(())
    }
}

/// Linear extrapolation from elapsed time and reported progress
fn estimate_end(
    actual_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    percent: f64,
) -> Option<DateTime<Utc>> {
    let start = actual_start?;
    if percent <= 0.0 {
        return None;
    }
    let elapsed_ms = (now - start).num_milliseconds().max(0) as f64;
    let total_ms = elapsed_ms * 100.0 / percent;
    Some(start + chrono::Duration::milliseconds(total_ms as i64))
}
