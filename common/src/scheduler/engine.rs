// Scheduler engine implementation
// Owns the in-memory plan and keeps it reconciled with storage.

use super::JobExecutor;
use crate::clock::Clock;
use crate::config::SchedulerSettings;
use crate::errors::{ScheduleError, SchedulerError};
use crate::models::{JobRun, PlanAction, PlanResult, PlannedJobRun, ScheduledPlanItem, Trigger};
use crate::schedule::{self, PlanningContext};
use crate::storage::JobRepository;
use crate::telemetry;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Planned start times closer than this to now are never moved
    pub allow_changes_before_start_in_sec: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            allow_changes_before_start_in_sec: 60,
        }
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            allow_changes_before_start_in_sec: settings.allow_changes_before_start_in_sec,
        }
    }
}

/// Notifications fed into the scheduler's event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    TriggerAdded(i64),
    TriggerDefinitionUpdated(i64),
    TriggerStateUpdated(i64),
    JobRunEnded(Uuid),
}

/// Keeps the execution plan for all active triggers
///
/// All handlers serialise on the plan mutex, so storage reads and writes made
/// while planning never interleave with another handler.
pub struct JobScheduler {
    config: SchedulerConfig,
    repository: Arc<dyn JobRepository>,
    executor: Arc<dyn JobExecutor>,
    clock: Arc<dyn Clock>,
    current_plan: Mutex<Vec<ScheduledPlanItem>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<dyn JobRepository>,
        executor: Arc<dyn JobExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Self {
            config,
            repository,
            executor,
            clock,
            current_plan: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Build the initial plan from storage and publish it
    pub async fn start(&self) -> Result<(), SchedulerError> {
        info!(
            allow_changes_before_start_in_sec = self.config.allow_changes_before_start_in_sec,
            "Starting scheduler"
        );
        self.create_initial_plan().await
    }

    /// Stop the event loop; the plan and storage are left untouched
    pub fn stop(&self) {
        info!("Stopping scheduler");
        let _ = self.shutdown_tx.send(());
    }

    /// Snapshot of the current plan
    pub async fn current_plan(&self) -> Vec<ScheduledPlanItem> {
        self.current_plan.lock().await.clone()
    }

    /// Spawn a task consuming events until the channel closes or `stop` is called
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        events: mpsc::UnboundedReceiver<SchedulerEvent>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move { scheduler.run_event_loop(events, shutdown_rx).await })
    }

    async fn run_event_loop(
        &self,
        mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("Scheduler event channel closed");
                        break;
                    };
                    if let Err(e) = self.handle_event(event).await {
                        error!(event = ?event, error = %e, "Failed to handle scheduler event");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping scheduler event loop");
                    break;
                }
            }
        }

        info!("Scheduler event loop stopped");
    }

    /// Dispatch a single event to its handler
    pub async fn handle_event(&self, event: SchedulerEvent) -> Result<(), SchedulerError> {
        match event {
            SchedulerEvent::TriggerAdded(id) => self.on_trigger_added(id).await,
            SchedulerEvent::TriggerDefinitionUpdated(id) => {
                self.on_trigger_definition_updated(id).await
            }
            SchedulerEvent::TriggerStateUpdated(id) => self.on_trigger_state_updated(id).await,
            SchedulerEvent::JobRunEnded(uid) => self.on_job_run_ended(uid).await,
        }
    }

    /// Replace the plan with one derived from every active trigger
    ///
    /// Safe to call repeatedly: pending runs are reused instead of
    /// materialised a second time.
    #[instrument(skip(self))]
    pub async fn create_initial_plan(&self) -> Result<(), SchedulerError> {
        let mut plan = self.current_plan.lock().await;
        let triggers = self.repository.get_active_triggers().await?;

        let mut new_plan = Vec::with_capacity(triggers.len());
        for trigger in &triggers {
            match self.plan_initial_item(trigger).await {
                Ok(Some(item)) => new_plan.push(item),
                Ok(None) => {}
                Err(e) => {
                    error!(
                        trigger_id = trigger.id,
                        error = %e,
                        "Failed to plan trigger, skipping"
                    );
                }
            }
        }

        info!(
            active_triggers = triggers.len(),
            plan_size = new_plan.len(),
            "Initial plan created"
        );

        *plan = new_plan;
        self.publish(&plan).await;
        Ok(())
    }

    async fn plan_initial_item(
        &self,
        trigger: &Trigger,
    ) -> Result<Option<ScheduledPlanItem>, SchedulerError> {
        let result = self.plan_trigger(trigger, false).await?;
        let pending = self
            .repository
            .get_pending_job_run_by_trigger_id(trigger.id)
            .await?;

        match result.action {
            PlanAction::Obsolete => {
                warn!(
                    trigger_id = trigger.id,
                    kind = trigger.kind.name(),
                    user_id = ?trigger.user_id,
                    "Disabling obsolete trigger"
                );
                if let Err(e) = self.repository.disable_trigger(trigger.id).await {
                    error!(trigger_id = trigger.id, error = %e, "Failed to disable trigger");
                }

                // A run that was already materialised still gets its chance
                Ok(pending.as_ref().map(plan_item_for))
            }
            PlanAction::Blocked => {
                debug!(trigger_id = trigger.id, "Trigger is blocked by a running job run");
                Ok(None)
            }
            PlanAction::Possible => {
                let expected = expected_start(trigger, &result)?;
                match pending {
                    Some(run) => Ok(Some(self.adopt_pending(&run, expected).await?)),
                    None => Ok(Some(self.materialize(trigger, expected).await?)),
                }
            }
        }
    }

    /// A trigger was created
    #[instrument(skip(self))]
    pub async fn on_trigger_added(&self, trigger_id: i64) -> Result<(), SchedulerError> {
        let mut plan = self.current_plan.lock().await;
        let trigger = self.load_trigger(trigger_id).await?;

        if plan.iter().any(|item| item.trigger_id == trigger_id) {
            debug!("Trigger is already part of the plan");
            return Ok(());
        }

        let result = self.plan_trigger(&trigger, true).await?;
        if result.action != PlanAction::Possible {
            info!(action = %result.action, "New trigger does not yield a job run");
            return Ok(());
        }

        let expected = expected_start(&trigger, &result)?;
        let item = self.materialize(&trigger, expected).await?;
        plan.push(item);

        self.publish(&plan).await;
        Ok(())
    }

    /// The definition (schedule, delay, bounds) of a trigger changed
    #[instrument(skip(self))]
    pub async fn on_trigger_definition_updated(&self, trigger_id: i64) -> Result<(), SchedulerError> {
        let mut plan = self.current_plan.lock().await;
        let trigger = self.load_trigger(trigger_id).await?;

        let result = self.plan_trigger(&trigger, false).await?;
        if result.action != PlanAction::Possible {
            info!(action = %result.action, "Updated trigger does not yield a job run");
            return Ok(());
        }
        let expected = expected_start(&trigger, &result)?;

        let Some(pending) = self
            .repository
            .get_pending_job_run_by_trigger_id(trigger_id)
            .await?
        else {
            error!("Updated trigger has no pending job run to reschedule");
            return Ok(());
        };

        if !self.reconcile(&pending, expected).await? {
            return Ok(());
        }

        match plan.iter_mut().find(|item| item.unique_id == pending.unique_id) {
            Some(item) => item.planned_start_utc = expected,
            None => plan.push(ScheduledPlanItem {
                trigger_id,
                unique_id: pending.unique_id,
                planned_start_utc: expected,
            }),
        }

        self.publish(&plan).await;
        Ok(())
    }

    /// A trigger was activated or deactivated
    #[instrument(skip(self))]
    pub async fn on_trigger_state_updated(&self, trigger_id: i64) -> Result<(), SchedulerError> {
        let mut plan = self.current_plan.lock().await;
        let trigger = self.load_trigger(trigger_id).await?;
        let result = self.plan_trigger(&trigger, false).await?;

        match result.action {
            PlanAction::Obsolete => {
                plan.retain(|item| item.trigger_id != trigger_id);

                if let Some(pending) = self
                    .repository
                    .get_pending_job_run_by_trigger_id(trigger_id)
                    .await?
                {
                    match self.repository.delete_job_run(pending.unique_id).await {
                        Ok(()) => info!(
                            correlation_id = %pending.unique_id,
                            "Deleted pending job run of obsolete trigger"
                        ),
                        Err(e) => warn!(
                            correlation_id = %pending.unique_id,
                            error = %e,
                            "Could not delete pending job run of obsolete trigger"
                        ),
                    }
                }

                self.publish(&plan).await;
            }
            PlanAction::Possible => {
                if plan.iter().any(|item| item.trigger_id == trigger_id) {
                    debug!("Trigger is already part of the plan");
                    return Ok(());
                }

                let expected = expected_start(&trigger, &result)?;
                let item = match self
                    .repository
                    .get_pending_job_run_by_trigger_id(trigger_id)
                    .await?
                {
                    Some(run) => self.adopt_pending(&run, expected).await?,
                    None => self.materialize(&trigger, expected).await?,
                };
                plan.push(item);

                self.publish(&plan).await;
            }
            PlanAction::Blocked => {
                debug!("Trigger is blocked by a running job run");
            }
        }

        Ok(())
    }

    /// A job run reached a terminal state
    ///
    /// Triggers without a plan item (blocked ones, or recurring triggers
    /// whose run just ended) are planned again.
    #[instrument(skip(self))]
    pub async fn on_job_run_ended(&self, correlation_id: Uuid) -> Result<(), SchedulerError> {
        let mut plan = self.current_plan.lock().await;
        plan.retain(|item| item.unique_id != correlation_id);

        let represented: HashSet<i64> = plan.iter().map(|item| item.trigger_id).collect();
        let triggers = self.repository.get_active_triggers().await?;

        let mut added = 0usize;
        for trigger in triggers.iter().filter(|t| !represented.contains(&t.id)) {
            match self.plan_follow_up(trigger).await {
                Ok(Some(item)) => {
                    plan.push(item);
                    added += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        trigger_id = trigger.id,
                        error = %e,
                        "Failed to re-plan trigger, skipping"
                    );
                }
            }
        }

        if added > 0 {
            info!(added = added, "Completed job run caused new plan items");
            self.publish(&plan).await;
        } else {
            debug!("No new plan items after completed job run");
        }

        Ok(())
    }

    async fn plan_follow_up(
        &self,
        trigger: &Trigger,
    ) -> Result<Option<ScheduledPlanItem>, SchedulerError> {
        let result = self.plan_trigger(trigger, false).await?;
        if result.action != PlanAction::Possible {
            return Ok(None);
        }

        let expected = expected_start(trigger, &result)?;
        let item = match self
            .repository
            .get_pending_job_run_by_trigger_id(trigger.id)
            .await?
        {
            Some(run) => self.adopt_pending(&run, expected).await?,
            None => self.materialize(trigger, expected).await?,
        };
        Ok(Some(item))
    }

    async fn load_trigger(&self, trigger_id: i64) -> Result<Trigger, SchedulerError> {
        self.repository
            .get_trigger_by_id(trigger_id)
            .await?
            .ok_or(SchedulerError::TriggerNotFound(trigger_id))
    }

    /// Gather the run facts for a trigger and evaluate it
    async fn plan_trigger(&self, trigger: &Trigger, is_new: bool) -> Result<PlanResult, SchedulerError> {
        let runs = self.repository.get_job_runs_by_trigger_id(trigger.id).await?;
        let running = self
            .repository
            .get_running_job_runs(trigger.job_id, trigger.id)
            .await?;

        let context = PlanningContext {
            now: self.clock.now(),
            is_new,
            has_existing_run: runs.iter().any(|r| !r.deleted),
            has_pending_run: runs.iter().any(JobRun::is_pending),
            has_running_run: !running.is_empty(),
        };

        let result = schedule::plan(trigger, &context)?;
        debug!(
            trigger_id = trigger.id,
            kind = trigger.kind.name(),
            action = %result.action,
            expected_start_utc = ?result.expected_start_utc,
            "Trigger planned"
        );
        Ok(result)
    }

    /// Persist a new scheduled run for the trigger
    async fn materialize(
        &self,
        trigger: &Trigger,
        planned_start_utc: DateTime<Utc>,
    ) -> Result<ScheduledPlanItem, SchedulerError> {
        let job = self
            .repository
            .get_job(trigger.job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound(trigger.job_id))?;

        let job_run = self
            .repository
            .save_new_job_run(JobRun::new_scheduled(&job, trigger, planned_start_utc))
            .await?;

        info!(
            trigger_id = trigger.id,
            job_run_id = job_run.id,
            correlation_id = %job_run.unique_id,
            planned_start_utc = %planned_start_utc,
            "Job run scheduled"
        );

        Ok(plan_item_for(&job_run))
    }

    async fn adopt_pending(
        &self,
        run: &JobRun,
        expected: DateTime<Utc>,
    ) -> Result<ScheduledPlanItem, SchedulerError> {
        let mut item = plan_item_for(run);
        if self.reconcile(run, expected).await? {
            item.planned_start_utc = expected;
        }
        Ok(item)
    }

    /// Move a pending run to a newly calculated start time
    ///
    /// Returns whether the persisted time changed. Changes landing inside the
    /// `allow_changes_before_start_in_sec` window are refused.
    async fn reconcile(&self, run: &JobRun, new_time: DateTime<Utc>) -> Result<bool, SchedulerError> {
        if run.planned_start_utc == new_time {
            debug!(correlation_id = %run.unique_id, "Planned start is still correct");
            return Ok(false);
        }

        let window = Duration::seconds(self.config.allow_changes_before_start_in_sec as i64);
        if self.clock.now() + window >= new_time {
            warn!(
                correlation_id = %run.unique_id,
                planned_start_utc = %run.planned_start_utc,
                requested_start_utc = %new_time,
                allow_changes_before_start_in_sec = self.config.allow_changes_before_start_in_sec,
                "Planned start change is too close to the start and was rejected"
            );
            return Ok(false);
        }

        self.repository
            .update_planned_start(run.unique_id, new_time)
            .await?;

        info!(
            correlation_id = %run.unique_id,
            previous_start_utc = %run.planned_start_utc,
            planned_start_utc = %new_time,
            "Job run rescheduled"
        );
        Ok(true)
    }

    /// Hand a snapshot of the plan to the executor; failures are only logged
    async fn publish(&self, plan: &[ScheduledPlanItem]) {
        let mut snapshot: Vec<PlannedJobRun> = plan.iter().map(PlannedJobRun::from).collect();
        snapshot.sort_by_key(|p| p.planned_start_utc);

        telemetry::update_plan_size(snapshot.len());
        info!(plan_size = snapshot.len(), "Publishing plan to executor");

        if let Err(e) = self.executor.on_plan_changed(snapshot).await {
            warn!(error = %e, "Unable to publish plan to executor");
        }
    }
}

fn plan_item_for(run: &JobRun) -> ScheduledPlanItem {
    ScheduledPlanItem {
        trigger_id: run.trigger_id,
        unique_id: run.unique_id,
        planned_start_utc: run.planned_start_utc,
    }
}

fn expected_start(trigger: &Trigger, result: &PlanResult) -> Result<DateTime<Utc>, SchedulerError> {
    result.expected_start_utc.ok_or_else(|| {
        ScheduleError::InvalidConfiguration {
            trigger_id: trigger.id,
            reason: "possible plan without an expected start".to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::errors::ExecutionError;
    use crate::models::{Job, JobRunState, TriggerKind};
    use crate::scheduler::MockJobExecutor;
    use crate::storage::InMemoryJobStorage;
    use chrono::TimeZone;

    /// Executor that remembers every published plan
    #[derive(Default)]
    struct RecordingExecutor {
        plans: std::sync::Mutex<Vec<Vec<PlannedJobRun>>>,
    }

    impl RecordingExecutor {
        fn published(&self) -> Vec<Vec<PlannedJobRun>> {
            self.plans.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl JobExecutor for RecordingExecutor {
        async fn on_plan_changed(&self, plan: Vec<PlannedJobRun>) -> Result<(), ExecutionError> {
            self.plans.lock().unwrap().push(plan);
            Ok(())
        }
    }

    struct Fixture {
        storage: Arc<InMemoryJobStorage>,
        executor: Arc<RecordingExecutor>,
        clock: FakeClock,
        scheduler: JobScheduler,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 30).unwrap()
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryJobStorage::new());
        storage.insert_job(Job::new(1, "report", "echo report")).await;
        let executor = Arc::new(RecordingExecutor::default());
        let clock = FakeClock::new(now());
        let scheduler = JobScheduler::new(
            SchedulerConfig::default(),
            storage.clone(),
            executor.clone(),
            Arc::new(clock.clone()),
        );
        Fixture {
            storage,
            executor,
            clock,
            scheduler,
        }
    }

    async fn set_state(storage: &InMemoryJobStorage, uid: Uuid, state: JobRunState) {
        let mut run = storage.get_job_run_by_unique_id(uid).await.unwrap().unwrap();
        run.state = state;
        storage.update_job_run(&run).await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_added_materialises_run_and_publishes() {
        let f = fixture().await;
        let trigger = Trigger::instant(1, 1, 5).with_created_at(now());
        f.storage.insert_trigger(trigger).await.unwrap();

        f.scheduler.on_trigger_added(1).await.unwrap();

        let plan = f.scheduler.current_plan().await;
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].planned_start_utc, now() + Duration::minutes(5));

        let run = f
            .storage
            .get_job_run_by_unique_id(plan[0].unique_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.state, JobRunState::Scheduled);
        assert_eq!(f.executor.published().len(), 1);
        assert_eq!(f.executor.published()[0][0].unique_id, run.unique_id);
    }

    #[tokio::test]
    async fn test_trigger_added_twice_keeps_single_item() {
        let f = fixture().await;
        f.storage
            .insert_trigger(Trigger::instant(1, 1, 0).with_created_at(now()))
            .await
            .unwrap();

        f.scheduler.on_trigger_added(1).await.unwrap();
        f.scheduler.on_trigger_added(1).await.unwrap();

        assert_eq!(f.scheduler.current_plan().await.len(), 1);
        assert_eq!(f.storage.job_runs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_trigger_is_an_error() {
        let f = fixture().await;
        let err = f.scheduler.on_trigger_added(42).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TriggerNotFound(42)));
    }

    #[tokio::test]
    async fn test_invalid_definition_is_returned_to_caller() {
        let f = fixture().await;
        f.storage
            .insert_trigger(Trigger::recurring(1, 1, "garbage", false))
            .await
            .unwrap();
        let err = f.scheduler.on_trigger_added(1).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Schedule(_)));
    }

    #[tokio::test]
    async fn test_initial_plan_is_idempotent() {
        let f = fixture().await;
        f.storage
            .insert_trigger(Trigger::recurring(1, 1, "*/5 * * * *", false))
            .await
            .unwrap();
        f.storage
            .insert_trigger(Trigger::scheduled(2, 1, now() + Duration::hours(2)))
            .await
            .unwrap();

        f.scheduler.start().await.unwrap();
        let first = f.scheduler.current_plan().await;
        f.scheduler.create_initial_plan().await.unwrap();
        let second = f.scheduler.current_plan().await;

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(f.storage.job_runs().await.len(), 2);
        assert_eq!(f.executor.published().len(), 2);
    }

    #[tokio::test]
    async fn test_initial_plan_disables_obsolete_triggers() {
        let f = fixture().await;
        f.storage
            .insert_trigger(Trigger::scheduled(1, 1, now() - Duration::hours(1)))
            .await
            .unwrap();

        f.scheduler.start().await.unwrap();

        assert!(f.scheduler.current_plan().await.is_empty());
        assert!(f.storage.get_active_triggers().await.unwrap().is_empty());
        assert_eq!(f.executor.published(), vec![Vec::<PlannedJobRun>::new()]);
    }

    #[tokio::test]
    async fn test_initial_plan_adopts_pending_run_of_obsolete_instant_trigger() {
        let f = fixture().await;
        let trigger = Trigger::instant(1, 1, 0).with_created_at(now() - Duration::hours(1));
        f.storage.insert_trigger(trigger).await.unwrap();
        f.scheduler.on_trigger_added(1).await.unwrap();
        let uid = f.scheduler.current_plan().await[0].unique_id;

        // Restart with a fresh scheduler over the same storage
        let restarted = JobScheduler::new(
            SchedulerConfig::default(),
            f.storage.clone(),
            f.executor.clone(),
            Arc::new(f.clock.clone()),
        );
        restarted.start().await.unwrap();

        let plan = restarted.current_plan().await;
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].unique_id, uid);
        assert!(f.storage.get_active_triggers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_initial_plan_skips_blocked_triggers() {
        let f = fixture().await;
        f.storage
            .insert_trigger(Trigger::recurring(1, 1, "* * * * *", true))
            .await
            .unwrap();
        f.scheduler.on_trigger_added(1).await.unwrap();
        let uid = f.scheduler.current_plan().await[0].unique_id;
        set_state(&f.storage, uid, JobRunState::Processing).await;

        f.scheduler.create_initial_plan().await.unwrap();

        assert!(f.scheduler.current_plan().await.is_empty());
        assert_eq!(f.storage.job_runs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_running_run_blocks_only_its_own_trigger() {
        let f = fixture().await;
        for id in [1, 2] {
            f.storage
                .insert_trigger(Trigger::recurring(id, 1, "* * * * *", true))
                .await
                .unwrap();
            f.scheduler.on_trigger_added(id).await.unwrap();
        }
        let running = f
            .storage
            .get_pending_job_run_by_trigger_id(1)
            .await
            .unwrap()
            .unwrap();
        set_state(&f.storage, running.unique_id, JobRunState::Processing).await;

        f.scheduler.create_initial_plan().await.unwrap();

        let plan = f.scheduler.current_plan().await;
        assert_eq!(plan.len(), 1);
        assert_ne!(plan[0].unique_id, running.unique_id);
        assert_eq!(
            f.storage
                .get_running_job_runs(1, 1)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(f.storage.get_running_job_runs(1, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_definition_update_moves_pending_run() {
        let f = fixture().await;
        f.storage
            .insert_trigger(Trigger::scheduled(1, 1, now() + Duration::hours(1)))
            .await
            .unwrap();
        f.scheduler.on_trigger_added(1).await.unwrap();

        let new_start = now() + Duration::hours(3);
        let mut trigger = f.storage.get_trigger_by_id(1).await.unwrap().unwrap();
        trigger.kind = TriggerKind::Scheduled {
            start_time_utc: new_start,
        };
        f.storage.update_trigger(trigger).await.unwrap();

        f.scheduler.on_trigger_definition_updated(1).await.unwrap();

        let plan = f.scheduler.current_plan().await;
        assert_eq!(plan[0].planned_start_utc, new_start);
        let run = f
            .storage
            .get_job_run_by_unique_id(plan[0].unique_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.planned_start_utc, new_start);
        assert_eq!(f.executor.published().len(), 2);
    }

    #[tokio::test]
    async fn test_definition_update_inside_window_is_rejected() {
        let f = fixture().await;
        let original = now() + Duration::hours(1);
        f.storage
            .insert_trigger(Trigger::scheduled(1, 1, original))
            .await
            .unwrap();
        f.scheduler.on_trigger_added(1).await.unwrap();

        let mut trigger = f.storage.get_trigger_by_id(1).await.unwrap().unwrap();
        trigger.kind = TriggerKind::Scheduled {
            start_time_utc: now() + Duration::seconds(30),
        };
        f.storage.update_trigger(trigger).await.unwrap();

        f.scheduler.on_trigger_definition_updated(1).await.unwrap();

        let plan = f.scheduler.current_plan().await;
        assert_eq!(plan[0].planned_start_utc, original);
        let run = f
            .storage
            .get_job_run_by_unique_id(plan[0].unique_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.planned_start_utc, original);
        assert_eq!(f.executor.published().len(), 1);
    }

    #[tokio::test]
    async fn test_definition_update_without_pending_run_is_logged_only() {
        let f = fixture().await;
        f.storage
            .insert_trigger(Trigger::scheduled(1, 1, now() + Duration::hours(1)))
            .await
            .unwrap();

        f.scheduler.on_trigger_definition_updated(1).await.unwrap();

        assert!(f.scheduler.current_plan().await.is_empty());
        assert!(f.executor.published().is_empty());
    }

    #[tokio::test]
    async fn test_deactivated_trigger_drops_item_and_deletes_run() {
        let f = fixture().await;
        f.storage
            .insert_trigger(Trigger::recurring(1, 1, "*/5 * * * *", false))
            .await
            .unwrap();
        f.scheduler.on_trigger_added(1).await.unwrap();
        let uid = f.scheduler.current_plan().await[0].unique_id;

        f.storage.set_trigger_active(1, false).await.unwrap();
        f.scheduler.on_trigger_state_updated(1).await.unwrap();

        assert!(f.scheduler.current_plan().await.is_empty());
        let run = f.storage.get_job_run_by_unique_id(uid).await.unwrap().unwrap();
        assert_eq!(run.state, JobRunState::Deleted);
        assert!(run.deleted);
        assert!(f.executor.published().last().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reactivated_trigger_is_planned_again() {
        let f = fixture().await;
        let mut trigger = Trigger::recurring(1, 1, "*/5 * * * *", false);
        trigger.is_active = false;
        f.storage.insert_trigger(trigger).await.unwrap();

        f.storage.set_trigger_active(1, true).await.unwrap();
        f.scheduler.on_trigger_state_updated(1).await.unwrap();

        let plan = f.scheduler.current_plan().await;
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan[0].planned_start_utc,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_job_run_ended_unblocks_no_parallel_trigger() {
        let f = fixture().await;
        f.storage
            .insert_trigger(Trigger::recurring(1, 1, "* * * * *", true))
            .await
            .unwrap();
        f.scheduler.on_trigger_added(1).await.unwrap();
        let first = f.scheduler.current_plan().await[0].unique_id;

        // The run starts and takes 90 seconds
        f.clock.advance(Duration::seconds(30));
        set_state(&f.storage, first, JobRunState::Processing).await;
        f.scheduler.create_initial_plan().await.unwrap();
        assert!(f.scheduler.current_plan().await.is_empty());

        f.clock.advance(Duration::seconds(90));
        set_state(&f.storage, first, JobRunState::Completed).await;
        f.scheduler.on_job_run_ended(first).await.unwrap();

        let plan = f.scheduler.current_plan().await;
        assert_eq!(plan.len(), 1);
        assert_ne!(plan[0].unique_id, first);
        assert_eq!(
            plan[0].planned_start_utc,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 3, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_job_run_ended_does_not_replan_instant_trigger() {
        let f = fixture().await;
        f.storage
            .insert_trigger(Trigger::instant(1, 1, 0).with_created_at(now()))
            .await
            .unwrap();
        f.scheduler.on_trigger_added(1).await.unwrap();
        let uid = f.scheduler.current_plan().await[0].unique_id;

        set_state(&f.storage, uid, JobRunState::Preparing).await;
        set_state(&f.storage, uid, JobRunState::Starting).await;
        set_state(&f.storage, uid, JobRunState::Failed).await;
        f.scheduler.on_job_run_ended(uid).await.unwrap();

        assert!(f.scheduler.current_plan().await.is_empty());
        assert_eq!(f.storage.job_runs().await.len(), 1);
        assert_eq!(f.executor.published().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_fatal() {
        let storage = Arc::new(InMemoryJobStorage::new());
        storage.insert_job(Job::new(1, "report", "echo")).await;
        storage
            .insert_trigger(Trigger::instant(1, 1, 0).with_created_at(now()))
            .await
            .unwrap();

        let mut executor = MockJobExecutor::new();
        executor
            .expect_on_plan_changed()
            .times(1)
            .returning(|_| Err(ExecutionError::Unavailable("engine stopped".to_string())));

        let scheduler = JobScheduler::new(
            SchedulerConfig::default(),
            storage,
            Arc::new(executor),
            Arc::new(FakeClock::new(now())),
        );

        assert!(scheduler.on_trigger_added(1).await.is_ok());
        assert_eq!(scheduler.current_plan().await.len(), 1);
    }

    #[tokio::test]
    async fn test_event_loop_dispatches_until_stopped() {
        let f = fixture().await;
        f.storage
            .insert_trigger(Trigger::instant(1, 1, 0).with_created_at(now()))
            .await
            .unwrap();

        let scheduler = Arc::new(f.scheduler);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = scheduler.spawn_event_loop(rx);

        tx.send(SchedulerEvent::TriggerAdded(1)).unwrap();
        // Unknown ids are logged, not fatal to the loop
        tx.send(SchedulerEvent::TriggerStateUpdated(99)).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(scheduler.current_plan().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_ends_event_loop_with_open_channel() {
        let f = fixture().await;
        let scheduler = Arc::new(f.scheduler);
        let (_tx, rx) = mpsc::unbounded_channel();
        let handle = scheduler.spawn_event_loop(rx);

        scheduler.stop();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
