// In-memory JobRepository
// Backs the job server when no persistence backend is plugged in, and every test.

use super::seed::SeedFile;
use super::JobRepository;
use crate::errors::StorageError;
use crate::models::{Job, JobRun, JobRunState, Trigger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<i64, Job>,
    triggers: BTreeMap<i64, Trigger>,
    job_runs: BTreeMap<i64, JobRun>,
    run_ids: HashMap<Uuid, i64>,
    next_run_id: i64,
}

impl Inner {
    fn run_by_uid_mut(&mut self, unique_id: Uuid) -> Result<&mut JobRun, StorageError> {
        let id = self
            .run_ids
            .get(&unique_id)
            .copied()
            .ok_or_else(|| StorageError::NotFound(format!("Job run not found: {}", unique_id)))?;
        self.job_runs
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("Job run not found: {}", unique_id)))
    }
}

/// Thread-safe in-memory store for jobs, triggers and job runs
#[derive(Default)]
pub struct InMemoryJobStorage {
    inner: RwLock<Inner>,
}

impl InMemoryJobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated from a seed file
    pub async fn from_seed(seed: SeedFile) -> Result<Self, StorageError> {
        let storage = Self::new();
        let (jobs, triggers) = seed.into_models()?;
        for job in jobs {
            storage.insert_job(job).await;
        }
        for trigger in triggers {
            storage.insert_trigger(trigger).await?;
        }
        Ok(storage)
    }

    /// Insert or replace a job definition
    pub async fn insert_job(&self, job: Job) {
        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.id, job);
    }

    /// Insert a trigger; its job must already exist
    pub async fn insert_trigger(&self, trigger: Trigger) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if !inner.jobs.contains_key(&trigger.job_id) {
            return Err(StorageError::ConstraintViolation(format!(
                "Trigger {} references unknown job {}",
                trigger.id, trigger.job_id
            )));
        }
        if inner.triggers.contains_key(&trigger.id) {
            return Err(StorageError::ConstraintViolation(format!(
                "Trigger {} already exists",
                trigger.id
            )));
        }
        inner.triggers.insert(trigger.id, trigger);
        Ok(())
    }

    /// Replace an existing trigger definition
    pub async fn update_trigger(&self, trigger: Trigger) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        match inner.triggers.get_mut(&trigger.id) {
            Some(existing) => {
                *existing = trigger;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "Trigger not found: {}",
                trigger.id
            ))),
        }
    }

    /// Flip a trigger's active flag
    pub async fn set_trigger_active(&self, trigger_id: i64, active: bool) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let trigger = inner
            .triggers
            .get_mut(&trigger_id)
            .ok_or_else(|| StorageError::NotFound(format!("Trigger not found: {}", trigger_id)))?;
        trigger.is_active = active;
        Ok(())
    }

    /// Snapshot of every stored run, in id order
    pub async fn job_runs(&self) -> Vec<JobRun> {
        self.inner.read().await.job_runs.values().cloned().collect()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobStorage {
    async fn get_active_triggers(&self) -> Result<Vec<Trigger>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .triggers
            .values()
            .filter(|t| t.is_active && !t.deleted)
            .cloned()
            .collect())
    }

    async fn get_trigger_by_id(&self, trigger_id: i64) -> Result<Option<Trigger>, StorageError> {
        Ok(self.inner.read().await.triggers.get(&trigger_id).cloned())
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StorageError> {
        Ok(self.inner.read().await.jobs.get(&job_id).cloned())
    }

    #[instrument(skip(self, job_run), fields(trigger_id = job_run.trigger_id))]
    async fn save_new_job_run(&self, mut job_run: JobRun) -> Result<JobRun, StorageError> {
        let mut inner = self.inner.write().await;
        if inner.run_ids.contains_key(&job_run.unique_id) {
            return Err(StorageError::ConstraintViolation(format!(
                "Job run {} already exists",
                job_run.unique_id
            )));
        }

        inner.next_run_id += 1;
        job_run.id = inner.next_run_id;
        inner.run_ids.insert(job_run.unique_id, job_run.id);
        inner.job_runs.insert(job_run.id, job_run.clone());

        debug!(job_run_id = job_run.id, correlation_id = %job_run.unique_id, "Job run saved");
        Ok(job_run)
    }

    async fn get_pending_job_run_by_trigger_id(
        &self,
        trigger_id: i64,
    ) -> Result<Option<JobRun>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .job_runs
            .values()
            .filter(|r| r.trigger_id == trigger_id && r.is_pending())
            .min_by_key(|r| r.planned_start_utc)
            .cloned())
    }

    async fn update_job_run(&self, job_run: &JobRun) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .job_runs
            .get_mut(&job_run.id)
            .ok_or_else(|| StorageError::NotFound(format!("Job run not found: {}", job_run.id)))?;

        if stored.unique_id != job_run.unique_id {
            return Err(StorageError::ConstraintViolation(format!(
                "Job run {} cannot change its correlation id",
                job_run.id
            )));
        }
        if stored.state != job_run.state && !stored.state.can_transition_to(job_run.state) {
            return Err(StorageError::ConstraintViolation(format!(
                "Job run {} cannot move from {} to {}",
                job_run.id, stored.state, job_run.state
            )));
        }

        *stored = job_run.clone();
        Ok(())
    }

    async fn update_planned_start(
        &self,
        unique_id: Uuid,
        planned_start_utc: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let run = inner.run_by_uid_mut(unique_id)?;
        if !run.is_pending() {
            return Err(StorageError::ConstraintViolation(format!(
                "Job run {} is {} and can no longer be rescheduled",
                unique_id, run.state
            )));
        }
        run.planned_start_utc = planned_start_utc;
        Ok(())
    }

    async fn get_running_job_runs(
        &self,
        job_id: i64,
        trigger_id: i64,
    ) -> Result<Vec<JobRun>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .job_runs
            .values()
            .filter(|r| r.job_id == job_id && r.trigger_id == trigger_id && r.is_running())
            .cloned()
            .collect())
    }

    async fn disable_trigger(&self, trigger_id: i64) -> Result<(), StorageError> {
        self.set_trigger_active(trigger_id, false).await
    }

    async fn delete_job_run(&self, unique_id: Uuid) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let run = inner.run_by_uid_mut(unique_id)?;
        if !run.state.can_transition_to(JobRunState::Deleted) {
            return Err(StorageError::ConstraintViolation(format!(
                "Job run {} is {} and cannot be deleted",
                unique_id, run.state
            )));
        }
        run.deleted = true;
        run.state = JobRunState::Deleted;
        Ok(())
    }

    async fn get_job_run_by_unique_id(
        &self,
        unique_id: Uuid,
    ) -> Result<Option<JobRun>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .run_ids
            .get(&unique_id)
            .and_then(|id| inner.job_runs.get(id))
            .cloned())
    }

    async fn get_job_runs_by_trigger_id(
        &self,
        trigger_id: i64,
    ) -> Result<Vec<JobRun>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .job_runs
            .values()
            .filter(|r| r.trigger_id == trigger_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage_with_trigger() -> (InMemoryJobStorage, Job, Trigger) {
        let storage = InMemoryJobStorage::new();
        let job = Job::new(1, "report", "echo hi");
        let trigger = Trigger::instant(10, 1, 0);
        storage.insert_job(job.clone()).await;
        storage.insert_trigger(trigger.clone()).await.unwrap();
        (storage, job, trigger)
    }

    #[tokio::test]
    async fn test_insert_trigger_requires_job() {
        let storage = InMemoryJobStorage::new();
        let err = storage
            .insert_trigger(Trigger::instant(1, 99, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_save_new_job_run_assigns_ids() {
        let (storage, job, trigger) = storage_with_trigger().await;
        let first = storage
            .save_new_job_run(JobRun::new_scheduled(&job, &trigger, Utc::now()))
            .await
            .unwrap();
        let second = storage
            .save_new_job_run(JobRun::new_scheduled(&job, &trigger, Utc::now()))
            .await
            .unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(
            storage.get_job_run_by_unique_id(second.unique_id).await.unwrap(),
            Some(second)
        );
    }

    #[tokio::test]
    async fn test_pending_run_lookup_ignores_started_and_deleted_runs() {
        let (storage, job, trigger) = storage_with_trigger().await;
        let mut started = storage
            .save_new_job_run(JobRun::new_scheduled(&job, &trigger, Utc::now()))
            .await
            .unwrap();
        started.state = JobRunState::Preparing;
        storage.update_job_run(&started).await.unwrap();

        let deleted = storage
            .save_new_job_run(JobRun::new_scheduled(&job, &trigger, Utc::now()))
            .await
            .unwrap();
        storage.delete_job_run(deleted.unique_id).await.unwrap();

        assert_eq!(
            storage.get_pending_job_run_by_trigger_id(trigger.id).await.unwrap(),
            None
        );
        assert_eq!(
            storage
                .get_running_job_runs(job.id, trigger.id)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(storage
            .get_running_job_runs(job.id, trigger.id + 1)
            .await
            .unwrap()
            .is_empty());

        let pending = storage
            .save_new_job_run(JobRun::new_scheduled(&job, &trigger, Utc::now()))
            .await
            .unwrap();
        assert_eq!(
            storage
                .get_pending_job_run_by_trigger_id(trigger.id)
                .await
                .unwrap()
                .map(|r| r.unique_id),
            Some(pending.unique_id)
        );
    }

    #[tokio::test]
    async fn test_update_job_run_rejects_leaving_terminal_state() {
        let (storage, job, trigger) = storage_with_trigger().await;
        let mut run = storage
            .save_new_job_run(JobRun::new_scheduled(&job, &trigger, Utc::now()))
            .await
            .unwrap();
        run.state = JobRunState::Omitted;
        storage.update_job_run(&run).await.unwrap();

        run.state = JobRunState::Preparing;
        let err = storage.update_job_run(&run).await.unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_update_planned_start_only_for_pending_runs() {
        let (storage, job, trigger) = storage_with_trigger().await;
        let mut run = storage
            .save_new_job_run(JobRun::new_scheduled(&job, &trigger, Utc::now()))
            .await
            .unwrap();
        let later = Utc::now() + chrono::Duration::hours(1);
        storage.update_planned_start(run.unique_id, later).await.unwrap();
        assert_eq!(
            storage
                .get_job_run_by_unique_id(run.unique_id)
                .await
                .unwrap()
                .unwrap()
                .planned_start_utc,
            later
        );

        run.planned_start_utc = later;
        run.state = JobRunState::Preparing;
        storage.update_job_run(&run).await.unwrap();
        assert!(storage.update_planned_start(run.unique_id, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_job_run_tombstones() {
        let (storage, job, trigger) = storage_with_trigger().await;
        let run = storage
            .save_new_job_run(JobRun::new_scheduled(&job, &trigger, Utc::now()))
            .await
            .unwrap();
        storage.delete_job_run(run.unique_id).await.unwrap();

        let stored = storage
            .get_job_run_by_unique_id(run.unique_id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.deleted);
        assert_eq!(stored.state, JobRunState::Deleted);
        assert_eq!(storage.get_job_runs_by_trigger_id(trigger.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disable_trigger_removes_it_from_active_set() {
        let (storage, _, trigger) = storage_with_trigger().await;
        storage.disable_trigger(trigger.id).await.unwrap();
        assert!(storage.get_active_triggers().await.unwrap().is_empty());
        assert!(!storage
            .get_trigger_by_id(trigger.id)
            .await
            .unwrap()
            .unwrap()
            .is_active);
    }
}
