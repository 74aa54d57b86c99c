// Storage contract for jobs, triggers and job runs
// The scheduler and the engine only ever see `Arc<dyn JobRepository>`.

pub mod memory;
pub mod seed;

pub use memory::InMemoryJobStorage;
pub use seed::SeedFile;

use crate::errors::StorageError;
use crate::models::{Job, JobRun, Trigger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Persistence operations used by the scheduler and the execution engine
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// All triggers that are active and not deleted
    async fn get_active_triggers(&self) -> Result<Vec<Trigger>, StorageError>;

    async fn get_trigger_by_id(&self, trigger_id: i64) -> Result<Option<Trigger>, StorageError>;

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StorageError>;

    /// Persist a new run and return it with its assigned id
    async fn save_new_job_run(&self, job_run: JobRun) -> Result<JobRun, StorageError>;

    /// The run of a trigger still waiting in `Scheduled`, if any
    async fn get_pending_job_run_by_trigger_id(
        &self,
        trigger_id: i64,
    ) -> Result<Option<JobRun>, StorageError>;

    /// Replace a stored run; moving backwards in the lifecycle is rejected
    async fn update_job_run(&self, job_run: &JobRun) -> Result<(), StorageError>;

    async fn update_planned_start(
        &self,
        unique_id: Uuid,
        planned_start_utc: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Runs of a job's trigger between `Preparing` and `Collecting`
    async fn get_running_job_runs(
        &self,
        job_id: i64,
        trigger_id: i64,
    ) -> Result<Vec<JobRun>, StorageError>;

    async fn disable_trigger(&self, trigger_id: i64) -> Result<(), StorageError>;

    /// Tombstone a run: `deleted = true`, state `Deleted`
    async fn delete_job_run(&self, unique_id: Uuid) -> Result<(), StorageError>;

    async fn get_job_run_by_unique_id(&self, unique_id: Uuid)
        -> Result<Option<JobRun>, StorageError>;

    async fn get_job_runs_by_trigger_id(&self, trigger_id: i64)
        -> Result<Vec<JobRun>, StorageError>;
}
