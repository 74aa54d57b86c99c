// Scheduler module: turns triggers into a reconciled execution plan

pub mod engine;

pub use engine::{JobScheduler, SchedulerConfig, SchedulerEvent};

use crate::errors::ExecutionError;
use crate::models::PlannedJobRun;
use async_trait::async_trait;

/// Receiver of the scheduler's published plan
///
/// Every call carries the full plan; implementations replace whatever they
/// held before.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn on_plan_changed(&self, plan: Vec<PlannedJobRun>) -> Result<(), ExecutionError>;
}
