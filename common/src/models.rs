use chrono::{DateTime, Utc};
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Job Models
// ============================================================================

/// Job represents a job definition that triggers produce runs for
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: i64,
    pub unique_name: String,
    pub title: Option<String>,
    /// Command the runner executes for every run of this job
    pub job_type: String,
    pub parameters: Option<serde_json::Value>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new job definition with default settings
    pub fn new(id: i64, unique_name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            id,
            unique_name: unique_name.into(),
            title: None,
            job_type: job_type.into(),
            parameters: None,
            deleted: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

// ============================================================================
// Trigger Models
// ============================================================================

/// Trigger describes when a job should run
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub id: i64,
    pub job_id: i64,
    pub is_active: bool,
    pub user_id: Option<String>,
    pub user_display_name: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    pub kind: TriggerKind,
}

/// TriggerKind holds the kind-specific part of a trigger
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerKind {
    /// Fires once, `delayed_minutes` after the trigger was created
    Instant { delayed_minutes: u32 },
    /// Fires once at an absolute point in time
    Scheduled { start_time_utc: DateTime<Utc> },
    /// Fires repeatedly according to a cron definition
    Recurring {
        definition: String,
        start_time_utc: Option<DateTime<Utc>>,
        end_time_utc: Option<DateTime<Utc>>,
        no_parallel_execution: bool,
    },
}

impl TriggerKind {
    /// Short name of the kind, used in log fields
    pub fn name(&self) -> &'static str {
        match self {
            TriggerKind::Instant { .. } => "instant",
            TriggerKind::Scheduled { .. } => "scheduled",
            TriggerKind::Recurring { .. } => "recurring",
        }
    }
}

impl Trigger {
    /// Create an active trigger for a job
    pub fn new(id: i64, job_id: i64, kind: TriggerKind) -> Self {
        Self {
            id,
            job_id,
            is_active: true,
            user_id: None,
            user_display_name: None,
            parameters: None,
            comment: None,
            created_at: Utc::now(),
            deleted: false,
            kind,
        }
    }

    /// Create an instant trigger
    pub fn instant(id: i64, job_id: i64, delayed_minutes: u32) -> Self {
        Self::new(id, job_id, TriggerKind::Instant { delayed_minutes })
    }

    /// Create a scheduled trigger
    pub fn scheduled(id: i64, job_id: i64, start_time_utc: DateTime<Utc>) -> Self {
        Self::new(id, job_id, TriggerKind::Scheduled { start_time_utc })
    }

    /// Create a recurring trigger without start or end bounds
    pub fn recurring(
        id: i64,
        job_id: i64,
        definition: impl Into<String>,
        no_parallel_execution: bool,
    ) -> Self {
        Self::new(
            id,
            job_id,
            TriggerKind::Recurring {
                definition: definition.into(),
                start_time_utc: None,
                end_time_utc: None,
                no_parallel_execution,
            },
        )
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.user_display_name = Some(display_name.into());
        self
    }
}

// ============================================================================
// JobRun Models
// ============================================================================

/// JobRun represents a single tracked occurrence of a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub id: i64,
    pub job_id: i64,
    pub trigger_id: i64,
    /// Correlation id shared with the child process and its back-channel messages
    pub unique_id: Uuid,
    pub state: JobRunState,
    pub progress: Option<f64>,
    pub planned_start_utc: DateTime<Utc>,
    pub actual_start_utc: Option<DateTime<Utc>>,
    pub actual_end_utc: Option<DateTime<Utc>>,
    pub estimated_end_utc: Option<DateTime<Utc>>,
    pub job_parameters: Option<serde_json::Value>,
    pub instance_parameters: Option<serde_json::Value>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub deleted: bool,
}

impl JobRun {
    /// Create a new scheduled run for a trigger, snapshotting the parameters
    ///
    /// The id stays `0` until storage assigns one in `save_new_job_run`.
    pub fn new_scheduled(job: &Job, trigger: &Trigger, planned_start_utc: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            job_id: job.id,
            trigger_id: trigger.id,
            unique_id: Uuid::new_v4(),
            state: JobRunState::Scheduled,
            progress: None,
            planned_start_utc,
            actual_start_utc: None,
            actual_end_utc: None,
            estimated_end_utc: None,
            job_parameters: job.parameters.clone(),
            instance_parameters: trigger.parameters.clone(),
            pid: None,
            exit_code: None,
            deleted: false,
        }
    }

    /// A run is pending while it waits in the plan for its start
    pub fn is_pending(&self) -> bool {
        !self.deleted && self.state == JobRunState::Scheduled
    }

    /// A run is running between preparation and collection
    pub fn is_running(&self) -> bool {
        !self.deleted && self.state.is_running()
    }
}

/// JobRunState represents the lifecycle of a job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobRunState {
    Scheduled,
    Preparing,
    Starting,
    Started,
    Connected,
    Initializing,
    Processing,
    Finishing,
    Collecting,
    Completed,
    Failed,
    Omitted,
    Deleted,
}

impl JobRunState {
    /// All states in lifecycle order
    pub const ALL: [JobRunState; 13] = [
        JobRunState::Scheduled,
        JobRunState::Preparing,
        JobRunState::Starting,
        JobRunState::Started,
        JobRunState::Connected,
        JobRunState::Initializing,
        JobRunState::Processing,
        JobRunState::Finishing,
        JobRunState::Collecting,
        JobRunState::Completed,
        JobRunState::Failed,
        JobRunState::Omitted,
        JobRunState::Deleted,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobRunState::Completed | JobRunState::Failed | JobRunState::Omitted | JobRunState::Deleted
        )
    }

    pub fn is_running(&self) -> bool {
        *self >= JobRunState::Preparing && *self <= JobRunState::Collecting
    }

    /// Whether the state machine allows moving from `self` to `next`
    ///
    /// Transitions only move forward along the lifecycle; `Failed` can be
    /// entered from `Starting` onward, `Omitted` and `Deleted` only from
    /// `Scheduled`. Terminal states never change.
    pub fn can_transition_to(&self, next: JobRunState) -> bool {
        if self.is_terminal() {
            return false;
        }

        match next {
            JobRunState::Failed => *self >= JobRunState::Starting,
            JobRunState::Omitted | JobRunState::Deleted => *self == JobRunState::Scheduled,
            JobRunState::Scheduled => false,
            _ => next > *self,
        }
    }
}

impl std::fmt::Display for JobRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobRunState::Scheduled => write!(f, "scheduled"),
            JobRunState::Preparing => write!(f, "preparing"),
            JobRunState::Starting => write!(f, "starting"),
            JobRunState::Started => write!(f, "started"),
            JobRunState::Connected => write!(f, "connected"),
            JobRunState::Initializing => write!(f, "initializing"),
            JobRunState::Processing => write!(f, "processing"),
            JobRunState::Finishing => write!(f, "finishing"),
            JobRunState::Collecting => write!(f, "collecting"),
            JobRunState::Completed => write!(f, "completed"),
            JobRunState::Failed => write!(f, "failed"),
            JobRunState::Omitted => write!(f, "omitted"),
            JobRunState::Deleted => write!(f, "deleted"),
        }
    }
}

impl FromStr for JobRunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobRunState::ALL
            .iter()
            .copied()
            .find(|state| state.to_string() == s)
            .ok_or_else(|| format!("Invalid job run state: {}", s))
    }
}

// ============================================================================
// Planning Models
// ============================================================================

/// PlanAction is a planner's verdict for one trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    /// The trigger yields a run at `expected_start_utc`
    Possible,
    /// The trigger would yield a run but a concurrency constraint prevents it
    Blocked,
    /// The trigger no longer yields future runs
    Obsolete,
}

impl std::fmt::Display for PlanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanAction::Possible => write!(f, "possible"),
            PlanAction::Blocked => write!(f, "blocked"),
            PlanAction::Obsolete => write!(f, "obsolete"),
        }
    }
}

/// PlanResult is the outcome of evaluating one trigger at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanResult {
    pub action: PlanAction,
    pub expected_start_utc: Option<DateTime<Utc>>,
}

impl PlanResult {
    pub fn possible(expected_start_utc: DateTime<Utc>) -> Self {
        Self {
            action: PlanAction::Possible,
            expected_start_utc: Some(expected_start_utc),
        }
    }

    pub fn blocked() -> Self {
        Self {
            action: PlanAction::Blocked,
            expected_start_utc: None,
        }
    }

    pub fn obsolete() -> Self {
        Self {
            action: PlanAction::Obsolete,
            expected_start_utc: None,
        }
    }
}

/// ScheduledPlanItem is the scheduler's in-memory view of one pending run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledPlanItem {
    pub trigger_id: i64,
    pub unique_id: Uuid,
    pub planned_start_utc: DateTime<Utc>,
}

/// PlannedJobRun is the immutable record published to the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedJobRun {
    pub unique_id: Uuid,
    pub planned_start_utc: DateTime<Utc>,
}

impl From<&ScheduledPlanItem> for PlannedJobRun {
    fn from(item: &ScheduledPlanItem) -> Self {
        Self {
            unique_id: item.unique_id,
            planned_start_utc: item.planned_start_utc,
        }
    }
}
