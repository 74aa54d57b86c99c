// Error handling framework
// One typed error enum per concern; binaries wrap them with anyhow.

use thiserror::Error;
use uuid::Uuid;

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid trigger configuration for trigger {trigger_id}: {reason}")]
    InvalidConfiguration { trigger_id: i64, reason: String },
}

/// Storage errors surfaced by a `JobRepository`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Filesystem error: {0}")]
    FileSystemError(String),
}

/// Errors returned by the scheduler's event handlers
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Trigger not found: {0}")]
    TriggerNotFound(i64),

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Planning failed: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),
}

/// Job run execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Unknown or already finalized job run: {0}")]
    UnknownJobRun(Uuid),

    #[error("Failed to prepare run directory: {0}")]
    WorkingDirectory(String),

    #[error("Failed to launch process: {0}")]
    LaunchFailed(String),

    #[error("Executor unavailable: {0}")]
    Unavailable(String),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),
}

/// Back-channel transport errors
#[derive(Error, Debug)]
pub enum BackChannelError {
    #[error("Failed to bind back-channel listener on '{address}': {reason}")]
    Bind { address: String, reason: String },

    #[error("Invalid back-channel address '{0}'")]
    InvalidAddress(String),

    #[error("Back-channel request failed: {0}")]
    RequestFailed(String),

    #[error("Back-channel rejected message with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// Validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Path for {field} does not exist: {path}")]
    PathNotFound { field: String, path: String },
}

/// Error body returned by the back-channel HTTP service
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&ExecutionError> for ApiError {
    fn from(err: &ExecutionError) -> Self {
        let code = match err {
            ExecutionError::UnknownJobRun(_) => "UNKNOWN_JOB_RUN",
            ExecutionError::Storage(_) => "STORAGE_ERROR",
            _ => "EXECUTION_ERROR",
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidJson(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::FileSystemError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "invalid format".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
        assert!(err.to_string().contains("* * * *"));
    }

    #[test]
    fn test_scheduler_error_from_storage() {
        let err: SchedulerError = StorageError::Unavailable("connection reset".to_string()).into();
        assert!(matches!(err, SchedulerError::Storage(_)));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_unknown_job_run_to_api_error() {
        let err = ExecutionError::UnknownJobRun(Uuid::nil());
        let api_err = ApiError::from(&err);
        assert_eq!(api_err.code, "UNKNOWN_JOB_RUN");
    }

    #[test]
    fn test_launch_failure_to_api_error() {
        let err = ExecutionError::LaunchFailed("no such file".to_string());
        let api_err = ApiError::from(&err);
        assert_eq!(api_err.code, "EXECUTION_ERROR");
        assert!(api_err.message.contains("no such file"));
    }
}
