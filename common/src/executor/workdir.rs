// Per-run working directory
//
// Layout under the configured job run directory:
//   run-<id>/metadata.json
//   run-<id>/job-parameters.json       (only when the job has parameters)
//   run-<id>/instance-parameters.json  (only when the trigger has parameters)

use crate::errors::ExecutionError;
use crate::models::{Job, JobRun, Trigger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const METADATA_FILE: &str = "metadata.json";
pub const JOB_PARAMETERS_FILE: &str = "job-parameters.json";
pub const INSTANCE_PARAMETERS_FILE: &str = "instance-parameters.json";

/// Run description read by the child runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub job_run_id: i64,
    pub correlation_id: Uuid,
    pub job_id: i64,
    pub trigger_id: i64,
    pub unique_name: String,
    pub job_type: String,
    pub user_id: Option<String>,
    pub user_display_name: Option<String>,
    pub planned_start_utc: DateTime<Utc>,
}

impl RunMetadata {
    pub fn new(run: &JobRun, job: &Job, trigger: Option<&Trigger>) -> Self {
        Self {
            job_run_id: run.id,
            correlation_id: run.unique_id,
            job_id: job.id,
            trigger_id: run.trigger_id,
            unique_name: job.unique_name.clone(),
            job_type: job.job_type.clone(),
            user_id: trigger.and_then(|t| t.user_id.clone()),
            user_display_name: trigger.and_then(|t| t.user_display_name.clone()),
            planned_start_utc: run.planned_start_utc,
        }
    }

    /// Read `metadata.json` from a run directory
    pub async fn load(workdir: &Path) -> Result<Self, ExecutionError> {
        let path = workdir.join(METADATA_FILE);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ExecutionError::WorkingDirectory(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| ExecutionError::WorkingDirectory(format!("{}: {}", path.display(), e)))
    }
}

/// Directory of one run below `base`
pub fn run_directory(base: &Path, job_run_id: i64) -> PathBuf {
    base.join(format!("run-{}", job_run_id))
}

/// Create the run directory and write metadata and parameter files
pub async fn prepare_run_directory(
    base: &Path,
    run: &JobRun,
    metadata: &RunMetadata,
) -> Result<PathBuf, ExecutionError> {
    let dir = run_directory(base, run.id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ExecutionError::WorkingDirectory(format!("{}: {}", dir.display(), e)))?;

    write_json(&dir.join(METADATA_FILE), metadata).await?;
    if let Some(parameters) = &run.job_parameters {
        write_json(&dir.join(JOB_PARAMETERS_FILE), parameters).await?;
    }
    if let Some(parameters) = &run.instance_parameters {
        write_json(&dir.join(INSTANCE_PARAMETERS_FILE), parameters).await?;
    }

    Ok(dir)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ExecutionError> {
    let content = serde_json::to_vec_pretty(value)
        .map_err(|e| ExecutionError::WorkingDirectory(format!("{}: {}", path.display(), e)))?;
    tokio::fs::write(path, content)
        .await
        .map_err(|e| ExecutionError::WorkingDirectory(format!("{}: {}", path.display(), e)))
}
