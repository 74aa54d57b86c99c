// Seed file format for the in-memory store
// Trigger kinds are tagged with "type" only at this boundary.

use crate::errors::StorageError;
use crate::models::{Job, Trigger, TriggerKind};
use crate::schedule::validate_definition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Jobs and triggers loaded at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedFile {
    #[serde(default)]
    pub jobs: Vec<JobDto>,
    #[serde(default)]
    pub triggers: Vec<TriggerDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDto {
    pub id: i64,
    pub unique_name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDto {
    pub id: i64,
    pub job_id: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_display_name: Option<String>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub kind: TriggerKindDto,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerKindDto {
    #[serde(rename_all = "camelCase")]
    Instant {
        #[serde(default)]
        delayed_minutes: u32,
    },
    #[serde(rename_all = "camelCase")]
    Scheduled { start_date_time_utc: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    Recurring {
        definition: String,
        #[serde(default)]
        start_date_time_utc: Option<DateTime<Utc>>,
        #[serde(default)]
        end_date_time_utc: Option<DateTime<Utc>>,
        #[serde(default)]
        no_parallel_execution: bool,
    },
}

impl SeedFile {
    /// Read and parse a seed file from disk
    pub async fn load(path: &Path) -> Result<Self, StorageError> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Convert to domain models, rejecting malformed recurring definitions
    pub fn into_models(self) -> Result<(Vec<Job>, Vec<Trigger>), StorageError> {
        let now = Utc::now();

        let jobs = self
            .jobs
            .into_iter()
            .map(|dto| Job {
                id: dto.id,
                unique_name: dto.unique_name,
                title: dto.title,
                job_type: dto.job_type,
                parameters: dto.parameters,
                deleted: false,
                created_at: now,
                updated_at: None,
            })
            .collect();

        let triggers = self
            .triggers
            .into_iter()
            .map(|dto| {
                let kind = match dto.kind {
                    TriggerKindDto::Instant { delayed_minutes } => {
                        TriggerKind::Instant { delayed_minutes }
                    }
                    TriggerKindDto::Scheduled {
                        start_date_time_utc,
                    } => TriggerKind::Scheduled {
                        start_time_utc: start_date_time_utc,
                    },
                    TriggerKindDto::Recurring {
                        definition,
                        start_date_time_utc,
                        end_date_time_utc,
                        no_parallel_execution,
                    } => {
                        validate_definition(&definition).map_err(|e| {
                            StorageError::ConstraintViolation(format!(
                                "Trigger {}: {}",
                                dto.id, e
                            ))
                        })?;
                        TriggerKind::Recurring {
                            definition,
                            start_time_utc: start_date_time_utc,
                            end_time_utc: end_date_time_utc,
                            no_parallel_execution,
                        }
                    }
                };

                Ok(Trigger {
                    id: dto.id,
                    job_id: dto.job_id,
                    is_active: dto.is_active,
                    user_id: dto.user_id,
                    user_display_name: dto.user_display_name,
                    parameters: dto.parameters,
                    comment: dto.comment,
                    created_at: dto.created_at.unwrap_or(now),
                    deleted: false,
                    kind,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        Ok((jobs, triggers))
    }
}
