// Trigger planning module
//
// Turns a trigger definition plus a few facts about its existing runs into a
// PlanResult. Planning is pure: the same trigger and context always yield the
// same result, so every input (including "now") comes in through the context.

use crate::errors::ScheduleError;
use crate::models::{PlanResult, Trigger, TriggerKind};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Facts a planner needs besides the trigger itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanningContext {
    pub now: DateTime<Utc>,
    /// The trigger was just added (as opposed to being re-planned)
    pub is_new: bool,
    /// Any run, in any state, exists for the trigger
    pub has_existing_run: bool,
    /// A run for the trigger is still waiting in `Scheduled`
    pub has_pending_run: bool,
    /// A run for the trigger is between `Preparing` and `Collecting`
    pub has_running_run: bool,
}

impl PlanningContext {
    /// Context for a trigger with no runs at all
    pub fn fresh(now: DateTime<Utc>, is_new: bool) -> Self {
        Self {
            now,
            is_new,
            has_existing_run: false,
            has_pending_run: false,
            has_running_run: false,
        }
    }
}

/// Evaluate a trigger at `context.now`
pub fn plan(trigger: &Trigger, context: &PlanningContext) -> Result<PlanResult, ScheduleError> {
    match &trigger.kind {
        TriggerKind::Instant { delayed_minutes } => {
            Ok(plan_instant(trigger, *delayed_minutes, context))
        }
        TriggerKind::Scheduled { start_time_utc } => {
            Ok(plan_scheduled(trigger, *start_time_utc, context))
        }
        TriggerKind::Recurring {
            definition,
            start_time_utc,
            end_time_utc,
            no_parallel_execution,
        } => plan_recurring(
            trigger,
            definition,
            *start_time_utc,
            *end_time_utc,
            *no_parallel_execution,
            context,
        ),
    }
}

fn plan_instant(trigger: &Trigger, delayed_minutes: u32, context: &PlanningContext) -> PlanResult {
    if !trigger.is_active {
        return PlanResult::obsolete();
    }

    // An instant trigger fires exactly once
    if !context.is_new && context.has_existing_run {
        return PlanResult::obsolete();
    }

    PlanResult::possible(trigger.created_at + Duration::minutes(delayed_minutes as i64))
}

fn plan_scheduled(
    trigger: &Trigger,
    start_time_utc: DateTime<Utc>,
    context: &PlanningContext,
) -> PlanResult {
    if !trigger.is_active {
        return PlanResult::obsolete();
    }

    if start_time_utc < context.now && !context.has_pending_run {
        return PlanResult::obsolete();
    }

    PlanResult::possible(start_time_utc)
}

fn plan_recurring(
    trigger: &Trigger,
    definition: &str,
    start_time_utc: Option<DateTime<Utc>>,
    end_time_utc: Option<DateTime<Utc>>,
    no_parallel_execution: bool,
    context: &PlanningContext,
) -> Result<PlanResult, ScheduleError> {
    if !trigger.is_active {
        return Ok(PlanResult::obsolete());
    }

    if let Some(end) = end_time_utc {
        if end < context.now {
            return Ok(PlanResult::obsolete());
        }
    }

    if no_parallel_execution && context.has_running_run {
        return Ok(PlanResult::blocked());
    }

    let base = match start_time_utc {
        Some(start) if start > context.now => start,
        _ => context.now,
    };

    let Some(next) = next_occurrence(definition, base)? else {
        return Ok(PlanResult::obsolete());
    };

    if let Some(end) = end_time_utc {
        if next > end {
            return Ok(PlanResult::obsolete());
        }
    }

    Ok(PlanResult::possible(next))
}

/// Normalise a cron definition to the six/seven field grammar
///
/// The classic five-field form (`min hour dom mon dow`) gets a `0` seconds
/// field in front.
pub fn normalize_definition(definition: &str) -> String {
    let trimmed = definition.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(definition: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(&normalize_definition(definition)).map_err(|e| {
        ScheduleError::InvalidCronExpression {
            expression: definition.to_string(),
            reason: e.to_string(),
        }
    })
}

/// Fail-fast check for a recurring definition
pub fn validate_definition(definition: &str) -> Result<(), ScheduleError> {
    parse_cron_expression(definition).map(|_| ())
}

/// First occurrence of `definition` strictly after `after`
pub fn next_occurrence(
    definition: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron_expression(definition)?;
    Ok(schedule.after(&after).next())
}
