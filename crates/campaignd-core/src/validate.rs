//! Input validation for campaign config, enforced at API boundaries and
//! before scheduling.

use std::str::FromStr as _;

use thiserror::Error;
use url::Url;

use campaignd_db::models::{BudgetConfig, CampaignConfig, RetryConfig, ScheduleConfig, StepConfig};

/// A single validation failure: the offending field and a human-readable
/// message. The API maps this to a 400 response.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// `name` non-empty; `steps` non-empty; every step/schedule/budget valid.
pub fn validate_campaign_config(config: &CampaignConfig, name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::new("name", "must not be empty"));
    }

    if config.steps.is_empty() {
        return Err(ValidationError::new("steps", "must be a non-empty ordered list"));
    }

    for (i, step) in config.steps.iter().enumerate() {
        validate_step_config(step).map_err(|e| ValidationError::new(format!("steps[{i}].{}", e.field), e.message))?;
    }

    if let Some(schedule) = &config.schedule {
        validate_schedule_config(schedule).map_err(|e| ValidationError::new(format!("schedule.{}", e.field), e.message))?;
    }

    if let Some(budget) = &config.budget {
        validate_budget_config(budget).map_err(|e| ValidationError::new(format!("budget.{}", e.field), e.message))?;
    }

    Ok(())
}

/// `name`, `engine`, well-formed `endpoint`, valid `method`/policies/retry.
pub fn validate_step_config(step: &StepConfig) -> Result<(), ValidationError> {
    if step.name.trim().is_empty() {
        return Err(ValidationError::new("name", "must not be empty"));
    }

    let url = Url::parse(&step.endpoint).map_err(|e| ValidationError::new("endpoint", format!("not a well-formed URL: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ValidationError::new("endpoint", "must be an http or https URL"));
    }

    const VALID_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];
    if !VALID_METHODS.contains(&step.method.to_uppercase().as_str()) {
        return Err(ValidationError::new("method", format!("unsupported HTTP method {:?}", step.method)));
    }

    validate_retry_config(&step.retry).map_err(|e| ValidationError::new(format!("retry.{}", e.field), e.message))?;

    Ok(())
}

/// Normalize a cron expression to the 6-field (seconds-first) grammar the
/// `cron`/`tokio-cron-scheduler` crates require. The spec's schedule
/// config is standard 5-field Unix cron (minute hour day month weekday);
/// a bare 5-field expression gets a `0` seconds field prepended. An
/// expression that already has 6 fields passes through unchanged.
pub fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_owned()
    }
}

/// Cron syntactically valid by the chosen cron grammar (after normalizing
/// to 6 fields); `enabled` a bool is enforced by the type system, so only
/// the cron expression is checked.
pub fn validate_schedule_config(schedule: &ScheduleConfig) -> Result<(), ValidationError> {
    cron::Schedule::from_str(&normalize_cron_expr(&schedule.cron))
        .map_err(|e| ValidationError::new("cron", format!("invalid cron expression: {e}")))?;
    Ok(())
}

/// Each present numeric field is finite and non-negative.
pub fn validate_budget_config(budget: &BudgetConfig) -> Result<(), ValidationError> {
    for (field, value) in [
        ("daily", budget.daily),
        ("weekly", budget.weekly),
        ("monthly", budget.monthly),
        ("perLead", budget.per_lead),
    ] {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err(ValidationError::new(field, "must be a finite, non-negative number"));
            }
        }
    }
    Ok(())
}

/// `attempts` is a valid u32 by construction; `initial_delay_ms` is a
/// valid u64 by construction. `backoff` is a closed enum validated by
/// deserialization, so there is nothing further to check beyond the
/// type system here -- this function exists as the named validation seam
/// `spec.md` calls for, should a future numeric range need enforcing.
pub fn validate_retry_config(_retry: &RetryConfig) -> Result<(), ValidationError> {
    Ok(())
}
