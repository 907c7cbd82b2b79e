//! Campaign Runner: runs one campaign end-to-end.
//!
//! Budget preflight, then a sequential step loop driven by each step's
//! `onSuccess`/`onFailure` policy, then finalization and notification.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};

use campaignd_db::models::{Campaign, CampaignRun, OnFailure, OnSuccess, RunError, RunStatus, TriggerType};
use campaignd_db::queries::{campaigns, runs};

use crate::budget::BudgetGate;
use crate::dispatch::{StepDispatcher, default_timeout_for_engine};
use crate::notify::{Notifier, completion_body, failure_body};
use crate::retry::retry;
use crate::state::RunStateMachine;

/// Raised when a campaign's run is aborted before any step executes.
#[derive(Debug, thiserror::Error)]
#[error("campaign {campaign_id} run aborted: {reason}")]
pub struct RunAbortedError {
    pub campaign_id: uuid::Uuid,
    pub reason: String,
    pub budget_exceeded: bool,
}

/// Runs campaigns by dispatching their steps and persisting outcomes.
pub struct CampaignRunner<'a> {
    pool: &'a PgPool,
    dispatcher: StepDispatcher,
    notifier: &'a Notifier,
    timezone: chrono_tz::Tz,
}

impl<'a> CampaignRunner<'a> {
    pub fn new(
        pool: &'a PgPool,
        client: Arc<reqwest::Client>,
        notifier: &'a Notifier,
        timezone: chrono_tz::Tz,
    ) -> Self {
        Self {
            pool,
            dispatcher: StepDispatcher::new(client),
            notifier,
            timezone,
        }
    }

    /// Run a campaign to completion, returning the finalized run.
    ///
    /// Returns `Err(RunAbortedError)` only for the budget-preflight abort
    /// path; all other outcomes (completed/partial/failed) are returned as
    /// `Ok` with the run's terminal status reflecting the result.
    pub async fn run_campaign(&self, campaign: &Campaign, trigger_type: TriggerType) -> Result<CampaignRun> {
        let config = campaign
            .parsed_config()
            .with_context(|| format!("campaign {} has malformed config", campaign.id))?;

        let run = runs::create_run(self.pool, campaign.id, trigger_type)
            .await
            .with_context(|| format!("failed to persist run-start record for campaign {}", campaign.id))?;

        info!(campaign_id = %campaign.id, run_id = %run.id, "starting campaign run");

        if let Some(budget) = &config.budget {
            let gate = BudgetGate::new(self.pool, self.timezone);
            let check = gate.check(campaign.id, budget).await;
            if check.exceeded {
                return self.abort_on_budget(campaign, &run, &check).await;
            }
        }

        let mut total_cost = 0.0_f64;
        let mut steps_completed = 0_i32;
        let mut steps_failed = 0_i32;
        let mut results = serde_json::Map::new();
        let mut errors: Vec<RunError> = Vec::new();
        let mut terminal_error: Option<String> = None;

        'steps: for step in &config.steps {
            let params = merge_project_id(&step.params, campaign.project_id.as_deref());
            let timeout = step
                .timeout_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or_else(|| default_timeout_for_engine(step.engine));

            let dispatch_result = retry(&step.retry, &step.name, || {
                self.dispatcher.call(step.engine, &step.endpoint, &step.method, &params, timeout)
            })
            .await;

            match dispatch_result {
                Ok(step_result) => {
                    let raw = serde_json::to_value(&step_result).unwrap_or(serde_json::Value::Null);
                    let cost = crate::cost::extract_cost(&raw);
                    total_cost += cost;
                    steps_completed += 1;
                    results.insert(step.name.clone(), raw);

                    self.persist_progress(
                        run.id,
                        steps_completed,
                        steps_failed,
                        total_cost,
                        &results,
                        &errors,
                    )
                    .await?;

                    if step.on_success == OnSuccess::Abort {
                        break 'steps;
                    }
                }
                Err(err) => {
                    steps_failed += 1;
                    errors.push(RunError {
                        step: step.name.clone(),
                        error: err.to_string(),
                        at: Utc::now(),
                    });

                    self.persist_progress(
                        run.id,
                        steps_completed,
                        steps_failed,
                        total_cost,
                        &results,
                        &errors,
                    )
                    .await?;

                    match step.on_failure {
                        OnFailure::Abort => {
                            terminal_error = Some(format!("step {:?} failed: {err}", step.name));
                            break 'steps;
                        }
                        OnFailure::Continue | OnFailure::Log => {
                            if step.on_failure == OnFailure::Log {
                                warn!(campaign_id = %campaign.id, step = %step.name, error = %err, "step failed, logging and continuing");
                            }
                            continue 'steps;
                        }
                    }
                }
            }
        }

        let final_status = if terminal_error.is_some() {
            RunStatus::Failed
        } else if steps_failed == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };

        self.finalize(campaign, &run, final_status, steps_completed, steps_failed, total_cost, &results, &errors)
            .await?;

        let duration_ms = (Utc::now() - run.started_at).num_milliseconds();

        match final_status {
            RunStatus::Completed | RunStatus::Partial => {
                if let Some(target) = config.notifications.as_ref().and_then(|n| n.on_complete.as_ref()) {
                    let body = completion_body(&campaign.name, steps_completed, steps_failed, total_cost, duration_ms, &results, &errors);
                    self.notifier.send(&target.email, &format!("Campaign {} finished", campaign.name), &body, None).await;
                }
            }
            RunStatus::Failed | RunStatus::Aborted => {
                if let Some(target) = config.notifications.as_ref().and_then(|n| n.on_failure.as_ref()) {
                    let message = terminal_error.clone().unwrap_or_else(|| "run failed".to_owned());
                    let body = failure_body(&campaign.name, &message, false);
                    self.notifier.send(&target.email, &format!("Campaign {} failed", campaign.name), &body, None).await;
                }
            }
            RunStatus::Running => unreachable!("finalize always produces a terminal status"),
        }

        if let Some(message) = terminal_error {
            anyhow::bail!("campaign {} run {} failed: {message}", campaign.id, run.id);
        }

        runs::get_run(self.pool, run.id)
            .await?
            .with_context(|| format!("run {} vanished after finalization", run.id))
    }

    async fn abort_on_budget(
        &self,
        campaign: &Campaign,
        run: &CampaignRun,
        check: &crate::budget::BudgetCheck,
    ) -> Result<CampaignRun> {
        let reason = check.reason.clone().unwrap_or_else(|| "budget exceeded".to_owned());

        RunStateMachine::transition(self.pool, run.id, RunStatus::Running, RunStatus::Aborted).await?;
        runs::update_run(
            self.pool,
            run.id,
            &runs::RunPatch {
                errors: Some(serde_json::json!([{
                    "step": "budget-check",
                    "error": reason,
                    "at": Utc::now(),
                }])),
                ..Default::default()
            },
        )
        .await?;

        campaigns::update_campaign(
            self.pool,
            campaign.id,
            &campaigns::CampaignPatch {
                status: Some(campaignd_db::models::CampaignStatus::Paused),
                ..Default::default()
            },
        )
        .await?;

        if let Ok(config) = campaign.parsed_config() {
            if let Some(target) = config.notifications.as_ref().and_then(|n| n.on_failure.as_ref()) {
                let body = failure_body(&campaign.name, &reason, true);
                self.notifier
                    .send(&target.email, &format!("Campaign {} aborted", campaign.name), &body, None)
                    .await;
            }
        }

        Err(RunAbortedError {
            campaign_id: campaign.id,
            reason,
            budget_exceeded: true,
        }
        .into())
    }

    async fn persist_progress(
        &self,
        run_id: uuid::Uuid,
        steps_completed: i32,
        steps_failed: i32,
        total_cost: f64,
        results: &serde_json::Map<String, serde_json::Value>,
        errors: &[RunError],
    ) -> Result<()> {
        runs::update_run(
            self.pool,
            run_id,
            &runs::RunPatch {
                steps_completed: Some(steps_completed),
                steps_failed: Some(steps_failed),
                total_cost: Some(total_cost),
                results: Some(serde_json::Value::Object(results.clone())),
                errors: Some(serde_json::to_value(errors).unwrap_or_default()),
                ..Default::default()
            },
        )
        .await
        .context("failed to persist run progress")?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        campaign: &Campaign,
        run: &CampaignRun,
        status: RunStatus,
        steps_completed: i32,
        steps_failed: i32,
        total_cost: f64,
        results: &serde_json::Map<String, serde_json::Value>,
        errors: &[RunError],
    ) -> Result<()> {
        RunStateMachine::transition(self.pool, run.id, RunStatus::Running, status).await?;

        runs::update_run(
            self.pool,
            run.id,
            &runs::RunPatch {
                steps_completed: Some(steps_completed),
                steps_failed: Some(steps_failed),
                total_cost: Some(total_cost),
                results: Some(serde_json::Value::Object(results.clone())),
                errors: Some(serde_json::to_value(errors).unwrap_or_default()),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .context("failed to persist finalized run")?;

        campaigns::record_run_completion(self.pool, campaign.id, total_cost, Utc::now())
            .await
            .context("failed to update campaign aggregates")?;

        Ok(())
    }
}

/// `step.params.options.projectId = project_id`, unless the step already
/// supplied one.
fn merge_project_id(params: &serde_json::Value, project_id: Option<&str>) -> serde_json::Value {
    let Some(project_id) = project_id else {
        return params.clone();
    };

    let mut merged = if params.is_object() {
        params.clone()
    } else {
        serde_json::json!({})
    };

    let options = merged
        .as_object_mut()
        .expect("coerced to object above")
        .entry("options")
        .or_insert_with(|| serde_json::json!({}));

    if !options.is_object() {
        *options = serde_json::json!({});
    }

    let options_obj = options.as_object_mut().expect("coerced above");
    options_obj.entry("projectId").or_insert_with(|| serde_json::Value::String(project_id.to_owned()));

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_project_id_sets_when_absent() {
        let params = json!({"query": "leads"});
        let merged = merge_project_id(&params, Some("proj-1"));
        assert_eq!(merged["options"]["projectId"], "proj-1");
        assert_eq!(merged["query"], "leads");
    }

    #[test]
    fn merge_project_id_does_not_override_existing() {
        let params = json!({"options": {"projectId": "explicit"}});
        let merged = merge_project_id(&params, Some("proj-1"));
        assert_eq!(merged["options"]["projectId"], "explicit");
    }

    #[test]
    fn merge_project_id_noop_when_campaign_has_none() {
        let params = json!({"query": "leads"});
        let merged = merge_project_id(&params, None);
        assert_eq!(merged, params);
    }

    #[test]
    fn merge_project_id_handles_non_object_params() {
        let params = json!("not an object");
        let merged = merge_project_id(&params, Some("proj-1"));
        assert_eq!(merged["options"]["projectId"], "proj-1");
    }
}
