//! Database query functions for the `campaign_runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CampaignRun, RunStatus, TriggerType};

/// Create a fresh `running` run record with zero counters.
///
/// The Runner treats failure to persist this as fatal to the run (see the
/// Persistence Gateway's failure semantics): the caller should abort before
/// dispatching any steps if this returns an error.
pub async fn create_run(
    pool: &PgPool,
    campaign_id: Uuid,
    trigger_type: TriggerType,
) -> Result<CampaignRun> {
    let run = sqlx::query_as::<_, CampaignRun>(
        "INSERT INTO campaign_runs (campaign_id, status, trigger_type) \
         VALUES ($1, 'running', $2) \
         RETURNING *",
    )
    .bind(campaign_id)
    .bind(trigger_type)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to create run for campaign {campaign_id}"))?;

    Ok(run)
}

/// Fields patched onto a run as it progresses through the step loop and at
/// finalization. `None` leaves the column unchanged.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub steps_completed: Option<i32>,
    pub steps_failed: Option<i32>,
    pub total_cost: Option<f64>,
    pub results: Option<serde_json::Value>,
    pub errors: Option<serde_json::Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Apply a partial update to a run.
pub async fn update_run(pool: &PgPool, id: Uuid, patch: &RunPatch) -> Result<CampaignRun> {
    let run = sqlx::query_as::<_, CampaignRun>(
        "UPDATE campaign_runs SET \
            status = COALESCE($2, status), \
            steps_completed = COALESCE($3, steps_completed), \
            steps_failed = COALESCE($4, steps_failed), \
            total_cost = COALESCE($5, total_cost), \
            results = COALESCE($6, results), \
            errors = COALESCE($7, errors), \
            completed_at = COALESCE($8, completed_at) \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .bind(patch.status.map(|s| s.to_string()))
    .bind(patch.steps_completed)
    .bind(patch.steps_failed)
    .bind(patch.total_cost)
    .bind(&patch.results)
    .bind(&patch.errors)
    .bind(patch.completed_at)
    .fetch_optional(pool)
    .await
    .context("failed to update run")?;

    run.ok_or_else(|| anyhow::anyhow!("run {id} not found"))
}

/// Transition a run's status with an optimistic lock on the current
/// status. Returns the number of rows affected: `0` means either the run
/// doesn't exist or `from` didn't match the stored status.
pub async fn transition_run_status(
    pool: &PgPool,
    id: Uuid,
    from: RunStatus,
    to: RunStatus,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE campaign_runs SET \
            status = $3, \
            completed_at = COALESCE($4, completed_at) \
         WHERE id = $1 AND status = $2",
    )
    .bind(id)
    .bind(from.to_string())
    .bind(to.to_string())
    .bind(completed_at)
    .execute(pool)
    .await
    .with_context(|| format!("failed to transition run {id} from {from} to {to}"))?;

    Ok(result.rows_affected())
}

/// Fetch a run by its UUID.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<CampaignRun>> {
    let run = sqlx::query_as::<_, CampaignRun>("SELECT * FROM campaign_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;

    Ok(run)
}

/// List the most recent runs for a campaign, newest first.
pub async fn list_runs(pool: &PgPool, campaign_id: Uuid, limit: i64) -> Result<Vec<CampaignRun>> {
    let runs = sqlx::query_as::<_, CampaignRun>(
        "SELECT * FROM campaign_runs \
         WHERE campaign_id = $1 \
         ORDER BY started_at DESC \
         LIMIT $2",
    )
    .bind(campaign_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list runs for campaign {campaign_id}"))?;

    Ok(runs)
}

/// Whether any run of `campaign_id` currently has `status = 'running'`
/// (supports invariant 5, the single-flight property, as a sanity check
/// independent of the scheduler's own in-memory lock).
pub async fn has_running_run(pool: &PgPool, campaign_id: Uuid) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        "SELECT EXISTS(SELECT 1 FROM campaign_runs WHERE campaign_id = $1 AND status = 'running')",
    )
    .bind(campaign_id)
    .fetch_one(pool)
    .await
    .context("failed to check for an in-flight run")?;

    Ok(row.0)
}

/// Mark runs stuck in `running` older than `threshold` as `failed` with a
/// synthetic recovery error. Intended to run once at orchestrator startup
/// to clean up after a crash mid-run.
///
/// Returns the number of runs recovered.
pub async fn recover_orphaned_runs(pool: &PgPool, threshold: chrono::Duration) -> Result<u64> {
    let cutoff = Utc::now() - threshold;

    let result = sqlx::query(
        "UPDATE campaign_runs SET \
            status = 'failed', \
            completed_at = now(), \
            errors = errors || jsonb_build_array( \
                jsonb_build_object( \
                    'step', 'recovery', \
                    'error', 'orphaned by process restart', \
                    'at', now() \
                ) \
            ) \
         WHERE status = 'running' AND started_at < $1",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to recover orphaned runs")?;

    Ok(result.rows_affected())
}
