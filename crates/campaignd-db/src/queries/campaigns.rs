//! Database query functions for the `campaigns` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Campaign, CampaignStatus};

/// Filters accepted by [`list_campaigns`].
#[derive(Debug, Clone, Default)]
pub struct CampaignFilters {
    pub status: Option<CampaignStatus>,
    pub project_id: Option<String>,
}

/// Parameters for inserting a new campaign.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub name: String,
    pub description: Option<String>,
    pub config: serde_json::Value,
    pub schedule_cron: Option<String>,
    pub project_id: Option<String>,
}

/// Fields that may be patched on an existing campaign. `None` leaves the
/// column unchanged.
#[derive(Debug, Clone, Default)]
pub struct CampaignPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Option<serde_json::Value>,
    pub schedule_cron: Option<String>,
    pub status: Option<CampaignStatus>,
    pub next_run_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Insert a new campaign row. Returns the inserted row with server-generated
/// defaults (id, status=active, created_at, updated_at).
pub async fn create_campaign(pool: &PgPool, new: &NewCampaign) -> Result<Campaign> {
    let campaign = sqlx::query_as::<_, Campaign>(
        "INSERT INTO campaigns (name, description, config, schedule_cron, project_id) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(&new.name)
    .bind(&new.description)
    .bind(&new.config)
    .bind(&new.schedule_cron)
    .bind(&new.project_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert campaign {:?}", new.name))?;

    Ok(campaign)
}

/// Fetch a campaign by its UUID.
pub async fn get_campaign(pool: &PgPool, id: Uuid) -> Result<Option<Campaign>> {
    let campaign = sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch campaign")?;

    Ok(campaign)
}

/// List campaigns matching the given filters, newest first.
pub async fn list_campaigns(pool: &PgPool, filters: &CampaignFilters) -> Result<Vec<Campaign>> {
    let campaigns = sqlx::query_as::<_, Campaign>(
        "SELECT * FROM campaigns \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR project_id = $2) \
         ORDER BY created_at DESC",
    )
    .bind(filters.status.map(|s| s.to_string()))
    .bind(&filters.project_id)
    .fetch_all(pool)
    .await
    .context("failed to list campaigns")?;

    Ok(campaigns)
}

/// List every campaign currently in `active` status (used by the scheduler
/// at startup and by `schedule_all`).
pub async fn list_active_campaigns(pool: &PgPool) -> Result<Vec<Campaign>> {
    let campaigns = sqlx::query_as::<_, Campaign>(
        "SELECT * FROM campaigns WHERE status = 'active' ORDER BY created_at",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active campaigns")?;

    Ok(campaigns)
}

/// Apply a partial update to a campaign. Returns the updated row.
///
/// Distinguishes "not found" from a no-op patch by checking for the row
/// first, matching the not-found-vs-wrong-status idiom used for run status
/// transitions.
pub async fn update_campaign(pool: &PgPool, id: Uuid, patch: &CampaignPatch) -> Result<Campaign> {
    let campaign = sqlx::query_as::<_, Campaign>(
        "UPDATE campaigns SET \
            name = COALESCE($2, name), \
            description = COALESCE($3, description), \
            config = COALESCE($4, config), \
            schedule_cron = COALESCE($5, schedule_cron), \
            status = COALESCE($6, status), \
            next_run_at = COALESCE($7, next_run_at), \
            updated_at = now() \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .bind(&patch.name)
    .bind(&patch.description)
    .bind(&patch.config)
    .bind(&patch.schedule_cron)
    .bind(patch.status.map(|s| s.to_string()))
    .bind(patch.next_run_at)
    .fetch_optional(pool)
    .await
    .context("failed to update campaign")?;

    campaign.ok_or_else(|| anyhow::anyhow!("campaign {id} not found"))
}

/// Record the outcome of a completed run on the owning campaign's
/// aggregates: `last_run_at`, `total_runs += 1`, `total_cost += run_cost`.
///
/// This is an eventually-consistent counter update, not a transaction
/// spanning the run row -- see the Persistence Gateway's guarantees.
pub async fn record_run_completion(
    pool: &PgPool,
    campaign_id: Uuid,
    run_cost: f64,
    completed_at: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE campaigns SET \
            last_run_at = $2, \
            total_runs = total_runs + 1, \
            total_cost = total_cost + $3, \
            updated_at = now() \
         WHERE id = $1",
    )
    .bind(campaign_id)
    .bind(completed_at)
    .bind(run_cost)
    .execute(pool)
    .await
    .context("failed to record run completion on campaign aggregates")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("campaign {campaign_id} not found");
    }

    Ok(())
}

/// Delete a campaign. Cascades to its runs via the FK constraint.
pub async fn delete_campaign(pool: &PgPool, id: Uuid) -> Result<()> {
    let result = sqlx::query("DELETE FROM campaigns WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete campaign")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("campaign {id} not found");
    }

    Ok(())
}

/// Sum of `total_cost` over runs of `campaign_id` whose `started_at` falls
/// within `[start, end)`. Returns `0.0` when no runs match.
pub async fn get_spending(
    pool: &PgPool,
    campaign_id: Uuid,
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
) -> Result<f64> {
    let spend: (f64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(total_cost), 0.0) FROM campaign_runs \
         WHERE campaign_id = $1 AND started_at >= $2 AND started_at < $3",
    )
    .bind(campaign_id)
    .bind(start)
    .bind(end)
    .fetch_one(pool)
    .await
    .context("failed to compute campaign spending")?;

    Ok(spend.0)
}
