//! Cron Scheduler: owns the set of active schedules and fires the Campaign
//! Runner on schedule, with single-flight discipline per campaign.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use chrono_tz::Tz;
use dashmap::DashMap;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use campaignd_db::models::{Campaign, TriggerType};
use campaignd_db::queries::campaigns::{self, CampaignPatch};

use crate::notify::Notifier;
use crate::runner::CampaignRunner;
use crate::validate::{normalize_cron_expr, validate_schedule_config};

/// A per-campaign recurring schedule, registered with the underlying job
/// scheduler and guarded by a single-flight lock.
struct ScheduledCampaign {
    job_id: Uuid,
    lock: Arc<Mutex<()>>,
}

/// Owns the mapping from campaign id to its active scheduled job.
pub struct CronScheduler {
    inner: JobScheduler,
    scheduled: DashMap<Uuid, ScheduledCampaign>,
    pool: Arc<PgPool>,
    client: Arc<reqwest::Client>,
    notifier: Arc<Notifier>,
}

impl CronScheduler {
    pub async fn new(pool: Arc<PgPool>, client: Arc<reqwest::Client>, notifier: Arc<Notifier>) -> Result<Self> {
        let inner = JobScheduler::new().await.context("failed to start job scheduler")?;
        inner.start().await.context("failed to start job scheduler event loop")?;

        Ok(Self {
            inner,
            scheduled: DashMap::new(),
            pool,
            client,
            notifier,
        })
    }

    /// Schedule a campaign. Validates `schedule.cron`, stops any existing
    /// task for the campaign first, then registers a recurring trigger in
    /// the schedule's own timezone.
    pub async fn schedule(&self, campaign: Campaign) -> Result<()> {
        let config = campaign.parsed_config().context("malformed campaign config")?;
        let schedule = config
            .schedule
            .as_ref()
            .context("campaign has no schedule configured")?;

        validate_schedule_config(schedule).context("invalid schedule config")?;

        if !schedule.enabled {
            bail!("campaign {} schedule is not enabled", campaign.id);
        }

        let tz = Tz::from_str(&schedule.timezone).unwrap_or(Tz::UTC);

        if self.scheduled.contains_key(&campaign.id) {
            self.unschedule(campaign.id).await?;
        }

        let lock = Arc::new(Mutex::new(()));
        let lock_for_job = Arc::clone(&lock);
        let pool = Arc::clone(&self.pool);
        let client = Arc::clone(&self.client);
        let notifier = Arc::clone(&self.notifier);
        let tz_for_job = tz;
        let campaign_for_job = campaign.clone();

        let normalized_cron = normalize_cron_expr(&schedule.cron);

        let job = Job::new_async_tz(normalized_cron.as_str(), tz_for_job, move |_uuid, _lock| {
            let lock = Arc::clone(&lock_for_job);
            let pool = Arc::clone(&pool);
            let client = Arc::clone(&client);
            let notifier = Arc::clone(&notifier);
            let campaign = campaign_for_job.clone();

            Box::pin(async move {
                let Ok(guard) = lock.try_lock() else {
                    warn!(campaign_id = %campaign.id, "previous firing still running, skipping this one");
                    return;
                };

                info!(campaign_id = %campaign.id, "scheduled firing starting");
                let runner = CampaignRunner::new(&pool, Arc::clone(&client), &notifier, tz_for_job);
                if let Err(err) = runner.run_campaign(&campaign, TriggerType::Scheduled).await {
                    warn!(campaign_id = %campaign.id, error = %err, "scheduled run ended with an error");
                }
                drop(guard);
            })
        })
        .with_context(|| format!("invalid cron expression {:?}", schedule.cron))?;

        let job_id = self
            .inner
            .add(job)
            .await
            .with_context(|| format!("failed to register schedule for campaign {}", campaign.id))?;

        self.scheduled.insert(campaign.id, ScheduledCampaign { job_id, lock });

        if let Some(next_run_at) = upcoming_run(&normalized_cron, tz) {
            if let Err(err) = campaigns::update_campaign(
                &self.pool,
                campaign.id,
                &CampaignPatch {
                    next_run_at: Some(next_run_at),
                    ..Default::default()
                },
            )
            .await
            {
                warn!(campaign_id = %campaign.id, error = %err, "failed to persist next_run_at");
            }
        }

        info!(campaign_id = %campaign.id, cron = %schedule.cron, timezone = %schedule.timezone, "campaign scheduled");
        Ok(())
    }

    /// Stop and remove the task for `campaign_id` if present.
    pub async fn unschedule(&self, campaign_id: Uuid) -> Result<()> {
        if let Some((_, entry)) = self.scheduled.remove(&campaign_id) {
            self.inner
                .remove(&entry.job_id)
                .await
                .with_context(|| format!("failed to unschedule campaign {campaign_id}"))?;
            info!(campaign_id = %campaign_id, "campaign unscheduled");
        }
        Ok(())
    }

    /// Unschedule then schedule again, picking up any config changes.
    pub async fn reschedule(&self, campaign: Campaign) -> Result<()> {
        self.unschedule(campaign.id).await?;
        self.schedule(campaign).await
    }

    /// Schedule every campaign that is `active` and has a schedule
    /// configured. Individual failures are logged, not propagated.
    pub async fn schedule_all(&self, campaigns: Vec<Campaign>) {
        for campaign in campaigns {
            let has_schedule = campaign
                .parsed_config()
                .ok()
                .and_then(|c| c.schedule)
                .map(|s| s.enabled)
                .unwrap_or(false);

            if !has_schedule {
                continue;
            }

            let campaign_id = campaign.id;
            if let Err(err) = self.schedule(campaign).await {
                warn!(campaign_id = %campaign_id, error = %err, "failed to schedule campaign at startup");
            }
        }
    }

    /// Stop every active task and clear the map.
    pub async fn stop_all(&self) -> Result<()> {
        let ids: Vec<Uuid> = self.scheduled.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.unschedule(id).await?;
        }
        Ok(())
    }

    /// Snapshot of currently scheduled campaign ids.
    pub fn active_tasks(&self) -> Vec<Uuid> {
        self.scheduled.iter().map(|e| *e.key()).collect()
    }
}

/// The next time a normalized (6-field) cron expression fires in `tz`,
/// expressed in UTC. `None` if the expression fails to parse (it was
/// already validated before scheduling, so this should not happen in
/// practice) or has no upcoming occurrence.
fn upcoming_run(normalized_cron: &str, tz: Tz) -> Option<chrono::DateTime<Utc>> {
    let schedule = cron::Schedule::from_str(normalized_cron).ok()?;
    schedule.upcoming(tz).next().map(|dt| dt.with_timezone(&Utc))
}

/// Trigger a one-off manual run, bypassing the scheduler's registration
/// but still occupying its campaign's single-flight slot is explicitly not
/// enforced here -- manual triggers bypass the gate per the concurrency
/// model.
pub async fn trigger_manual_run(
    pool: &PgPool,
    client: Arc<reqwest::Client>,
    notifier: &Notifier,
    timezone: Tz,
    campaign_id: Uuid,
) -> Result<()> {
    let campaign = campaigns::get_campaign(pool, campaign_id)
        .await?
        .with_context(|| format!("campaign {campaign_id} not found"))?;

    let runner = CampaignRunner::new(pool, client, notifier, timezone);
    runner.run_campaign(&campaign, TriggerType::Manual).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(Tz::from_str("not-a-real-zone").unwrap_or(Tz::UTC), Tz::UTC);
    }

    #[test]
    fn known_timezone_parses() {
        assert_eq!(Tz::from_str("America/New_York").unwrap(), chrono_tz::America::New_York);
    }

    #[test]
    fn upcoming_run_finds_a_future_fire_time() {
        let next = upcoming_run("0 */1 * * * *", Tz::UTC);
        assert!(next.is_some());
        assert!(next.unwrap() > chrono::Utc::now());
    }

    #[test]
    fn upcoming_run_none_for_unparseable_expression() {
        assert!(upcoming_run("not a cron expression", Tz::UTC).is_none());
    }
}
