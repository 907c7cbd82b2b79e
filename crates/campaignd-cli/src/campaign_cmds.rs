//! `campaignd campaign` subcommands: create, list, show, pause, resume,
//! delete, and run-to-completion.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use campaignd_core::notify::Notifier;
use campaignd_core::runner::CampaignRunner;
use campaignd_core::validate::validate_campaign_config;
use campaignd_db::models::{CampaignConfig, CampaignStatus, RunStatus, TriggerType};
use campaignd_db::queries::campaigns::{self, CampaignFilters, CampaignPatch, NewCampaign};
use campaignd_db::queries::runs;

/// `campaignd campaign create <config-file> --name ... [--description ...] [--project-id ...]`
pub async fn run_create(
    pool: &PgPool,
    config_path: &Path,
    name: &str,
    description: Option<&str>,
    project_id: Option<&str>,
) -> Result<()> {
    let raw = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read campaign config at {}", config_path.display()))?;
    let config: CampaignConfig = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a valid campaign config document", config_path.display()))?;

    validate_campaign_config(&config, name).map_err(|e| anyhow::anyhow!("{e}"))?;

    let schedule_cron = config.schedule.as_ref().map(|s| s.cron.clone());
    let config_value = serde_json::to_value(&config).context("failed to serialize campaign config")?;

    let new = NewCampaign {
        name: name.to_owned(),
        description: description.map(str::to_owned),
        config: config_value,
        schedule_cron,
        project_id: project_id.map(str::to_owned),
    };

    let campaign = campaigns::create_campaign(pool, &new).await?;
    println!("Created campaign: {} ({})", campaign.name, campaign.id);
    if campaign.schedule_cron.is_some() {
        println!("  Scheduled (takes effect the next time `campaignd serve` starts).");
    }

    Ok(())
}

/// `campaignd campaign list [--status ...] [--project-id ...]`
pub async fn run_list(pool: &PgPool, status: Option<&str>, project_id: Option<&str>) -> Result<()> {
    let filters = CampaignFilters {
        status: status.map(str::parse).transpose().map_err(|e| anyhow::anyhow!("{e}"))?,
        project_id: project_id.map(str::to_owned),
    };

    let campaigns = campaigns::list_campaigns(pool, &filters).await?;

    if campaigns.is_empty() {
        println!("No campaigns found.");
        return Ok(());
    }

    println!("{:<38} {:<30} {:<10} {:>8} {:>12}", "ID", "NAME", "STATUS", "RUNS", "COST");
    println!("{}", "-".repeat(100));

    for campaign in &campaigns {
        let name_display = if campaign.name.len() > 28 {
            format!("{}...", &campaign.name[..25])
        } else {
            campaign.name.clone()
        };
        println!(
            "{:<38} {:<30} {:<10} {:>8} {:>12.2}",
            campaign.id, name_display, campaign.status, campaign.total_runs, campaign.total_cost
        );
    }

    Ok(())
}

/// `campaignd campaign show <id>`
pub async fn run_show(pool: &PgPool, campaign_id_str: &str) -> Result<()> {
    let campaign_id = Uuid::parse_str(campaign_id_str).with_context(|| format!("invalid campaign ID: {campaign_id_str}"))?;

    let campaign = campaigns::get_campaign(pool, campaign_id)
        .await?
        .with_context(|| format!("campaign {campaign_id} not found"))?;

    println!("Campaign: {} ({})", campaign.name, campaign.id);
    println!("Status: {}", campaign.status);
    if let Some(description) = &campaign.description {
        println!("Description: {description}");
    }
    if let Some(project_id) = &campaign.project_id {
        println!("Project: {project_id}");
    }
    if let Some(cron) = &campaign.schedule_cron {
        println!("Schedule: {cron}");
    }
    if let Some(last_run_at) = campaign.last_run_at {
        println!("Last run: {}", last_run_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("Total runs: {}", campaign.total_runs);
    println!("Total cost: {:.2}", campaign.total_cost);
    println!();

    match campaign.parsed_config() {
        Ok(config) => {
            println!("Steps:");
            for step in &config.steps {
                println!("  - {} ({}, {} {})", step.name, step.engine, step.method, step.endpoint);
            }
        }
        Err(err) => println!("Config could not be parsed: {err}"),
    }
    println!();

    let recent = runs::list_runs(pool, campaign_id, 10).await?;
    println!("Recent runs:");
    for run in &recent {
        let icon = run_status_icon(run.status);
        println!(
            "  [{}] {} started {} ({} ok, {} failed, {:.2} cost)",
            icon,
            run.status,
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            run.steps_completed,
            run.steps_failed,
            run.total_cost,
        );
    }

    Ok(())
}

fn run_status_icon(status: RunStatus) -> char {
    match status {
        RunStatus::Running => '*',
        RunStatus::Completed => '+',
        RunStatus::Partial => '~',
        RunStatus::Failed => '!',
        RunStatus::Aborted => 'X',
    }
}

/// `campaignd campaign pause <id>`
pub async fn run_pause(pool: &PgPool, campaign_id_str: &str) -> Result<()> {
    let campaign_id = Uuid::parse_str(campaign_id_str).with_context(|| format!("invalid campaign ID: {campaign_id_str}"))?;

    campaigns::update_campaign(
        pool,
        campaign_id,
        &CampaignPatch {
            status: Some(CampaignStatus::Paused),
            ..Default::default()
        },
    )
    .await?;

    println!("Paused campaign {campaign_id}.");
    println!("  Takes effect immediately if `campaignd serve` is running; otherwise on its next restart.");
    Ok(())
}

/// `campaignd campaign resume <id>`
pub async fn run_resume(pool: &PgPool, campaign_id_str: &str) -> Result<()> {
    let campaign_id = Uuid::parse_str(campaign_id_str).with_context(|| format!("invalid campaign ID: {campaign_id_str}"))?;

    campaigns::update_campaign(
        pool,
        campaign_id,
        &CampaignPatch {
            status: Some(CampaignStatus::Active),
            ..Default::default()
        },
    )
    .await?;

    println!("Resumed campaign {campaign_id}.");
    println!("  Takes effect immediately if `campaignd serve` is running; otherwise on its next restart.");
    Ok(())
}

/// `campaignd campaign delete <id>`
pub async fn run_delete(pool: &PgPool, campaign_id_str: &str) -> Result<()> {
    let campaign_id = Uuid::parse_str(campaign_id_str).with_context(|| format!("invalid campaign ID: {campaign_id_str}"))?;

    campaigns::delete_campaign(pool, campaign_id).await?;
    println!("Deleted campaign {campaign_id}.");
    Ok(())
}

/// `campaignd campaign run <id>`: run a campaign to completion synchronously
/// and print its outcome. Exits non-zero when the run did not complete
/// cleanly, for use in scripts.
pub async fn run_trigger(
    pool: &PgPool,
    client: Arc<reqwest::Client>,
    notifier: &Notifier,
    timezone: chrono_tz::Tz,
    campaign_id_str: &str,
) -> Result<()> {
    let campaign_id = Uuid::parse_str(campaign_id_str).with_context(|| format!("invalid campaign ID: {campaign_id_str}"))?;

    let campaign = campaigns::get_campaign(pool, campaign_id)
        .await?
        .with_context(|| format!("campaign {campaign_id} not found"))?;

    println!("Running campaign: {} ({})", campaign.name, campaign.id);

    let runner = CampaignRunner::new(pool, client, notifier, timezone);
    match runner.run_campaign(&campaign, TriggerType::Manual).await {
        Ok(run) => {
            println!();
            match run.status {
                RunStatus::Completed => {
                    println!("Run completed: {}/{} steps ok, cost {:.2}.", run.steps_completed, run.steps_completed + run.steps_failed, run.total_cost);
                }
                RunStatus::Partial => {
                    println!(
                        "Run completed partially: {} ok, {} failed, cost {:.2}.",
                        run.steps_completed, run.steps_failed, run.total_cost
                    );
                    std::process::exit(1);
                }
                RunStatus::Failed | RunStatus::Aborted | RunStatus::Running => {
                    println!("Run ended in status {}.", run.status);
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Err(err) => {
            println!();
            println!("Run aborted: {err}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_icons_are_distinct() {
        let icons: Vec<char> = [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Partial,
            RunStatus::Failed,
            RunStatus::Aborted,
        ]
        .into_iter()
        .map(run_status_icon)
        .collect();
        let unique: std::collections::HashSet<_> = icons.iter().collect();
        assert_eq!(unique.len(), icons.len());
    }

    #[test]
    fn parse_valid_campaign_uuid() {
        let id = "550e8400-e29b-41d4-a716-446655440000";
        let parsed: Uuid = id.parse().unwrap();
        assert_eq!(parsed.to_string(), id);
    }
}
