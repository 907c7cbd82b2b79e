//! Integration tests for the campaign CLI's persistence paths: create,
//! list, pause/resume, and delete against a real PostgreSQL instance. Each
//! test creates an isolated temporary database and drops it on completion.

use serde_json::json;
use uuid::Uuid;

use campaignd_db::models::CampaignStatus;
use campaignd_db::queries::campaigns::{self, CampaignFilters, CampaignPatch, NewCampaign};
use campaignd_test_utils::{create_test_db, drop_test_db};

fn sample_config() -> serde_json::Value {
    json!({
        "steps": [{
            "name": "prospect",
            "engine": "prospecting",
            "endpoint": "https://engines.internal/prospect",
            "method": "POST",
            "params": {},
            "retry": {"attempts": 1, "initial_delay_ms": 1000, "backoff": "exponential"},
            "onSuccess": "continue",
            "onFailure": "abort"
        }]
    })
}

#[tokio::test]
async fn create_campaign_and_verify() {
    let (pool, db_name) = create_test_db().await;

    let new = NewCampaign {
        name: "Q3 Outreach".to_owned(),
        description: Some("test campaign".to_owned()),
        config: sample_config(),
        schedule_cron: None,
        project_id: Some("proj-1".to_owned()),
    };

    let campaign = campaigns::create_campaign(&pool, &new).await.expect("create should succeed");

    assert_eq!(campaign.name, "Q3 Outreach");
    assert_eq!(campaign.status, CampaignStatus::Active);
    assert_eq!(campaign.total_runs, 0);
    assert!(campaign.last_run_at.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_campaigns_filters_by_status_and_project() {
    let (pool, db_name) = create_test_db().await;

    let active = campaigns::create_campaign(
        &pool,
        &NewCampaign {
            name: "Active One".to_owned(),
            description: None,
            config: sample_config(),
            schedule_cron: None,
            project_id: Some("proj-a".to_owned()),
        },
    )
    .await
    .unwrap();

    let other_project = campaigns::create_campaign(
        &pool,
        &NewCampaign {
            name: "Other Project".to_owned(),
            description: None,
            config: sample_config(),
            schedule_cron: None,
            project_id: Some("proj-b".to_owned()),
        },
    )
    .await
    .unwrap();

    campaigns::update_campaign(
        &pool,
        active.id,
        &CampaignPatch {
            status: Some(CampaignStatus::Paused),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let paused = campaigns::list_campaigns(
        &pool,
        &CampaignFilters {
            status: Some(CampaignStatus::Paused),
            project_id: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0].id, active.id);

    let proj_b = campaigns::list_campaigns(
        &pool,
        &CampaignFilters {
            status: None,
            project_id: Some("proj-b".to_owned()),
        },
    )
    .await
    .unwrap();
    assert_eq!(proj_b.len(), 1);
    assert_eq!(proj_b[0].id, other_project.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn pause_then_resume_round_trip() {
    let (pool, db_name) = create_test_db().await;

    let campaign = campaigns::create_campaign(
        &pool,
        &NewCampaign {
            name: "Pausable".to_owned(),
            description: None,
            config: sample_config(),
            schedule_cron: None,
            project_id: None,
        },
    )
    .await
    .unwrap();

    let paused = campaigns::update_campaign(
        &pool,
        campaign.id,
        &CampaignPatch {
            status: Some(CampaignStatus::Paused),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);

    let resumed = campaigns::update_campaign(
        &pool,
        campaign.id,
        &CampaignPatch {
            status: Some(CampaignStatus::Active),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(resumed.status, CampaignStatus::Active);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn delete_campaign_removes_it() {
    let (pool, db_name) = create_test_db().await;

    let campaign = campaigns::create_campaign(
        &pool,
        &NewCampaign {
            name: "Disposable".to_owned(),
            description: None,
            config: sample_config(),
            schedule_cron: None,
            project_id: None,
        },
    )
    .await
    .unwrap();

    campaigns::delete_campaign(&pool, campaign.id).await.expect("delete should succeed");

    let found = campaigns::get_campaign(&pool, campaign.id).await.unwrap();
    assert!(found.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn update_nonexistent_campaign_fails() {
    let (pool, db_name) = create_test_db().await;

    let fake_id = Uuid::new_v4();
    let result = campaigns::update_campaign(
        &pool,
        fake_id,
        &CampaignPatch {
            status: Some(CampaignStatus::Paused),
            ..Default::default()
        },
    )
    .await;

    assert!(result.is_err());
    let err_msg = result.unwrap_err().to_string();
    assert!(err_msg.contains("not found"), "expected not found error, got: {err_msg}");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[test]
fn parse_invalid_config_document_gives_error() {
    let result: Result<campaignd_db::models::CampaignConfig, _> = serde_json::from_str("this is not json {{{");
    assert!(result.is_err());
}
