//! Management API: the HTTP surface over the Campaign Runner, Cron
//! Scheduler, and Persistence Gateway.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use campaignd_core::lifecycle::shutdown_signal;
use campaignd_core::notify::Notifier;
use campaignd_core::scheduler::{CronScheduler, trigger_manual_run};
use campaignd_core::validate::validate_campaign_config;
use campaignd_db::models::{Campaign, CampaignStatus};
use campaignd_db::queries::campaigns::{self, CampaignFilters, CampaignPatch, NewCampaign};
use campaignd_db::queries::runs;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({ "success": false, "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

/// Wrap a JSON object or array in the `{success: true, ...}` envelope.
/// Objects get `success` inserted alongside their existing fields; anything
/// else (arrays, scalars) is nested under `data`.
fn ok(value: Value) -> Json<Value> {
    let mut obj = match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_owned(), other);
            map
        }
    };
    obj.insert("success".to_owned(), Value::Bool(true));
    Json(Value::Object(obj))
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub client: Arc<reqwest::Client>,
    pub scheduler: Arc<CronScheduler>,
    pub notifier: Arc<Notifier>,
    pub timezone: Tz,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/campaigns", post(create_campaign).get(list_campaigns))
        .route("/api/campaigns/{id}", get(get_campaign).delete(delete_campaign))
        .route("/api/campaigns/{id}/run", post(run_campaign))
        .route("/api/campaigns/{id}/runs", get(list_runs))
        .route("/api/campaigns/{id}/pause", put(pause_campaign))
        .route("/api/campaigns/{id}/resume", put(resume_campaign))
        .route("/api/health", get(health))
        .route("/api/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let scheduler = Arc::clone(&state.scheduler);
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("campaignd serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;
    tracing::info!("campaignd serve shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub description: Option<String>,
    pub project_id: Option<String>,
    pub config: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct CampaignListQuery {
    pub status: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn create_campaign(
    State(state): State<AppState>,
    Json(req): Json<CreateCampaignRequest>,
) -> Result<axum::response::Response, AppError> {
    let parsed_config = serde_json::from_value(req.config.clone())
        .map_err(|e| AppError::bad_request(format!("config: {e}")))?;
    validate_campaign_config(&parsed_config, &req.name).map_err(|e| AppError::bad_request(e.to_string()))?;

    let schedule_cron = parsed_config.schedule.as_ref().map(|s| s.cron.clone());

    let campaign = campaigns::create_campaign(
        &state.pool,
        &NewCampaign {
            name: req.name,
            description: req.description,
            config: req.config,
            schedule_cron,
            project_id: req.project_id,
        },
    )
    .await
    .map_err(AppError::internal)?;

    if let Some(schedule) = &parsed_config.schedule {
        if schedule.enabled {
            if let Err(err) = state.scheduler.schedule(campaign.clone()).await {
                tracing::warn!(campaign_id = %campaign.id, error = %err, "failed to schedule newly created campaign");
            }
        }
    }

    let body = serde_json::to_value(&campaign).map_err(|e| AppError::internal(e.into()))?;
    Ok((StatusCode::CREATED, ok(body)).into_response())
}

async fn list_campaigns(
    State(state): State<AppState>,
    Query(query): Query<CampaignListQuery>,
) -> Result<axum::response::Response, AppError> {
    let status = query
        .status
        .as_deref()
        .map(CampaignStatus::from_str)
        .transpose()
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let filters = CampaignFilters {
        status,
        project_id: query.project_id,
    };

    let campaigns = campaigns::list_campaigns(&state.pool, &filters).await.map_err(AppError::internal)?;
    let body = serde_json::to_value(&campaigns).map_err(|e| AppError::internal(e.into()))?;
    Ok(ok(body).into_response())
}

async fn get_campaign(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<axum::response::Response, AppError> {
    let campaign = fetch_campaign(&state.pool, id).await?;
    let body = serde_json::to_value(&campaign).map_err(|e| AppError::internal(e.into()))?;
    Ok(ok(body).into_response())
}

async fn run_campaign(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<axum::response::Response, AppError> {
    fetch_campaign(&state.pool, id).await?;

    let pool = state.pool.clone();
    let client = Arc::clone(&state.client);
    let notifier = Arc::clone(&state.notifier);
    let timezone = state.timezone;

    tokio::spawn(async move {
        if let Err(err) = trigger_manual_run(&pool, client, &notifier, timezone, id).await {
            tracing::error!(campaign_id = %id, error = %err, "manual run ended with an error");
        }
    });

    Ok(ok(json!({ "triggered": true, "campaign_id": id })).into_response())
}

async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<RunsQuery>,
) -> Result<axum::response::Response, AppError> {
    fetch_campaign(&state.pool, id).await?;

    let limit = query.limit.unwrap_or(20);
    let run_list = runs::list_runs(&state.pool, id, limit).await.map_err(AppError::internal)?;
    let body = serde_json::to_value(&run_list).map_err(|e| AppError::internal(e.into()))?;
    Ok(ok(body).into_response())
}

async fn pause_campaign(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<axum::response::Response, AppError> {
    fetch_campaign(&state.pool, id).await?;

    let campaign = campaigns::update_campaign(
        &state.pool,
        id,
        &CampaignPatch {
            status: Some(CampaignStatus::Paused),
            ..Default::default()
        },
    )
    .await
    .map_err(AppError::internal)?;

    if let Err(err) = state.scheduler.unschedule(id).await {
        tracing::warn!(campaign_id = %id, error = %err, "failed to unschedule paused campaign");
    }

    let body = serde_json::to_value(&campaign).map_err(|e| AppError::internal(e.into()))?;
    Ok(ok(body).into_response())
}

async fn resume_campaign(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<axum::response::Response, AppError> {
    fetch_campaign(&state.pool, id).await?;

    let campaign = campaigns::update_campaign(
        &state.pool,
        id,
        &CampaignPatch {
            status: Some(CampaignStatus::Active),
            ..Default::default()
        },
    )
    .await
    .map_err(AppError::internal)?;

    let has_schedule = campaign
        .parsed_config()
        .ok()
        .and_then(|c| c.schedule)
        .map(|s| s.enabled)
        .unwrap_or(false);

    if has_schedule {
        if let Err(err) = state.scheduler.reschedule(campaign.clone()).await {
            tracing::warn!(campaign_id = %id, error = %err, "failed to reschedule resumed campaign");
        }
    }

    let body = serde_json::to_value(&campaign).map_err(|e| AppError::internal(e.into()))?;
    Ok(ok(body).into_response())
}

async fn delete_campaign(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<axum::response::Response, AppError> {
    fetch_campaign(&state.pool, id).await?;

    if let Err(err) = state.scheduler.unschedule(id).await {
        tracing::warn!(campaign_id = %id, error = %err, "failed to unschedule campaign before delete");
    }

    campaigns::delete_campaign(&state.pool, id).await.map_err(AppError::internal)?;

    Ok(ok(json!({ "deleted": true, "campaign_id": id })).into_response())
}

async fn health(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let active_scheduled = state.scheduler.active_tasks().len();
    Ok(ok(json!({
        "status": "ok",
        "active_scheduled": active_scheduled,
    }))
    .into_response())
}

async fn stats(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let all = campaigns::list_campaigns(&state.pool, &CampaignFilters::default())
        .await
        .map_err(AppError::internal)?;

    let total_campaigns = all.len();
    let active_campaigns = all.iter().filter(|c| c.status == CampaignStatus::Active).count();
    let paused_campaigns = all.iter().filter(|c| c.status == CampaignStatus::Paused).count();
    let archived_campaigns = all.iter().filter(|c| c.status == CampaignStatus::Archived).count();
    let total_runs: i64 = all.iter().map(|c| c.total_runs).sum();
    let total_cost: f64 = all.iter().map(|c| c.total_cost).sum();

    Ok(ok(json!({
        "total_campaigns": total_campaigns,
        "active_campaigns": active_campaigns,
        "paused_campaigns": paused_campaigns,
        "archived_campaigns": archived_campaigns,
        "total_runs": total_runs,
        "total_cost": total_cost,
    }))
    .into_response())
}

async fn fetch_campaign(pool: &PgPool, id: Uuid) -> Result<Campaign, AppError> {
    campaigns::get_campaign(pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("campaign {id} not found")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use campaignd_core::notify::Notifier;
    use campaignd_test_utils::{create_test_db, drop_test_db};
    use tower::ServiceExt;

    async fn test_state(pool: PgPool) -> AppState {
        AppState {
            pool,
            client: Arc::new(reqwest::Client::new()),
            scheduler: Arc::new(
                CronScheduler::new(
                    Arc::new(PgPool::connect_lazy("postgresql://localhost/irrelevant").unwrap()),
                    Arc::new(reqwest::Client::new()),
                    Arc::new(Notifier::new(None)),
                )
                .await
                .unwrap(),
            ),
            notifier: Arc::new(Notifier::new(None)),
            timezone: Tz::UTC,
        }
    }

    async fn send(state: AppState, method: &str, uri: &str, body: Option<Value>) -> axum::response::Response {
        let app = build_router(state);
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        app.oneshot(builder.body(body).unwrap()).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn sample_config() -> Value {
        json!({
            "steps": [{
                "name": "prospect",
                "engine": "prospecting",
                "endpoint": "https://engines.internal/prospect",
                "method": "POST",
                "params": {},
                "onSuccess": "continue",
                "onFailure": "abort",
                "retry": {"attempts": 1, "initial_delay_ms": 1000, "backoff": "constant"},
            }]
        })
    }

    #[tokio::test]
    async fn create_list_get_campaign_round_trip() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let create_body = json!({"name": "My Campaign", "config": sample_config()});
        let resp = send(state.clone(), "POST", "/api/campaigns", Some(create_body)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["success"], true);
        assert_eq!(created["name"], "My Campaign");
        let id = created["id"].as_str().unwrap().to_owned();

        let resp = send(state.clone(), "GET", "/api/campaigns", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let listed = body_json(resp).await;
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);

        let resp = send(state.clone(), "GET", &format!("/api/campaigns/{id}"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let fetched = body_json(resp).await;
        assert_eq!(fetched["id"], id);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn create_campaign_rejects_invalid_config() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let create_body = json!({"name": "Bad Campaign", "config": {"steps": []}});
        let resp = send(state, "POST", "/api/campaigns", Some(create_body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_missing_campaign_is_404() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let resp = send(state, "GET", &format!("/api/campaigns/{}", Uuid::new_v4()), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn pause_then_resume_round_trip() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let create_body = json!({"name": "Pausable", "config": sample_config()});
        let resp = send(state.clone(), "POST", "/api/campaigns", Some(create_body)).await;
        let created = body_json(resp).await;
        let id = created["id"].as_str().unwrap().to_owned();

        let resp = send(state.clone(), "PUT", &format!("/api/campaigns/{id}/pause"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let paused = body_json(resp).await;
        assert_eq!(paused["status"], "paused");

        let resp = send(state.clone(), "PUT", &format!("/api/campaigns/{id}/resume"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resumed = body_json(resp).await;
        assert_eq!(resumed["status"], "active");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn delete_removes_campaign() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let create_body = json!({"name": "Deletable", "config": sample_config()});
        let resp = send(state.clone(), "POST", "/api/campaigns", Some(create_body)).await;
        let created = body_json(resp).await;
        let id = created["id"].as_str().unwrap().to_owned();

        let resp = send(state.clone(), "DELETE", &format!("/api/campaigns/{id}"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(state, "GET", &format!("/api/campaigns/{id}"), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn health_reports_active_scheduled_count() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let resp = send(state, "GET", "/api/health", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_scheduled"], 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn stats_reports_zero_for_empty_db() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let resp = send(state, "GET", "/api/stats", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["total_campaigns"], 0);
        assert_eq!(body["total_runs"], 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
