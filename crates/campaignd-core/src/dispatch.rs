//! Step Dispatcher: calls the remote engine for one step and normalizes its
//! response. Knows nothing about budgets or persistence.

use std::sync::Arc;
use std::time::Duration;

use campaignd_db::models::Engine;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::retry::Retryable;

/// Everything that can go wrong calling an engine.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transport error calling {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("engine at {endpoint} returned {status} {status_text}: {body_snippet}")]
    EngineStatus {
        endpoint: String,
        status: u16,
        status_text: String,
        body_snippet: String,
    },
    #[error("call to {endpoint} timed out after {elapsed:?}")]
    Timeout { endpoint: String, elapsed: Duration },
    #[error("polling {endpoint} failed: {source}")]
    PollFailed {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("polling {endpoint} exceeded its wall-time bound of {bound:?}")]
    PollTimeout { endpoint: String, bound: Duration },
    #[error("could not parse response from {endpoint} as JSON: {source}")]
    InvalidResponse {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("engine at {endpoint} reported job failure: {message}")]
    JobFailed { endpoint: String, message: String },
}

impl Retryable for DispatchError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::PollFailed { .. } | Self::PollTimeout { .. } => true,
            Self::EngineStatus { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::InvalidResponse { .. } | Self::JobFailed { .. } => false,
        }
    }
}

/// Truncate a string to at most `max_bytes` bytes, appending "..." if
/// truncated.
fn truncate_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}

/// The default hard timeout for a step that doesn't set one explicitly.
pub fn default_timeout_for_engine(engine: Engine) -> Duration {
    match engine {
        Engine::Prospecting | Engine::Outreach => Duration::from_secs(5 * 60),
        Engine::Analysis | Engine::Sender => Duration::from_secs(10 * 60),
    }
}

fn poll_interval_for_engine(engine: Engine) -> Duration {
    match engine {
        Engine::Prospecting => Duration::from_secs(5),
        Engine::Analysis | Engine::Outreach | Engine::Sender => Duration::from_secs(10),
    }
}

fn poll_deadline_for_engine(engine: Engine) -> Duration {
    match engine {
        Engine::Prospecting => Duration::from_secs(10 * 60),
        Engine::Analysis | Engine::Outreach => Duration::from_secs(15 * 60),
        Engine::Sender => Duration::from_secs(20 * 60),
    }
}

/// Normalized, engine-tagged outcome of one step call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "snake_case")]
pub enum StepResult {
    Prospecting {
        prospects_generated: u64,
        prospects_verified: u64,
        cost: f64,
        time_ms: u64,
        raw_result: Value,
    },
    Analysis {
        leads_analyzed: u64,
        leads_updated: u64,
        grade_a: u64,
        grade_b: u64,
        grade_c: u64,
        cost: f64,
        time_ms: u64,
        raw_result: Value,
    },
    Outreach {
        emails_composed: u64,
        emails_ready: u64,
        avg_quality_score: f64,
        cost: f64,
        time_ms: u64,
        raw_result: Value,
    },
    Sender {
        emails_sent: u64,
        emails_failed: u64,
        emails_queued: u64,
        cost: f64,
        time_ms: u64,
        raw_result: Value,
    },
}

/// Pull an unsigned counter out of `obj`, trying each key in `keys` in
/// order and defaulting to 0 if none are present or numeric.
fn counter(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> u64 {
    for key in keys {
        if let Some(n) = obj.get(*key).and_then(Value::as_u64) {
            return n;
        }
    }
    0
}

fn float_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> f64 {
    for key in keys {
        if let Some(n) = obj.get(*key).and_then(Value::as_f64) {
            return n;
        }
    }
    0.0
}

/// Map a raw engine response body to its normalized, engine-specific shape.
pub fn normalize(engine: Engine, body: &Value, time_ms: u64) -> StepResult {
    let empty = serde_json::Map::new();
    let obj = body.as_object().unwrap_or(&empty);
    let cost = crate::cost::extract_cost(body);

    match engine {
        Engine::Prospecting => StepResult::Prospecting {
            prospects_generated: counter(obj, &["prospects_generated", "found", "count"]),
            prospects_verified: counter(obj, &["prospects_verified", "verified"]),
            cost,
            time_ms,
            raw_result: body.clone(),
        },
        Engine::Analysis => StepResult::Analysis {
            leads_analyzed: counter(obj, &["leads_analyzed", "analyzed", "count"]),
            leads_updated: counter(obj, &["leads_updated", "updated"]),
            grade_a: counter(obj, &["grade_a", "gradeA"]),
            grade_b: counter(obj, &["grade_b", "gradeB"]),
            grade_c: counter(obj, &["grade_c", "gradeC"]),
            cost,
            time_ms,
            raw_result: body.clone(),
        },
        Engine::Outreach => StepResult::Outreach {
            emails_composed: counter(obj, &["emails_composed", "composed", "count"]),
            emails_ready: counter(obj, &["emails_ready", "ready"]),
            avg_quality_score: float_field(obj, &["avg_quality_score", "avgQualityScore"]),
            cost,
            time_ms,
            raw_result: body.clone(),
        },
        Engine::Sender => StepResult::Sender {
            emails_sent: counter(obj, &["emails_sent", "sent", "count"]),
            emails_failed: counter(obj, &["emails_failed", "failed"]),
            emails_queued: counter(obj, &["emails_queued", "queued"]),
            cost,
            time_ms,
            raw_result: body.clone(),
        },
    }
}

/// Outcome of polling an asynchronous job (`{status:'running', jobId}`).
#[derive(Debug, Deserialize)]
struct JobEnvelope {
    status: String,
    #[serde(default)]
    #[serde(rename = "jobId")]
    job_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    rest: Value,
}

/// Calls remote engine endpoints over HTTP and returns normalized results.
pub struct StepDispatcher {
    client: Arc<Client>,
}

impl StepDispatcher {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    /// Issue one call for `step`, following the async poll protocol if the
    /// engine replies with a `running` job envelope.
    pub async fn call(
        &self,
        engine: Engine,
        endpoint: &str,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<StepResult, DispatchError> {
        let start = std::time::Instant::now();
        let method = method.parse::<Method>().unwrap_or(Method::POST);

        let response = match tokio::time::timeout(
            timeout,
            self.client.request(method, endpoint).json(params).send(),
        )
        .await
        {
            Ok(Ok(resp)) => resp,
            Ok(Err(source)) => {
                return Err(DispatchError::Transport {
                    endpoint: endpoint.to_owned(),
                    source,
                });
            }
            Err(_) => {
                return Err(DispatchError::Timeout {
                    endpoint: endpoint.to_owned(),
                    elapsed: start.elapsed(),
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let status_text = status.canonical_reason().unwrap_or("unknown").to_owned();
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::EngineStatus {
                endpoint: endpoint.to_owned(),
                status: status.as_u16(),
                status_text,
                body_snippet: truncate_snippet(&body, 1024),
            });
        }

        let body: Value = response.json().await.map_err(|source| DispatchError::InvalidResponse {
            endpoint: endpoint.to_owned(),
            source,
        })?;

        let body = if is_running_job(&body) {
            self.poll_until_done(engine, endpoint, &body).await?
        } else {
            body
        };

        let time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(normalize(engine, &body, time_ms))
    }

    async fn poll_until_done(
        &self,
        engine: Engine,
        endpoint: &str,
        initial: &Value,
    ) -> Result<Value, DispatchError> {
        let job_id = initial
            .get("jobId")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let poll_url = format!("{}/{job_id}", endpoint.trim_end_matches('/'));
        let interval = poll_interval_for_engine(engine);
        let deadline = poll_deadline_for_engine(engine);
        let start = std::time::Instant::now();

        loop {
            if start.elapsed() >= deadline {
                return Err(DispatchError::PollTimeout {
                    endpoint: poll_url,
                    bound: deadline,
                });
            }

            tokio::time::sleep(interval).await;

            let resp = self
                .client
                .get(&poll_url)
                .send()
                .await
                .map_err(|source| DispatchError::PollFailed {
                    endpoint: poll_url.clone(),
                    source,
                })?;

            let envelope: JobEnvelope = resp.json().await.map_err(|source| DispatchError::PollFailed {
                endpoint: poll_url.clone(),
                source,
            })?;

            match envelope.status.as_str() {
                "completed" => return Ok(envelope.rest),
                "failed" => {
                    return Err(DispatchError::JobFailed {
                        endpoint: poll_url,
                        message: envelope.error.unwrap_or_else(|| "job failed".to_owned()),
                    });
                }
                _ => {
                    warn!(endpoint = %poll_url, status = %envelope.status, "job still running, polling again");
                }
            }
        }
    }
}

fn is_running_job(body: &Value) -> bool {
    body.get("status").and_then(Value::as_str) == Some("running") && body.get("jobId").is_some()
}
