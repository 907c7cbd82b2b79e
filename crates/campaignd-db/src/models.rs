use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Paused,
    Archived,
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for CampaignStatus {
    type Err = CampaignStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "archived" => Ok(Self::Archived),
            other => Err(CampaignStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CampaignStatus`] string.
#[derive(Debug, Clone)]
pub struct CampaignStatusParseError(pub String);

impl fmt::Display for CampaignStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid campaign status: {:?}", self.0)
    }
}

impl std::error::Error for CampaignStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a campaign run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(RunStatusParseError(other.to_owned())),
        }
    }
}

/// Whether a run status is terminal (see invariant 3: terminal runs have
/// `completed_at` set, non-terminal runs don't).
impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Error returned when parsing an invalid [`RunStatus`] string.
#[derive(Debug, Clone)]
pub struct RunStatusParseError(pub String);

impl fmt::Display for RunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run status: {:?}", self.0)
    }
}

impl std::error::Error for RunStatusParseError {}

// ---------------------------------------------------------------------------

/// What caused a campaign run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

impl FromStr for TriggerType {
    type Err = TriggerTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            other => Err(TriggerTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TriggerType`] string.
#[derive(Debug, Clone)]
pub struct TriggerTypeParseError(pub String);

impl fmt::Display for TriggerTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid trigger type: {:?}", self.0)
    }
}

impl std::error::Error for TriggerTypeParseError {}

// ---------------------------------------------------------------------------

/// The remote worker service a step calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Prospecting,
    Analysis,
    Outreach,
    Sender,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prospecting => "prospecting",
            Self::Analysis => "analysis",
            Self::Outreach => "outreach",
            Self::Sender => "sender",
        };
        f.write_str(s)
    }
}

impl FromStr for Engine {
    type Err = EngineParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prospecting" => Ok(Self::Prospecting),
            "analysis" => Ok(Self::Analysis),
            "outreach" => Ok(Self::Outreach),
            "sender" => Ok(Self::Sender),
            other => Err(EngineParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Engine`] string.
#[derive(Debug, Clone)]
pub struct EngineParseError(pub String);

impl fmt::Display for EngineParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid engine kind: {:?}", self.0)
    }
}

impl std::error::Error for EngineParseError {}

// ---------------------------------------------------------------------------

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Constant,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Constant => "constant",
        };
        f.write_str(s)
    }
}

impl FromStr for BackoffStrategy {
    type Err = BackoffStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "constant" => Ok(Self::Constant),
            other => Err(BackoffStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BackoffStrategy`] string.
#[derive(Debug, Clone)]
pub struct BackoffStrategyParseError(pub String);

impl fmt::Display for BackoffStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid backoff strategy: {:?}", self.0)
    }
}

impl std::error::Error for BackoffStrategyParseError {}

// ---------------------------------------------------------------------------

/// What a step does when it succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnSuccess {
    Continue,
    Abort,
}

impl Default for OnSuccess {
    fn default() -> Self {
        Self::Continue
    }
}

impl fmt::Display for OnSuccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Continue => "continue",
            Self::Abort => "abort",
        };
        f.write_str(s)
    }
}

impl FromStr for OnSuccess {
    type Err = OnSuccessParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(Self::Continue),
            "abort" => Ok(Self::Abort),
            other => Err(OnSuccessParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OnSuccess`] string.
#[derive(Debug, Clone)]
pub struct OnSuccessParseError(pub String);

impl fmt::Display for OnSuccessParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid onSuccess policy: {:?}", self.0)
    }
}

impl std::error::Error for OnSuccessParseError {}

// ---------------------------------------------------------------------------

/// What a step does when it fails (after its retries are exhausted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Abort,
    Continue,
    Log,
}

impl Default for OnFailure {
    fn default() -> Self {
        Self::Abort
    }
}

impl fmt::Display for OnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Abort => "abort",
            Self::Continue => "continue",
            Self::Log => "log",
        };
        f.write_str(s)
    }
}

impl FromStr for OnFailure {
    type Err = OnFailureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(Self::Abort),
            "continue" => Ok(Self::Continue),
            "log" => Ok(Self::Log),
            other => Err(OnFailureParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OnFailure`] string.
#[derive(Debug, Clone)]
pub struct OnFailureParseError(pub String);

impl fmt::Display for OnFailureParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid onFailure policy: {:?}", self.0)
    }
}

impl std::error::Error for OnFailureParseError {}

// ---------------------------------------------------------------------------
// Embedded config structs (parsed out of `campaigns.config`)
// ---------------------------------------------------------------------------

/// Retry policy attached to a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub attempts: u32,
    #[serde(rename = "initial_delay_ms")]
    pub initial_delay_ms: u64,
    pub backoff: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 1,
            initial_delay_ms: 1000,
            backoff: BackoffStrategy::Exponential,
        }
    }
}

/// One step of a campaign's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    pub engine: Engine,
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Explicit per-step override. When absent, the dispatcher falls back
    /// to a per-engine default (see `dispatch::default_timeout_for_engine`).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default, rename = "onSuccess")]
    pub on_success: OnSuccess,
    #[serde(default, rename = "onFailure")]
    pub on_failure: OnFailure,
}

fn default_method() -> String {
    "POST".to_owned()
}

/// Cron schedule attached to a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub enabled: bool,
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

/// Spend ceilings for a campaign, one currency, multiple rolling periods.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily: Option<f64>,
    pub weekly: Option<f64>,
    pub monthly: Option<f64>,
    #[serde(rename = "perLead")]
    pub per_lead: Option<f64>,
}

/// Notification targets for a campaign's terminal states.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default, rename = "onComplete")]
    pub on_complete: Option<NotificationTarget>,
    #[serde(default, rename = "onFailure")]
    pub on_failure: Option<NotificationTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub email: String,
}

/// The full structured document stored in `campaigns.config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
    #[serde(default)]
    pub budget: Option<BudgetConfig>,
    #[serde(default)]
    pub notifications: Option<NotificationsConfig>,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A campaign -- a named pipeline definition with steps, schedule, budget.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub config: serde_json::Value,
    pub schedule_cron: Option<String>,
    pub status: CampaignStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub total_runs: i64,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub project_id: Option<String>,
}

impl Campaign {
    /// Parse the structured config document out of the `config` JSON column.
    pub fn parsed_config(&self) -> Result<CampaignConfig, serde_json::Error> {
        serde_json::from_value(self.config.clone())
    }
}

/// One execution of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CampaignRun {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps_completed: i32,
    pub steps_failed: i32,
    pub total_cost: f64,
    pub results: serde_json::Value,
    pub errors: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One entry in a run's `errors` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub step: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_status_display_roundtrip() {
        let variants = [
            CampaignStatus::Active,
            CampaignStatus::Paused,
            CampaignStatus::Archived,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: CampaignStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn campaign_status_invalid() {
        assert!("bogus".parse::<CampaignStatus>().is_err());
    }

    #[test]
    fn run_status_display_roundtrip() {
        let variants = [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Partial,
            RunStatus::Failed,
            RunStatus::Aborted,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RunStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn run_status_invalid() {
        assert!("nope".parse::<RunStatus>().is_err());
    }

    #[test]
    fn run_status_terminal_classification() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
    }

    #[test]
    fn trigger_type_display_roundtrip() {
        for v in [TriggerType::Scheduled, TriggerType::Manual] {
            let s = v.to_string();
            let parsed: TriggerType = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn engine_display_roundtrip() {
        for v in [
            Engine::Prospecting,
            Engine::Analysis,
            Engine::Outreach,
            Engine::Sender,
        ] {
            let s = v.to_string();
            let parsed: Engine = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn engine_invalid() {
        assert!("mailer".parse::<Engine>().is_err());
    }

    #[test]
    fn backoff_strategy_display_roundtrip() {
        for v in [
            BackoffStrategy::Exponential,
            BackoffStrategy::Linear,
            BackoffStrategy::Constant,
        ] {
            let s = v.to_string();
            let parsed: BackoffStrategy = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn on_success_defaults_to_continue() {
        assert_eq!(OnSuccess::default(), OnSuccess::Continue);
    }

    #[test]
    fn on_failure_defaults_to_abort() {
        assert_eq!(OnFailure::default(), OnFailure::Abort);
    }

    #[test]
    fn step_config_deserializes_with_defaults() {
        let json = serde_json::json!({
            "name": "S1",
            "engine": "prospecting",
            "endpoint": "https://engines.internal/prospect"
        });
        let step: StepConfig = serde_json::from_value(json).unwrap();
        assert_eq!(step.method, "POST");
        assert_eq!(step.timeout_ms, None);
        assert_eq!(step.on_success, OnSuccess::Continue);
        assert_eq!(step.on_failure, OnFailure::Abort);
        assert_eq!(step.retry.attempts, 1);
    }

    #[test]
    fn campaign_config_round_trips_through_json_column() {
        let json = serde_json::json!({
            "steps": [
                {
                    "name": "S1",
                    "engine": "prospecting",
                    "endpoint": "https://e.example/prospect",
                    "onFailure": "abort"
                }
            ],
            "schedule": { "cron": "0 * * * *", "enabled": true },
            "budget": { "daily": 10.0 }
        });
        let cfg: CampaignConfig = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(cfg.steps.len(), 1);
        assert_eq!(cfg.steps[0].on_failure, OnFailure::Abort);
        assert!(cfg.schedule.unwrap().enabled);
        assert_eq!(cfg.budget.unwrap().daily, Some(10.0));

        let campaign_config_value = json;
        let parsed: CampaignConfig = serde_json::from_value(campaign_config_value).unwrap();
        assert_eq!(parsed.steps[0].name, "S1");
    }
}
