//! Campaign run state machine.
//!
//! Validates and executes transitions for a [`RunStatus`], enforcing the
//! allowed transition graph and optimistic locking on the stored status.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use campaignd_db::models::RunStatus;
use campaignd_db::queries::runs;

/// The campaign run state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// running -> aborted
/// running -> completed
/// running -> partial
/// running -> failed
/// ```
///
/// All four destinations from `running` are terminal; there are no
/// transitions out of `completed`, `partial`, `failed`, or `aborted`.
pub struct RunStateMachine;

impl RunStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
        matches!(
            (from, to),
            (RunStatus::Running, RunStatus::Aborted)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Partial)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// Every destination in the graph is terminal, so `completed_at` is
    /// always stamped.
    ///
    /// Returns an error if the transition is not a valid edge, the run
    /// does not exist, or the current status in the database does not
    /// match `from` (optimistic lock failure).
    pub async fn transition(pool: &PgPool, run_id: Uuid, from: RunStatus, to: RunStatus) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid run state transition: {from} -> {to} for run {run_id}");
        }

        let rows = runs::transition_run_status(pool, run_id, from, to, Some(Utc::now()))
            .await
            .with_context(|| format!("failed to transition run {run_id} from {from} to {to}"))?;

        if rows == 0 {
            let run = runs::get_run(pool, run_id).await?;
            match run {
                None => bail!("run {run_id} not found"),
                Some(r) => bail!(
                    "optimistic lock failed: run {run_id} has status {}, expected {from}",
                    r.status
                ),
            }
        }

        Ok(())
    }
}
