//! Notifier: sends campaign-completion and campaign-failure emails.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::warn;

/// SMTP settings resolved from configuration. `None` means unconfigured.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// Sends notification emails, or no-ops with a warning when unconfigured.
pub struct Notifier {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from: String,
}

impl Notifier {
    /// Build a notifier from resolved SMTP settings. `None` yields an
    /// unconfigured notifier whose sends always no-op.
    pub fn new(config: Option<&SmtpConfig>) -> Self {
        let Some(config) = config else {
            return Self {
                transport: None,
                from: String::new(),
            };
        };

        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .ok()
            .map(|builder| builder.port(config.port).credentials(creds).build());

        Self {
            transport,
            from: config.from.clone(),
        }
    }

    /// Send an email. Returns `false` without sending when unconfigured or
    /// when the message fails to build.
    pub async fn send(&self, to: &str, subject: &str, body_text: &str, body_html: Option<&str>) -> bool {
        let Some(transport) = &self.transport else {
            warn!(to, subject, "notifier unconfigured, skipping send");
            return false;
        };

        let body = body_html.map(str::to_owned).unwrap_or_else(|| body_text.to_owned());
        let content_type = if body_html.is_some() {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };

        let from: lettre::message::Mailbox = match self.from.parse() {
            Ok(addr) => addr,
            Err(err) => {
                warn!(from = %self.from, error = %err, "invalid sender address, skipping send");
                return false;
            }
        };
        let recipient: lettre::message::Mailbox = match to.parse() {
            Ok(addr) => addr,
            Err(err) => {
                warn!(to, error = %err, "invalid recipient address, skipping send");
                return false;
            }
        };

        let message = match Message::builder()
            .from(from)
            .to(recipient)
            .subject(subject)
            .header(content_type)
            .body(body)
        {
            Ok(m) => m,
            Err(err) => {
                warn!(to, subject, error = %err, "failed to build notification message");
                return false;
            }
        };

        match transport.send(message).await {
            Ok(_) => true,
            Err(err) => {
                warn!(to, subject, error = %err, "failed to send notification");
                false
            }
        }
    }
}

/// Compose the body of a completion (success/partial) notification.
///
/// `results` holds the successful steps (step name -> engine response);
/// `errors` holds the failed ones. Together they drive the per-step summary
/// line appended after the run counters.
pub fn completion_body(
    campaign_name: &str,
    steps_completed: i32,
    steps_failed: i32,
    total_cost: f64,
    duration_ms: i64,
    results: &serde_json::Map<String, serde_json::Value>,
    errors: &[campaignd_db::models::RunError],
) -> String {
    let mut summary = String::new();
    for name in results.keys() {
        summary.push_str(&format!("\n  - {name}: ok"));
    }
    for err in errors {
        summary.push_str(&format!("\n  - {}: failed ({})", err.step, err.error));
    }
    if summary.is_empty() {
        summary.push_str("\n  (no steps ran)");
    }

    format!(
        "Campaign \"{campaign_name}\" finished.\n\
         Steps completed: {steps_completed}\n\
         Steps failed: {steps_failed}\n\
         Total cost: {total_cost:.2}\n\
         Duration: {duration_ms} ms\n\
         Per-step summary:{summary}"
    )
}

/// Compose the body of a failure (failed/aborted) notification.
pub fn failure_body(campaign_name: &str, error_message: &str, budget_exceeded: bool) -> String {
    if budget_exceeded {
        format!("Campaign \"{campaign_name}\" was aborted: budget exceeded ({error_message}).")
    } else {
        format!("Campaign \"{campaign_name}\" failed: {error_message}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_notifier_noop_returns_false() {
        let notifier = Notifier::new(None);
        let sent = notifier.send("ops@example.com", "subject", "body", None).await;
        assert!(!sent);
    }

    #[test]
    fn completion_body_includes_counters() {
        let mut results = serde_json::Map::new();
        results.insert("prospect".to_owned(), serde_json::json!({"leads": 10}));
        let errors = vec![campaignd_db::models::RunError {
            step: "enrich".to_owned(),
            error: "timeout".to_owned(),
            at: chrono::Utc::now(),
        }];

        let body = completion_body("My Campaign", 1, 1, 2.5, 1500, &results, &errors);
        assert!(body.contains("My Campaign"));
        assert!(body.contains("Steps completed: 1"));
        assert!(body.contains("Steps failed: 1"));
        assert!(body.contains("2.50"));
        assert!(body.contains("prospect: ok"));
        assert!(body.contains("enrich: failed (timeout)"));
    }

    #[test]
    fn completion_body_notes_when_no_steps_ran() {
        let body = completion_body("Empty Campaign", 0, 0, 0.0, 0, &serde_json::Map::new(), &[]);
        assert!(body.contains("(no steps ran)"));
    }

    #[test]
    fn failure_body_notes_budget_exceeded() {
        let body = failure_body("My Campaign", "daily limit reached", true);
        assert!(body.contains("budget exceeded"));
        assert!(body.contains("daily limit reached"));
    }

    #[test]
    fn failure_body_plain_error() {
        let body = failure_body("My Campaign", "engine unreachable", false);
        assert!(body.contains("failed: engine unreachable"));
    }
}
