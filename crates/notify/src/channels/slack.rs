//! Slack incoming-webhook channel using Block Kit.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

const ENV_SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

/// Slack allows at most ten fields per section block.
const MAX_SECTION_FIELDS: usize = 10;

pub struct SlackChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Reads `SLACK_WEBHOOK_URL`; the channel is disabled when unset.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            webhook_url: std::env::var(ENV_SLACK_WEBHOOK_URL).ok(),
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    fn blocks(event: &NotifyEvent) -> Value {
        let fields: Vec<Value> = event
            .fields()
            .into_iter()
            .take(MAX_SECTION_FIELDS)
            .map(|(name, value)| json!({ "type": "mrkdwn", "text": format!("*{name}*\n{value}") }))
            .collect();

        let mut blocks = vec![
            json!({
                "type": "header",
                "text": { "type": "plain_text", "text": event.title() }
            }),
            json!({
                "type": "section",
                "text": { "type": "mrkdwn", "text": event.description() }
            }),
        ];
        if !fields.is_empty() {
            blocks.push(json!({ "type": "section", "fields": fields }));
        }
        blocks.push(json!({
            "type": "context",
            "elements": [{
                "type": "mrkdwn",
                "text": format!(
                    "{} | <!date^{}^{{date_short_pretty}} {{time}}|{}>",
                    event.severity().as_str(),
                    event.timestamp().timestamp(),
                    event.timestamp().to_rfc3339()
                )
            }]
        }));

        // `text` is the notification fallback for clients without blocks
        json!({ "text": event.title(), "blocks": blocks })
    }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let Some(url) = self.webhook_url.as_deref() else {
            return Err(ChannelError::NotConfigured(ENV_SLACK_WEBHOOK_URL.to_string()));
        };

        let response = self.client.post(url).json(&Self::blocks(event)).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(30);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Slack webhook rejected notification");
            return Err(ChannelError::Other(format!("Slack returned {status}: {body}")));
        }

        debug!(event = %event.title(), "Slack notification delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn conflict_event() -> NotifyEvent {
        NotifyEvent::ConflictsUnresolved {
            repository: "acme/widgets".to_string(),
            branch: "stone/issue-7".to_string(),
            target_branch: "main".to_string(),
            files: vec!["src/lib.rs".to_string()],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_blocks_layout() {
        let payload = SlackChannel::blocks(&conflict_event());
        let blocks = payload["blocks"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "header");
        assert_eq!(blocks[2]["fields"].as_array().unwrap().len(), 3);
        assert_eq!(blocks.last().unwrap()["type"], "context");
        assert_eq!(payload["text"], "Unresolved Merge Conflicts: stone/issue-7");
    }

    #[tokio::test]
    async fn test_send_posts_to_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(json!({ "text": "Unresolved Merge Conflicts: stone/issue-7" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let channel = SlackChannel::new(format!("{}/hook", server.uri()));
        channel.send(&conflict_event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_reports_http_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let channel = SlackChannel::new(server.uri());
        let err = channel.send(&conflict_event()).await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_send_maps_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "12"))
            .mount(&server)
            .await;

        let channel = SlackChannel::new(server.uri());
        let err = channel.send(&conflict_event()).await.unwrap_err();
        assert!(matches!(err, ChannelError::RateLimited { retry_after_secs: 12 }));
    }
}
