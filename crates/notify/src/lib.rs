//! Out-of-band alerts for the Stone workflow.
//!
//! Escalations and unresolved merge conflicts are pushed to chat channels in
//! addition to the comment posted on the originating issue.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{Notifier, NotifyEvent};
//!
//! # async fn example() {
//! let notifier = Notifier::from_env();
//!
//! notifier.notify(NotifyEvent::ConflictsUnresolved {
//!     repository: "acme/widgets".to_string(),
//!     branch: "stone/issue-42".to_string(),
//!     target_branch: "main".to_string(),
//!     files: vec!["src/lib.rs".to_string()],
//!     timestamp: chrono::Utc::now(),
//! });
//! # }
//! ```
//!
//! # Configuration
//!
//! | Variable | Effect |
//! |---|---|
//! | `DISCORD_WEBHOOK_URL` | enables the Discord channel |
//! | `SLACK_WEBHOOK_URL` | enables the Slack channel |
//! | `NOTIFY_MIN_SEVERITY` | `info`, `warning` (default) or `critical` |
//! | `NOTIFY_DISABLED` | `true` or `1` drops everything |

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::discord::DiscordChannel;
pub use channels::slack::SlackChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{NotifyEvent, Severity};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Lowest severity that is delivered: `info`, `warning` or `critical`.
const ENV_NOTIFY_MIN_SEVERITY: &str = "NOTIFY_MIN_SEVERITY";

/// Per-channel delivery bound.
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivery result per channel name.
pub type DeliveryReport = Vec<(String, Result<(), ChannelError>)>;

/// Fans events out to every configured channel.
#[derive(Clone)]
pub struct Notifier {
    channels: Arc<[Arc<dyn NotifyChannel>]>,
    min_severity: Severity,
    send_timeout: Duration,
}

impl Notifier {
    /// Channels from `DISCORD_WEBHOOK_URL` / `SLACK_WEBHOOK_URL`.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .is_ok_and(|v| v.eq_ignore_ascii_case("true") || v == "1");
        if disabled {
            info!("Notifications disabled via {ENV_NOTIFY_DISABLED}");
            return Self::disabled();
        }

        let candidates: Vec<Arc<dyn NotifyChannel>> = vec![
            Arc::new(DiscordChannel::from_env()),
            Arc::new(SlackChannel::from_env()),
        ];
        let channels: Vec<_> = candidates.into_iter().filter(|c| c.enabled()).collect();

        let min_severity = match std::env::var(ENV_NOTIFY_MIN_SEVERITY) {
            Ok(value) => Severity::parse(&value).unwrap_or_else(|| {
                warn!(value = %value, "Unknown {ENV_NOTIFY_MIN_SEVERITY}, using warning");
                Severity::Warning
            }),
            Err(_) => Severity::Warning,
        };

        if channels.is_empty() {
            warn!("No notification channels configured; escalations are only posted on issues");
        } else {
            info!(
                channels = ?channels.iter().map(|c| c.name()).collect::<Vec<_>>(),
                min_severity = min_severity.as_str(),
                "Notifications enabled"
            );
        }

        Self::with_channels(channels).with_min_severity(min_severity)
    }

    /// Deliver to exactly these channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels: channels.into(),
            min_severity: Severity::Info,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// No channels; every event is dropped.
    #[must_use]
    pub fn disabled() -> Self {
        Self::with_channels(Vec::new())
    }

    /// Drop events below `severity`.
    #[must_use]
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.channels.is_empty()
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn accepts(&self, event: &NotifyEvent) -> bool {
        if !self.has_channels() {
            return false;
        }
        if event.severity() < self.min_severity {
            debug!(
                event = %event.title(),
                severity = event.severity().as_str(),
                "Below minimum severity, not sent"
            );
            return false;
        }
        true
    }

    /// Deliver in the background. Must be called inside a tokio runtime;
    /// failures are logged only.
    pub fn notify(&self, event: NotifyEvent) {
        if !self.accepts(&event) {
            return;
        }
        let notifier = self.clone();
        tokio::spawn(async move {
            notifier.deliver(Arc::new(event)).await;
        });
    }

    /// Deliver to every channel concurrently and report each outcome.
    pub async fn notify_and_wait(&self, event: NotifyEvent) -> DeliveryReport {
        if !self.accepts(&event) {
            return Vec::new();
        }
        self.deliver(Arc::new(event)).await
    }

    async fn deliver(&self, event: Arc<NotifyEvent>) -> DeliveryReport {
        let mut sends = JoinSet::new();
        for channel in self.channels.iter() {
            let channel = Arc::clone(channel);
            let event = Arc::clone(&event);
            let limit = self.send_timeout;
            sends.spawn(async move {
                let name = channel.name().to_string();
                let result = match tokio::time::timeout(limit, channel.send(&event)).await {
                    Ok(result) => result,
                    Err(_) => Err(ChannelError::Timeout(limit.as_secs())),
                };
                (name, result)
            });
        }

        let mut report = Vec::with_capacity(self.channels.len());
        while let Some(joined) = sends.join_next().await {
            let Ok((name, result)) = joined else {
                warn!("Notification task panicked");
                continue;
            };
            match &result {
                Ok(()) => debug!(channel = %name, event = %event.title(), "Notification sent"),
                Err(e) => warn!(channel = %name, error = %e, "Failed to send notification"),
            }
            report.push((name, result));
        }
        report.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}
