//! Chat channels an event can be delivered to.

pub mod discord;
pub mod slack;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::events::NotifyEvent;

/// A single delivery target. Implementations post one event per call and
/// do not retry; the [`crate::Notifier`] bounds each call with a timeout.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// False when the channel has no webhook and should be skipped.
    fn enabled(&self) -> bool;

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError>;
}
