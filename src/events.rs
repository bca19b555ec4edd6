//! Broken-model notifications.
//!
//! The reconciler publishes one [`ModelBroken`] per transition into the
//! broken state, after the transition is committed. What happens next
//! (deleting the model, alerting someone) is up to the subscriber.

use crate::model::BrokenReason;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelBroken {
    pub project: String,
    pub model_id: String,
    pub reason: BrokenReason,
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: ModelBroken);
}

/// Forwards events into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: UnboundedSender<ModelBroken>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, UnboundedReceiver<ModelBroken>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: ModelBroken) {
        if let Err(err) = self.sender.send(event) {
            warn!(model = %err.0.model_id, "event receiver dropped, ModelBroken lost");
        }
    }
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardEvents;

impl EventSink for DiscardEvents {
    fn publish(&self, _event: ModelBroken) {}
}
