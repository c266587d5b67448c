// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Best-effort call event fan-out.
//!
//! Publishing never fails and never blocks: a bus with no subscribers drops
//! the event, and a subscriber that falls behind loses the oldest events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::trace;

use crate::state_machine::CallStatus;

/// Event-specific fields, tagged with the event `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A call changed status.
    CallUpdate {
        /// Status after the change.
        status: CallStatus,
        /// Extra context (error message, attempts, ...).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Map<String, Value>>,
    },
    /// Enrichment produced a result.
    AiResult {
        /// Transcribed text.
        transcription: String,
        /// Sentiment label.
        sentiment: String,
    },
}

/// One notification about a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    /// External call ID.
    pub call_id: String,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// Event body.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl CallEvent {
    /// `call_update` event.
    pub fn call_update(
        call_id: impl Into<String>,
        status: CallStatus,
        data: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            timestamp: Utc::now(),
            payload: EventPayload::CallUpdate { status, data },
        }
    }

    /// `ai_result` event.
    pub fn ai_result(
        call_id: impl Into<String>,
        transcription: impl Into<String>,
        sentiment: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            timestamp: Utc::now(),
            payload: EventPayload::AiResult {
                transcription: transcription.into(),
                sentiment: sentiment.into(),
            },
        }
    }

    /// The `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self.payload {
            EventPayload::CallUpdate { .. } => "call_update",
            EventPayload::AiResult { .. } => "ai_result",
        }
    }
}

/// Event sink for call notifications.
pub trait NotificationBus: Send + Sync {
    /// Publish an event. Delivery failures are swallowed.
    fn publish(&self, event: CallEvent);
}

/// Fan-out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<CallEvent>,
}

impl BroadcastBus {
    /// Create a bus that buffers up to `capacity` events per subscriber.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl NotificationBus for BroadcastBus {
    fn publish(&self, event: CallEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            trace!(
                call_id = %event.call_id,
                event_type = event.event_type(),
                "No subscribers for call event"
            );
        }
    }
}

/// Bus that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBus;

impl NotificationBus for NoopBus {
    fn publish(&self, _event: CallEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_update_json_shape() {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::from("boom"));
        let event = CallEvent::call_update("CALL-1", CallStatus::Failed, Some(data));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "call_update");
        assert_eq!(json["call_id"], "CALL-1");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["data"]["error"], "boom");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_zero_capacity_bus_still_delivers() {
        let bus = BroadcastBus::new(0);
        let mut events = bus.subscribe();

        bus.publish(CallEvent::call_update("CALL-0", CallStatus::Completed, None));
        let event = events.try_recv().unwrap();
        assert_eq!(event.call_id, "CALL-0");
    }

    #[test]
    fn test_ai_result_json_shape() {
        let event = CallEvent::ai_result("CALL-2", "hello", "positive");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ai_result");
        assert_eq!(json["transcription"], "hello");
        assert_eq!(json["sentiment"], "positive");
        assert_eq!(event.event_type(), "ai_result");
    }

    #[test]
    fn test_event_round_trip() {
        let event = CallEvent::call_update("CALL-3", CallStatus::Completed, None);
        let json = serde_json::to_string(&event).unwrap();
        let back: CallEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = BroadcastBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(CallEvent::call_update("CALL-4", CallStatus::Completed, None));
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let bus = BroadcastBus::new(4);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(CallEvent::ai_result("CALL-5", "t", "neutral"));

        assert_eq!(a.recv().await.unwrap().call_id, "CALL-5");
        assert_eq!(b.recv().await.unwrap().event_type(), "ai_result");
    }

    #[tokio::test]
    async fn test_lagging_subscriber_loses_oldest() {
        let bus = BroadcastBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..3 {
            bus.publish(CallEvent::call_update(
                format!("CALL-{i}"),
                CallStatus::Completed,
                None,
            ));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(rx.recv().await.unwrap().call_id, "CALL-1");
    }
}
