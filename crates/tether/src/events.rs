//! Hub events and the sink they are published to.
//!
//! Delivery is fire-and-forget and at most once per `notify` call. The
//! WebSocket layer (or anything else) subscribes to a [`BroadcastSink`].

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::agent::{AgentType, InvocationCredential};
use crate::backend::BackendStatus;
use crate::queue::DirectStatus;

/// Observable outcome of routing work.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    TypingStarted {
        agent: String,
        channel_id: String,
    },
    TypingStopped {
        agent: String,
        channel_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A recipient was skipped because it is a ghost.
    AgentUnreachable {
        agent: String,
        channel_id: String,
    },
    CredentialUpdated {
        agent: String,
        credential: Option<InvocationCredential>,
    },
    BackendStatusChanged {
        cli: AgentType,
        port: u16,
        status: BackendStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DirectMessageResolved {
        entry_id: String,
        from_agent: String,
        to_agent: String,
        status: DirectStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<String>,
    },
}

/// Receiver of hub events.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: HubEvent);
}

/// Event sink that fans out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<HubEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn notify(&self, event: HubEvent) {
        if self.tx.send(event).is_err() {
            debug!("event dropped: no subscribers");
        }
    }
}

/// Drain every event currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<HubEvent>) -> Vec<HubEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_without_subscribers_is_silent() {
        let sink = BroadcastSink::new(4);
        sink.notify(HubEvent::TypingStarted {
            agent: "nibex".into(),
            channel_id: "c1".into(),
        });
        assert_eq!(sink.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_receives_events_in_order() {
        let sink = BroadcastSink::new(4);
        let mut rx = sink.subscribe();
        sink.notify(HubEvent::TypingStarted {
            agent: "nibex".into(),
            channel_id: "c1".into(),
        });
        sink.notify(HubEvent::TypingStopped {
            agent: "nibex".into(),
            channel_id: "c1".into(),
            error: None,
        });
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], HubEvent::TypingStarted { .. }));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(HubEvent::AgentUnreachable {
            agent: "nibex".into(),
            channel_id: "c1".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "agent_unreachable");
    }
}
