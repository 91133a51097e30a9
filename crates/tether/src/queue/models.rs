//! Direct-message queue models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery state of a queued direct message.
///
/// Transitions only move forward: `pending → delivered → {responded, expired, fallback}`,
/// or straight from `pending` to any terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectStatus {
    /// Waiting for the recipient to pick it up.
    Pending,
    /// Handed to the recipient piggy-backed on one of its own requests.
    Delivered,
    Responded,
    Expired,
    /// Delivered by invoking a backend after the smart-pull window closed.
    Fallback,
}

impl DirectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectStatus::Pending => "pending",
            DirectStatus::Delivered => "delivered",
            DirectStatus::Responded => "responded",
            DirectStatus::Expired => "expired",
            DirectStatus::Fallback => "fallback",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DirectStatus::Responded | DirectStatus::Expired | DirectStatus::Fallback
        )
    }

    /// States from which a transition into `self` is accepted.
    pub fn predecessors(&self) -> &'static [DirectStatus] {
        match self {
            DirectStatus::Pending => &[],
            DirectStatus::Delivered => &[DirectStatus::Pending],
            DirectStatus::Responded | DirectStatus::Expired | DirectStatus::Fallback => {
                &[DirectStatus::Pending, DirectStatus::Delivered]
            }
        }
    }

    pub fn can_transition_to(&self, next: DirectStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl std::fmt::Display for DirectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DirectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DirectStatus::Pending),
            "delivered" => Ok(DirectStatus::Delivered),
            "responded" => Ok(DirectStatus::Responded),
            "expired" => Ok(DirectStatus::Expired),
            "fallback" => Ok(DirectStatus::Fallback),
            _ => Err(format!("unknown direct status: {}", s)),
        }
    }
}

/// A queued direct message between two agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectQueueEntry {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub prompt: String,
    /// Prompt with the reply instructions the recipient sees.
    pub wrapped_prompt: String,
    pub status: DirectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

impl DirectQueueEntry {
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        prompt: impl Into<String>,
        wrapped_prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            prompt: prompt.into(),
            wrapped_prompt: wrapped_prompt.into(),
            status: DirectStatus::Pending,
            response: None,
            created_at: Utc::now(),
            delivered_at: None,
            responded_at: None,
        }
    }

    /// Apply a status change in place, stamping the matching timestamp.
    ///
    /// Returns `false` (and changes nothing) when the transition is not allowed.
    pub fn transition(&mut self, next: DirectStatus, response: Option<&str>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        match next {
            DirectStatus::Delivered => self.delivered_at = Some(now),
            DirectStatus::Responded => {
                self.responded_at = Some(now);
                self.response = response.map(str::to_string);
            }
            _ => {}
        }
        self.status = next;
        true
    }
}

/// Filter for queue listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueFilter {
    pub to_agent: Option<String>,
    pub status: Option<DirectStatus>,
    pub limit: Option<u32>,
}

/// Listing cap for queue status queries.
pub const MAX_QUEUE_LIMIT: u32 = 50;

impl QueueFilter {
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(20).clamp(1, MAX_QUEUE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_accept_nothing() {
        for terminal in [DirectStatus::Responded, DirectStatus::Expired, DirectStatus::Fallback] {
            for next in [
                DirectStatus::Pending,
                DirectStatus::Delivered,
                DirectStatus::Responded,
                DirectStatus::Expired,
                DirectStatus::Fallback,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_delivered_only_from_pending() {
        assert!(DirectStatus::Pending.can_transition_to(DirectStatus::Delivered));
        assert!(!DirectStatus::Delivered.can_transition_to(DirectStatus::Delivered));
        assert!(DirectStatus::Delivered.can_transition_to(DirectStatus::Responded));
    }

    #[test]
    fn test_transition_stamps_response() {
        let mut entry = DirectQueueEntry::new("yara", "nibex", "ping", "ping");
        assert!(entry.transition(DirectStatus::Responded, Some("pong")));
        assert_eq!(entry.response.as_deref(), Some("pong"));
        assert!(entry.responded_at.is_some());
        assert!(!entry.transition(DirectStatus::Expired, None));
        assert_eq!(entry.status, DirectStatus::Responded);
    }

    #[test]
    fn test_limit_is_capped() {
        let filter = QueueFilter {
            limit: Some(500),
            ..Default::default()
        };
        assert_eq!(filter.effective_limit(), MAX_QUEUE_LIMIT);
        assert_eq!(QueueFilter::default().effective_limit(), 20);
    }
}
