//! Direct-message queue: smart pull first, backend fallback second.

pub mod models;
mod service;

pub use models::{DirectQueueEntry, DirectStatus, MAX_QUEUE_LIMIT, QueueFilter};
pub use service::{DirectConfig, DirectMode, DirectOutcome, DirectQueue, Resolution};
