//! Client for the OpenCode server HTTP API.
//!
//! Only the handful of endpoints the hub consumes are modelled: session
//! listing/creation, prompt submission (sync and fire-and-forget), abort,
//! health and dispose.

mod client;
mod error;
mod types;

pub use client::OpenCodeClient;
#[cfg(test)]
pub(crate) use client::test_server;
pub use error::{OpenCodeError, OpenCodeResult};
pub use types::{HealthInfo, MessageReply, RemoteSession, SessionTime};
