//! Tether: a hub that delivers prompts to locally running AI coding-agent CLIs.
//!
//! The library is organised around four cooperating parts:
//!
//! - [`discovery`] resolves which CLI session backs a registered agent.
//! - [`liveness`] decides whether an agent is reachable or a ghost.
//! - [`backend`] supervises persistent CLI server processes and one-shot subprocesses.
//! - [`router`] and [`queue`] decide who gets invoked and how direct messages are delivered.
//!
//! [`hub::Hub`] wires them together; [`api`] exposes them over HTTP.

pub mod agent;
pub mod api;
pub mod backend;
pub mod db;
pub mod discovery;
pub mod error;
pub mod events;
pub mod hub;
pub mod liveness;
pub mod opencode;
pub mod queue;
pub mod router;
pub mod settings;
pub mod store;

pub use error::{RelayError, RelayResult};
pub use hub::Hub;
