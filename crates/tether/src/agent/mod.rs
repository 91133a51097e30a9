//! Registered agents and their local registration sessions.

pub mod models;
pub mod service;

pub use models::{
    AgentIdentity, AgentProfile, AgentStatus, AgentType, InvocationCredential, OsSession,
    ProfileUpdate,
};
pub use service::{AgentService, RegisterRequest};
