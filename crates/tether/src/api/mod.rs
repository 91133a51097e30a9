//! HTTP surface of the hub.

pub mod error;
pub mod handlers;
mod routes;

use std::sync::Arc;

use crate::hub::Hub;

pub use error::{ApiError, ApiResult};
pub use routes::{INTERNAL_SECRET_HEADER, create_router};

/// Shared state handed to every handler.
pub type AppState = Arc<Hub>;
