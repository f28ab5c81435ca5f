//! VidBill API Library
//!
//! HTTP surface of the billing engine: operator-triggered billing runs,
//! invoice lookups and the payment collaborator's status callback.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
