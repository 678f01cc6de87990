//! HTTP Server
//!
//! JSON administration API: login, schedule management, point status, the
//! device configuration view and BACnet client requests.

mod auth;
mod error;
mod handlers;
mod router;
mod state;

pub use auth::{AuthUser, SESSION_COOKIE};
pub use error::ApiError;
pub use router::*;
pub use state::*;
