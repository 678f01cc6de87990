//! BAS Runtime - long-running service supervision
//!
//! Hosts the periodic and event-driven services of a building automation
//! station on a single tokio executor.

pub mod service;
