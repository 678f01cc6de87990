//! FreeBAS - BACnet/IP occupancy device
//!
//! Publishes two live points over BACnet/IP:
//! - `binary-value,1` "Occupied", from a weekly occupancy schedule
//! - `analog-value,1` "Outside_Air_Temp_Sensor", from an external weather source
//!
//! The sync loop and the BACnet stack run as services on `bas_runtime`; an
//! HTTP API manages the schedule and relays BACnet client requests.

// Re-export the service runtime
pub use bas_runtime;

// Settings and CLI
pub mod config;

// Weekly schedule and its store
pub mod schedule;

// Schedule evaluation
pub mod occupancy;

// Outside air temperature
pub mod weather;

// Published points
pub mod device;

// Schedule + weather -> device
pub mod sync;

// BACnet/IP codec, responder and client
pub mod bacnet;

// HTTP API
pub mod server;
