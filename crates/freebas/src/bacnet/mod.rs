//! BACnet/IP
//!
//! Wire codec, the responder for our own device object, and a client for
//! reading and writing other devices. All traffic goes through one UDP
//! socket owned by the worker task behind [`BacnetService`].

pub mod codec;
mod client;
mod responder;
mod service;
pub mod services;
mod types;
mod worker;

pub use client::*;
pub use responder::{Destination, Reply, Responder};
pub use service::BacnetService;
pub use services::WhoIs;
pub use types::*;
