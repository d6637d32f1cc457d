//! Agent Link — dispatch prompts from a hub to remote worker machines.

pub mod config;
pub mod error;
pub mod hub;
pub mod logging;
pub mod protocol;
pub mod transport;
pub mod worker;
