//! Wakegate - starts idle game-server containers on demand
//!
//! This library keeps a fleet of containerized backends asleep until a client
//! wants one:
//! - Intercepts connections to offline backends and starts their container
//! - Waits for a readiness line in the container log before letting clients in
//! - Allows one start sequence per backend at a time
//! - Stops backends that have had no connected clients for a configurable time
//! - Drives any Docker-compatible CLI (docker, podman, ...)

pub mod activity;
pub mod admin;
pub mod config;
pub mod coordinator;
pub mod lifecycle;
pub mod proxy;
pub mod registry;
pub mod routing;
pub mod runtime;
pub mod sweeper;
