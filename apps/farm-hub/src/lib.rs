//! Device farm hub: aggregates provider heartbeats into a device registry and
//! fronts the farm with a WebDriver endpoint that leases devices to sessions.

pub mod auth;
pub mod capabilities;
pub mod config;
pub mod devices;
pub mod dispatcher;
pub mod error;
pub mod janitor;
pub mod persist;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod selection;
pub mod state;
pub mod streams;
pub mod telemetry;
