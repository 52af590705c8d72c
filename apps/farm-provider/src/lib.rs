pub mod actions;
pub mod appium;
pub mod config;
pub mod device;
pub mod heartbeat;
pub mod jpeg;
pub mod logging;
pub mod platform;
pub mod ports;
pub mod probes;
pub mod routes;
pub mod stream;
pub mod supervisor;
pub mod tools;
