pub mod config;
pub mod crypto;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod telemetry;
