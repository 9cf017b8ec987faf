pub mod config;
pub mod scenario;
pub mod telemetry;
