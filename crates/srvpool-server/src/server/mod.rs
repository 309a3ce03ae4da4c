pub mod config;
pub mod tcp;
pub mod telemetry;
