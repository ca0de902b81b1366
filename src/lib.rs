pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod telemetry;
