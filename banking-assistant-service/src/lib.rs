pub mod answer;
pub mod config;
pub mod data_store;
pub mod models;
pub mod service;
pub mod telegram;
pub mod telemetry;

pub use config::{CredentialMode, LogFormat, ServiceConfig};
pub use service::{AppState, build_router, create_app};
