//! # Kairos Config
//!
//! Layered configuration for the Kairos job scheduler: TOML files,
//! `.env`, and `KAIROS__*` environment variables, validated on load.

mod app_config;
mod loader;
mod validation;

pub use app_config::*;
pub use loader::*;
pub use validation::*;
