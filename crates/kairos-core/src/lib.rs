//! # Kairos Core
//!
//! Shared error types and tracing setup for the Kairos background job
//! scheduler. Everything above the job engine reports failures as
//! [`KairosError`].

pub mod error;
pub mod telemetry;

pub use error::*;
pub use telemetry::{init_tracing, LogFormat, LoggingConfig};
