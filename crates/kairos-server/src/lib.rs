//! # Kairos Server Library
//!
//! Wiring for the server binary: registry construction, the demo job types
//! and their HTTP endpoints, and startup output.

pub mod demo_controller;
pub mod demo_jobs;
pub mod startup;
