//! Food image analysis pipeline
//!
//! Uploaded images are queued as tasks, analyzed by a pluggable vision
//! backend in separate worker processes, and their nutrition estimates kept
//! in a TTL-bounded result store for callers to poll.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
