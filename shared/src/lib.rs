//! Shared types, error taxonomy, and credential storage for Vidrelay.
pub mod cookie_store;
pub mod errors;
pub mod models;
