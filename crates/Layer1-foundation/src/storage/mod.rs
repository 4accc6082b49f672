//! Storage module for Relay
//!
//! - `json`: file store with atomic writes

mod json;

pub use json::FileStore;
