//! Core domain + application logic for the chat connector.
//!
//! This crate is intentionally framework-agnostic. Telegram, SQLite and the
//! remote join helper live behind ports (traits) implemented in adapter crates.

pub mod client;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod links;
pub mod logging;
pub mod messaging;
pub mod orchestrator;
pub mod progress;
pub mod service;
pub mod store;
pub mod throttle;

pub use errors::{Error, Result};
