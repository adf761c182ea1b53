//! Operator notification channel (Telegram today, anything with edits later).

pub mod port;
pub mod throttled;
pub mod types;
