//! Impulses
//!
//! Turns impulse spending into savings:
//! - Users set habits with a time of day and day-of-week pattern
//! - A worker texts them a reminder when a habit comes up
//! - Replying YES to a reminder earns coins
//! - Coins buy entries into lotteries drawn when they end
//! - Linked bank data is scanned for recurring spending
//!
//! FLOW:
//! WORKER TICK → REMINDERS → SMS REPLY → COINS → LOTTERY ENTRY → DRAW

pub mod api;
pub mod app;
pub mod coins;
pub mod config;
pub mod error;
pub mod habits;
pub mod ingest;
pub mod lottery;
pub mod models;
pub mod notify;
pub mod savings;
pub mod schedule;
pub mod store;
pub mod users;

pub use error::{ImpulsesError, Result};

// Re-export common types
pub use models::*;
