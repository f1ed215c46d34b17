//! The history ledger (C8/§9): a durable, append-only SQLite record of
//! terminal task transitions, backed by `sqlx`.
//!
//! This used to be a live job-queue store; that responsibility now belongs to
//! the in-memory `queue` module (with `queue::persistence` for durability).
//! What's left here is strictly diagnostic: one row per task, written once,
//! at the moment it leaves the active set.

pub mod db;
pub mod types;


pub use db::ResumeDb;
pub use types::*;
