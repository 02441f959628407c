//! Durable, append-only message log on SQLite.
//!
//! The log assigns every committed message a strictly increasing
//! [`Sequence`](chorus_core::Sequence) and enforces dedup-key uniqueness with a
//! column constraint, so several processes can share one database file.

pub mod database;
pub mod error;
pub mod log;
pub mod replay;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use log::{LogStore, SqliteLog};
pub use replay::read_after;
