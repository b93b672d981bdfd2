//! Data layer module
//!
//! Storage interfaces used by the federation core and their
//! SQLite implementation.

mod database;
mod models;
mod store;

pub use database::Database;
pub use models::*;
pub use store::{HostStore, KeyStore, QueueStore, RepoStore, UserDirectory};
