//! Persistent storage for environments and episodes.

pub mod database;
pub mod migrations;
pub mod schema;

pub use database::{Database, DatabaseError};
