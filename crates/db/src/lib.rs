//! `db` crate: pure persistence layer.
//!
//! Provides a SQLite connection pool, typed row structs, and repository
//! functions for the checkpoint table.  No business logic lives here.

pub mod error;
pub mod pool;
pub mod repository;
pub mod models;

pub use pool::DbPool;
pub use error::DbError;
