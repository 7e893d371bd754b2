//! Infrastructure layer - storage adapters
//!
//! - `memory_store`: in-process store for tests and embedding
//! - `postgres`: sqlx/PostgreSQL store (feature `postgres`)

pub mod memory_store;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory_store::InMemoryUploadStore;

#[cfg(feature = "postgres")]
pub use postgres::{PgReferenceScanner, PostgresUploadStore};
