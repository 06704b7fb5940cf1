//! Core of the Loft album server: source backends, validation,
//! credential storage, the source registry, the scan job engine, the
//! media catalog and the thumbnail generator.
//!
//! The HTTP surface lives in `loft-server`; everything here is
//! transport-agnostic.

pub mod catalog;
pub mod credentials;
pub mod error;
pub mod registry;
pub mod scan;
pub mod source;
pub mod thumbs;
pub mod types;
pub mod validator;

pub use error::{CoreError, Result};

/// Embedded catalog schema migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Fresh in-memory catalog for unit tests.
#[cfg(test)]
pub(crate) async fn test_pool() -> sqlx::SqlitePool {
    // One connection: every handle must see the same in-memory database.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    MIGRATOR.run(&pool).await.expect("migrations");
    pool
}
