//! # keel-data-sqlx — SQLite backend for keel-data
//!
//! [`SqliteStore`] implements [`keel_data::Store`] on top of an
//! [SQLx](https://github.com/launchbadge/sqlx) pool. Every entity kind shares
//! one `keel_documents` table; bodies are stored as JSON text and filtered
//! with `json_extract`, so entities need no schema of their own.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SqliteStore`] | `Store` over an `SqlitePool` |
//! | [`SqliteTransaction`] | Handle returned by `SqliteStore::begin` |
//! | [`SqliteConfig`] | Connection URL and pool size, from YAML or `KEEL_DATABASE_*` |
//! | [`SqlxErrorExt`] | Extension trait to convert `sqlx::Error` → `DataError` (`.into_data_error()`) |
//!
//! # Quick start
//!
//! ```ignore
//! use keel_data::prelude::*;
//! use keel_data_sqlx::{SqliteConfig, SqliteStore};
//!
//! let store = SqliteStore::connect(&SqliteConfig::load("keel.yaml")?).await?;
//! let mut uow = UnitOfWork::new(DbContext::new(store));
//! let users = uow.repository::<User>();
//!
//! uow.begin().await?;
//! users.add(User::new("alice"))?;
//! uow.commit().await?;
//! ```
//!
//! # Error bridging
//!
//! Due to Rust's orphan rules, `From<sqlx::Error> for DataError` can't be
//! implemented here. Use the [`SqlxErrorExt`] trait instead:
//!
//! ```ignore
//! use keel_data_sqlx::SqlxErrorExt;
//!
//! sqlx::query("VACUUM")
//!     .execute(store.pool())
//!     .await
//!     .map_err(|e| e.into_data_error())?;
//! ```

pub mod config;
pub mod error;
mod sql;
#[cfg(feature = "sqlite")]
pub mod store;

pub use config::SqliteConfig;
pub use error::{SqlxErrorExt, SqlxResult};
#[cfg(feature = "sqlite")]
pub use store::{SqliteStore, SqliteTransaction};

/// Re-exports of the most commonly used types from both `keel-data` and this crate.
pub mod prelude {
    pub use crate::{SqliteConfig, SqlxErrorExt};
    #[cfg(feature = "sqlite")]
    pub use crate::SqliteStore;
    pub use keel_data::prelude::*;
}
