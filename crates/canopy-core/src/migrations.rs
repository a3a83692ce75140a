// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for canopy-core.
//!
//! The schema is embedded at compile time. [`run`] is safe to call on every
//! start; already-applied migrations are skipped.
//!
//! ```ignore
//! let pool = PgPool::connect(&database_url).await?;
//! canopy_core::migrations::run(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with all migrations embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// Apply all pending PostgreSQL migrations.
pub async fn run(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}
