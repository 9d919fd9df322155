// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database schema bootstrap.

use sqlx::SqlitePool;

/// Apply the trybox schema to the given pool.
///
/// The statements are idempotent (`CREATE TABLE IF NOT EXISTS`), so this is
/// safe to run on every startup.
pub async fn run(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(include_str!("../migrations/schema.sql"))
        .execute(pool)
        .await?;
    Ok(())
}
