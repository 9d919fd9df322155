// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for trybox.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store stayed contended past the retry budget.
    #[error("Storage unavailable after {attempts} attempts")]
    StorageUnavailable {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Container runtime call failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),
}

/// Result type using the trybox Error.
pub type Result<T> = std::result::Result<T, Error>;
