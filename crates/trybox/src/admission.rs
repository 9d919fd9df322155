// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission control for new session requests.
//!
//! Checks run in a fixed order (terms, ban list, capacity, per-address
//! quota) and the first failure wins. Both counting checks fail closed:
//! when the store cannot be consulted, the request is refused rather than
//! admitted past an unverifiable limit.

use tracing::warn;

use crate::config::ServerConfig;
use crate::db::SessionDb;

/// Why a session request was refused.
///
/// The discriminants are the wire status codes returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// The client did not echo the current terms fingerprint.
    InvalidTerms = 1,
    /// The server-wide session cap is reached.
    ServerFull = 2,
    /// The requester already holds its maximum number of sessions.
    QuotaReached = 3,
    /// The requester address is banned.
    Banned = 4,
}

impl Denial {
    /// Wire status code for this denial.
    pub fn status_code(&self) -> i64 {
        *self as i64
    }
}

/// Decide whether a request from `request_ip` echoing `terms` may proceed.
pub async fn check(
    db: &SessionDb,
    config: &ServerConfig,
    request_ip: &str,
    terms: &str,
) -> Result<(), Denial> {
    if terms != config.server_terms_hash {
        return Err(Denial::InvalidTerms);
    }

    if config
        .server_banned_ips
        .iter()
        .any(|banned| banned == request_ip)
    {
        return Err(Denial::Banned);
    }

    // Counting always happens so a broken store denies admission even when
    // the corresponding limit is 0 (unlimited).
    let active = match db.count_active().await {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "Unable to count active sessions, refusing admission");
            return Err(Denial::ServerFull);
        }
    };
    if config.server_containers_max > 0 && active >= config.server_containers_max {
        return Err(Denial::ServerFull);
    }

    let held = match db.count_active_for_ip(request_ip).await {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, ip = %request_ip, "Unable to count sessions for address, refusing admission");
            return Err(Denial::QuotaReached);
        }
    };
    if config.quota_sessions > 0 && held >= config.quota_sessions {
        return Err(Denial::QuotaReached);
    }

    Ok(())
}
