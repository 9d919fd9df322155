// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session expiry scheduling and instance reclaim.
//!
//! Each active session gets one timer task keyed by its record id. Firing
//! reclaims the instance and flips the session to expired. Reclaim is
//! idempotent: deleting an already-gone instance succeeds and re-expiring
//! an expired session is a no-op, so a timer racing a manual reclaim is
//! harmless.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::db::SessionDb;
use crate::runtime::ContainerRuntime;

/// Reclaims session instances when their lifetime runs out.
pub struct ExpiryScheduler {
    db: SessionDb,
    runtime: Arc<dyn ContainerRuntime>,
    timers: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl ExpiryScheduler {
    /// New scheduler with no timers armed.
    pub fn new(db: SessionDb, runtime: Arc<dyn ContainerRuntime>) -> Arc<Self> {
        Arc::new(Self {
            db,
            runtime,
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Arm a timer that reclaims `instance_name` at `expiry_unix`.
    ///
    /// Re-scheduling the same record replaces its previous timer.
    pub fn schedule(self: &Arc<Self>, record_id: i64, instance_name: String, expiry_unix: i64) {
        let now = chrono::Utc::now().timestamp();
        let delay = Duration::from_secs(expiry_unix.saturating_sub(now).max(0) as u64);

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.reclaim(record_id, &instance_name).await;
        });

        let mut timers = self.timers.lock().expect("timer lock poisoned");
        if let Some(previous) = timers.insert(record_id, handle) {
            previous.abort();
        }
    }

    /// Delete the instance and mark the session expired.
    ///
    /// A failed delete is logged and the session still flips to expired;
    /// the leaked instance is picked up by the next orphan sweep.
    pub async fn reclaim(&self, record_id: i64, instance_name: &str) {
        info!(session = record_id, instance = %instance_name, "Session expired, reclaiming instance");

        if let Err(e) = self.runtime.force_delete(instance_name).await {
            warn!(instance = %instance_name, error = %e, "Unable to delete expired instance");
        }

        if let Err(e) = self.db.expire(record_id).await {
            warn!(session = record_id, error = %e, "Unable to mark session expired");
        }

        if let Some(handle) = self
            .timers
            .lock()
            .expect("timer lock poisoned")
            .remove(&record_id)
        {
            handle.abort();
        }
    }

    /// Rebuild timers for sessions that survived a restart.
    ///
    /// Sessions already past their expiry are reclaimed immediately.
    pub async fn replay(self: &Arc<Self>) -> crate::error::Result<()> {
        let sessions = self.db.list_active().await?;
        let now = chrono::Utc::now().timestamp();

        let mut rearmed = 0usize;
        for session in sessions {
            if session.instance_expiry <= now {
                self.reclaim(session.id, &session.instance_name).await;
            } else {
                self.schedule(session.id, session.instance_name, session.instance_expiry);
                rearmed += 1;
            }
        }

        info!(rearmed, "Expiry timers restored");
        Ok(())
    }

    /// Delete instances carrying our name prefix that no active session
    /// references.
    ///
    /// Covers the window where an instance was created but the process died
    /// before the session row landed.
    pub async fn reconcile_orphans(&self, prefix: &str) -> crate::error::Result<()> {
        let names = self.runtime.list_names(prefix).await?;
        let active: HashSet<String> = self
            .db
            .list_active()
            .await?
            .into_iter()
            .map(|s| s.instance_name)
            .collect();

        for name in names {
            if active.contains(&name) {
                continue;
            }
            info!(instance = %name, "Deleting orphaned instance");
            if let Err(e) = self.runtime.force_delete(&name).await {
                warn!(instance = %name, error = %e, "Unable to delete orphaned instance");
            }
        }

        Ok(())
    }

    /// Number of timers currently armed.
    pub fn timer_count(&self) -> usize {
        self.timers.lock().expect("timer lock poisoned").len()
    }
}
