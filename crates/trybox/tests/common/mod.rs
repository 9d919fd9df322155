// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for trybox integration tests.
//!
//! Provides TestContext wiring a temp-file SQLite store, a scripted mock
//! runtime and an in-memory configuration handle.

#![allow(dead_code)]

use std::sync::Arc;

use trybox::config::{ConfigHandle, ServerConfig};
use trybox::db::{NewSession, SessionDb};
use trybox::expiry::ExpiryScheduler;
use trybox::provision::Provisioner;
use trybox::runtime::{AddressFamily, InstanceAddress, MockRuntime};
use trybox::server::AppState;

/// Default YAML used by tests; individual tests load their own when they
/// need different quotas.
pub const TEST_CONFIG: &str = r#"
image: ubuntu/22.04
quota_time: 3600
quota_sessions: 2
quota_ram: 256
server_containers_max: 4
server_statistics_keys: ["statskey"]
feedback: true
server_terms: |
  Be nice to the demo server.
"#;

/// Test context managing store, runtime and configuration.
pub struct TestContext {
    pub db: SessionDb,
    pub runtime: Arc<MockRuntime>,
    pub config: Arc<ConfigHandle>,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// New context with the default test configuration.
    pub async fn new() -> Self {
        Self::with_config(TEST_CONFIG).await
    }

    /// New context with a custom YAML configuration.
    pub async fn with_config(yaml: &str) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");

        let config_path = temp_dir.path().join("trybox.yml");
        std::fs::write(&config_path, yaml).expect("write config");
        let config = Arc::new(ConfigHandle::load(&config_path).expect("load config"));

        let db_path = temp_dir.path().join("trybox.sqlite3");
        let db = SessionDb::connect(db_path.to_str().unwrap(), 3)
            .await
            .expect("open store");

        Self {
            db,
            runtime: Arc::new(MockRuntime::new()),
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Current configuration snapshot.
    pub fn config_snapshot(&self) -> Arc<ServerConfig> {
        self.config.snapshot()
    }

    /// Terms fingerprint clients must echo.
    pub fn terms_hash(&self) -> String {
        self.config.snapshot().server_terms_hash.clone()
    }

    /// Scheduler over this context's store and runtime.
    pub fn scheduler(&self) -> Arc<ExpiryScheduler> {
        ExpiryScheduler::new(self.db.clone(), self.runtime.clone())
    }

    /// Full application state for router tests.
    pub fn app_state(&self) -> AppState {
        let scheduler = self.scheduler();
        let provisioner = Arc::new(Provisioner::new(
            self.db.clone(),
            self.runtime.clone(),
            scheduler.clone(),
        ));
        AppState {
            db: self.db.clone(),
            runtime: self.runtime.clone(),
            config: self.config.clone(),
            scheduler,
            provisioner,
        }
    }

    /// Insert a session row directly, returning its record id.
    pub async fn insert_session(&self, token: &str, instance: &str, expiry: i64) -> i64 {
        let now = chrono::Utc::now().timestamp();
        self.db
            .create(&NewSession {
                uuid: token.to_string(),
                instance_name: instance.to_string(),
                instance_ip: "10.0.3.7".to_string(),
                instance_username: "testuser".to_string(),
                instance_password: "testpass".to_string(),
                instance_expiry: expiry,
                request_date: now,
                request_ip: "192.0.2.1".to_string(),
                request_terms: self.terms_hash(),
            })
            .await
            .expect("insert session")
    }

    /// Script a routable global IPv4 address for an instance.
    pub fn give_address(&self, instance: &str, address: &str) {
        self.runtime.set_addresses(
            instance,
            vec![InstanceAddress {
                interface: "eth0".to_string(),
                family: AddressFamily::Inet,
                scope: "global".to_string(),
                address: address.to_string(),
            }],
        );
    }
}
