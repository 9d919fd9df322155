// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session provisioning: create, configure and start an instance, wait for
//! its address, register the session and arm its expiry timer.
//!
//! Any failure after the instance exists rolls it back with a force delete
//! before the error surfaces, so a failed request never leaks an instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::db::{NewSession, SessionDb};
use crate::error::Result;
use crate::expiry::ExpiryScheduler;
use crate::runtime::{AddressFamily, ContainerRuntime, CreateOptions, ResourceLimits};

/// Name prefix of every instance this server creates.
pub const INSTANCE_PREFIX: &str = "trybox-";

/// Address reported for sessions that expose no network access.
pub const CONSOLE_ONLY_ADDRESS: &str = "console-only";

/// Interfaces considered when looking for the instance address.
const ADDRESS_INTERFACES: &[&str] = &["eth0", "lxcbr0"];

/// Settle time before the first address poll.
const ADDRESS_SETTLE: Duration = Duration::from_secs(2);
/// Address poll attempts and spacing.
const ADDRESS_ATTEMPTS: u32 = 30;
const ADDRESS_INTERVAL: Duration = Duration::from_millis(500);

/// A freshly provisioned, registered session.
#[derive(Debug, Clone)]
pub struct ProvisionedSession {
    /// Opaque token handed to the client.
    pub token: String,
    /// Database record id.
    pub record_id: i64,
    /// Instance name.
    pub instance_name: String,
    /// Instance address, the console-only sentinel, or empty when the
    /// instance never reported one.
    pub address: String,
    /// Login username.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Absolute expiry, Unix seconds.
    pub expiry: i64,
}

/// Creates instances and registers their sessions.
pub struct Provisioner {
    db: SessionDb,
    runtime: Arc<dyn ContainerRuntime>,
    scheduler: Arc<ExpiryScheduler>,
}

impl Provisioner {
    /// New provisioner.
    pub fn new(
        db: SessionDb,
        runtime: Arc<dyn ContainerRuntime>,
        scheduler: Arc<ExpiryScheduler>,
    ) -> Self {
        Self {
            db,
            runtime,
            scheduler,
        }
    }

    /// Provision an instance and register a session for `request_ip`.
    pub async fn provision(
        &self,
        config: &ServerConfig,
        request_ip: &str,
    ) -> Result<ProvisionedSession> {
        let instance_name = format!("{INSTANCE_PREFIX}{}", random_suffix(10));

        match self.build(config, &instance_name, request_ip).await {
            Ok(session) => Ok(session),
            Err(e) => {
                if let Err(delete_err) = self.runtime.force_delete(&instance_name).await {
                    warn!(instance = %instance_name, error = %delete_err,
                        "Rollback delete failed");
                }
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        config: &ServerConfig,
        instance_name: &str,
        request_ip: &str,
    ) -> Result<ProvisionedSession> {
        let username = random_suffix(10);
        let password = random_suffix(10);
        let token = Uuid::new_v4().to_string();

        let mut instance_config = HashMap::new();
        instance_config.insert("security.nesting".to_string(), "true".to_string());
        if !config.server_console_only {
            instance_config.insert(
                "user.user-data".to_string(),
                cloud_init_user_data(&username, &password),
            );
        }

        let options = CreateOptions {
            config: instance_config,
            profiles: config.profiles.clone(),
        };

        if !config.container.is_empty() {
            self.runtime
                .create_from_template(&config.container, instance_name, &options)
                .await?;
        } else {
            self.runtime
                .create_from_image(&config.image, instance_name, &options)
                .await?;
        }

        let limits = ResourceLimits {
            cpu: (config.quota_cpu > 0)
                .then(|| cpu_range(config.server_cpu_count, config.quota_cpu)),
            memory_mb: (config.quota_ram > 0).then_some(config.quota_ram),
            processes: (config.quota_processes > 0).then_some(config.quota_processes),
            root_disk_gb: (config.quota_disk > 0).then_some(config.quota_disk),
        };
        self.runtime.configure(instance_name, &limits).await?;

        self.runtime.start(instance_name).await?;

        let address = if config.server_console_only {
            CONSOLE_ONLY_ADDRESS.to_string()
        } else {
            self.wait_for_address(instance_name, config.server_ipv6_only)
                .await?
        };

        let now = chrono::Utc::now().timestamp();
        let expiry = now + config.quota_time;

        let record_id = self
            .db
            .create(&NewSession {
                uuid: token.clone(),
                instance_name: instance_name.to_string(),
                instance_ip: address.clone(),
                instance_username: username.clone(),
                instance_password: password.clone(),
                instance_expiry: expiry,
                request_date: now,
                request_ip: request_ip.to_string(),
                request_terms: config.server_terms_hash.clone(),
            })
            .await?;

        self.scheduler
            .schedule(record_id, instance_name.to_string(), expiry);

        info!(session = record_id, instance = %instance_name, ip = %request_ip,
            "Session provisioned");

        Ok(ProvisionedSession {
            token,
            record_id,
            instance_name: instance_name.to_string(),
            address,
            username,
            password,
            expiry,
        })
    }

    /// Poll the runtime until the instance reports a usable address.
    ///
    /// Gives up after the attempt budget and returns an empty address; the
    /// session still registers so the client keeps its console access.
    async fn wait_for_address(&self, instance_name: &str, ipv6_only: bool) -> Result<String> {
        tokio::time::sleep(ADDRESS_SETTLE).await;

        for attempt in 0..ADDRESS_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(ADDRESS_INTERVAL).await;
            }

            let addresses = self.runtime.addresses(instance_name).await?;
            let found = addresses.into_iter().find(|addr| {
                ADDRESS_INTERFACES.contains(&addr.interface.as_str())
                    && !addr.address.is_empty()
                    && addr.scope == "global"
                    && (!ipv6_only || addr.family == AddressFamily::Inet6)
            });

            if let Some(addr) = found {
                return Ok(addr.address);
            }
        }

        warn!(instance = %instance_name, "Instance never reported an address");
        Ok(String::new())
    }
}

/// Build the cloud-init payload creating the session login account.
fn cloud_init_user_data(username: &str, password: &str) -> String {
    format!(
        r#"#cloud-config
ssh_pwauth: True
manage_etc_hosts: True
users:
 - name: {username}
   groups: sudo
   plain_text_passwd: {password}
   lock_passwd: False
   shell: /bin/bash
"#
    )
}

/// Random lowercase alphanumeric string of the given length.
fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// Pick `wanted` distinct host CPUs out of `available` for pinning.
///
/// Returns a comma-separated id list suitable for `limits.cpu`.
fn cpu_range(available: u32, wanted: u32) -> String {
    let available = available.max(1) as usize;
    let wanted = (wanted as usize).min(available);

    let mut ids = rand::seq::index::sample(&mut rand::thread_rng(), available, wanted)
        .into_iter()
        .collect::<Vec<_>>();
    ids.sort_unstable();

    ids.iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
