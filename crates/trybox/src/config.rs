// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server configuration loaded from a YAML file.
//!
//! The configuration is hot-reloadable: [`ConfigHandle`] keeps the current
//! parsed config behind an `RwLock<Arc<_>>`. Request handlers call
//! [`ConfigHandle::snapshot`] once and read the returned `Arc` for the
//! whole request, so a concurrent reload never races a reader. A failed
//! reload keeps the previous snapshot.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

/// Default listen address, Go-style (`:8080` means all interfaces).
const DEFAULT_SERVER_ADDR: &str = ":8080";

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// CPU core limit per instance (0 = unlimited).
    pub quota_cpu: u32,
    /// Memory ceiling per instance in MB (0 = unlimited).
    pub quota_ram: u64,
    /// Root disk size override per instance in GB (0 = no override).
    pub quota_disk: u64,
    /// Process count ceiling per instance (0 = unlimited).
    pub quota_processes: u64,
    /// Maximum concurrent sessions per requester address (0 = unlimited).
    pub quota_sessions: i64,
    /// Session lifetime in seconds.
    pub quota_time: i64,
    /// Template instance to clone. Mutually optional with `image`;
    /// at least one must be set.
    pub container: String,
    /// Image to instantiate from when no template is configured.
    pub image: String,
    /// Command executed for console sessions.
    pub command: Vec<String>,
    /// Profiles applied to created instances.
    pub profiles: Vec<String>,
    /// HTTP listen address.
    pub server_addr: String,
    /// Requester addresses refused admission outright.
    pub server_banned_ips: Vec<String>,
    /// Console-only mode: no login account, no network address exposed.
    pub server_console_only: bool,
    /// Only report IPv6 instance addresses.
    pub server_ipv6_only: bool,
    /// Number of host CPUs available for pinning.
    pub server_cpu_count: u32,
    /// Server-wide cap on concurrent active sessions.
    pub server_containers_max: i64,
    /// Maintenance mode: report the server as down in /1.0.
    pub server_maintenance: bool,
    /// Terms-of-service text presented to clients.
    pub server_terms: String,
    /// Pre-shared keys accepted by /1.0/statistics.
    pub server_statistics_keys: Vec<String>,
    /// Whether feedback collection is enabled.
    pub feedback: bool,
    /// Grace window for feedback after session expiry, in minutes.
    pub feedback_timeout: i64,
    /// Path of the SQLite database file.
    pub db_path: String,
    /// Retry budget for contended store operations (attempts at 1s backoff).
    pub db_retry_budget: u32,

    /// sha256 fingerprint of `server_terms`, derived at load time.
    #[serde(skip)]
    pub server_terms_hash: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            quota_cpu: 0,
            quota_ram: 0,
            quota_disk: 0,
            quota_processes: 0,
            quota_sessions: 0,
            quota_time: 3600,
            container: String::new(),
            image: String::new(),
            command: vec!["bash".to_string()],
            profiles: Vec::new(),
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            server_banned_ips: Vec::new(),
            server_console_only: false,
            server_ipv6_only: false,
            server_cpu_count: 1,
            server_containers_max: 0,
            server_maintenance: false,
            server_terms: String::new(),
            server_statistics_keys: Vec::new(),
            feedback: false,
            feedback_timeout: 5,
            db_path: "trybox.sqlite3".to_string(),
            db_retry_budget: 30,
            server_terms_hash: String::new(),
        }
    }
}

impl ServerConfig {
    /// Load and validate the configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let mut config: ServerConfig = serde_yaml::from_str(&data)?;
        config.finalize()?;
        Ok(config)
    }

    /// Apply defaults, derive the terms fingerprint, and validate.
    fn finalize(&mut self) -> Result<(), ConfigError> {
        if self.server_addr.is_empty() {
            self.server_addr = DEFAULT_SERVER_ADDR.to_string();
        }

        if self.server_cpu_count == 0 {
            self.server_cpu_count = 1;
        }

        if self.command.is_empty() {
            self.command = vec!["bash".to_string()];
        }

        self.server_terms = self.server_terms.trim_end_matches('\n').to_string();
        let mut hasher = Sha256::new();
        hasher.update(self.server_terms.as_bytes());
        self.server_terms_hash = format!("{:x}", hasher.finalize());

        if self.container.is_empty() && self.image.is_empty() {
            return Err(ConfigError::NoSource);
        }

        Ok(())
    }

    /// Listen address as a bindable socket address string.
    ///
    /// A bare `:port` means all interfaces.
    pub fn bind_addr(&self) -> String {
        if self.server_addr.starts_with(':') {
            format!("0.0.0.0{}", self.server_addr)
        } else {
            self.server_addr.clone()
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("The configuration file ({0}) doesn't exist")]
    NotFound(PathBuf),
    /// Reading the configuration file failed.
    #[error("Unable to read the configuration: {0}")]
    Io(#[from] std::io::Error),
    /// Parsing the configuration failed.
    #[error("Unable to parse the configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// Neither a template instance nor an image is configured.
    #[error("No container or image specified in configuration")]
    NoSource,
}

/// Shared handle to the current configuration snapshot.
pub struct ConfigHandle {
    path: PathBuf,
    current: RwLock<Arc<ServerConfig>>,
}

impl ConfigHandle {
    /// Load the configuration from `path` and wrap it in a handle.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = ServerConfig::load(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Build a handle around an already-parsed configuration (tests).
    pub fn from_config(config: ServerConfig) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Take an immutable snapshot of the current configuration.
    pub fn snapshot(&self) -> Arc<ServerConfig> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Re-read the configuration file and swap the snapshot.
    ///
    /// On failure the previous snapshot stays in place.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let config = ServerConfig::load(&self.path)?;
        *self.current.write().expect("config lock poisoned") = Arc::new(config);
        Ok(())
    }

    /// Path of the watched configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Watch the configuration file and reload the handle on modification.
///
/// The returned watcher must be kept alive for the lifetime of the server.
pub fn spawn_watcher(handle: Arc<ConfigHandle>) -> notify::Result<RecommendedWatcher> {
    let file_name = handle.path().file_name().map(|n| n.to_os_string());
    let dir = handle
        .path()
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let watch_handle = handle.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "Configuration watcher error");
                return;
            }
        };

        if !matches!(
            event.kind,
            notify::EventKind::Modify(_) | notify::EventKind::Create(_)
        ) {
            return;
        }

        let touches_config = event
            .paths
            .iter()
            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
        if !touches_config {
            return;
        }

        info!("Reloading configuration");
        if let Err(e) = watch_handle.reload() {
            warn!(error = %e, "Failed to reload configuration, keeping previous");
        }
    })?;

    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
