// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime trait and shared types.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

/// Runtime errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The named instance does not exist.
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// A runtime command exited with a failure status.
    #[error("Command failed: {command}: {stderr}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Captured standard error output.
        stderr: String,
    },

    /// Spawning or talking to the runtime failed at the OS level.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other runtime error.
    #[error("{0}")]
    Other(String),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Options applied when creating an instance.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Instance config keys set at creation time (e.g. cloud-init user data).
    pub config: HashMap<String, String>,
    /// Profiles to apply, in order.
    pub profiles: Vec<String>,
}

/// Resource ceilings applied to an instance before start.
///
/// `None`/absent means no limit for that resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    /// CPU pinning range or count, e.g. `"0-3"` or `"2"`.
    pub cpu: Option<String>,
    /// Memory ceiling in MB.
    pub memory_mb: Option<u64>,
    /// Maximum number of processes.
    pub processes: Option<u64>,
    /// Root disk size in GB.
    pub root_disk_gb: Option<u64>,
}

/// Address family of a reported instance address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4.
    Inet,
    /// IPv6.
    Inet6,
}

/// One network address reported by the runtime for an instance.
#[derive(Debug, Clone)]
pub struct InstanceAddress {
    /// Interface the address is bound to, e.g. `eth0`.
    pub interface: String,
    /// Address family.
    pub family: AddressFamily,
    /// Address scope as reported by the runtime (`global`, `link`, ...).
    pub scope: String,
    /// The address itself, without prefix length.
    pub address: String,
}

/// Parameters for an interactive exec inside an instance.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Command and arguments to run.
    pub command: Vec<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Initial terminal width in columns.
    pub width: u16,
    /// Initial terminal height in rows.
    pub height: u16,
}

/// Control channel of a running exec: window resizes and their
/// acknowledgements.
#[async_trait]
pub trait ExecControl: Send {
    /// Request a terminal resize.
    async fn resize(&mut self, width: u16, height: u16) -> Result<()>;

    /// Wait for the next control acknowledgement.
    ///
    /// Returns `false` once the control channel is closed and no further
    /// acknowledgements will arrive.
    async fn next_ack(&mut self) -> Result<bool>;
}

/// Streams of a running interactive exec.
pub struct ExecSession {
    /// Write side of the process standard input.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Read side of the process standard output.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Control channel for resizes.
    pub control: Box<dyn ExecControl + Send>,
    /// Resolves when the process has exited.
    pub done: oneshot::Receiver<()>,
}

/// A backend able to provision, inspect and reclaim instances.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short identifier of the backend, for logs.
    fn runtime_type(&self) -> &'static str;

    /// Clone `template` into a new instance named `name`.
    async fn create_from_template(
        &self,
        template: &str,
        name: &str,
        options: &CreateOptions,
    ) -> Result<()>;

    /// Initialize a new instance named `name` from `image`.
    async fn create_from_image(&self, image: &str, name: &str, options: &CreateOptions)
    -> Result<()>;

    /// Apply resource ceilings to a stopped instance.
    async fn configure(&self, name: &str, limits: &ResourceLimits) -> Result<()>;

    /// Start the instance.
    async fn start(&self, name: &str) -> Result<()>;

    /// Stop and delete the instance, discarding its state.
    ///
    /// Deleting an instance that no longer exists succeeds.
    async fn force_delete(&self, name: &str) -> Result<()>;

    /// Current network addresses of the instance.
    async fn addresses(&self, name: &str) -> Result<Vec<InstanceAddress>>;

    /// Start an interactive command inside the instance.
    async fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecSession>;

    /// Names of existing instances starting with `prefix`.
    async fn list_names(&self, prefix: &str) -> Result<Vec<String>>;
}
