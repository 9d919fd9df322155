// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! LXC-backed runtime driving the `lxc` client binary.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::traits::{
    AddressFamily, ContainerRuntime, CreateOptions, ExecControl, ExecRequest, ExecSession,
    InstanceAddress, Result, ResourceLimits, RuntimeError,
};

/// Runtime backed by the local LXD daemon through the `lxc` CLI.
#[derive(Debug, Default, Clone)]
pub struct LxcRuntime;

impl LxcRuntime {
    /// New runtime talking to the default local remote.
    pub fn new() -> Self {
        Self
    }

    /// Run `lxc` with the given arguments, failing on a non-zero exit.
    async fn run(&self, args: &[String]) -> Result<std::process::Output> {
        let output = Command::new("lxc").args(args).output().await?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("lxc {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    fn create_args(base: Vec<String>, options: &CreateOptions) -> Vec<String> {
        let mut args = base;
        for (key, value) in &options.config {
            args.push("-c".to_string());
            args.push(format!("{key}={value}"));
        }
        for profile in &options.profiles {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        args
    }
}

struct LxcExecControl {
    // Held open by the child-wait task; recv resolves to None on exit.
    exited: mpsc::Receiver<()>,
}

#[async_trait]
impl ExecControl for LxcExecControl {
    async fn resize(&mut self, width: u16, height: u16) -> Result<()> {
        // The CLI offers no resize channel for a piped exec.
        debug!(width, height, "Ignoring resize for piped exec");
        Ok(())
    }

    async fn next_ack(&mut self) -> Result<bool> {
        Ok(self.exited.recv().await.is_some())
    }
}

#[async_trait]
impl ContainerRuntime for LxcRuntime {
    fn runtime_type(&self) -> &'static str {
        "lxc"
    }

    async fn create_from_template(
        &self,
        template: &str,
        name: &str,
        options: &CreateOptions,
    ) -> Result<()> {
        let args = Self::create_args(
            vec![
                "copy".to_string(),
                template.to_string(),
                name.to_string(),
                "--instance-only".to_string(),
            ],
            options,
        );
        self.run(&args).await?;
        Ok(())
    }

    async fn create_from_image(
        &self,
        image: &str,
        name: &str,
        options: &CreateOptions,
    ) -> Result<()> {
        let args = Self::create_args(
            vec!["init".to_string(), image.to_string(), name.to_string()],
            options,
        );
        self.run(&args).await?;
        Ok(())
    }

    async fn configure(&self, name: &str, limits: &ResourceLimits) -> Result<()> {
        let mut config = Vec::new();
        if let Some(cpu) = &limits.cpu {
            config.push(("limits.cpu", cpu.clone()));
        }
        if let Some(memory_mb) = limits.memory_mb {
            config.push(("limits.memory", format!("{memory_mb}MB")));
        }
        if let Some(processes) = limits.processes {
            config.push(("limits.processes", processes.to_string()));
        }

        for (key, value) in config {
            self.run(&[
                "config".to_string(),
                "set".to_string(),
                name.to_string(),
                key.to_string(),
                value,
            ])
            .await?;
        }

        if let Some(disk_gb) = limits.root_disk_gb {
            let size = format!("size={disk_gb}GB");
            // Override fails when the instance already carries a local root
            // device (template clones do); set on the device directly then.
            let override_args = vec![
                "config".to_string(),
                "device".to_string(),
                "override".to_string(),
                name.to_string(),
                "root".to_string(),
                size.clone(),
            ];
            if self.run(&override_args).await.is_err() {
                self.run(&[
                    "config".to_string(),
                    "device".to_string(),
                    "set".to_string(),
                    name.to_string(),
                    "root".to_string(),
                    size,
                ])
                .await?;
            }
        }

        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run(&["start".to_string(), name.to_string()]).await?;
        Ok(())
    }

    async fn force_delete(&self, name: &str) -> Result<()> {
        let result = self
            .run(&[
                "delete".to_string(),
                name.to_string(),
                "--force".to_string(),
            ])
            .await;

        match result {
            Ok(_) => Ok(()),
            // Already gone is the outcome we wanted.
            Err(RuntimeError::CommandFailed { stderr, .. })
                if stderr.to_lowercase().contains("not found") =>
            {
                debug!(instance = %name, "Instance already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn addresses(&self, name: &str) -> Result<Vec<InstanceAddress>> {
        let output = self
            .run(&[
                "list".to_string(),
                format!("^{name}$"),
                "--format".to_string(),
                "json".to_string(),
            ])
            .await?;

        let listed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| RuntimeError::Other(format!("Unparseable instance listing: {e}")))?;

        let Some(instance) = listed
            .as_array()
            .and_then(|items| items.iter().find(|i| i["name"] == name))
        else {
            return Err(RuntimeError::NotFound(name.to_string()));
        };

        let mut addresses = Vec::new();
        let Some(networks) = instance["state"]["network"].as_object() else {
            return Ok(addresses);
        };

        for (interface, network) in networks {
            let Some(entries) = network["addresses"].as_array() else {
                continue;
            };
            for entry in entries {
                let family = match entry["family"].as_str() {
                    Some("inet") => AddressFamily::Inet,
                    Some("inet6") => AddressFamily::Inet6,
                    _ => continue,
                };
                let Some(address) = entry["address"].as_str() else {
                    continue;
                };
                addresses.push(InstanceAddress {
                    interface: interface.clone(),
                    family,
                    scope: entry["scope"].as_str().unwrap_or_default().to_string(),
                    address: address.to_string(),
                });
            }
        }

        Ok(addresses)
    }

    async fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecSession> {
        let mut args = vec!["exec".to_string(), name.to_string()];

        let mut env: HashMap<String, String> = request.env.clone();
        env.entry("TERM".to_string())
            .or_insert_with(|| "xterm".to_string());
        env.insert("COLUMNS".to_string(), request.width.to_string());
        env.insert("LINES".to_string(), request.height.to_string());
        for (key, value) in &env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push("--force-interactive".to_string());
        args.push("--".to_string());
        args.extend(request.command.iter().cloned());

        let mut child = Command::new("lxc")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Other("Exec child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Other("Exec child has no stdout".to_string()))?;

        let (done_tx, done_rx) = oneshot::channel();
        let (exit_guard, exited) = mpsc::channel::<()>(1);
        let instance = name.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(instance = %instance, status = %status, "Exec finished"),
                Err(e) => warn!(instance = %instance, error = %e, "Waiting for exec failed"),
            }
            drop(exit_guard);
            let _ = done_tx.send(());
        });

        Ok(ExecSession {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            control: Box::new(LxcExecControl { exited }),
            done: done_rx,
        })
    }

    async fn list_names(&self, prefix: &str) -> Result<Vec<String>> {
        let output = self
            .run(&["list".to_string(), "--format".to_string(), "json".to_string()])
            .await?;

        let listed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| RuntimeError::Other(format!("Unparseable instance listing: {e}")))?;

        Ok(listed
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i["name"].as_str())
                    .filter(|n| n.starts_with(prefix))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}
