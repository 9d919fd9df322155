// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory runtime for tests.
//!
//! Records every call, can be scripted to fail individual operations, and
//! exposes the far end of exec streams so tests can drive a console session
//! without a real container backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};

use super::traits::{
    ContainerRuntime, CreateOptions, ExecControl, ExecRequest, ExecSession, InstanceAddress,
    Result, ResourceLimits, RuntimeError,
};

/// Far end of a mock exec, handed to the test.
pub struct MockExecHandle {
    /// Write here to produce process output.
    pub output: DuplexStream,
    /// Read here to observe process input.
    pub input: DuplexStream,
    /// Send to acknowledge a control message.
    pub acks: mpsc::Sender<()>,
    /// Resolve to mark the process as exited.
    pub done: oneshot::Sender<()>,
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl MockExecHandle {
    /// Resize requests observed so far, oldest first.
    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }
}

struct MockExecControl {
    acks: mpsc::Receiver<()>,
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
}

#[async_trait]
impl ExecControl for MockExecControl {
    async fn resize(&mut self, width: u16, height: u16) -> Result<()> {
        self.resizes.lock().unwrap().push((width, height));
        Ok(())
    }

    async fn next_ack(&mut self) -> Result<bool> {
        Ok(self.acks.recv().await.is_some())
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    instances: Vec<String>,
    deleted: Vec<String>,
    create_options: HashMap<String, CreateOptions>,
    limits: HashMap<String, ResourceLimits>,
    addresses: HashMap<String, Vec<InstanceAddress>>,
    default_addresses: Vec<InstanceAddress>,
    exec_handles: HashMap<String, MockExecHandle>,
    fail_create: bool,
    fail_configure: bool,
    fail_start: bool,
    fail_delete: bool,
    fail_exec: bool,
}

/// Scriptable in-memory [`ContainerRuntime`].
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    /// New mock with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every runtime call made so far, as `"op name"` strings.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Names passed to `force_delete`, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    /// Whether the named instance currently exists.
    pub fn instance_exists(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .instances
            .iter()
            .any(|n| n == name)
    }

    /// Seed an instance as already existing (as if left over from a crash).
    pub fn seed_instance(&self, name: &str) {
        self.state.lock().unwrap().instances.push(name.to_string());
    }

    /// Script the addresses reported for an instance.
    pub fn set_addresses(&self, name: &str, addresses: Vec<InstanceAddress>) {
        self.state
            .lock()
            .unwrap()
            .addresses
            .insert(name.to_string(), addresses);
    }

    /// Script the addresses reported for instances with no specific entry.
    pub fn set_default_addresses(&self, addresses: Vec<InstanceAddress>) {
        self.state.lock().unwrap().default_addresses = addresses;
    }

    /// Creation options recorded for an instance.
    pub fn create_options(&self, name: &str) -> Option<CreateOptions> {
        self.state.lock().unwrap().create_options.get(name).cloned()
    }

    /// Resource limits recorded for an instance.
    pub fn limits(&self, name: &str) -> Option<ResourceLimits> {
        self.state.lock().unwrap().limits.get(name).cloned()
    }

    /// Take the far end of the exec started in `name`.
    pub fn take_exec_handle(&self, name: &str) -> Option<MockExecHandle> {
        self.state.lock().unwrap().exec_handles.remove(name)
    }

    /// Make create calls fail.
    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    /// Make configure calls fail.
    pub fn fail_configure(&self, fail: bool) {
        self.state.lock().unwrap().fail_configure = fail;
    }

    /// Make start calls fail.
    pub fn fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    /// Make delete calls fail.
    pub fn fail_delete(&self, fail: bool) {
        self.state.lock().unwrap().fail_delete = fail;
    }

    /// Make exec calls fail.
    pub fn fail_exec(&self, fail: bool) {
        self.state.lock().unwrap().fail_exec = fail;
    }

    fn record(&self, op: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("{op} {name}"));
    }

    fn fail(op: &str, name: &str) -> RuntimeError {
        RuntimeError::CommandFailed {
            command: format!("mock {op} {name}"),
            stderr: "scripted failure".to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn create_from_template(
        &self,
        template: &str,
        name: &str,
        options: &CreateOptions,
    ) -> Result<()> {
        self.record("copy", name);
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(Self::fail("copy", name));
        }
        let _ = template;
        state.instances.push(name.to_string());
        state.create_options.insert(name.to_string(), options.clone());
        Ok(())
    }

    async fn create_from_image(
        &self,
        image: &str,
        name: &str,
        options: &CreateOptions,
    ) -> Result<()> {
        self.record("init", name);
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(Self::fail("init", name));
        }
        let _ = image;
        state.instances.push(name.to_string());
        state.create_options.insert(name.to_string(), options.clone());
        Ok(())
    }

    async fn configure(&self, name: &str, limits: &ResourceLimits) -> Result<()> {
        self.record("configure", name);
        let mut state = self.state.lock().unwrap();
        if state.fail_configure {
            return Err(Self::fail("configure", name));
        }
        state.limits.insert(name.to_string(), limits.clone());
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.record("start", name);
        if self.state.lock().unwrap().fail_start {
            return Err(Self::fail("start", name));
        }
        Ok(())
    }

    async fn force_delete(&self, name: &str) -> Result<()> {
        self.record("delete", name);
        let mut state = self.state.lock().unwrap();
        if state.fail_delete {
            return Err(Self::fail("delete", name));
        }
        state.instances.retain(|n| n != name);
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn addresses(&self, name: &str) -> Result<Vec<InstanceAddress>> {
        self.record("addresses", name);
        let state = self.state.lock().unwrap();
        Ok(state
            .addresses
            .get(name)
            .cloned()
            .unwrap_or_else(|| state.default_addresses.clone()))
    }

    async fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecSession> {
        self.record("exec", name);
        let mut state = self.state.lock().unwrap();
        if state.fail_exec {
            return Err(Self::fail("exec", name));
        }
        let _ = request;

        let (stdin_near, stdin_far) = tokio::io::duplex(4096);
        let (stdout_near, stdout_far) = tokio::io::duplex(4096);
        let (ack_tx, ack_rx) = mpsc::channel(8);
        let (done_tx, done_rx) = oneshot::channel();
        let resizes = Arc::new(Mutex::new(Vec::new()));

        state.exec_handles.insert(
            name.to_string(),
            MockExecHandle {
                output: stdout_far,
                input: stdin_far,
                acks: ack_tx,
                done: done_tx,
                resizes: resizes.clone(),
            },
        );

        Ok(ExecSession {
            stdin: Box::new(stdin_near),
            stdout: Box::new(stdout_near),
            control: Box::new(MockExecControl {
                acks: ack_rx,
                resizes,
            }),
            done: done_rx,
        })
    }

    async fn list_names(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .iter()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }
}
