// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime backends.
//!
//! [`ContainerRuntime`] is the seam between session management and the
//! container layer: [`LxcRuntime`] drives a real LXD daemon, while
//! [`MockRuntime`] scripts everything in memory for tests.

mod lxc;
mod mock;
mod traits;

pub use lxc::LxcRuntime;
pub use mock::{MockExecHandle, MockRuntime};
pub use traits::{
    AddressFamily, ContainerRuntime, CreateOptions, ExecControl, ExecRequest, ExecSession,
    InstanceAddress, ResourceLimits, Result as RuntimeResult, RuntimeError,
};
