// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trybox - Disposable Demo Container Server
//!
//! This crate provides an HTTP service that hands out short-lived demo
//! containers: visitors accept the terms of service, get a container with
//! a deadline, and interact with it through a WebSocket console. When the
//! deadline passes the container is deleted and the session archived.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Web Clients                            │
//! │                (browser UI, statistics pollers)              │
//! └──────────────────────────────────────────────────────────────┘
//!                              │ HTTP + WebSocket (/1.0)
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     trybox (This Crate)                      │
//! │  ┌───────────┐  ┌─────────────┐  ┌──────────┐  ┌─────────┐  │
//! │  │ Admission │  │ Provisioner │  │  Expiry  │  │ Console │  │
//! │  │  Control  │  │             │  │Scheduler │  │  Proxy  │  │
//! │  └───────────┘  └─────────────┘  └──────────┘  └─────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!          │                  │ create / exec / delete
//!          ▼                  ▼
//! ┌──────────────────┐  ┌────────────────────────────────────────┐
//! │     SQLite       │  │              LXD daemon                │
//! │ (sessions,       │  │        (demo instances)                │
//! │  feedback)       │  │                                        │
//! └──────────────────┘  └────────────────────────────────────────┘
//! ```
//!
//! # HTTP API (`/1.0`)
//!
//! | Endpoint | Description |
//! |----------|-------------|
//! | `GET /1.0` | Server health, capacity and client address |
//! | `GET /1.0/terms` | Terms of service text and fingerprint |
//! | `GET /1.0/start` | Request a new session |
//! | `GET /1.0/info` | Details of an active session |
//! | `GET /1.0/console` | WebSocket terminal into a session |
//! | `GET/POST /1.0/feedback` | Read or record session feedback |
//! | `GET /1.0/statistics` | Session counts for authenticated reporters |

#![deny(missing_docs)]

pub mod admission;
pub mod config;
pub mod console;
pub mod db;
pub mod error;
pub mod expiry;
pub mod migrations;
pub mod provision;
pub mod runtime;
pub mod server;

pub use config::{ConfigHandle, ServerConfig};
pub use db::SessionDb;
pub use error::{Error, Result};
pub use expiry::ExpiryScheduler;
pub use provision::{INSTANCE_PREFIX, Provisioner};
pub use server::{AppState, router};
