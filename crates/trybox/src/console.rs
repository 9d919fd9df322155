// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Console bridging between a WebSocket client and an instance exec.
//!
//! Text frames carry the terminal byte stream in both directions. Binary
//! frames from the client are ignored. The bridge runs until the process
//! exits or the client goes away, whichever happens first.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::runtime::ExecSession;

/// Pump bytes between the socket and the exec until either side ends.
///
/// The control loop keeps re-asserting the terminal geometry: it sends a
/// resize for the current dimensions, waits for the acknowledgement, and
/// repeats until the control channel closes.
pub async fn run_console(socket: WebSocket, exec: ExecSession, width: u16, height: u16) {
    let ExecSession {
        mut stdin,
        mut stdout,
        mut control,
        done,
    } = exec;

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Process output to the client. Output is treated as UTF-8 text; the
    // occasional split multibyte sequence degrades to a replacement char.
    let out_task = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Client keystrokes to the process.
    let mut in_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_rx.next().await {
            match message {
                Message::Text(text) => {
                    if stdin.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                // Binary frames are not part of the console protocol.
                Message::Binary(_) => {}
                _ => {}
            }
        }
    });

    // Re-assert the terminal geometry until the channel closes.
    let ctrl_task = tokio::spawn(async move {
        loop {
            if control.resize(width, height).await.is_err() {
                break;
            }
            if !matches!(control.next_ack().await, Ok(true)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = done => debug!("Console process exited"),
        _ = &mut in_task => debug!("Console client disconnected"),
    }

    out_task.abort();
    in_task.abort();
    ctrl_task.abort();
}
