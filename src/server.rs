// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Gateway Accept Loop
//!
//! Accepts gateway sockets and spawns one handler task per connection,
//! bounded by a connection semaphore.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::handler::{self, ConnectionDeps};

/// Accepts gateway connections until the listener fails permanently.
///
/// Sockets arriving while `max_connections` handlers are live are closed
/// immediately.
pub async fn serve(listener: TcpListener, deps: ConnectionDeps, max_connections: usize) {
    let slots = Arc::new(Semaphore::new(max_connections));

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };

        let permit = match slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Connection from {} rejected: at max capacity ({})",
                    peer_addr, max_connections
                );
                deps.metrics.connections_rejected.inc();
                drop(stream);
                continue;
            }
        };

        let _ = stream.set_nodelay(true);
        let deps = deps.clone();
        tokio::spawn(async move {
            // Slot is held until the handler returns.
            let _permit = permit;
            let reason = handler::handle_connection(stream, Some(peer_addr), deps).await;
            debug!("Connection from {} closed: {:?}", peer_addr, reason);
        });
    }
}
