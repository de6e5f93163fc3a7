// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Registry
//!
//! Tracks every live gateway connection and which owner it belongs to.
//!
//! - Connections start provisional and are indexed under an owner once the
//!   injected [`TokenValidator`] accepts their token.
//! - One owner may run several gateways at once; commands fan out to all of
//!   them.
//! - Published device data is cached per `(owner, device)`. The cache lives
//!   only while the owner has at least one live connection.
//!
//! Each connection task holds the receiving end of an mpsc channel; the
//! registry keeps the sender and pushes outbound envelopes through it.
//! Device updates are announced on a broadcast channel of [`OwnerEvent`]s.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::envelope::{Action, Envelope, TopicKind};
use crate::validator::{TokenValidator, ValidationError};

/// Registry-assigned connection identity.
pub type ConnectionId = u64;

/// Outbound queue depth per connection.
const OUTBOUND_CAPACITY: usize = 64;

/// Owner event backlog before slow subscribers start lagging.
const EVENT_CAPACITY: usize = 256;

/// Error type for registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is not authenticated")]
    NotAuthenticated(ConnectionId),

    #[error("token rejected: {0}")]
    Rejected(#[from] ValidationError),

    #[error("no live connection for owner")]
    NoLiveConnection,
}

/// Announcements for the fulfillment layer.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnerEvent {
    /// First connection for an owner was authenticated.
    OwnerOnline { owner_id: String },
    /// Last connection for an owner closed; its device cache is gone.
    OwnerOffline { owner_id: String },
    DeviceList {
        owner_id: String,
        device: String,
        devices: Value,
    },
    DeviceExposes {
        owner_id: String,
        device: String,
        exposes: Value,
    },
    DeviceStatus {
        owner_id: String,
        device: String,
        status: Value,
    },
    DeviceState {
        owner_id: String,
        device: String,
        topic: String,
        state: Value,
    },
    /// Envelope outside the cached device families, passed on verbatim.
    Message { owner_id: String, envelope: Envelope },
}

/// Last-seen data for one device of one owner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceRecord {
    pub list: Option<Value>,
    pub exposes: Option<Value>,
    pub status: Option<Value>,
    /// State payloads by full topic.
    pub state: HashMap<String, Value>,
}

/// Snapshot of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: Option<SocketAddr>,
    pub unique_id: Option<String>,
    pub owner_id: Option<String>,
}

struct ConnectionEntry {
    peer_addr: Option<SocketAddr>,
    unique_id: Option<String>,
    owner_id: Option<String>,
    outbound: mpsc::Sender<Envelope>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    owners: HashMap<String, HashSet<ConnectionId>>,
    devices: HashMap<String, HashMap<String, DeviceRecord>>,
}

/// Thread-safe registry of gateway connections.
pub struct ConnectionRegistry {
    validator: Arc<dyn TokenValidator>,
    default_subscriptions: Vec<String>,
    next_id: AtomicU64,
    state: RwLock<RegistryState>,
    events: broadcast::Sender<OwnerEvent>,
}

impl ConnectionRegistry {
    /// Creates an empty registry. `default_subscriptions` are sent to every
    /// gateway right after it is authorized.
    pub fn new(validator: Arc<dyn TokenValidator>, default_subscriptions: Vec<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        ConnectionRegistry {
            validator,
            default_subscriptions,
            next_id: AtomicU64::new(1),
            state: RwLock::new(RegistryState::default()),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribes to owner-scoped device announcements.
    pub fn subscribe(&self) -> broadcast::Receiver<OwnerEvent> {
        self.events.subscribe()
    }

    /// Tracks a new, unauthenticated connection. Returns its id and the
    /// receiving end of its outbound queue.
    pub fn accept(
        &self,
        peer_addr: Option<SocketAddr>,
    ) -> (ConnectionId, mpsc::Receiver<Envelope>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.write().connections.insert(
            id,
            ConnectionEntry {
                peer_addr,
                unique_id: None,
                owner_id: None,
                outbound: tx,
            },
        );
        (id, rx)
    }

    /// Validates `token` and, on success, binds the connection to the owner
    /// and queues the default subscriptions.
    ///
    /// The validator runs without the registry lock held. If the connection
    /// closed in the meantime, nothing is indexed.
    pub async fn authorize(
        &self,
        id: ConnectionId,
        unique_id: &str,
        token: &str,
    ) -> Result<String, RegistryError> {
        let known = self.read().connections.contains_key(&id);
        if !known {
            return Err(RegistryError::UnknownConnection(id));
        }

        let owner_id = self.validator.validate(token).await?;

        let first_for_owner = {
            let mut state = self.write();
            let entry = state
                .connections
                .get_mut(&id)
                .ok_or(RegistryError::UnknownConnection(id))?;
            entry.unique_id = Some(unique_id.to_string());
            entry.owner_id = Some(owner_id.clone());
            for topic in &self.default_subscriptions {
                let _ = entry.outbound.try_send(Envelope::subscribe(topic.clone()));
            }

            let set = state.owners.entry(owner_id.clone()).or_default();
            set.insert(id);
            set.len() == 1
        };

        debug!("Connection {} bound to owner {}", id, owner_id);
        if first_for_owner {
            let _ = self.events.send(OwnerEvent::OwnerOnline {
                owner_id: owner_id.clone(),
            });
        }
        Ok(owner_id)
    }

    /// Routes a decrypted envelope from an authenticated connection into the
    /// owner's device cache.
    pub fn handle_message(
        &self,
        id: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), RegistryError> {
        let owner_id = self
            .read()
            .connections
            .get(&id)
            .ok_or(RegistryError::UnknownConnection(id))?
            .owner_id
            .clone()
            .ok_or(RegistryError::NotAuthenticated(id))?;

        let kind = envelope.kind();
        let cacheable = envelope.action == Action::Publish && envelope.message.is_some();
        let device = match kind.device() {
            Some(device) if cacheable => device.to_string(),
            _ => {
                debug!(
                    "Connection {} sent uncached {:?} on {}",
                    id, envelope.action, envelope.topic
                );
                let _ = self.events.send(OwnerEvent::Message { owner_id, envelope });
                return Ok(());
            }
        };
        let Some(message) = envelope.message else {
            return Ok(());
        };

        let event = {
            let mut state = self.write();
            let record = state
                .devices
                .entry(owner_id.clone())
                .or_default()
                .entry(device.clone())
                .or_default();
            match kind {
                TopicKind::DeviceList { .. } => {
                    record.list = Some(message.clone());
                    OwnerEvent::DeviceList {
                        owner_id,
                        device,
                        devices: message,
                    }
                }
                TopicKind::DeviceExposes { .. } => {
                    record.exposes = Some(message.clone());
                    OwnerEvent::DeviceExposes {
                        owner_id,
                        device,
                        exposes: message,
                    }
                }
                TopicKind::DeviceStatus { .. } => {
                    record.status = Some(message.clone());
                    OwnerEvent::DeviceStatus {
                        owner_id,
                        device,
                        status: message,
                    }
                }
                _ => {
                    record.state.insert(envelope.topic.clone(), message.clone());
                    OwnerEvent::DeviceState {
                        owner_id,
                        device,
                        topic: envelope.topic,
                        state: message,
                    }
                }
            }
        };

        let _ = self.events.send(event);
        Ok(())
    }

    /// Forgets a connection. Safe to call more than once; only the first call
    /// has any effect. Returns true if the connection was registered.
    ///
    /// When the owner's last connection goes away its device cache is purged.
    pub fn release(&self, id: ConnectionId) -> bool {
        let offline_owner = {
            let mut state = self.write();
            let Some(entry) = state.connections.remove(&id) else {
                return false;
            };
            match entry.owner_id {
                Some(owner_id) => {
                    let now_empty = match state.owners.get_mut(&owner_id) {
                        Some(set) => {
                            set.remove(&id);
                            set.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        state.owners.remove(&owner_id);
                        state.devices.remove(&owner_id);
                        Some(owner_id)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(owner_id) = offline_owner {
            info!("Last gateway for an owner disconnected, device cache purged");
            let _ = self.events.send(OwnerEvent::OwnerOffline { owner_id });
        }
        true
    }

    /// Queues `envelope` for every live connection of `owner_id`. Returns the
    /// number of connections it was queued on.
    pub fn broadcast(&self, owner_id: &str, envelope: &Envelope) -> usize {
        let state = self.read();
        let Some(ids) = state.owners.get(owner_id) else {
            return 0;
        };
        ids.iter()
            .filter_map(|id| state.connections.get(id))
            .filter(|entry| entry.outbound.try_send(envelope.clone()).is_ok())
            .count()
    }

    /// Publishes a command to an owner's devices through every live gateway.
    pub fn send_command(
        &self,
        owner_id: &str,
        topic: &str,
        payload: Value,
    ) -> Result<usize, RegistryError> {
        match self.broadcast(owner_id, &Envelope::publish(topic, payload)) {
            0 => Err(RegistryError::NoLiveConnection),
            delivered => Ok(delivered),
        }
    }

    /// Number of tracked connections, authenticated or not.
    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    /// Number of owners with at least one live connection.
    pub fn owner_count(&self) -> usize {
        self.read().owners.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.read().connections.get(&id).map(|entry| ConnectionInfo {
            id,
            peer_addr: entry.peer_addr,
            unique_id: entry.unique_id.clone(),
            owner_id: entry.owner_id.clone(),
        })
    }

    /// Connection ids currently bound to `owner_id`.
    pub fn owner_connections(&self, owner_id: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .read()
            .owners
            .get(owner_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Peer-declared unique ids of the owner's live gateways.
    pub fn owner_gateways(&self, owner_id: &str) -> Vec<String> {
        let state = self.read();
        let mut gateways: Vec<String> = state
            .owners
            .get(owner_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.connections.get(id)?.unique_id.clone())
            .collect();
        gateways.sort();
        gateways
    }

    pub fn device(&self, owner_id: &str, device: &str) -> Option<DeviceRecord> {
        self.read().devices.get(owner_id)?.get(device).cloned()
    }

    /// All cached devices of an owner.
    pub fn devices(&self, owner_id: &str) -> HashMap<String, DeviceRecord> {
        self.read()
            .devices
            .get(owner_id)
            .cloned()
            .unwrap_or_default()
    }
}
