//! Registry of live WebSocket sessions grouped by conversion job.
//!
//! The manager never touches a socket directly. Each session hands in the
//! sending half of an unbounded channel and a writer task on the transport
//! side drains it, so fan-out is a synchronous, lock-scoped loop over
//! `DashMap` shards. Refs into one map are always released before another
//! map (or the same shard) is locked again.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::HubError;
use crate::protocol::{codes, ClientMessage, ServerMessage};
use crate::rate_limiter::{RateDecision, RateLimiter};

/// What the transport should do next with a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

pub type OutboundSender = UnboundedSender<Outbound>;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
    pub stale_timeout: Duration,
    pub rate_limit_max_messages: usize,
    pub rate_limit_window: Duration,
    pub max_connections_per_conversion: usize,
    pub history_size: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            stale_timeout: Duration::from_secs(300),
            rate_limit_max_messages: 60,
            rate_limit_window: Duration::from_secs(60),
            max_connections_per_conversion: 50,
            history_size: 20,
        }
    }
}

/// Snapshot of a session's metadata, safe to hand out over HTTP.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub client_id: String,
    pub conversion_id: String,
    pub user_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub messages_received: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub active_conversions: usize,
    pub rate_limited_clients: usize,
    pub total_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub rate_limited: u64,
    pub stale_removed: u64,
}

struct ConnectionHandle {
    info: ConnectionInfo,
    sender: OutboundSender,
    last_seen: Instant,
}

impl ConnectionHandle {
    fn mark_active(&mut self) {
        self.last_seen = Instant::now();
        self.info.last_activity = Utc::now();
    }
}

struct History {
    events: VecDeque<ServerMessage>,
    updated_at: Instant,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    rate_limited: AtomicU64,
    stale_removed: AtomicU64,
}

pub struct ConnectionManager {
    settings: ManagerSettings,
    conversions: DashMap<String, HashMap<Uuid, ConnectionHandle>>,
    index: DashMap<Uuid, String>,
    history: DashMap<String, History>,
    rate_limiter: RateLimiter,
    counters: Counters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(settings: ManagerSettings) -> Self {
        let rate_limiter =
            RateLimiter::new(settings.rate_limit_max_messages, settings.rate_limit_window);
        Self {
            settings,
            conversions: DashMap::new(),
            index: DashMap::new(),
            history: DashMap::new(),
            rate_limiter,
            counters: Counters::default(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Registers a socket for `conversion_id`, greets it and replays the
    /// job's recent history.
    pub fn connect(
        &self,
        conversion_id: &str,
        client_id: &str,
        user_id: Option<String>,
        sender: OutboundSender,
    ) -> Result<Uuid, HubError> {
        if conversion_id.trim().is_empty() {
            return Err(HubError::InvalidId("conversion_id"));
        }
        if client_id.trim().is_empty() {
            return Err(HubError::InvalidId("client_id"));
        }

        let connection_id = Uuid::new_v4();
        let now = Utc::now();
        let handle = ConnectionHandle {
            info: ConnectionInfo {
                connection_id,
                client_id: client_id.to_string(),
                conversion_id: conversion_id.to_string(),
                user_id,
                connected_at: now,
                last_activity: now,
                last_heartbeat: None,
                messages_received: 0,
            },
            sender,
            last_seen: Instant::now(),
        };

        let limit = self.settings.max_connections_per_conversion;
        let admitted = {
            let mut sockets = self.conversions.entry(conversion_id.to_string()).or_default();
            if sockets.len() >= limit {
                false
            } else {
                sockets.insert(connection_id, handle);
                true
            }
        };
        if !admitted {
            self.conversions.remove_if(conversion_id, |_, sockets| sockets.is_empty());
            warn!(conversion_id, client_id, limit, "Rejecting connection: conversion is full");
            return Err(HubError::ConversionFull {
                conversion_id: conversion_id.to_string(),
                limit,
            });
        }

        self.index.insert(connection_id, conversion_id.to_string());
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        info!(%connection_id, conversion_id, client_id, "WebSocket connected");

        let greeting = ServerMessage::ConnectionEstablished {
            connection_id,
            conversion_id: conversion_id.to_string(),
            client_id: client_id.to_string(),
            timestamp: now,
        };
        self.send_to_connection(connection_id, &greeting)?;

        let backlog: Vec<ServerMessage> = self
            .history
            .get(conversion_id)
            .map(|h| h.events.iter().cloned().collect())
            .unwrap_or_default();
        if !backlog.is_empty() {
            debug!(%connection_id, replayed = backlog.len(), "Replaying conversion history");
        }
        for message in &backlog {
            self.send_to_connection(connection_id, message)?;
        }

        Ok(connection_id)
    }

    /// Removes a session. Returns its final metadata, or `None` if it was
    /// already gone.
    pub fn disconnect(&self, connection_id: Uuid) -> Option<ConnectionInfo> {
        let (_, conversion_id) = self.index.remove(&connection_id)?;

        let (removed, now_empty) = match self.conversions.get_mut(&conversion_id) {
            Some(mut sockets) => {
                let removed = sockets.remove(&connection_id);
                (removed, sockets.is_empty())
            }
            None => (None, false),
        };
        if now_empty {
            self.conversions.remove_if(&conversion_id, |_, sockets| sockets.is_empty());
        }

        let handle = removed?;
        info!(
            %connection_id,
            conversion_id = %conversion_id,
            client_id = %handle.info.client_id,
            "WebSocket disconnected"
        );
        Some(handle.info)
    }

    pub fn send_to_connection(
        &self,
        connection_id: Uuid,
        message: &ServerMessage,
    ) -> Result<(), HubError> {
        let text = message.to_json()?;

        let conversion_id = match self.index.get(&connection_id) {
            Some(entry) => entry.value().clone(),
            None => return Err(HubError::UnknownConnection(connection_id)),
        };
        let delivered = self.conversions.get(&conversion_id).and_then(|sockets| {
            sockets
                .get(&connection_id)
                .map(|h| h.sender.send(Outbound::Text(text)).is_ok())
        });

        match delivered {
            Some(true) => {
                self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Some(false) => {
                warn!(%connection_id, "Outbound channel closed, dropping connection");
                self.disconnect(connection_id);
                Err(HubError::SendFailed(connection_id))
            }
            None => Err(HubError::UnknownConnection(connection_id)),
        }
    }

    /// Sends `message` to every socket of a job and returns how many
    /// received it. Job events are also kept for late joiners.
    pub fn broadcast_to_conversion(&self, conversion_id: &str, message: &ServerMessage) -> usize {
        if message.is_conversion_event() {
            self.record_history(conversion_id, message);
        }
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(conversion_id, error = %e, "Failed to serialize broadcast");
                return 0;
            }
        };
        let delivered = self.fan_out(conversion_id, &text);
        debug!(conversion_id, delivered, "Broadcast to conversion");
        delivered
    }

    pub fn broadcast_all(&self, message: &ServerMessage) -> usize {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to serialize broadcast");
                return 0;
            }
        };
        let conversion_ids: Vec<String> =
            self.conversions.iter().map(|e| e.key().clone()).collect();
        conversion_ids.iter().map(|id| self.fan_out(id, &text)).sum()
    }

    /// Handles one inbound text frame from a client.
    pub fn handle_client_text(&self, connection_id: Uuid, text: &str) -> Result<(), HubError> {
        let client_id = self
            .with_handle(connection_id, |handle| {
                handle.info.messages_received += 1;
                handle.info.client_id.clone()
            })
            .ok_or(HubError::UnknownConnection(connection_id))?;
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

        let decision = self.rate_limiter.check(&client_id, Instant::now());
        if let RateDecision::Denied { notify } = decision {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            if notify {
                warn!(%connection_id, client_id = %client_id, "Client exceeded message rate limit");
                let notice = ServerMessage::error(
                    codes::RATE_LIMITED,
                    format!(
                        "rate limit exceeded: at most {} messages per {}s",
                        self.settings.rate_limit_max_messages,
                        self.settings.rate_limit_window.as_secs()
                    ),
                );
                self.send_to_connection(connection_id, &notice)?;
            }
            return Err(HubError::RateLimited(client_id));
        }

        self.touch(connection_id);

        match ClientMessage::parse(text) {
            Ok(ClientMessage::Ping) => {
                self.send_to_connection(connection_id, &ServerMessage::pong())
            }
            Ok(ClientMessage::HeartbeatAck) => {
                self.with_handle(connection_id, |handle| {
                    handle.info.last_heartbeat = Some(Utc::now())
                });
                Ok(())
            }
            Ok(ClientMessage::GetStatus) => {
                let connection = self
                    .connection_info(connection_id)
                    .ok_or(HubError::UnknownConnection(connection_id))?;
                let status = ServerMessage::Status {
                    connection,
                    timestamp: Utc::now(),
                };
                self.send_to_connection(connection_id, &status)
            }
            Err(e) => {
                debug!(%connection_id, error = %e, "Unrecognized client message");
                let reply = ServerMessage::error(
                    codes::INVALID_MESSAGE,
                    format!("unrecognized message: {}", e),
                );
                self.send_to_connection(connection_id, &reply)
            }
        }
    }

    /// Marks a session as alive without counting it against the rate limit.
    pub fn touch(&self, connection_id: Uuid) -> bool {
        self.with_handle(connection_id, ConnectionHandle::mark_active).is_some()
    }

    pub fn send_heartbeats(&self) -> usize {
        self.broadcast_all(&ServerMessage::heartbeat())
    }

    /// Closes and removes every session idle for longer than the stale
    /// timeout, then prunes limiter state and orphaned history.
    pub fn sweep_stale(&self, now: Instant) -> Vec<Uuid> {
        let timeout = self.settings.stale_timeout;
        let mut stale: Vec<(Uuid, OutboundSender)> = Vec::new();
        for entry in self.conversions.iter() {
            for (id, handle) in entry.value() {
                if now.saturating_duration_since(handle.last_seen) >= timeout {
                    stale.push((*id, handle.sender.clone()));
                }
            }
        }

        let mut removed = Vec::with_capacity(stale.len());
        for (id, sender) in stale {
            let _ = sender.send(Outbound::Close);
            if self.disconnect(id).is_some() {
                info!(connection_id = %id, "Removed stale connection");
                removed.push(id);
            }
        }
        self.counters
            .stale_removed
            .fetch_add(removed.len() as u64, Ordering::Relaxed);

        let pruned = self.rate_limiter.prune(now);
        self.history.retain(|conversion_id, history| {
            self.conversions.contains_key(conversion_id)
                || now.saturating_duration_since(history.updated_at) < timeout
        });

        if !removed.is_empty() || pruned > 0 {
            debug!(stale = removed.len(), pruned_clients = pruned, "Cleanup sweep finished");
        }
        removed
    }

    pub fn connection_info(&self, connection_id: Uuid) -> Option<ConnectionInfo> {
        self.with_handle(connection_id, |handle| handle.info.clone())
    }

    pub fn conversion_connections(&self, conversion_id: &str) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .conversions
            .get(conversion_id)
            .map(|sockets| sockets.values().map(|h| h.info.clone()).collect())
            .unwrap_or_default();
        infos.sort_by_key(|info| info.connected_at);
        infos
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active_connections: self.index.len(),
            active_conversions: self.conversions.len(),
            rate_limited_clients: self.rate_limiter.tracked_clients(),
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            stale_removed: self.counters.stale_removed.load(Ordering::Relaxed),
        }
    }

    /// Spawns the heartbeat and cleanup loops. Both hold only a weak
    /// reference and exit once the manager is dropped.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !tasks.is_empty() {
            debug!("Background tasks already running");
            return;
        }

        let heartbeat_every = self.settings.heartbeat_interval;
        tasks.push(spawn_periodic(Arc::downgrade(self), heartbeat_every, |manager| {
            let reached = manager.send_heartbeats();
            debug!(reached, "Heartbeat sent");
        }));

        let cleanup_every = self.settings.cleanup_interval;
        tasks.push(spawn_periodic(Arc::downgrade(self), cleanup_every, |manager| {
            manager.sweep_stale(Instant::now());
        }));

        info!(
            heartbeat_secs = heartbeat_every.as_secs(),
            cleanup_secs = cleanup_every.as_secs(),
            "Connection manager background tasks started"
        );
    }

    pub fn is_running(&self) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.iter().any(|task| !task.is_finished())
    }

    /// Stops the background loops and asks every socket to close.
    pub fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        let ids: Vec<Uuid> = self.index.iter().map(|e| *e.key()).collect();
        for entry in self.conversions.iter() {
            for handle in entry.value().values() {
                let _ = handle.sender.send(Outbound::Close);
            }
        }
        for id in &ids {
            self.disconnect(*id);
        }
        self.history.clear();
        info!(closed = ids.len(), "Connection manager shut down");
    }

    fn fan_out(&self, conversion_id: &str, text: &str) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        if let Some(sockets) = self.conversions.get(conversion_id) {
            for (id, handle) in sockets.iter() {
                if handle.sender.send(Outbound::Text(text.to_string())).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            warn!(connection_id = %id, conversion_id, "Dropping dead connection during broadcast");
            self.disconnect(id);
        }
        self.counters
            .messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    fn record_history(&self, conversion_id: &str, message: &ServerMessage) {
        let capacity = self.settings.history_size;
        if capacity == 0 {
            return;
        }
        let mut history = self
            .history
            .entry(conversion_id.to_string())
            .or_insert_with(|| History {
                events: VecDeque::with_capacity(capacity),
                updated_at: Instant::now(),
            });
        if history.events.len() == capacity {
            history.events.pop_front();
        }
        history.events.push_back(message.clone());
        history.updated_at = Instant::now();
    }

    fn with_handle<R>(
        &self,
        connection_id: Uuid,
        f: impl FnOnce(&mut ConnectionHandle) -> R,
    ) -> Option<R> {
        let conversion_id = self.index.get(&connection_id)?.value().clone();
        let mut sockets = self.conversions.get_mut(&conversion_id)?;
        sockets.get_mut(&connection_id).map(f)
    }
}

fn spawn_periodic<F>(
    manager: Weak<ConnectionManager>,
    period: Duration,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut(&ConnectionManager) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(strong) = manager.upgrade() else {
                break;
            };
            tick(&strong);
        }
    })
}
