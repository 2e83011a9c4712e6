//! Connection manager: a bounded pool of per-conversation connections
//!
//! The pool map is the only shared mutable state and sits behind one
//! async mutex. Public operations and background task callbacks all take
//! that lock, mutate, collect the resulting events, and dispatch them to
//! subscribers before releasing it, so events for one conversation are
//! published in the order they happened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chat_shared::codec;
use chat_shared::{defaults, ChatMessage, ConnectionState, OutboundFrame, OutboundPayload};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::dedup::SeenIds;
use super::error::ConnectionError;
use super::events::{ConnectionEvent, EventStream, PoolStats, StatusSnapshot};
use super::link::{Connection, TimerKind};
use crate::auth::{StaticToken, TokenProvider};
use crate::config::ManagerConfig;
use crate::history::HistoryClient;
use crate::transport::{
    SocketEvent, TransportConnector, TransportError, TransportSocket, WebSocketConnector,
};

/// State shared between the manager handle and its background tasks
pub(crate) struct Shared {
    pub(crate) me: Weak<Shared>,
    pub(crate) config: ManagerConfig,
    pub(crate) connector: Arc<dyn TransportConnector>,
    pub(crate) tokens: Arc<dyn TokenProvider>,
    epochs: AtomicU64,
    pool: Mutex<Pool>,
}

struct Pool {
    entries: HashMap<String, Connection>,
    /// Seen message ids per conversation, kept across reconnects and evictions
    seen: HashMap<String, TrackedIds>,
    seen_capacity: usize,
    /// Conversations with a seen-id set; pooled ones are never forgotten
    max_tracked: usize,
    active: Option<String>,
    subscribers: Vec<mpsc::UnboundedSender<ConnectionEvent>>,
    /// Logical clock for creation and activation order
    clock: u64,
    shut_down: bool,
}

struct TrackedIds {
    ids: SeenIds,
    touched: u64,
}

impl Shared {
    pub(crate) fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) async fn on_connect_result(
        &self,
        id: &str,
        epoch: u64,
        result: Result<TransportSocket, TransportError>,
    ) {
        let mut pool = self.pool.lock().await;
        let mut out = Vec::new();
        match pool.current(id, epoch) {
            Some(conn) => conn.on_connect_result(self, result, &mut out),
            None => {
                debug!("[POOL] {} dropping stale open result", id);
                if let Ok(socket) = result {
                    socket.close(defaults::NORMAL_CLOSURE, "superseded");
                }
            }
        }
        pool.dispatch(out);
    }

    pub(crate) async fn on_socket_event(&self, id: &str, epoch: u64, event: SocketEvent) {
        let mut pool = self.pool.lock().await;
        let mut out = Vec::new();
        match pool.current(id, epoch) {
            Some(conn) => conn.on_socket_event(self, event, &mut out),
            None => debug!("[POOL] {} dropping stale socket event", id),
        }
        pool.dispatch(out);
    }

    pub(crate) async fn on_timer(&self, id: &str, epoch: u64, timer: TimerKind) {
        let mut pool = self.pool.lock().await;
        let mut out = Vec::new();
        match pool.current(id, epoch) {
            Some(conn) => conn.on_timer(self, timer, &mut out),
            None => debug!("[POOL] {} dropping stale {:?} timer", id, timer),
        }
        pool.dispatch(out);
    }
}

impl Pool {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Connection for `id` if it is still the one that spawned `epoch`
    fn current(&mut self, id: &str, epoch: u64) -> Option<&mut Connection> {
        self.entries.get_mut(id).filter(|conn| conn.epoch() == epoch)
    }

    /// Entry to evict to make room for `keep`: the oldest non-open entry,
    /// else the least recently activated open one
    fn eviction_candidate(&self, keep: &str) -> Option<String> {
        let others = || self.entries.iter().filter(|(id, _)| id.as_str() != keep);

        others()
            .filter(|(_, conn)| !conn.is_open())
            .min_by_key(|(_, conn)| conn.created_seq)
            .or_else(|| others().min_by_key(|(_, conn)| conn.activated_seq))
            .map(|(id, _)| id.clone())
    }

    fn remove(&mut self, shared: &Shared, id: &str, out: &mut Vec<ConnectionEvent>) -> bool {
        let Some(mut conn) = self.entries.remove(id) else {
            return false;
        };
        conn.disconnect(shared, out);
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
        true
    }

    fn mark_seen(&mut self, id: &str, message_id: &str) -> bool {
        let now = self.tick();
        if !self.seen.contains_key(id) {
            self.forget_idle_conversations();
        }

        let capacity = self.seen_capacity;
        let tracked = self.seen.entry(id.to_owned()).or_insert_with(|| TrackedIds {
            ids: SeenIds::new(capacity),
            touched: now,
        });
        tracked.touched = now;
        tracked.ids.insert(message_id)
    }

    /// Make room for one more seen-id set by dropping the least recently
    /// touched sets of conversations that are not pooled
    fn forget_idle_conversations(&mut self) {
        while self.seen.len() >= self.max_tracked {
            let Some(idle) = self
                .seen
                .iter()
                .filter(|(id, _)| !self.entries.contains_key(id.as_str()))
                .min_by_key(|(_, tracked)| tracked.touched)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            debug!("[POOL] forgetting seen ids of {}", idle);
            self.seen.remove(&idle);
        }
    }

    /// Publish events in order, dropping duplicate messages and
    /// subscribers that have gone away
    fn dispatch(&mut self, events: Vec<ConnectionEvent>) {
        for event in events {
            if let ConnectionEvent::Message {
                conversation_id,
                message,
            } = &event
            {
                if !self.mark_seen(conversation_id, &message.id) {
                    debug!(
                        "[POOL] {} suppressing duplicate message {}",
                        conversation_id, message.id
                    );
                    continue;
                }
            }
            self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

/// Owns every realtime connection of the client.
///
/// Cloning gives another handle to the same pool. Dropping the last
/// handle aborts every timer and closes every socket.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

/// Handle to one pooled conversation
#[derive(Clone)]
pub struct ConnectionHandle {
    id: String,
    shared: Weak<Shared>,
}

impl ConnectionHandle {
    pub fn conversation_id(&self) -> &str {
        &self.id
    }

    fn manager(&self) -> Option<ConnectionManager> {
        self.shared
            .upgrade()
            .map(|shared| ConnectionManager { shared })
    }

    pub async fn send(&self, payload: impl Into<OutboundPayload>) -> Result<bool, ConnectionError> {
        match self.manager() {
            Some(manager) => manager.send(&self.id, payload).await,
            None => Err(ConnectionError::ShutDown),
        }
    }

    pub async fn status(&self) -> StatusSnapshot {
        match self.manager() {
            Some(manager) => manager.status(&self.id).await,
            None => StatusSnapshot::default(),
        }
    }

    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        match self.manager() {
            Some(manager) => manager.disconnect(&self.id).await,
            None => Err(ConnectionError::ShutDown),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").field("id", &self.id).finish()
    }
}

impl ConnectionManager {
    /// Create a manager over any transport and token source
    pub fn new(
        config: ManagerConfig,
        connector: Arc<dyn TransportConnector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let seen_capacity = config.seen_ids_capacity;
        let max_tracked = config.max_tracked_conversations.max(1);
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            config,
            connector,
            tokens,
            epochs: AtomicU64::new(0),
            pool: Mutex::new(Pool {
                entries: HashMap::new(),
                seen: HashMap::new(),
                seen_capacity,
                max_tracked,
                active: None,
                subscribers: Vec::new(),
                clock: 0,
                shut_down: false,
            }),
        });
        Self { shared }
    }

    /// WebSocket transport with the configured static token
    pub fn websocket(config: ManagerConfig) -> Self {
        let connector = Arc::new(WebSocketConnector::new(config.connect_timeout()));
        let tokens = Arc::new(StaticToken(config.token.clone()));
        Self::new(config, connector, tokens)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Connect to a conversation and make it the active one.
    ///
    /// Returns at once; watch events or `status` for the socket opening.
    /// An entry that is open or connecting is left untouched, one that is
    /// reconnecting or closed starts over from zero attempts. A new entry
    /// evicts another when the pool is full.
    pub async fn connect(&self, conversation_id: &str) -> Result<ConnectionHandle, ConnectionError> {
        let shared = &*self.shared;
        let mut pool = shared.pool.lock().await;
        if pool.shut_down {
            return Err(ConnectionError::ShutDown);
        }

        let mut out = Vec::new();
        let seq = pool.tick();

        if let Some(conn) = pool.entries.get_mut(conversation_id) {
            if matches!(conn.state(), ConnectionState::Open | ConnectionState::Connecting) {
                debug!("[POOL] {} already {}, reusing", conversation_id, conn.state());
            } else {
                conn.restart(shared, &mut out);
            }
            conn.activated_seq = seq;
        } else {
            while pool.entries.len() >= shared.config.pool_capacity() {
                let Some(victim) = pool.eviction_candidate(conversation_id) else {
                    break;
                };
                info!("[POOL] evicting {} to make room for {}", victim, conversation_id);
                pool.remove(shared, &victim, &mut out);
            }

            let mut conn = Connection::new(conversation_id, shared, seq);
            conn.start(shared, &mut out);
            pool.entries.insert(conversation_id.to_owned(), conn);
            info!(
                "[POOL] {} added ({}/{})",
                conversation_id,
                pool.entries.len(),
                shared.config.pool_capacity()
            );
        }

        pool.active = Some(conversation_id.to_owned());
        pool.dispatch(out);

        Ok(ConnectionHandle {
            id: conversation_id.to_owned(),
            shared: shared.me.clone(),
        })
    }

    /// Close a conversation's connection and drop it from the pool.
    /// No-op for unknown ids.
    pub async fn disconnect(&self, conversation_id: &str) -> Result<(), ConnectionError> {
        let mut pool = self.shared.pool.lock().await;
        if pool.shut_down {
            return Err(ConnectionError::ShutDown);
        }

        let mut out = Vec::new();
        if pool.remove(&self.shared, conversation_id, &mut out) {
            info!("[POOL] {} removed ({} left)", conversation_id, pool.entries.len());
        }
        pool.dispatch(out);
        Ok(())
    }

    /// Send a payload. `Ok(true)` if written to an open socket, `Ok(false)`
    /// if queued until the connection opens.
    pub async fn send(
        &self,
        conversation_id: &str,
        payload: impl Into<OutboundPayload>,
    ) -> Result<bool, ConnectionError> {
        let line = codec::encode(&OutboundFrame::from(payload.into()))?;

        let mut pool = self.shared.pool.lock().await;
        if pool.shut_down {
            return Err(ConnectionError::ShutDown);
        }
        pool.entries
            .get_mut(conversation_id)
            .ok_or_else(|| ConnectionError::UnknownConversation(conversation_id.to_owned()))?
            .send(line)
    }

    /// True iff the conversation has an open socket
    pub async fn has_connection(&self, conversation_id: &str) -> bool {
        let pool = self.shared.pool.lock().await;
        pool.entries
            .get(conversation_id)
            .is_some_and(|conn| conn.is_open())
    }

    /// Snapshot of one conversation; the zero snapshot if it is not pooled
    pub async fn status(&self, conversation_id: &str) -> StatusSnapshot {
        let pool = self.shared.pool.lock().await;
        pool.entries
            .get(conversation_id)
            .map(Connection::snapshot)
            .unwrap_or_default()
    }

    /// Snapshot of the active conversation, or the zero snapshot
    pub async fn active_status(&self) -> StatusSnapshot {
        let pool = self.shared.pool.lock().await;
        pool.active
            .as_deref()
            .and_then(|id| pool.entries.get(id))
            .map(Connection::snapshot)
            .unwrap_or_default()
    }

    pub async fn active_conversation(&self) -> Option<String> {
        self.shared.pool.lock().await.active.clone()
    }

    pub async fn stats(&self) -> PoolStats {
        let pool = self.shared.pool.lock().await;
        let mut entries: Vec<&Connection> = pool.entries.values().collect();
        entries.sort_by_key(|conn| conn.created_seq);

        let connections: Vec<_> = entries.into_iter().map(Connection::stats).collect();
        PoolStats {
            total: connections.len(),
            open: connections.iter().filter(|c| c.is_open).count(),
            connections,
        }
    }

    /// Receive every event from every connection
    pub async fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pool = self.shared.pool.lock().await;
        if !pool.shut_down {
            pool.subscribers.push(tx);
        }
        rx
    }

    /// Remember message ids as delivered so the socket will not deliver
    /// them again. Returns how many were new.
    pub async fn mark_seen<I, S>(&self, conversation_id: &str, message_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pool = self.shared.pool.lock().await;
        message_ids
            .into_iter()
            .filter(|id| pool.mark_seen(conversation_id, id.as_ref()))
            .count()
    }

    /// Fetch stored history for a conversation and mark it as seen
    pub async fn seed_history(
        &self,
        conversation_id: &str,
        client: &dyn HistoryClient,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        if self.shared.pool.lock().await.shut_down {
            return Err(ConnectionError::ShutDown.into());
        }

        let messages = client.fetch_messages(conversation_id).await?;
        let fresh = self
            .mark_seen(conversation_id, messages.iter().map(|m| m.id.as_str()))
            .await;
        info!(
            "[POOL] {} seeded with {} messages ({} new ids)",
            conversation_id,
            messages.len(),
            fresh
        );
        Ok(messages)
    }

    /// Disconnect everything and refuse further work
    pub async fn shutdown(&self) {
        let shared = &*self.shared;
        let mut pool = shared.pool.lock().await;
        if pool.shut_down {
            return;
        }

        let mut entries: Vec<Connection> = pool.entries.drain().map(|(_, conn)| conn).collect();
        entries.sort_by_key(|conn| conn.created_seq);

        let mut out = Vec::new();
        for conn in entries.iter_mut() {
            conn.disconnect(shared, &mut out);
        }
        pool.active = None;
        pool.dispatch(out);

        pool.shut_down = true;
        pool.subscribers.clear();
        info!("[POOL] shut down ({} connections closed)", entries.len());
    }
}
