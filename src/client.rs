//! WebSocket sync client for connecting to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect + join, disconnect)
//! - Mutation send with ack/reject surfacing
//! - Remote event and snapshot delivery to the application
//! - Offline queue for mutations made while disconnected
//!
//! The client holds no authoritative state and runs no deduplication of its
//! own; the server decides what was applied. The application layers its
//! optimistic cache over the [`SyncEvent`] stream.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use futures_util::StreamExt;
use uuid::Uuid;

use crate::protocol::{Entity, MessageType, MutationEvent, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established and channel joined
    Connected,
    /// Connection lost
    Disconnected,
    /// Full entity state received on join
    Snapshot(Vec<Entity>),
    /// Another peer's mutation, server-stamped
    Remote(MutationEvent),
    /// The server accepted one of our mutations
    Acked(MutationEvent),
    /// The server rejected one of our mutations
    Rejected(String),
}

/// Offline queue for mutations made while disconnected.
///
/// Queued events are replayed on reconnection; the server's replay window
/// absorbs any the server already saw.
pub struct OfflineQueue {
    queue: VecDeque<MutationEvent>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an event for later replay.
    pub fn enqueue(&mut self, event: MutationEvent) -> bool {
        if self.queue.len() >= self.max_size {
            return false; // Queue full
        }
        self.queue.push_back(event);
        true
    }

    /// Drain all queued events for replay.
    pub fn drain(&mut self) -> Vec<MutationEvent> {
        self.queue.drain(..).collect()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Clear all queued events.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to the sync server, joins one channel,
/// and relays mutations and remote events.
pub struct SyncClient {
    /// Our user identity
    user: Uuid,

    /// Channel ("binder") we collaborate in
    channel: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Offline queue for disconnected mutations
    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(user: Uuid, channel: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user,
            channel: channel.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the channel.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;

        match ws_result {
            Ok((ws_stream, _)) => {
                let (mut ws_writer, mut ws_reader) = futures_util::StreamExt::split(ws_stream);

                // Outgoing message channel
                let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
                self.outgoing_tx = Some(out_tx);

                // Writer task: the sole owner of the sink half
                tokio::spawn(async move {
                    use futures_util::SinkExt;
                    while let Some(data) = out_rx.recv().await {
                        if ws_writer
                            .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });

                // Join the channel; the server answers with a snapshot
                let join_msg = SyncMessage::join(&self.channel, self.user);
                if let Ok(encoded) = join_msg.encode() {
                    if let Some(ref tx) = self.outgoing_tx {
                        let _ = tx.send(encoded).await;
                    }
                }

                *self.state.write().await = ConnectionState::Connected;
                let _ = self.event_tx.send(SyncEvent::Connected).await;

                // Replay the offline queue; the server's replay window keeps
                // retransmitted events idempotent
                {
                    let mut queue = self.offline_queue.lock().await;
                    let queued = queue.drain();
                    if !queued.is_empty() {
                        log::info!("Replaying {} queued mutations", queued.len());
                        for event in queued {
                            if let Ok(msg) = SyncMessage::mutation(&self.channel, &event) {
                                if let Ok(encoded) = msg.encode() {
                                    if let Some(ref tx) = self.outgoing_tx {
                                        let _ = tx.send(encoded).await;
                                    }
                                }
                            }
                        }
                    }
                }

                // Reader task: process incoming WebSocket messages
                let event_tx = self.event_tx.clone();
                let state = self.state.clone();
                tokio::spawn(async move {
                    while let Some(msg) = ws_reader.next().await {
                        match msg {
                            Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                                let bytes: Vec<u8> = data.into();
                                if let Ok(sync_msg) = SyncMessage::decode(&bytes) {
                                    let event = match sync_msg.msg_type {
                                        MessageType::Mutation => {
                                            sync_msg.mutation_event().ok().map(SyncEvent::Remote)
                                        }
                                        MessageType::Ack => {
                                            sync_msg.mutation_event().ok().map(SyncEvent::Acked)
                                        }
                                        MessageType::Reject => sync_msg
                                            .reject_reason()
                                            .ok()
                                            .map(SyncEvent::Rejected),
                                        MessageType::Snapshot => sync_msg
                                            .snapshot_entities()
                                            .ok()
                                            .map(SyncEvent::Snapshot),
                                        _ => None,
                                    };

                                    if let Some(evt) = event {
                                        let _ = event_tx.send(evt).await;
                                    }
                                }
                            }
                            Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                                break;
                            }
                            _ => {}
                        }
                    }

                    // Connection lost
                    *state.write().await = ConnectionState::Disconnected;
                    let _ = event_tx.send(SyncEvent::Disconnected).await;
                });

                Ok(())
            }
            Err(_e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Send a mutation event to the server.
    ///
    /// If disconnected, queues the event for later replay.
    pub async fn send_mutation(&self, event: MutationEvent) -> Result<(), ProtocolError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            // Queue for offline replay
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(event) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let msg = SyncMessage::mutation(&self.channel, &event)?;
        let encoded = msg.encode()?;

        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }

        Ok(())
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::ping(self.user);
        let encoded = msg.encode()?;

        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }

        Ok(())
    }

    /// Send a leave message before disconnecting.
    pub async fn leave(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::leave(&self.channel, self.user);
        let encoded = msg.encode()?;

        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }

        Ok(())
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Our user identity.
    pub fn user(&self) -> Uuid {
        self.user
    }

    /// The channel we collaborate in.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Get offline queue length.
    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EntityKind, EventPayload};

    #[test]
    fn test_client_creation() {
        let user = Uuid::new_v4();
        let client = SyncClient::new(user, "binder-1", "ws://localhost:9090");

        assert_eq!(client.user(), user);
        assert_eq!(client.channel(), "binder-1");
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(Uuid::new_v4(), "binder-1", "ws://localhost:9090");

        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_send_mutation_offline_queues() {
        let user = Uuid::new_v4();
        let client = SyncClient::new(user, "binder-1", "ws://localhost:9090");

        // Not connected — mutations should be queued
        let event =
            MutationEvent::add(EntityKind::Goal, "g1", user, EventPayload::named("Write"), 1);
        client.send_mutation(event).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 1);

        let event = MutationEvent::remove(EntityKind::Goal, "g1", user, 2);
        client.send_mutation(event).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);
    }

    #[test]
    fn test_offline_queue() {
        let user = Uuid::new_v4();
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);

        queue.enqueue(MutationEvent::remove(EntityKind::Goal, "a", user, 1));
        queue.enqueue(MutationEvent::remove(EntityKind::Goal, "b", user, 2));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, "a");
        assert_eq!(drained[1].id, "b");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let user = Uuid::new_v4();
        let mut queue = OfflineQueue::new(3);

        for i in 0..3 {
            assert!(queue.enqueue(MutationEvent::remove(
                EntityKind::Goal,
                format!("g{i}"),
                user,
                i
            )));
        }
        assert!(!queue.enqueue(MutationEvent::remove(EntityKind::Goal, "g3", user, 3)));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_offline_queue_clear() {
        let user = Uuid::new_v4();
        let mut queue = OfflineQueue::new(100);
        queue.enqueue(MutationEvent::remove(EntityKind::Goal, "a", user, 1));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_connection_state_values() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Connected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(Uuid::new_v4(), "binder-1", "ws://localhost:9090");

        // First take should succeed
        assert!(client.take_event_rx().is_some());
        // Second take should return None
        assert!(client.take_event_rx().is_none());
    }
}
