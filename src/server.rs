//! WebSocket sync server with channel-based entity routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Channel (binder) ── EntityStores ── BroadcastGroup
//! Client B ──┘          │
//!                       ├── DedupWindow (replay suppression)
//!                       ├── RecordStore (RocksDB, optional)
//!                       │
//!            ┌──────────┼───────────┐
//!            ▼          ▼           ▼
//!         Client A   Client B    Client C
//! ```
//!
//! Each connection runs a `select!` loop over its WebSocket stream and its
//! per-peer broadcast queue. The first message must be a Join; it binds the
//! connection to one channel for its lifetime and answers with a full
//! snapshot. Every mutation is answered with an Ack (applied or duplicate)
//! or a Reject — the channel pipeline decides which.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::channel::{ApplyOutcome, Channel, ChannelConfig, ChannelRegistry};
use crate::protocol::{MessageType, SyncMessage};
use crate::storage::{RecordError, RecordStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Replay-suppression window (ms)
    pub dedup_ttl_ms: u64,
    /// Per-peer broadcast queue capacity
    pub peer_queue_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let channel = ChannelConfig::default();
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            dedup_ttl_ms: channel.dedup_ttl_ms,
            peer_queue_capacity: channel.peer_queue_capacity,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_channels: usize,
    pub events_applied: u64,
    pub events_suppressed: u64,
    pub events_rejected: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<ChannelRegistry>,
    stats: Arc<RwLock<ServerStats>>,
    records: Option<Arc<RecordStore>>,
}

impl SyncServer {
    /// Create a sync server, opening persistent storage if configured.
    pub fn new(config: ServerConfig) -> Result<Self, RecordError> {
        let records = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(RecordStore::open(store_config)?))
            }
            None => None,
        };

        let channel_config = ChannelConfig {
            dedup_ttl_ms: config.dedup_ttl_ms,
            peer_queue_capacity: config.peer_queue_capacity,
        };

        Ok(Self {
            config,
            registry: Arc::new(ChannelRegistry::new(channel_config, records.clone())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            records,
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self {
            config: ServerConfig::default(),
            registry: Arc::new(ChannelRegistry::new(ChannelConfig::default(), None)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            records: None,
        }
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, RecordError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<ChannelRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Bound by the first Join; one channel per connection
        let mut user: Option<Uuid> = None;
        let mut channel: Option<Arc<Channel>> = None;
        let mut peer_tx: Option<mpsc::Sender<Arc<Vec<u8>>>> = None;
        let mut broadcast_rx: Option<mpsc::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match sync_msg.msg_type {
                                MessageType::Join => {
                                    // The binding is for the connection's lifetime;
                                    // a rebind would strand the old registration.
                                    if channel.is_some() {
                                        log::warn!("Repeated join from {addr} rejected");
                                        let reject = SyncMessage::reject(
                                            &sync_msg.channel,
                                            "already joined",
                                        );
                                        ws_sender
                                            .send(Message::Binary(reject.encode()?.into()))
                                            .await?;
                                        continue;
                                    }

                                    let ch = registry.open(&sync_msg.channel).await?;
                                    let (tx, rx) =
                                        ch.broadcast_group().add_peer(sync_msg.user).await;

                                    let entities = ch.snapshot().await;
                                    let snapshot =
                                        SyncMessage::snapshot(&sync_msg.channel, &entities)?;
                                    ws_sender
                                        .send(Message::Binary(snapshot.encode()?.into()))
                                        .await?;

                                    log::info!(
                                        "User {} joined channel '{}' ({} entities sent)",
                                        sync_msg.user,
                                        sync_msg.channel,
                                        entities.len()
                                    );

                                    user = Some(sync_msg.user);
                                    channel = Some(ch);
                                    peer_tx = Some(tx);
                                    broadcast_rx = Some(rx);

                                    let mut s = stats.write().await;
                                    s.active_channels = registry.channel_count().await;
                                }

                                MessageType::Mutation => {
                                    let ch = match &channel {
                                        Some(ch) => ch,
                                        None => {
                                            let reject = SyncMessage::reject(
                                                &sync_msg.channel,
                                                "mutation before join",
                                            );
                                            ws_sender
                                                .send(Message::Binary(reject.encode()?.into()))
                                                .await?;
                                            continue;
                                        }
                                    };

                                    let event = match sync_msg.mutation_event() {
                                        Ok(e) => e,
                                        Err(e) => {
                                            log::warn!("Malformed mutation from {addr}: {e}");
                                            let reject = SyncMessage::reject(
                                                ch.name(),
                                                &format!("malformed event: {e}"),
                                            );
                                            ws_sender
                                                .send(Message::Binary(reject.encode()?.into()))
                                                .await?;
                                            continue;
                                        }
                                    };

                                    // Duplicates are acknowledged with the event
                                    // as received — the originator already holds
                                    // the applied result.
                                    let reply = match ch.apply(event.clone()).await {
                                        Ok(ApplyOutcome::Applied(stamped)) => {
                                            stats.write().await.events_applied += 1;
                                            SyncMessage::ack(ch.name(), &stamped)?
                                        }
                                        Ok(ApplyOutcome::Duplicate) => {
                                            stats.write().await.events_suppressed += 1;
                                            SyncMessage::ack(ch.name(), &event)?
                                        }
                                        Err(e) => {
                                            stats.write().await.events_rejected += 1;
                                            log::debug!(
                                                "Rejected {:?} '{}' on '{}': {e}",
                                                event.kind,
                                                event.id,
                                                ch.name()
                                            );
                                            SyncMessage::reject(ch.name(), &e.to_string())
                                        }
                                    };
                                    ws_sender
                                        .send(Message::Binary(reply.encode()?.into()))
                                        .await?;
                                }

                                MessageType::Ping => {
                                    let pong = SyncMessage::pong(sync_msg.user);
                                    ws_sender
                                        .send(Message::Binary(pong.encode()?.into()))
                                        .await?;
                                }

                                MessageType::Leave => {
                                    log::info!("User {} left from {addr}", sync_msg.user);
                                    break;
                                }

                                _ => {
                                    log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast message (queue exists only after join)
                msg = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        // Originator exclusion happened at fan-out; forward as-is
                        Some(data) => {
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        // Queue replaced by a rejoin, or channel torn down
                        None => break,
                    }
                }
            }
        }

        // Cleanup: remove peer, drop the channel if it emptied. A same-uuid
        // rejoin may have replaced this connection's queue; only the live
        // registration gets to evict the peer.
        if let (Some(uid), Some(ch), Some(tx)) = (user, channel, peer_tx) {
            if ch.broadcast_group().remove_peer_if(&uid, &tx).await {
                registry.close_if_empty(ch.name()).await;
            }

            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_channels = registry.channel_count().await;
        } else {
            stats.write().await.active_connections -= 1;
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_channels = self.registry.channel_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the channel registry.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Get the persistent store (if configured).
    pub fn record_store(&self) -> Option<&Arc<RecordStore>> {
        self.records.as_ref()
    }
}
