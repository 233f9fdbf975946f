//! Live connection set and broadcast fan-out.
//!
//! Each connection owns a bounded channel; the transport drains the receiving end into
//! the socket. Broadcasts snapshot the current members and deliver to all of them
//! concurrently, so no map shard lock is held while a send is pending.

use crate::error::{RelayError, Result};
use crate::models::{ChatMessage, ConnectionId, ServerEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 64;

/// Fan-out primitive the hub broadcasts through
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Deliver `message` to every connected client, returning how many were reached
    async fn broadcast_to_all(&self, message: ChatMessage) -> Result<usize>;
}

/// Registry of connected clients.
///
/// Membership only changes through [`register`](Self::register) and
/// [`unregister`](Self::unregister), plus pruning of members that stop draining their
/// channel during a broadcast.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, mpsc::Sender<ServerEvent>>,
    closed: AtomicBool,
    send_timeout: Duration,
    buffer_size: usize,
}

impl ConnectionRegistry {
    /// Create a registry that drops clients which block a broadcast for longer than `send_timeout`
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            closed: AtomicBool::new(false),
            send_timeout,
            buffer_size: CONNECTION_BUFFER_SIZE,
        }
    }

    /// Set the per-connection buffer size for connections registered afterwards
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Register a new connection.
    ///
    /// Returns the connection handle and the receiver for events addressed to it.
    pub fn register(&self) -> Result<(ConnectionId, mpsc::Receiver<ServerEvent>)> {
        if self.is_closed() {
            return Err(RelayError::HubClosed);
        }

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let id = ConnectionId::new();
        self.connections.insert(id, tx);
        info!("Registered connection {} ({} connected)", id, self.connections.len());

        Ok((id, rx))
    }

    /// Remove a connection. Returns whether it was still registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            info!("Unregistered connection {} ({} connected)", id, self.connections.len());
        }
        removed
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting connections and broadcasts, and drop every member's channel
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.connections.clear();
            info!("Connection registry closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send `event` to every current member.
    ///
    /// Members whose channel is closed, or who do not accept the event within the send
    /// timeout, are removed. Returns the number of members that received it.
    pub async fn broadcast(&self, event: ServerEvent) -> Result<usize> {
        if self.is_closed() {
            return Err(RelayError::HubClosed);
        }

        let members: Vec<(ConnectionId, mpsc::Sender<ServerEvent>)> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let send_timeout = self.send_timeout;
        let deliveries = members.into_iter().map(|(id, tx)| {
            let event = event.clone();
            async move {
                let sent = tokio::time::timeout(send_timeout, tx.send(event)).await;
                (id, matches!(sent, Ok(Ok(()))))
            }
        });

        let mut reached = 0;
        for (id, delivered) in join_all(deliveries).await {
            if delivered {
                reached += 1;
            } else if self.connections.remove(&id).is_some() {
                warn!("Dropped connection {}: not accepting events", id);
            }
        }

        debug!("Broadcast reached {} connections", reached);
        Ok(reached)
    }
}

#[async_trait]
impl Broadcaster for ConnectionRegistry {
    async fn broadcast_to_all(&self, message: ChatMessage) -> Result<usize> {
        self.broadcast(ServerEvent::ReceiveMessage(message)).await
    }
}
