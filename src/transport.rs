//! Outbound delivery primitives
//!
//! The game logic only needs three things from the real-time layer: put a
//! connection into a channel, send to a whole channel, send to one recipient.
//! [`Hub`] implements them in-process with one unbounded queue per connection;
//! the WebSocket task for that connection drains the queue.

use crate::protocol::ServerMessage;
use crate::types::ConnectionId;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn join_channel(&self, channel: &str, connection_id: &str);
    async fn leave_channel(&self, channel: &str, connection_id: &str);
    async fn send_to_channel(&self, channel: &str, msg: ServerMessage);
    /// Send to every member of `channel` except `exclude`
    async fn send_to_channel_except(&self, channel: &str, exclude: &str, msg: ServerMessage);
    async fn send_to(&self, connection_id: &str, msg: ServerMessage);
}

pub type Outbound = mpsc::UnboundedReceiver<ServerMessage>;

#[derive(Debug, Default)]
pub struct Hub {
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>>,
    channels: RwLock<HashMap<String, HashSet<ConnectionId>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and get the queue of messages addressed to it
    pub async fn register(&self, connection_id: &str) -> Outbound {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .write()
            .await
            .insert(connection_id.to_string(), tx);
        rx
    }

    /// Forget a connection and drop it from every channel
    pub async fn unregister(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
        let mut channels = self.channels.write().await;
        for members in channels.values_mut() {
            members.remove(connection_id);
        }
        channels.retain(|_, members| !members.is_empty());
    }

    pub async fn channel_members(&self, channel: &str) -> HashSet<ConnectionId> {
        self.channels
            .read()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    async fn deliver(&self, targets: impl Iterator<Item = &ConnectionId>, msg: &ServerMessage) {
        let connections = self.connections.read().await;
        for connection_id in targets {
            if let Some(tx) = connections.get(connection_id) {
                // A closed receiver just means the socket is going away
                let _ = tx.send(msg.clone());
            }
        }
    }
}

#[async_trait]
impl Transport for Hub {
    async fn join_channel(&self, channel: &str, connection_id: &str) {
        self.channels
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    async fn leave_channel(&self, channel: &str, connection_id: &str) {
        let mut channels = self.channels.write().await;
        if let Some(members) = channels.get_mut(channel) {
            members.remove(connection_id);
            if members.is_empty() {
                channels.remove(channel);
            }
        }
    }

    async fn send_to_channel(&self, channel: &str, msg: ServerMessage) {
        let members = self.channel_members(channel).await;
        self.deliver(members.iter(), &msg).await;
    }

    async fn send_to_channel_except(&self, channel: &str, exclude: &str, msg: ServerMessage) {
        let members = self.channel_members(channel).await;
        self.deliver(members.iter().filter(|c| c.as_str() != exclude), &msg)
            .await;
    }

    async fn send_to(&self, connection_id: &str, msg: ServerMessage) {
        let target = connection_id.to_string();
        self.deliver(std::iter::once(&target), &msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut Outbound) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_channel_broadcast_and_direct_send() {
        let hub = Hub::new();
        let mut a = hub.register("a").await;
        let mut b = hub.register("b").await;
        let mut c = hub.register("c").await;
        hub.join_channel("room", "a").await;
        hub.join_channel("room", "b").await;

        hub.send_to_channel("room", ServerMessage::SubmissionAck).await;
        hub.send_to("c", ServerMessage::RankingAck).await;

        assert_eq!(drain(&mut a).len(), 1);
        assert_eq!(drain(&mut b).len(), 1);
        assert!(matches!(drain(&mut c).as_slice(), [ServerMessage::RankingAck]));
    }

    #[tokio::test]
    async fn test_send_except_skips_sender() {
        let hub = Hub::new();
        let mut a = hub.register("a").await;
        let mut b = hub.register("b").await;
        hub.join_channel("room", "a").await;
        hub.join_channel("room", "b").await;

        hub.send_to_channel_except("room", "a", ServerMessage::SubmissionAck)
            .await;

        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b).len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_removes_from_channels() {
        let hub = Hub::new();
        let _a = hub.register("a").await;
        hub.join_channel("room", "a").await;

        hub.unregister("a").await;
        assert!(hub.channel_members("room").await.is_empty());
    }

    #[tokio::test]
    async fn test_leave_channel() {
        let hub = Hub::new();
        let mut a = hub.register("a").await;
        hub.join_channel("room", "a").await;
        hub.leave_channel("room", "a").await;

        hub.send_to_channel("room", ServerMessage::SubmissionAck).await;
        assert!(drain(&mut a).is_empty());
    }
}
