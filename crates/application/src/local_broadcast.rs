// 进程内分组广播器
use std::sync::Arc;

use async_trait::async_trait;

use crate::broadcaster::{
    BroadcastError, Channel, ChannelId, ChannelRegistry, GroupBroadcaster, GroupEnvelope,
};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct LocalGroupBroadcaster {
    registry: Arc<ChannelRegistry>,
}

impl LocalGroupBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(ChannelRegistry::new(capacity)),
        }
    }
}

impl Default for LocalGroupBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl GroupBroadcaster for LocalGroupBroadcaster {
    async fn register_channel(&self) -> Channel {
        self.registry.register().await
    }

    async fn unregister_channel(&self, channel: ChannelId) {
        self.registry.unregister(channel).await;
    }

    async fn join_group(&self, group: &str, channel: ChannelId) -> Result<(), BroadcastError> {
        self.registry.join(group, channel).await
    }

    async fn leave_group(&self, group: &str, channel: ChannelId) -> Result<(), BroadcastError> {
        self.registry.leave(group, channel).await;
        Ok(())
    }

    async fn publish(&self, envelope: GroupEnvelope) -> Result<(), BroadcastError> {
        let delivered = self.registry.deliver(&envelope).await;
        tracing::trace!(group = %envelope.group, delivered, "本地广播完成");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OutboundEvent;
    use domain::UserId;

    fn online(ids: &[i64]) -> OutboundEvent {
        let ids: Vec<UserId> = ids.iter().copied().map(UserId).collect();
        OutboundEvent::online_users(&ids)
    }

    #[tokio::test]
    async fn double_join_delivers_once() {
        let broadcaster = LocalGroupBroadcaster::default();
        let mut channel = broadcaster.register_channel().await;
        broadcaster.join_group("g", channel.id).await.unwrap();
        broadcaster.join_group("g", channel.id).await.unwrap();

        broadcaster
            .publish(GroupEnvelope::new("g", online(&[1])))
            .await
            .unwrap();

        assert_eq!(channel.receiver.recv().await, Some(online(&[1])));
        assert!(channel.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn excluded_channel_receives_nothing() {
        let broadcaster = LocalGroupBroadcaster::default();
        let mut sender = broadcaster.register_channel().await;
        let mut peer = broadcaster.register_channel().await;
        broadcaster.join_group("g", sender.id).await.unwrap();
        broadcaster.join_group("g", peer.id).await.unwrap();

        broadcaster
            .publish(GroupEnvelope::new("g", online(&[2])).excluding(sender.id))
            .await
            .unwrap();

        assert_eq!(peer.receiver.recv().await, Some(online(&[2])));
        assert!(sender.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_order_is_preserved_per_group() {
        let broadcaster = LocalGroupBroadcaster::default();
        let mut channel = broadcaster.register_channel().await;
        broadcaster.join_group("g", channel.id).await.unwrap();

        for id in 1..=5 {
            broadcaster
                .publish(GroupEnvelope::new("g", online(&[id])))
                .await
                .unwrap();
        }
        for id in 1..=5 {
            assert_eq!(channel.receiver.recv().await, Some(online(&[id])));
        }
    }

    #[tokio::test]
    async fn leave_and_unregister_stop_delivery() {
        let broadcaster = LocalGroupBroadcaster::default();
        let mut channel = broadcaster.register_channel().await;
        broadcaster.join_group("a", channel.id).await.unwrap();
        broadcaster.join_group("b", channel.id).await.unwrap();

        broadcaster.leave_group("a", channel.id).await.unwrap();
        broadcaster
            .publish(GroupEnvelope::new("a", online(&[1])))
            .await
            .unwrap();
        assert!(channel.receiver.try_recv().is_err());

        broadcaster.unregister_channel(channel.id).await;
        broadcaster
            .publish(GroupEnvelope::new("b", online(&[1])))
            .await
            .unwrap();
        assert!(channel.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn joining_with_unknown_channel_fails() {
        let broadcaster = LocalGroupBroadcaster::default();
        let err = broadcaster
            .join_group("g", uuid::Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, BroadcastError::UnknownChannel(_)));
    }

    #[tokio::test]
    async fn full_queue_drops_events_for_that_channel_only() {
        let broadcaster = LocalGroupBroadcaster::new(1);
        let mut slow = broadcaster.register_channel().await;
        let mut fast = broadcaster.register_channel().await;
        broadcaster.join_group("g", slow.id).await.unwrap();
        broadcaster.join_group("g", fast.id).await.unwrap();

        broadcaster
            .publish(GroupEnvelope::new("g", online(&[1])))
            .await
            .unwrap();
        assert_eq!(fast.receiver.recv().await, Some(online(&[1])));

        broadcaster
            .publish(GroupEnvelope::new("g", online(&[2])))
            .await
            .unwrap();
        assert_eq!(fast.receiver.recv().await, Some(online(&[2])));

        assert_eq!(slow.receiver.recv().await, Some(online(&[1])));
        assert!(slow.receiver.try_recv().is_err());
    }
}
