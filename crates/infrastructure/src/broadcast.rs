//! Redis Pub/Sub 分组广播
//!
//! 每个节点用模式订阅 `{prefix}*` 接收所有分组的事件，再投递给本节点注册的通道。
//! 订阅断开后按指数退避重连；重连完成前以及发布失败时，事件直接投递给本节点。

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use application::{
    BroadcastError, Channel, ChannelId, ChannelRegistry, GroupBroadcaster, GroupEnvelope,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{
    aio::{ConnectionManager, PubSub},
    AsyncCommands, RedisError, RedisResult,
};
use tokio::task::JoinHandle;

const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(200);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

pub struct RedisGroupBroadcaster {
    registry: Arc<ChannelRegistry>,
    publisher: ConnectionManager,
    prefix: String,
    subscribed: Arc<AtomicBool>,
    listener: JoinHandle<()>,
}

impl RedisGroupBroadcaster {
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        capacity: usize,
    ) -> Result<Self, RedisError> {
        let prefix = prefix.into();
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;

        let pattern = format!("{prefix}*");
        let pubsub = subscribe(&client, &pattern).await?;

        let registry = Arc::new(ChannelRegistry::new(capacity));
        let subscribed = Arc::new(AtomicBool::new(true));
        let listener = tokio::spawn(listen_loop(
            client,
            pattern,
            pubsub,
            registry.clone(),
            subscribed.clone(),
        ));
        tracing::info!(prefix = %prefix, "Redis 分组广播已订阅");

        Ok(Self {
            registry,
            publisher,
            prefix,
            subscribed,
            listener,
        })
    }

    /// 当前是否持有有效的 Redis 订阅
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    fn channel_name(&self, group: &str) -> String {
        format!("{}{}", self.prefix, group)
    }
}

impl Drop for RedisGroupBroadcaster {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn subscribe(client: &redis::Client, pattern: &str) -> RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(pattern).await?;
    Ok(pubsub)
}

/// 第 `attempt` 次重连前的等待时间
fn reconnect_delay(attempt: u32) -> Duration {
    RECONNECT_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(RECONNECT_MAX_DELAY)
}

async fn listen_loop(
    client: redis::Client,
    pattern: String,
    mut pubsub: PubSub,
    registry: Arc<ChannelRegistry>,
    subscribed: Arc<AtomicBool>,
) {
    loop {
        forward(pubsub, &registry).await;
        subscribed.store(false, Ordering::Release);
        tracing::error!(pattern = %pattern, "Redis 订阅连接已断开，重连前只投递本节点");

        pubsub = resubscribe(&client, &pattern).await;
        subscribed.store(true, Ordering::Release);
        tracing::info!(pattern = %pattern, "Redis 订阅已恢复");
    }
}

async fn resubscribe(client: &redis::Client, pattern: &str) -> PubSub {
    let mut attempt = 0;
    loop {
        let delay = reconnect_delay(attempt);
        tokio::time::sleep(delay).await;
        match subscribe(client, pattern).await {
            Ok(pubsub) => return pubsub,
            Err(err) => {
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Redis 重新订阅失败"
                );
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// 转发订阅消息直到连接断开
async fn forward(pubsub: PubSub, registry: &ChannelRegistry) {
    let mut messages = pubsub.into_on_message();
    while let Some(message) = messages.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(channel = %message.get_channel_name(), error = %err, "无法读取 Redis 消息内容");
                continue;
            }
        };
        match serde_json::from_str::<GroupEnvelope>(&payload) {
            Ok(envelope) => {
                let delivered = registry.deliver(&envelope).await;
                tracing::trace!(group = %envelope.group, delivered, "Redis 事件已投递");
            }
            Err(err) => {
                tracing::warn!(channel = %message.get_channel_name(), error = %err, "丢弃无法解析的广播事件");
            }
        }
    }
}

#[async_trait]
impl GroupBroadcaster for RedisGroupBroadcaster {
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
        let payload = serde_json::to_string(&envelope)
            .map_err(|err| BroadcastError::failed(err.to_string()))?;
        let channel = self.channel_name(&envelope.group);

        // 订阅恢复前本节点收不到 Redis 回流，先直接投递；其他节点仍通过 Redis 接收
        let delivered_locally = !self.is_subscribed();
        if delivered_locally {
            self.registry.deliver(&envelope).await;
        }

        let mut connection = self.publisher.clone();
        let published: Result<i64, RedisError> = connection.publish(&channel, payload).await;
        match published {
            Ok(receivers) => {
                tracing::trace!(channel = %channel, receivers, "事件已发布到 Redis");
            }
            Err(err) => {
                tracing::warn!(channel = %channel, error = %err, "Redis 发布失败，仅投递本节点");
                if !delivered_locally {
                    self.registry.deliver(&envelope).await;
                }
            }
        }
        Ok(())
    }
}
