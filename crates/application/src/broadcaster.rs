//! 分组广播抽象。
//!
//! 每个实时连接注册为一个通道（channel），拥有自己的有界出站队列；
//! 通道可以加入任意多个命名分组，发布到分组的事件投递给组内每个通道至多一次，
//! 发布时可以排除一个通道（用于不回显给发送者自己）。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::events::OutboundEvent;

/// 连接通道标识，跨节点唯一
pub type ChannelId = Uuid;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast failed: {0}")]
    Failed(String),
    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelId),
}

impl BroadcastError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// 一次发布：目标分组、可选的排除通道、事件本身
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEnvelope {
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<ChannelId>,
    pub event: OutboundEvent,
}

impl GroupEnvelope {
    pub fn new(group: impl Into<String>, event: OutboundEvent) -> Self {
        Self {
            group: group.into(),
            exclude: None,
            event,
        }
    }

    pub fn excluding(mut self, channel: ChannelId) -> Self {
        self.exclude = Some(channel);
        self
    }
}

/// 已注册的通道及其出站事件接收端
#[derive(Debug)]
pub struct Channel {
    pub id: ChannelId,
    pub receiver: mpsc::Receiver<OutboundEvent>,
}

#[async_trait]
pub trait GroupBroadcaster: Send + Sync {
    async fn register_channel(&self) -> Channel;

    /// 注销通道并退出它所在的所有分组
    async fn unregister_channel(&self, channel: ChannelId);

    /// 幂等：重复加入不会导致重复投递
    async fn join_group(&self, group: &str, channel: ChannelId) -> Result<(), BroadcastError>;

    async fn leave_group(&self, group: &str, channel: ChannelId) -> Result<(), BroadcastError>;

    async fn publish(&self, envelope: GroupEnvelope) -> Result<(), BroadcastError>;
}

#[derive(Default)]
struct RegistryState {
    channels: HashMap<ChannelId, mpsc::Sender<OutboundEvent>>,
    groups: HashMap<String, HashSet<ChannelId>>,
}

/// 本节点的通道与分组成员表，各广播后端共用
pub struct ChannelRegistry {
    capacity: usize,
    state: RwLock<RegistryState>,
}

impl ChannelRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub async fn register(&self) -> Channel {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        self.state.write().await.channels.insert(id, sender);
        tracing::debug!(channel = %id, "通道已注册");
        Channel { id, receiver }
    }

    /// 注销通道，同时退出所有分组；空分组一并移除
    pub async fn unregister(&self, channel: ChannelId) {
        let mut state = self.state.write().await;
        state.channels.remove(&channel);
        state.groups.retain(|_, members| {
            members.remove(&channel);
            !members.is_empty()
        });
        tracing::debug!(channel = %channel, "通道已注销");
    }

    pub async fn join(&self, group: &str, channel: ChannelId) -> Result<(), BroadcastError> {
        let mut state = self.state.write().await;
        if !state.channels.contains_key(&channel) {
            return Err(BroadcastError::UnknownChannel(channel));
        }
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(channel);
        Ok(())
    }

    pub async fn leave(&self, group: &str, channel: ChannelId) {
        let mut state = self.state.write().await;
        if let Some(members) = state.groups.get_mut(group) {
            members.remove(&channel);
            if members.is_empty() {
                state.groups.remove(group);
            }
        }
    }

    /// 投递给本节点组内的通道，返回成功入队的数量。队列满时丢弃该事件。
    pub async fn deliver(&self, envelope: &GroupEnvelope) -> usize {
        let state = self.state.read().await;
        let Some(members) = state.groups.get(&envelope.group) else {
            return 0;
        };

        let mut delivered = 0;
        for channel in members {
            if envelope.exclude == Some(*channel) {
                continue;
            }
            let Some(sender) = state.channels.get(channel) else {
                continue;
            };
            match sender.try_send(envelope.event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(channel = %channel, group = %envelope.group, "通道出站队列已满，丢弃事件");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(channel = %channel, group = %envelope.group, "通道已关闭");
                }
            }
        }
        delivered
    }
}
