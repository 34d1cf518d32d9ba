//! 在线状态连接状态机：Connecting → Online → Closed

use async_trait::async_trait;
use domain::UserId;

use crate::{
    broadcaster::{ChannelId, GroupEnvelope},
    events::{user_group, InboundPresenceEvent, OutboundEvent, ServerFrame, PRESENCE_GROUP},
    services::{SessionDependencies, SessionRejection, SocketSession},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSessionState {
    Connecting,
    Online,
    Closed,
}

pub struct PresenceSession {
    deps: SessionDependencies,
    channel: ChannelId,
    user_id: Option<UserId>,
    state: PresenceSessionState,
}

impl PresenceSession {
    pub fn new(deps: SessionDependencies, channel: ChannelId) -> Self {
        Self {
            deps,
            channel,
            user_id: None,
            state: PresenceSessionState::Connecting,
        }
    }

    pub fn state(&self) -> PresenceSessionState {
        self.state
    }

    /// 上线并广播最新在线列表；返回应直接发给本连接的在线列表
    pub async fn connect(
        &mut self,
        identity: Option<UserId>,
    ) -> Result<ServerFrame, SessionRejection> {
        let Some(user_id) = identity else {
            tracing::warn!(channel = %self.channel, "未认证的在线状态连接，拒绝");
            self.state = PresenceSessionState::Closed;
            return Err(SessionRejection::Unauthenticated);
        };

        if let Err(err) = self.deps.presence.add(user_id).await {
            tracing::error!(user_id = %user_id, backend = %self.deps.presence.backend(), error = %err, "记录在线状态失败");
        }

        if let Err(err) = self
            .deps
            .broadcaster
            .join_group(PRESENCE_GROUP, self.channel)
            .await
        {
            tracing::error!(user_id = %user_id, error = %err, "加入在线状态分组失败");
            if let Err(err) = self.deps.presence.remove(user_id).await {
                tracing::error!(user_id = %user_id, error = %err, "回滚在线状态失败");
            }
            self.state = PresenceSessionState::Closed;
            return Err(SessionRejection::Unavailable);
        }
        // 个人通知组：没有打开聊天连接时也能收到新消息和新会话通知
        let personal = user_group(user_id);
        if let Err(err) = self
            .deps
            .broadcaster
            .join_group(&personal, self.channel)
            .await
        {
            tracing::warn!(user_id = %user_id, error = %err, "加入个人通知组失败");
        }

        self.user_id = Some(user_id);
        self.state = PresenceSessionState::Online;
        tracing::info!(user_id = %user_id, backend = %self.deps.presence.backend(), "用户上线");

        let snapshot = self.snapshot().await;
        self.broadcast(snapshot.clone()).await;
        Ok(ServerFrame::Event(snapshot))
    }

    async fn snapshot(&self) -> OutboundEvent {
        match self.deps.presence.online_users().await {
            Ok(users) => OutboundEvent::online_users(&users),
            Err(err) => {
                tracing::error!(error = %err, "读取在线用户失败");
                OutboundEvent::online_users(&[])
            }
        }
    }

    async fn broadcast(&self, event: OutboundEvent) {
        if let Err(err) = self
            .deps
            .broadcaster
            .publish(GroupEnvelope::new(PRESENCE_GROUP, event))
            .await
        {
            tracing::warn!(error = %err, "广播在线列表失败");
        }
    }
}

#[async_trait]
impl SocketSession for PresenceSession {
    async fn handle_text(&mut self, text: &str) -> Option<ServerFrame> {
        if self.state != PresenceSessionState::Online {
            return None;
        }
        match serde_json::from_str::<InboundPresenceEvent>(text) {
            Ok(InboundPresenceEvent::GetOnlineUsersRequest) => {
                Some(ServerFrame::Event(self.snapshot().await))
            }
            Ok(InboundPresenceEvent::Unknown) => {
                tracing::debug!(channel = %self.channel, "忽略未知事件类型");
                None
            }
            Err(err) => {
                tracing::warn!(channel = %self.channel, error = %err, "丢弃无法解析的客户端帧");
                None
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.state == PresenceSessionState::Online {
            if let Some(user_id) = self.user_id {
                if let Err(err) = self.deps.presence.remove(user_id).await {
                    tracing::error!(user_id = %user_id, error = %err, "清理在线状态失败");
                }
                if let Err(err) = self
                    .deps
                    .broadcaster
                    .leave_group(PRESENCE_GROUP, self.channel)
                    .await
                {
                    tracing::error!(user_id = %user_id, error = %err, "退出在线状态分组失败");
                }
                if let Err(err) = self
                    .deps
                    .broadcaster
                    .leave_group(&user_group(user_id), self.channel)
                    .await
                {
                    tracing::error!(user_id = %user_id, error = %err, "退出个人通知组失败");
                }

                let snapshot = self.snapshot().await;
                self.broadcast(snapshot).await;
                tracing::info!(user_id = %user_id, "用户下线");
            }
        }
        self.state = PresenceSessionState::Closed;
    }
}
