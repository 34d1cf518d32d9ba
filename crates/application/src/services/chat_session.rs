//! 聊天连接状态机：Connecting → Authorizing → Joined → Closed

use async_trait::async_trait;
use domain::{ConversationId, NewMessage, UserProfile};

use crate::{
    broadcaster::{ChannelId, GroupEnvelope},
    events::{conversation_group, InboundChatEvent, OutboundEvent, ServerFrame},
    services::{SessionDependencies, SessionRejection, SocketSession},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatSessionState {
    Connecting,
    Authorizing,
    Joined,
    Closed,
}

pub struct ChatSession {
    deps: SessionDependencies,
    channel: ChannelId,
    requested_conversation: String,
    conversation_id: Option<ConversationId>,
    user: Option<UserProfile>,
    state: ChatSessionState,
}

impl ChatSession {
    pub fn new(
        deps: SessionDependencies,
        channel: ChannelId,
        requested_conversation: impl Into<String>,
    ) -> Self {
        Self {
            deps,
            channel,
            requested_conversation: requested_conversation.into(),
            conversation_id: None,
            user: None,
            state: ChatSessionState::Connecting,
        }
    }

    pub fn state(&self) -> ChatSessionState {
        self.state
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// 校验身份与会话成员资格，通过后加入会话分组
    pub async fn connect(
        &mut self,
        identity: Option<domain::UserId>,
    ) -> Result<(), SessionRejection> {
        let Some(user_id) = identity else {
            tracing::warn!(conversation = %self.requested_conversation, "未认证的聊天连接，拒绝");
            return self.reject(SessionRejection::Unauthenticated);
        };
        self.state = ChatSessionState::Authorizing;

        let Ok(conversation_id) = self.requested_conversation.parse::<ConversationId>() else {
            tracing::warn!(user_id = %user_id, conversation = %self.requested_conversation, "会话 ID 非法");
            return self.reject(SessionRejection::Forbidden);
        };

        match self
            .deps
            .repository
            .is_participant(conversation_id, user_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(user_id = %user_id, conversation_id = %conversation_id, "非会话参与者，拒绝连接");
                return self.reject(SessionRejection::Forbidden);
            }
            Err(err) => {
                tracing::error!(user_id = %user_id, conversation_id = %conversation_id, error = %err, "校验会话成员失败");
                return self.reject(SessionRejection::Unavailable);
            }
        }

        let user = match self.deps.users.find_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!(user_id = %user_id, "用户不存在，拒绝连接");
                return self.reject(SessionRejection::Unauthenticated);
            }
            Err(err) => {
                tracing::error!(user_id = %user_id, error = %err, "读取用户资料失败");
                return self.reject(SessionRejection::Unavailable);
            }
        };

        let group = conversation_group(conversation_id);
        if let Err(err) = self.deps.broadcaster.join_group(&group, self.channel).await {
            tracing::error!(user_id = %user_id, group = %group, error = %err, "加入会话分组失败");
            return self.reject(SessionRejection::Unavailable);
        }

        self.conversation_id = Some(conversation_id);
        self.user = Some(user);
        self.state = ChatSessionState::Joined;
        tracing::info!(user_id = %user_id, conversation_id = %conversation_id, "聊天连接已加入会话");
        Ok(())
    }

    fn reject(&mut self, reason: SessionRejection) -> Result<(), SessionRejection> {
        self.state = ChatSessionState::Closed;
        Err(reason)
    }

    fn is_bound_conversation(&self, claimed: Option<&str>) -> bool {
        match (self.conversation_id, claimed) {
            (Some(bound), Some(claimed)) => claimed.trim() == bound.to_string(),
            _ => false,
        }
    }

    async fn handle_new_message(&self, content: Option<String>) -> Option<ServerFrame> {
        let (conversation_id, user) = (self.conversation_id?, self.user.as_ref()?);

        let draft = match NewMessage::compose(conversation_id, user.id, content, None, None) {
            Ok(draft) => draft,
            Err(err) => return Some(ServerFrame::error(err.to_string())),
        };

        let message = match self.deps.repository.append_message(draft).await {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(user_id = %user.id, conversation_id = %conversation_id, error = %err, "保存消息失败");
                return Some(ServerFrame::error(format!("Failed to save message: {err}")));
            }
        };
        tracing::debug!(message_id = %message.id, preview = %message.preview(), "消息已保存");

        let dto = match self.deps.presenter().message(&message).await {
            Ok(dto) => dto,
            Err(err) => {
                tracing::error!(message_id = %message.id, error = %err, "组装消息失败");
                return None;
            }
        };

        let envelope = GroupEnvelope::new(
            conversation_group(conversation_id),
            OutboundEvent::ChatMessage { message: dto },
        );
        if let Err(err) = self.deps.broadcaster.publish(envelope).await {
            tracing::warn!(message_id = %message.id, error = %err, "广播新消息失败");
        }
        None
    }

    async fn publish_typing(&self, started: bool) {
        let (Some(conversation_id), Some(user)) = (self.conversation_id, self.user.as_ref()) else {
            return;
        };
        let (user_id, username) = (user.id, user.typing_name());
        let event = if started {
            OutboundEvent::UserTypingStarted {
                user_id,
                username,
                conversation_id,
            }
        } else {
            OutboundEvent::UserTypingStopped {
                user_id,
                username,
                conversation_id,
            }
        };

        let envelope =
            GroupEnvelope::new(conversation_group(conversation_id), event).excluding(self.channel);
        if let Err(err) = self.deps.broadcaster.publish(envelope).await {
            tracing::warn!(user_id = %user_id, error = %err, "广播输入状态失败");
        }
    }
}

#[async_trait]
impl SocketSession for ChatSession {
    async fn handle_text(&mut self, text: &str) -> Option<ServerFrame> {
        if self.state != ChatSessionState::Joined {
            return None;
        }

        let event = match serde_json::from_str::<InboundChatEvent>(text) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(channel = %self.channel, error = %err, "丢弃无法解析的客户端帧");
                return None;
            }
        };

        let claimed = match &event {
            InboundChatEvent::ChatMessageNew {
                conversation_id, ..
            }
            | InboundChatEvent::TypingStarted { conversation_id }
            | InboundChatEvent::TypingStopped { conversation_id } => conversation_id.as_deref(),
            InboundChatEvent::Unknown => {
                tracing::debug!(channel = %self.channel, "忽略未知事件类型");
                return None;
            }
        };
        if !self.is_bound_conversation(claimed) {
            tracing::warn!(
                channel = %self.channel,
                claimed = ?claimed,
                bound = ?self.conversation_id,
                "事件中的会话 ID 与连接不一致，丢弃"
            );
            return None;
        }

        match event {
            InboundChatEvent::ChatMessageNew { content, .. } => {
                self.handle_new_message(content).await
            }
            InboundChatEvent::TypingStarted { .. } => {
                self.publish_typing(true).await;
                None
            }
            InboundChatEvent::TypingStopped { .. } => {
                self.publish_typing(false).await;
                None
            }
            InboundChatEvent::Unknown => None,
        }
    }

    async fn disconnect(&mut self) {
        if self.state == ChatSessionState::Joined {
            self.publish_typing(false).await;

            if let Some(conversation_id) = self.conversation_id {
                let group = conversation_group(conversation_id);
                if let Err(err) = self.deps.broadcaster.leave_group(&group, self.channel).await {
                    tracing::error!(group = %group, error = %err, "退出会话分组失败");
                }
            }
            tracing::info!(
                user_id = ?self.user.as_ref().map(|user| user.id),
                conversation_id = ?self.conversation_id,
                "聊天连接已断开"
            );
        }
        self.state = ChatSessionState::Closed;
    }
}
