mod chat_session;
mod conversation_service;
mod presence_session;
mod presenter;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    broadcaster::GroupBroadcaster,
    events::ServerFrame,
    presence::PresenceStore,
    repository::{ConversationRepository, UserDirectory},
};

pub use chat_session::{ChatSession, ChatSessionState};
pub use conversation_service::{
    ConversationService, ConversationServiceDependencies, CreateConversationRequest,
    EditMessageRequest, MessageDraft, PostConversationMessageRequest, SendMessageToUserRequest,
};
pub use presence_session::{PresenceSession, PresenceSessionState};
pub use presenter::MessagePresenter;

/// 实时连接会话共用的依赖
#[derive(Clone)]
pub struct SessionDependencies {
    pub repository: Arc<dyn ConversationRepository>,
    pub users: Arc<dyn UserDirectory>,
    pub broadcaster: Arc<dyn GroupBroadcaster>,
    pub presence: Arc<dyn PresenceStore>,
}

impl SessionDependencies {
    pub fn presenter(&self) -> MessagePresenter {
        MessagePresenter::new(self.repository.clone(), self.users.clone())
    }
}

/// 连接被拒绝的原因，决定关闭帧的状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionRejection {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("not a participant of this conversation")]
    Forbidden,
    #[error("backend unavailable")]
    Unavailable,
}

impl SessionRejection {
    /// WebSocket 关闭状态码
    pub fn close_code(&self) -> u16 {
        match self {
            SessionRejection::Unauthenticated => 4001,
            SessionRejection::Forbidden => 4003,
            SessionRejection::Unavailable => 1011,
        }
    }
}

/// 与传输层无关的连接会话：处理一条文本帧，连接结束时清理
#[async_trait]
pub trait SocketSession: Send {
    /// 返回需要直接回给本连接的帧
    async fn handle_text(&mut self, text: &str) -> Option<ServerFrame>;

    /// 尽力清理，每一步失败都只记录日志
    async fn disconnect(&mut self);
}
