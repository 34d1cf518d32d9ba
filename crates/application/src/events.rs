//! 实时通道的事件协议。
//!
//! 入站事件和出站事件都是封闭枚举，按 `type` 字段区分；未知类型落入 `Unknown` 分支统一处理。

use domain::{ConversationId, MessageId, UserId};
use serde::{Deserialize, Deserializer, Serialize};

use crate::dto::{ConversationDto, MessageDto};

/// 全局在线状态广播组
pub const PRESENCE_GROUP: &str = "global_presence_notifications";

/// 会话广播组名
pub fn conversation_group(conversation_id: ConversationId) -> String {
    format!("conversation_{conversation_id}")
}

/// 用户个人通知组名
pub fn user_group(user_id: UserId) -> String {
    format!("user_{user_id}")
}

/// 聊天连接上客户端发来的事件
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundChatEvent {
    ChatMessageNew {
        #[serde(default, deserialize_with = "loose_id")]
        conversation_id: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },
    TypingStarted {
        #[serde(default, deserialize_with = "loose_id")]
        conversation_id: Option<String>,
    },
    TypingStopped {
        #[serde(default, deserialize_with = "loose_id")]
        conversation_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// 在线状态连接上客户端发来的事件
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundPresenceEvent {
    GetOnlineUsersRequest,
    #[serde(other)]
    Unknown,
}

/// 客户端可能以数字或字符串发送会话 ID，统一转为字符串比较
fn loose_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(text)) => Some(text),
        Some(serde_json::Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

/// 服务端推送的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    ChatMessage {
        message: MessageDto,
    },
    MessageUpdated {
        message: MessageDto,
    },
    MessageDeleted {
        message_id: MessageId,
        conversation_id: ConversationId,
        message: MessageDto,
    },
    UserTypingStarted {
        user_id: UserId,
        username: String,
        conversation_id: ConversationId,
    },
    UserTypingStopped {
        user_id: UserId,
        username: String,
        conversation_id: ConversationId,
    },
    OnlineUsersList {
        users: Vec<String>,
    },
    NewMessageNotification {
        message: MessageDto,
        conversation_id: ConversationId,
        sender_id: UserId,
        sender_username: String,
    },
    NewConversationAdded {
        conversation_id: ConversationId,
        conversation: ConversationDto,
        created_by: UserId,
    },
}

impl OutboundEvent {
    pub fn online_users(users: &[UserId]) -> Self {
        OutboundEvent::OnlineUsersList {
            users: users.iter().map(UserId::to_string).collect(),
        }
    }
}

/// 写到单个连接上的一帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Event(OutboundEvent),
    Error { error: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<OutboundEvent> for ServerFrame {
    fn from(event: OutboundEvent) -> Self {
        ServerFrame::Event(event)
    }
}
