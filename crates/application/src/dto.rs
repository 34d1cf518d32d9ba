//! 对外输出的数据结构（REST 响应与实时事件共用）。

use domain::{
    fallback_display_name, Conversation, ConversationId, Message, MessageId, Timestamp, UserId,
    UserProfile, DEFAULT_AVATAR_URL,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDto {
    pub id: UserId,
    pub username: Option<String>,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub profile_pic_url: String,
}

impl UserDto {
    /// 用户目录中已不存在的用户
    pub fn unknown(id: UserId) -> Self {
        Self {
            id,
            username: None,
            email: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            full_name: fallback_display_name(id),
            profile_pic_url: DEFAULT_AVATAR_URL.to_string(),
        }
    }
}

impl From<&UserProfile> for UserDto {
    fn from(user: &UserProfile) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            full_name: user.full_name(),
            profile_pic_url: user.profile_pic_url(),
        }
    }
}

/// 被回复消息中的发送者精简信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySenderDto {
    pub id: UserId,
    pub username: Option<String>,
    pub full_name: String,
    pub profile_pic_url: String,
}

impl From<&UserDto> for ReplySenderDto {
    fn from(user: &UserDto) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            full_name: user.full_name.clone(),
            profile_pic_url: user.profile_pic_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreviewDto {
    pub id: MessageId,
    pub content: Option<String>,
    pub sender: ReplySenderDto,
    pub image_url: Option<String>,
    pub is_deleted: bool,
}

impl ReplyPreviewDto {
    pub fn new(target: &Message, sender: &UserDto) -> Self {
        Self {
            id: target.id,
            content: target.content.clone(),
            sender: ReplySenderDto::from(sender),
            image_url: target.image.as_ref().map(|image| image.url()),
            is_deleted: target.is_deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDto {
    pub id: MessageId,
    pub conversation: ConversationId,
    pub sender: UserDto,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub timestamp: Timestamp,
    pub updated_at: Timestamp,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub reply_to_message: Option<MessageId>,
    pub reply_to_message_details: Option<ReplyPreviewDto>,
}

impl MessageDto {
    pub fn new(message: &Message, sender: UserDto, reply: Option<ReplyPreviewDto>) -> Self {
        Self {
            id: message.id,
            conversation: message.conversation_id,
            sender,
            content: message.content.clone(),
            image_url: message.image.as_ref().map(|image| image.url()),
            timestamp: message.timestamp,
            updated_at: message.updated_at,
            is_edited: message.is_edited,
            is_deleted: message.is_deleted,
            reply_to_message: message.reply_to,
            reply_to_message_details: reply,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationDto {
    pub id: ConversationId,
    pub participants: Vec<UserDto>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub last_message: Option<MessageDto>,
    pub unread_count: u64,
}

impl ConversationDto {
    pub fn new(
        conversation: &Conversation,
        participants: Vec<UserDto>,
        last_message: Option<MessageDto>,
        unread_count: u64,
    ) -> Self {
        Self {
            id: conversation.id,
            participants,
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
            last_message,
            unread_count,
        }
    }
}
