use chrono::Duration;

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, ImageRef, MessageId, Timestamp, UserId};

/// 消息发送后允许编辑的时长（小时）
pub const EDIT_WINDOW_HOURS: i64 = 24;

/// 待写入的新消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: Option<String>,
    pub image: Option<ImageRef>,
    pub reply_to: Option<MessageId>,
}

impl NewMessage {
    /// 构造新消息，空白文本视为无文本。文本和图片至少要有一个。
    pub fn compose(
        conversation_id: ConversationId,
        sender_id: UserId,
        content: Option<String>,
        image: Option<ImageRef>,
        reply_to: Option<MessageId>,
    ) -> Result<Self, DomainError> {
        let content = content.filter(|text| !text.trim().is_empty());
        if content.is_none() && image.is_none() {
            return Err(DomainError::validation(
                "content",
                "A message must have either text content or an image.",
            ));
        }
        Ok(Self {
            conversation_id,
            sender_id,
            content,
            image,
            reply_to,
        })
    }

    /// 校验回复目标：必须存在于同一会话且未被删除
    pub fn check_reply_target(&self, target: Option<&Message>) -> Result<(), DomainError> {
        let Some(reply_id) = self.reply_to else {
            return Ok(());
        };
        match target {
            None => Err(DomainError::validation(
                "reply_to_message_id",
                format!("Message to reply to ({reply_id}) does not exist."),
            )),
            Some(target) if target.conversation_id != self.conversation_id => {
                Err(DomainError::validation(
                    "reply_to_message_id",
                    "Cannot reply to a message from a different conversation.",
                ))
            }
            Some(target) if target.is_deleted => Err(DomainError::validation(
                "reply_to_message_id",
                "Cannot reply to a deleted message.",
            )),
            Some(_) => Ok(()),
        }
    }

    /// 存储分配 ID 后生成消息实体
    pub fn into_message(self, id: MessageId, timestamp: Timestamp) -> Message {
        Message {
            id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content: self.content,
            image: self.image,
            timestamp,
            updated_at: timestamp,
            is_edited: false,
            is_deleted: false,
            reply_to: self.reply_to,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: Option<String>,
    pub image: Option<ImageRef>,
    /// 创建时间，不可变
    pub timestamp: Timestamp,
    pub updated_at: Timestamp,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub reply_to: Option<MessageId>,
}

impl Message {
    fn ensure_sender(&self, user_id: UserId, action: &str) -> Result<(), DomainError> {
        if self.sender_id != user_id {
            return Err(DomainError::permission_denied(format!(
                "You do not have permission to {action} this message."
            )));
        }
        Ok(())
    }

    /// 编辑文本内容。检查顺序：发送者、删除状态、24 小时窗口。
    pub fn edit(
        &mut self,
        editor: UserId,
        new_content: impl Into<String>,
        now: Timestamp,
    ) -> Result<(), DomainError> {
        self.ensure_sender(editor, "edit")?;
        if self.is_deleted {
            return Err(DomainError::invalid_state("Cannot modify a deleted message."));
        }
        if now - self.timestamp > Duration::hours(EDIT_WINDOW_HOURS) {
            return Err(DomainError::permission_denied("Edit time limit exceeded."));
        }
        let new_content = new_content.into();
        if new_content.trim().is_empty() && self.image.is_none() {
            return Err(DomainError::validation(
                "content",
                "A message must have either text content or an image.",
            ));
        }

        self.content = Some(new_content).filter(|text| !text.trim().is_empty());
        self.is_edited = true;
        self.updated_at = now;
        Ok(())
    }

    /// 软删除。已删除时返回 `Ok(false)`，不做任何修改。
    pub fn soft_delete(&mut self, requester: UserId, now: Timestamp) -> Result<bool, DomainError> {
        self.ensure_sender(requester, "delete")?;
        if self.is_deleted {
            return Ok(false);
        }
        self.is_deleted = true;
        self.content = None;
        self.image = None;
        self.updated_at = now;
        Ok(true)
    }

    /// 目标被物理删除后清空回复引用
    pub fn clear_reply_to(&mut self, target: MessageId) -> bool {
        if self.reply_to == Some(target) {
            self.reply_to = None;
            true
        } else {
            false
        }
    }

    /// 日志用的简短预览
    pub fn preview(&self) -> String {
        match (&self.content, &self.image) {
            (Some(text), _) if text.chars().count() > 30 => {
                format!("{}...", text.chars().take(30).collect::<String>())
            }
            (Some(text), _) => text.clone(),
            (None, Some(_)) => "[Image]".to_string(),
            (None, None) => "[Empty Message]".to_string(),
        }
    }
}
