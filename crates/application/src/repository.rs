//! 持久化接口：会话与消息仓储、用户目录、未读数钩子。

use std::collections::BTreeSet;

use async_trait::async_trait;
use domain::{
    fallback_display_name, Conversation, ConversationId, Message, MessageId, NewMessage,
    RepositoryResult, UserId, UserProfile,
};

pub mod memory;

/// 会话列表项：会话本身及其最新一条未删除消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationOverview {
    pub conversation: Conversation,
    pub last_message: Option<Message>,
}

/// 用户目录（用户由外部系统管理，这里只读取资料）
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, id: UserId) -> RepositoryResult<Option<UserProfile>>;

    async fn user_exists(&self, id: UserId) -> RepositoryResult<bool> {
        Ok(self.find_user(id).await?.is_some())
    }

    /// 返回不存在的用户 ID
    async fn missing_users(&self, ids: &BTreeSet<UserId>) -> RepositoryResult<Vec<UserId>> {
        let mut missing = Vec::new();
        for id in ids {
            if !self.user_exists(*id).await? {
                missing.push(*id);
            }
        }
        Ok(missing)
    }

    async fn display_name(&self, id: UserId) -> RepositoryResult<String> {
        Ok(self
            .find_user(id)
            .await?
            .map(|user| user.display_name())
            .unwrap_or_else(|| fallback_display_name(id)))
    }
}

/// 会话与消息仓储。所有写操作都是原子的。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find_conversation(&self, id: ConversationId) -> RepositoryResult<Option<Conversation>>;

    /// 参与者恰好为 {a, b} 的会话
    async fn find_direct_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> RepositoryResult<Option<Conversation>>;

    /// 参与者少于两人或有不存在的用户时返回校验错误；两人会话与已有会话去重
    async fn create_conversation(
        &self,
        participants: BTreeSet<UserId>,
    ) -> RepositoryResult<Conversation>;

    /// 原子地查找或创建两人会话，返回值第二项表示是否新建
    async fn get_or_create_direct_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> RepositoryResult<(Conversation, bool)>;

    async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> RepositoryResult<bool>;

    /// 按 updated_at 倒序，其次按最新未删除消息时间倒序（无消息的排最后）
    async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> RepositoryResult<Vec<ConversationOverview>>;

    /// 写入消息并同时更新会话的 updated_at
    async fn append_message(&self, message: NewMessage) -> RepositoryResult<Message>;

    async fn find_message(&self, id: MessageId) -> RepositoryResult<Option<Message>>;

    /// 按 timestamp 升序，同一时间按 id 升序
    async fn list_messages(&self, conversation_id: ConversationId) -> RepositoryResult<Vec<Message>>;

    async fn edit_message(
        &self,
        id: MessageId,
        editor: UserId,
        content: String,
    ) -> RepositoryResult<Message>;

    /// 幂等软删除，返回值第二项表示本次是否改变了状态
    async fn soft_delete_message(
        &self,
        id: MessageId,
        requester: UserId,
    ) -> RepositoryResult<(Message, bool)>;

    /// 管理操作：物理删除消息，并清空所有指向它的回复引用
    async fn delete_message(&self, id: MessageId) -> RepositoryResult<()>;

    /// 管理操作：先删除会话下所有消息，再删除会话
    async fn delete_conversation(&self, id: ConversationId) -> RepositoryResult<()>;
}

/// 未读数钩子
#[async_trait]
pub trait UnreadCounter: Send + Sync {
    async fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> u64;
}

/// 不统计未读，始终为 0
#[derive(Debug, Default)]
pub struct NoUnreadCounter;

#[async_trait]
impl UnreadCounter for NoUnreadCounter {
    async fn unread_count(&self, _conversation_id: ConversationId, _user_id: UserId) -> u64 {
        0
    }
}

/// 最新一条未删除消息
pub fn latest_visible_message<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Option<&'a Message> {
    messages
        .into_iter()
        .filter(|message| !message.is_deleted)
        .max_by_key(|message| (message.timestamp, message.id))
}

/// 会话列表排序：updated_at 倒序，其次最新消息时间倒序，最后按 ID 倒序
pub fn sort_overviews(overviews: &mut [ConversationOverview]) {
    overviews.sort_by(|left, right| {
        let left_last = left.last_message.as_ref().map(|m| m.timestamp);
        let right_last = right.last_message.as_ref().map(|m| m.timestamp);
        right
            .conversation
            .updated_at
            .cmp(&left.conversation.updated_at)
            // None 小于 Some，倒序后无消息的会话排在最后
            .then_with(|| right_last.cmp(&left_last))
            .then_with(|| right.conversation.id.cmp(&left.conversation.id))
    });
}
