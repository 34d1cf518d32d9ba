//! 内存实现，用于测试与单节点开发环境。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    direct_pair, Conversation, ConversationId, DomainError, Message, MessageId, NewMessage,
    RepositoryError, RepositoryResult, UserId, UserProfile,
};
use tokio::sync::{Mutex, RwLock};

use super::{
    latest_visible_message, sort_overviews, ConversationOverview, ConversationRepository,
    UserDirectory,
};
use crate::clock::Clock;

#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<UserId, UserProfile>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = UserProfile>) -> Self {
        Self {
            users: RwLock::new(users.into_iter().map(|user| (user.id, user)).collect()),
        }
    }

    pub async fn insert(&self, user: UserProfile) {
        self.users.write().await.insert(user.id, user);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_user(&self, id: UserId) -> RepositoryResult<Option<UserProfile>> {
        Ok(self.users.read().await.get(&id).cloned())
    }
}

#[derive(Default)]
struct MemoryState {
    last_conversation_id: i64,
    last_message_id: i64,
    conversations: BTreeMap<ConversationId, Conversation>,
    messages: BTreeMap<MessageId, Message>,
    direct_index: HashMap<(UserId, UserId), ConversationId>,
}

impl MemoryState {
    fn conversation_mut(&mut self, id: ConversationId) -> RepositoryResult<&mut Conversation> {
        self.conversations
            .get_mut(&id)
            .ok_or_else(|| DomainError::not_found("conversation", id).into())
    }

    fn insert_conversation(
        &mut self,
        participants: BTreeSet<UserId>,
        now: domain::Timestamp,
    ) -> RepositoryResult<Conversation> {
        self.last_conversation_id += 1;
        let conversation =
            Conversation::new(ConversationId(self.last_conversation_id), participants, now)?;
        self.conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    fn messages_of(&self, conversation_id: ConversationId) -> impl Iterator<Item = &Message> {
        self.messages
            .values()
            .filter(move |message| message.conversation_id == conversation_id)
    }
}

pub struct InMemoryConversationRepository {
    users: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
}

impl InMemoryConversationRepository {
    pub fn new(users: Arc<dyn UserDirectory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            users,
            clock,
            state: Mutex::new(MemoryState::default()),
        }
    }

    async fn ensure_users_exist(&self, participants: &BTreeSet<UserId>) -> RepositoryResult<()> {
        let missing = self.users.missing_users(participants).await?;
        if missing.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = missing.iter().map(UserId::to_string).collect();
        Err(DomainError::validation(
            "participant_ids",
            format!("Users not found: {}", ids.join(", ")),
        )
        .into())
    }
}

#[async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn find_conversation(&self, id: ConversationId) -> RepositoryResult<Option<Conversation>> {
        Ok(self.state.lock().await.conversations.get(&id).cloned())
    }

    async fn find_direct_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> RepositoryResult<Option<Conversation>> {
        let state = self.state.lock().await;
        Ok(state
            .direct_index
            .get(&direct_pair(a, b))
            .and_then(|id| state.conversations.get(id))
            .cloned())
    }

    async fn create_conversation(
        &self,
        participants: BTreeSet<UserId>,
    ) -> RepositoryResult<Conversation> {
        let participants = Conversation::normalize_participants(participants)?;
        if participants.len() == 2 {
            let mut pair = participants.iter().copied();
            if let (Some(a), Some(b)) = (pair.next(), pair.next()) {
                let (conversation, _) = self.get_or_create_direct_conversation(a, b).await?;
                return Ok(conversation);
            }
        }

        self.ensure_users_exist(&participants).await?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.insert_conversation(participants, now)
    }

    async fn get_or_create_direct_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> RepositoryResult<(Conversation, bool)> {
        if a == b {
            return Err(DomainError::validation(
                "participant_ids",
                "Cannot create a conversation with yourself.",
            )
            .into());
        }
        let participants: BTreeSet<UserId> = [a, b].into_iter().collect();
        self.ensure_users_exist(&participants).await?;

        let now = self.clock.now();
        let key = direct_pair(a, b);
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .direct_index
            .get(&key)
            .and_then(|id| state.conversations.get(id))
        {
            return Ok((existing.clone(), false));
        }

        let conversation = state.insert_conversation(participants, now)?;
        state.direct_index.insert(key, conversation.id);
        Ok((conversation, true))
    }

    async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> RepositoryResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .conversations
            .get(&conversation_id)
            .is_some_and(|conversation| conversation.has_participant(user_id)))
    }

    async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> RepositoryResult<Vec<ConversationOverview>> {
        let state = self.state.lock().await;
        let mut overviews: Vec<ConversationOverview> = state
            .conversations
            .values()
            .filter(|conversation| conversation.has_participant(user_id))
            .map(|conversation| ConversationOverview {
                conversation: conversation.clone(),
                last_message: latest_visible_message(state.messages_of(conversation.id)).cloned(),
            })
            .collect();

        sort_overviews(&mut overviews);
        Ok(overviews)
    }

    async fn append_message(&self, message: NewMessage) -> RepositoryResult<Message> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let conversation = state
            .conversations
            .get(&message.conversation_id)
            .ok_or_else(|| DomainError::not_found("conversation", message.conversation_id))?;
        if !conversation.has_participant(message.sender_id) {
            return Err(DomainError::permission_denied(
                "You are not a participant in this conversation.",
            )
            .into());
        }
        // 保证同一会话内消息时间单调不减
        let timestamp = now.max(conversation.updated_at);

        let target = message
            .reply_to
            .and_then(|reply_id| state.messages.get(&reply_id));
        message.check_reply_target(target)?;

        state.last_message_id += 1;
        let stored = message.into_message(MessageId(state.last_message_id), timestamp);
        state.conversation_mut(stored.conversation_id)?.touch(timestamp);
        state.messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find_message(&self, id: MessageId) -> RepositoryResult<Option<Message>> {
        Ok(self.state.lock().await.messages.get(&id).cloned())
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> RepositoryResult<Vec<Message>> {
        let state = self.state.lock().await;
        let mut messages: Vec<Message> = state.messages_of(conversation_id).cloned().collect();
        messages.sort_by_key(|message| (message.timestamp, message.id));
        Ok(messages)
    }

    async fn edit_message(
        &self,
        id: MessageId,
        editor: UserId,
        content: String,
    ) -> RepositoryResult<Message> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .get_mut(&id)
            .ok_or_else(|| DomainError::not_found("message", id))?;
        message.edit(editor, content, now)?;
        let edited = message.clone();
        state.conversation_mut(edited.conversation_id)?.touch(now);
        Ok(edited)
    }

    async fn soft_delete_message(
        &self,
        id: MessageId,
        requester: UserId,
    ) -> RepositoryResult<(Message, bool)> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .get_mut(&id)
            .ok_or_else(|| DomainError::not_found("message", id))?;
        let changed = message.soft_delete(requester, now)?;
        let snapshot = message.clone();
        if changed {
            state.conversation_mut(snapshot.conversation_id)?.touch(now);
        }
        Ok((snapshot, changed))
    }

    async fn delete_message(&self, id: MessageId) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        if state.messages.remove(&id).is_none() {
            return Err(RepositoryError::NotFound);
        }
        for message in state.messages.values_mut() {
            message.clear_reply_to(id);
        }
        Ok(())
    }

    async fn delete_conversation(&self, id: ConversationId) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        if !state.conversations.contains_key(&id) {
            return Err(RepositoryError::NotFound);
        }

        let owned: BTreeSet<MessageId> = state.messages_of(id).map(|message| message.id).collect();
        state.messages.retain(|message_id, _| !owned.contains(message_id));
        for message in state.messages.values_mut() {
            if let Some(target) = message.reply_to.filter(|target| owned.contains(target)) {
                message.clear_reply_to(target);
            }
        }
        state.direct_index.retain(|_, conversation_id| *conversation_id != id);
        state.conversations.remove(&id);
        Ok(())
    }
}
