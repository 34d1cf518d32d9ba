use std::collections::HashMap;
use std::sync::Arc;

use domain::{Message, UserId};

use crate::dto::{ConversationDto, MessageDto, ReplyPreviewDto, UserDto};
use crate::error::ApplicationError;
use crate::repository::{ConversationOverview, ConversationRepository, UserDirectory};

/// 把领域实体组装成对外 DTO，查询发送者资料和被回复的消息
#[derive(Clone)]
pub struct MessagePresenter {
    repository: Arc<dyn ConversationRepository>,
    users: Arc<dyn UserDirectory>,
}

type UserCache = HashMap<UserId, UserDto>;

impl MessagePresenter {
    pub fn new(repository: Arc<dyn ConversationRepository>, users: Arc<dyn UserDirectory>) -> Self {
        Self { repository, users }
    }

    async fn cached_user(
        &self,
        cache: &mut UserCache,
        id: UserId,
    ) -> Result<UserDto, ApplicationError> {
        if let Some(user) = cache.get(&id) {
            return Ok(user.clone());
        }
        let user = self
            .users
            .find_user(id)
            .await?
            .map(|profile| UserDto::from(&profile))
            .unwrap_or_else(|| UserDto::unknown(id));
        cache.insert(id, user.clone());
        Ok(user)
    }

    async fn render(
        &self,
        cache: &mut UserCache,
        message: &Message,
    ) -> Result<MessageDto, ApplicationError> {
        let sender = self.cached_user(cache, message.sender_id).await?;
        let reply = match message.reply_to {
            Some(reply_id) => match self.repository.find_message(reply_id).await? {
                Some(target) => {
                    let target_sender = self.cached_user(cache, target.sender_id).await?;
                    Some(ReplyPreviewDto::new(&target, &target_sender))
                }
                None => None,
            },
            None => None,
        };
        Ok(MessageDto::new(message, sender, reply))
    }

    pub async fn message(&self, message: &Message) -> Result<MessageDto, ApplicationError> {
        self.render(&mut UserCache::new(), message).await
    }

    pub async fn messages(&self, messages: &[Message]) -> Result<Vec<MessageDto>, ApplicationError> {
        let mut cache = UserCache::new();
        let mut rendered = Vec::with_capacity(messages.len());
        for message in messages {
            rendered.push(self.render(&mut cache, message).await?);
        }
        Ok(rendered)
    }

    pub async fn conversation(
        &self,
        overview: &ConversationOverview,
        unread_count: u64,
    ) -> Result<ConversationDto, ApplicationError> {
        let mut cache = UserCache::new();
        let mut participants = Vec::with_capacity(overview.conversation.participants.len());
        for id in &overview.conversation.participants {
            participants.push(self.cached_user(&mut cache, *id).await?);
        }
        let last_message = match &overview.last_message {
            Some(message) => Some(self.render(&mut cache, message).await?),
            None => None,
        };
        Ok(ConversationDto::new(
            &overview.conversation,
            participants,
            last_message,
            unread_count,
        ))
    }
}
