use std::collections::BTreeSet;
use std::sync::Arc;

use domain::{
    Conversation, ConversationId, DomainError, ImageRef, MessageId, NewMessage, UserId,
};

use crate::{
    broadcaster::{GroupBroadcaster, GroupEnvelope},
    dto::{ConversationDto, MessageDto},
    error::ApplicationError,
    events::{conversation_group, user_group, OutboundEvent},
    repository::{
        latest_visible_message, ConversationOverview, ConversationRepository, UnreadCounter,
        UserDirectory,
    },
    services::presenter::MessagePresenter,
};

/// 通过 REST 发送消息的请求体
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub content: Option<String>,
    pub image: Option<String>,
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone)]
pub struct SendMessageToUserRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub draft: MessageDraft,
}

#[derive(Debug, Clone)]
pub struct CreateConversationRequest {
    pub requester_id: UserId,
    pub participant_ids: Vec<UserId>,
}

#[derive(Debug, Clone)]
pub struct PostConversationMessageRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub draft: MessageDraft,
}

#[derive(Debug, Clone)]
pub struct EditMessageRequest {
    pub message_id: MessageId,
    pub editor_id: UserId,
    pub content: String,
}

pub struct ConversationServiceDependencies {
    pub repository: Arc<dyn ConversationRepository>,
    pub users: Arc<dyn UserDirectory>,
    pub broadcaster: Arc<dyn GroupBroadcaster>,
    pub unread_counter: Arc<dyn UnreadCounter>,
}

/// 会话与消息的同步操作，成功后把变更推送到实时分组
pub struct ConversationService {
    deps: ConversationServiceDependencies,
    presenter: MessagePresenter,
}

impl ConversationService {
    pub fn new(deps: ConversationServiceDependencies) -> Self {
        let presenter = MessagePresenter::new(deps.repository.clone(), deps.users.clone());
        Self { deps, presenter }
    }

    /// 与某个用户的两人会话历史；对方是自己、不存在或没有会话时返回空列表
    pub async fn messages_with_user(
        &self,
        requester_id: UserId,
        other_id: UserId,
    ) -> Result<Vec<MessageDto>, ApplicationError> {
        if requester_id == other_id || !self.deps.users.user_exists(other_id).await? {
            return Ok(Vec::new());
        }
        let Some(conversation) = self
            .deps
            .repository
            .find_direct_conversation(requester_id, other_id)
            .await?
        else {
            return Ok(Vec::new());
        };
        let messages = self.deps.repository.list_messages(conversation.id).await?;
        self.presenter.messages(&messages).await
    }

    /// 给某个用户发消息，必要时隐式创建两人会话
    pub async fn send_message_to_user(
        &self,
        request: SendMessageToUserRequest,
    ) -> Result<MessageDto, ApplicationError> {
        let SendMessageToUserRequest {
            sender_id,
            receiver_id,
            draft,
        } = request;

        if !self.deps.users.user_exists(receiver_id).await? {
            return Err(ApplicationError::not_found("user", receiver_id));
        }
        if sender_id == receiver_id {
            return Err(DomainError::validation("receiver", "Cannot send messages to yourself.").into());
        }
        // 先校验消息内容和回复目标，避免为无效消息创建空会话
        let image = draft.image.and_then(ImageRef::parse);
        let existing = self
            .deps
            .repository
            .find_direct_conversation(sender_id, receiver_id)
            .await?;
        // 还没有会话时任何回复目标都属于其他会话
        let pending = NewMessage::compose(
            existing.as_ref().map_or(ConversationId(0), |conversation| conversation.id),
            sender_id,
            draft.content.clone(),
            image.clone(),
            draft.reply_to,
        )?;
        if let Some(reply_id) = draft.reply_to {
            let target = self.deps.repository.find_message(reply_id).await?;
            pending.check_reply_target(target.as_ref())?;
        }

        let (conversation, created) = self
            .deps
            .repository
            .get_or_create_direct_conversation(sender_id, receiver_id)
            .await?;
        if created {
            tracing::info!(
                conversation_id = %conversation.id,
                sender_id = %sender_id,
                receiver_id = %receiver_id,
                "首次发消息，创建两人会话"
            );
        }

        let new_message = NewMessage::compose(
            conversation.id,
            sender_id,
            draft.content,
            image,
            draft.reply_to,
        )?;
        let message = self.deps.repository.append_message(new_message).await?;
        let dto = self.presenter.message(&message).await?;

        self.publish(
            conversation_group(conversation.id),
            OutboundEvent::ChatMessage {
                message: dto.clone(),
            },
        )
        .await;
        self.notify_new_message(&conversation, sender_id, &dto).await;

        Ok(dto)
    }

    pub async fn list_conversations(
        &self,
        requester_id: UserId,
    ) -> Result<Vec<ConversationDto>, ApplicationError> {
        let overviews = self
            .deps
            .repository
            .list_conversations_for_user(requester_id)
            .await?;

        let mut conversations = Vec::with_capacity(overviews.len());
        for overview in &overviews {
            let unread = self
                .deps
                .unread_counter
                .unread_count(overview.conversation.id, requester_id)
                .await;
            conversations.push(self.presenter.conversation(overview, unread).await?);
        }
        Ok(conversations)
    }

    /// 创建会话，请求者自动加入。两人会话已存在时直接返回，不重复通知。
    pub async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<ConversationDto, ApplicationError> {
        let requester_id = request.requester_id;
        let participants = Conversation::normalize_participants(
            request
                .participant_ids
                .into_iter()
                .chain(std::iter::once(requester_id)),
        )?;

        let (conversation, created) = if participants.len() == 2 {
            let other = participants
                .iter()
                .copied()
                .find(|id| *id != requester_id)
                .ok_or_else(|| {
                    DomainError::validation(
                        "participant_ids",
                        "A conversation requires at least two unique participants.",
                    )
                })?;
            self.deps
                .repository
                .get_or_create_direct_conversation(requester_id, other)
                .await?
        } else {
            let conversation = self
                .deps
                .repository
                .create_conversation(participants.clone())
                .await?;
            (conversation, true)
        };

        let overview = self.overview_of(conversation).await?;
        let unread = self
            .deps
            .unread_counter
            .unread_count(overview.conversation.id, requester_id)
            .await;
        let dto = self.presenter.conversation(&overview, unread).await?;

        if created {
            tracing::info!(
                conversation_id = %dto.id,
                created_by = %requester_id,
                participants = overview.conversation.participants.len(),
                "会话已创建"
            );
            for participant in overview.conversation.other_participants(requester_id) {
                self.publish(
                    user_group(participant),
                    OutboundEvent::NewConversationAdded {
                        conversation_id: dto.id,
                        conversation: dto.clone(),
                        created_by: requester_id,
                    },
                )
                .await;
            }
        }

        Ok(dto)
    }

    pub async fn conversation_messages(
        &self,
        requester_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessageDto>, ApplicationError> {
        self.ensure_participant(conversation_id, requester_id).await?;
        let messages = self.deps.repository.list_messages(conversation_id).await?;
        self.presenter.messages(&messages).await
    }

    pub async fn post_conversation_message(
        &self,
        request: PostConversationMessageRequest,
    ) -> Result<MessageDto, ApplicationError> {
        let conversation = self
            .ensure_participant(request.conversation_id, request.sender_id)
            .await?;

        let new_message = NewMessage::compose(
            conversation.id,
            request.sender_id,
            request.draft.content,
            request.draft.image.and_then(ImageRef::parse),
            request.draft.reply_to,
        )?;
        let message = self.deps.repository.append_message(new_message).await?;
        let dto = self.presenter.message(&message).await?;

        self.publish(
            conversation_group(conversation.id),
            OutboundEvent::ChatMessage {
                message: dto.clone(),
            },
        )
        .await;
        self.notify_new_message(&conversation, request.sender_id, &dto)
            .await;

        Ok(dto)
    }

    pub async fn get_message(
        &self,
        requester_id: UserId,
        message_id: MessageId,
    ) -> Result<MessageDto, ApplicationError> {
        let message = self
            .deps
            .repository
            .find_message(message_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("message", message_id))?;
        if !self
            .deps
            .repository
            .is_participant(message.conversation_id, requester_id)
            .await?
        {
            return Err(ApplicationError::not_found("message", message_id));
        }
        self.presenter.message(&message).await
    }

    pub async fn edit_message(
        &self,
        request: EditMessageRequest,
    ) -> Result<MessageDto, ApplicationError> {
        let message = self
            .deps
            .repository
            .edit_message(request.message_id, request.editor_id, request.content)
            .await?;
        let dto = self.presenter.message(&message).await?;

        self.publish(
            conversation_group(message.conversation_id),
            OutboundEvent::MessageUpdated {
                message: dto.clone(),
            },
        )
        .await;
        Ok(dto)
    }

    /// 软删除；重复删除不会再次广播
    pub async fn delete_message(
        &self,
        requester_id: UserId,
        message_id: MessageId,
    ) -> Result<(), ApplicationError> {
        let (message, changed) = self
            .deps
            .repository
            .soft_delete_message(message_id, requester_id)
            .await?;
        if !changed {
            tracing::debug!(message_id = %message_id, "消息已是删除状态");
            return Ok(());
        }

        let dto = self.presenter.message(&message).await?;
        self.publish(
            conversation_group(message.conversation_id),
            OutboundEvent::MessageDeleted {
                message_id: message.id,
                conversation_id: message.conversation_id,
                message: dto,
            },
        )
        .await;
        Ok(())
    }

    async fn ensure_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, ApplicationError> {
        match self.deps.repository.find_conversation(conversation_id).await? {
            Some(conversation) if conversation.has_participant(user_id) => Ok(conversation),
            _ => Err(ApplicationError::not_found("conversation", conversation_id)),
        }
    }

    async fn overview_of(
        &self,
        conversation: Conversation,
    ) -> Result<ConversationOverview, ApplicationError> {
        let messages = self.deps.repository.list_messages(conversation.id).await?;
        let last_message = latest_visible_message(&messages).cloned();
        Ok(ConversationOverview {
            conversation,
            last_message,
        })
    }

    /// 通知其他参与者的个人通知组
    async fn notify_new_message(
        &self,
        conversation: &Conversation,
        sender_id: UserId,
        message: &MessageDto,
    ) {
        let sender_username = match self.deps.users.display_name(sender_id).await {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!(user_id = %sender_id, error = %err, "读取发送者名称失败");
                domain::fallback_display_name(sender_id)
            }
        };
        let recipients: BTreeSet<UserId> = conversation.other_participants(sender_id).collect();
        for recipient in recipients {
            self.publish(
                user_group(recipient),
                OutboundEvent::NewMessageNotification {
                    message: message.clone(),
                    conversation_id: conversation.id,
                    sender_id,
                    sender_username: sender_username.clone(),
                },
            )
            .await;
        }
    }

    /// 推送是尽力而为的，失败只记录日志，不影响已提交的数据
    async fn publish(&self, group: String, event: OutboundEvent) {
        if let Err(err) = self
            .deps
            .broadcaster
            .publish(GroupEnvelope::new(group.clone(), event))
            .await
        {
            tracing::warn!(group = %group, error = %err, "推送实时事件失败");
        }
    }
}
