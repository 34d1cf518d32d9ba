//! 应用层实现。
//!
//! 这里提供围绕领域模型的用例服务：REST 网关的会话与消息操作、
//! 实时连接的状态机，以及对持久化、分组广播、在线状态存储的抽象。

pub mod broadcaster;
pub mod clock;
pub mod dto;
pub mod error;
pub mod events;
pub mod local_broadcast;
pub mod presence;
pub mod repository;
pub mod services;

pub use broadcaster::{
    BroadcastError, Channel, ChannelId, ChannelRegistry, GroupBroadcaster, GroupEnvelope,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dto::{ConversationDto, MessageDto, ReplyPreviewDto, UserDto};
pub use error::ApplicationError;
pub use events::{
    conversation_group, user_group, InboundChatEvent, InboundPresenceEvent, OutboundEvent,
    ServerFrame, PRESENCE_GROUP,
};
pub use local_broadcast::{LocalGroupBroadcaster, DEFAULT_CHANNEL_CAPACITY};
pub use presence::{
    memory::MemoryPresenceStore, PresenceBackend, PresenceError, PresenceStore,
    RedisPresenceStore, DEFAULT_PRESENCE_KEY,
};
pub use repository::{
    memory::{InMemoryConversationRepository, InMemoryUserDirectory},
    latest_visible_message, sort_overviews, ConversationOverview, ConversationRepository,
    NoUnreadCounter, UnreadCounter, UserDirectory,
};
pub use services::{
    ChatSession, ChatSessionState, ConversationService, ConversationServiceDependencies,
    CreateConversationRequest, EditMessageRequest, MessageDraft, MessagePresenter,
    PostConversationMessageRequest, PresenceSession, PresenceSessionState,
    SendMessageToUserRequest, SessionDependencies, SessionRejection, SocketSession,
};
