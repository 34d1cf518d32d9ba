//! 聊天系统核心领域模型
//!
//! 包含会话、消息、用户资料等实体，以及编辑时限、软删除、参与者校验等业务规则。

pub mod conversation;
pub mod errors;
pub mod message;
pub mod user;
pub mod value_objects;

// 重新导出常用类型
pub use conversation::{direct_pair, Conversation};
pub use errors::{DomainError, RepositoryError, RepositoryResult};
pub use message::{Message, NewMessage, EDIT_WINDOW_HOURS};
pub use user::{fallback_display_name, UserProfile, DEFAULT_AVATAR_URL};
pub use value_objects::{ConversationId, ImageRef, MessageId, Timestamp, UserId, MEDIA_URL};
