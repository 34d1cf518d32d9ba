//! 基础设施层实现。
//!
//! 提供 PostgreSQL 仓储、Redis 分组广播与在线状态存储，实现应用层定义的接口。

pub mod broadcast;
pub mod builder;
pub mod migrations;
pub mod presence_storage;
pub mod repository;

pub use broadcast::RedisGroupBroadcaster;
pub use builder::{Infrastructure, InfrastructureError};
pub use migrations::MIGRATOR;
pub use presence_storage::connect_presence_store;
pub use repository::{
    create_pg_pool, NewUser, PgConversationRepository, PgStorage, PgUserDirectory,
};
