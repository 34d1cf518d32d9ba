//! 在线状态存储。
//!
//! 在线状态按用户做连接引用计数：同一用户开着多个在线状态连接时，
//! 只有最后一个连接关闭才会把用户移出在线列表。

use async_trait::async_trait;
use domain::UserId;
use thiserror::Error;

/// Redis 中保存在线连接计数的哈希键
pub const DEFAULT_PRESENCE_KEY: &str = "chat_app:online_connections";

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence backend error: {0}")]
    Backend(String),
    #[error("invalid presence entry: {0}")]
    InvalidEntry(String),
}

impl From<redis::RedisError> for PresenceError {
    fn from(err: redis::RedisError) -> Self {
        PresenceError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceBackend {
    Memory,
    Redis,
}

impl std::fmt::Display for PresenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceBackend::Memory => f.write_str("memory"),
            PresenceBackend::Redis => f.write_str("redis"),
        }
    }
}

/// 在线用户集合
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 用户新增一个在线连接
    async fn add(&self, user_id: UserId) -> Result<(), PresenceError>;

    /// 用户关闭一个在线连接，计数归零时移出在线集合
    async fn remove(&self, user_id: UserId) -> Result<(), PresenceError>;

    /// 当前在线用户，按 ID 升序
    async fn online_users(&self) -> Result<Vec<UserId>, PresenceError>;

    fn backend(&self) -> PresenceBackend;
}

/// Redis 实现的在线状态存储，多节点共享
pub struct RedisPresenceStore {
    connection: redis::aio::ConnectionManager,
    key: String,
    release: redis::Script,
}

// 原子地递减计数，归零时删除字段
const RELEASE_SCRIPT: &str = r#"
local remaining = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if remaining <= 0 then
    redis.call('HDEL', KEYS[1], ARGV[1])
    return 0
end
return remaining
"#;

impl RedisPresenceStore {
    pub fn new(connection: redis::aio::ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            connection,
            key: key.into(),
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add(&self, user_id: UserId) -> Result<(), PresenceError> {
        let mut conn = self.connection.clone();
        let connections: i64 = redis::cmd("HINCRBY")
            .arg(&self.key)
            .arg(user_id.to_string())
            .arg(1)
            .query_async(&mut conn)
            .await?;

        tracing::debug!(user_id = %user_id, connections, "用户上线");
        Ok(())
    }

    async fn remove(&self, user_id: UserId) -> Result<(), PresenceError> {
        let mut conn = self.connection.clone();
        let remaining: i64 = self
            .release
            .key(&self.key)
            .arg(user_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        tracing::debug!(user_id = %user_id, remaining, "用户连接断开");
        Ok(())
    }

    async fn online_users(&self) -> Result<Vec<UserId>, PresenceError> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = redis::cmd("HKEYS")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;

        let mut users = members
            .into_iter()
            .map(|member| {
                member
                    .parse::<UserId>()
                    .map_err(|err| PresenceError::InvalidEntry(format!("{member}: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        users.sort();
        Ok(users)
    }

    fn backend(&self) -> PresenceBackend {
        PresenceBackend::Redis
    }
}

pub mod memory {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex;

    /// 进程内在线状态存储，仅对本节点可见
    #[derive(Default)]
    pub struct MemoryPresenceStore {
        connections: Mutex<BTreeMap<UserId, usize>>,
    }

    impl MemoryPresenceStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl PresenceStore for MemoryPresenceStore {
        async fn add(&self, user_id: UserId) -> Result<(), PresenceError> {
            let mut connections = self.connections.lock().await;
            *connections.entry(user_id).or_insert(0) += 1;
            Ok(())
        }

        async fn remove(&self, user_id: UserId) -> Result<(), PresenceError> {
            let mut connections = self.connections.lock().await;
            if let Some(count) = connections.get_mut(&user_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    connections.remove(&user_id);
                }
            }
            Ok(())
        }

        async fn online_users(&self) -> Result<Vec<UserId>, PresenceError> {
            Ok(self.connections.lock().await.keys().copied().collect())
        }

        fn backend(&self) -> PresenceBackend {
            PresenceBackend::Memory
        }
    }

}
