use std::sync::Arc;
use std::time::Duration;

use application::{MemoryPresenceStore, PresenceStore, RedisPresenceStore};
use redis::aio::ConnectionManager;

/// 选择在线状态存储：配置了 Redis 且探测成功时用 Redis，否则使用本进程内存。
///
/// 只在启动时探测一次，回退后不会再切回 Redis。
pub async fn connect_presence_store(
    redis_url: Option<&str>,
    key: &str,
    probe_timeout: Duration,
) -> Arc<dyn PresenceStore> {
    let Some(url) = redis_url else {
        tracing::info!("未配置 Redis，在线状态使用内存存储");
        return Arc::new(MemoryPresenceStore::new());
    };

    match tokio::time::timeout(probe_timeout, probe(url)).await {
        Ok(Ok(connection)) => {
            tracing::info!(key = %key, "在线状态使用 Redis 存储");
            Arc::new(RedisPresenceStore::new(connection, key))
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "Redis 不可用，在线状态退回内存存储（仅本节点可见）");
            Arc::new(MemoryPresenceStore::new())
        }
        Err(_) => {
            tracing::warn!(timeout_ms = probe_timeout.as_millis() as u64, "Redis 探测超时，在线状态退回内存存储");
            Arc::new(MemoryPresenceStore::new())
        }
    }
}

async fn probe(url: &str) -> redis::RedisResult<ConnectionManager> {
    let client = redis::Client::open(url)?;
    let mut connection = ConnectionManager::new(client).await?;
    let _: String = redis::cmd("PING").query_async(&mut connection).await?;
    Ok(connection)
}
