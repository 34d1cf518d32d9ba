use std::sync::Arc;
use std::time::Duration;

use application::{
    Clock, ConversationRepository, GroupBroadcaster, LocalGroupBroadcaster, PresenceStore,
    UserDirectory,
};
use config::{AppConfig, BroadcastBackend};
use thiserror::Error;

use crate::{
    broadcast::RedisGroupBroadcaster,
    migrations::MIGRATOR,
    presence_storage::connect_presence_store,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// 启动时装配好的基础设施适配器
#[derive(Clone)]
pub struct Infrastructure {
    pub storage: PgStorage,
    pub broadcaster: Arc<dyn GroupBroadcaster>,
    pub presence: Arc<dyn PresenceStore>,
}

impl Infrastructure {
    pub async fn connect(
        config: &AppConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, InfrastructureError> {
        tracing::info!(database = %config.database.redacted_url(), "连接数据库");
        let pool = create_pg_pool(
            &config.database.url,
            config.database.max_connections,
            Duration::from_secs(config.database.acquire_timeout_seconds),
        )
        .await?;
        MIGRATOR.run(&pool).await?;
        let storage = PgStorage::new(pool, clock);

        let broadcaster: Arc<dyn GroupBroadcaster> = match (config.broadcast.backend, config.redis_url()) {
            (BroadcastBackend::Redis, Some(url)) => Arc::new(
                RedisGroupBroadcaster::connect(
                    url,
                    config.broadcast.channel_prefix.clone(),
                    config.broadcast.channel_capacity,
                )
                .await?,
            ),
            _ => {
                tracing::info!("分组广播使用本进程内存实现");
                Arc::new(LocalGroupBroadcaster::new(config.broadcast.channel_capacity))
            }
        };

        let redis_for_presence = config.redis_url().filter(|_| config.presence.use_redis);
        let presence = connect_presence_store(
            redis_for_presence,
            &config.presence.key,
            Duration::from_millis(config.presence.probe_timeout_ms),
        )
        .await;

        Ok(Self {
            storage,
            broadcaster,
            presence,
        })
    }

    pub fn repository(&self) -> Arc<dyn ConversationRepository> {
        self.storage.conversations.clone()
    }

    pub fn users(&self) -> Arc<dyn UserDirectory> {
        self.storage.users.clone()
    }
}
