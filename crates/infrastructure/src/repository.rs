//! PostgreSQL 仓储实现。
//!
//! 每个写操作都在一个事务里完成；删除不依赖外键级联，由这里显式清理关联数据。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use application::{
    sort_overviews, Clock, ConversationOverview, ConversationRepository, UserDirectory,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    direct_pair, Conversation, ConversationId, DomainError, ImageRef, Message, MessageId,
    NewMessage, RepositoryError, RepositoryResult, UserId, UserProfile,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgConnection, PgPool};

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::storage(err.to_string())
}

const SELECT_MESSAGE: &str = "SELECT id, conversation_id, sender_id, content, image, sent_at, \
     updated_at, is_edited, is_deleted, reply_to_message_id FROM messages";

const SELECT_USER: &str = "SELECT u.id, u.username, u.email, u.first_name, u.last_name, \
     p.profile_pic FROM users u LEFT JOIN user_profiles p ON p.user_id = u.id";

#[derive(Debug, FromRow)]
struct UserRecord {
    id: i64,
    username: Option<String>,
    email: String,
    first_name: String,
    last_name: String,
    profile_pic: Option<String>,
}

impl From<UserRecord> for UserProfile {
    fn from(value: UserRecord) -> Self {
        UserProfile {
            id: UserId(value.id),
            username: value.username,
            email: value.email,
            first_name: value.first_name,
            last_name: value.last_name,
            profile_pic: value.profile_pic.and_then(ImageRef::parse),
        }
    }
}

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    fn into_conversation(self, participants: BTreeSet<UserId>) -> Conversation {
        Conversation {
            id: ConversationId(self.id),
            participants,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ParticipantRecord {
    conversation_id: i64,
    user_id: i64,
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: i64,
    conversation_id: i64,
    sender_id: i64,
    content: Option<String>,
    image: Option<String>,
    sent_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    is_edited: bool,
    is_deleted: bool,
    reply_to_message_id: Option<i64>,
}

impl From<MessageRecord> for Message {
    fn from(value: MessageRecord) -> Self {
        Message {
            id: MessageId(value.id),
            conversation_id: ConversationId(value.conversation_id),
            sender_id: UserId(value.sender_id),
            content: value.content,
            image: value.image.and_then(ImageRef::parse),
            timestamp: value.sent_at,
            updated_at: value.updated_at,
            is_edited: value.is_edited,
            is_deleted: value.is_deleted,
            reply_to: value.reply_to_message_id.map(MessageId),
        }
    }
}

/// 新建用户的资料
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: Option<String>,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub profile_pic: Option<ImageRef>,
}

#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 在同一个事务里写入用户和资料
    pub async fn create_user(&self, user: NewUser) -> RepositoryResult<UserProfile> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO users (username, email, first_name, last_name)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if err
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                RepositoryError::Conflict
            } else {
                map_sqlx_err(err)
            }
        })?;

        sqlx::query(r#"INSERT INTO user_profiles (user_id, profile_pic) VALUES ($1, $2)"#)
            .bind(id)
            .bind(user.profile_pic.as_ref().map(ImageRef::as_str))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        tracing::info!(user_id = id, "用户已创建");

        Ok(UserProfile {
            id: UserId(id),
            username: user.username,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            profile_pic: user.profile_pic,
        })
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_user(&self, id: UserId) -> RepositoryResult<Option<UserProfile>> {
        let record = sqlx::query_as::<_, UserRecord>(&format!("{SELECT_USER} WHERE u.id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(record.map(UserProfile::from))
    }

    async fn missing_users(&self, ids: &BTreeSet<UserId>) -> RepositoryResult<Vec<UserId>> {
        let wanted: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let found: Vec<i64> = sqlx::query_scalar(r#"SELECT id FROM users WHERE id = ANY($1)"#)
            .bind(&wanted)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(ids
            .iter()
            .copied()
            .filter(|id| !found.contains(&id.0))
            .collect())
    }
}

async fn load_participants(
    conn: &mut PgConnection,
    conversation_ids: &[i64],
) -> RepositoryResult<HashMap<i64, BTreeSet<UserId>>> {
    let records = sqlx::query_as::<_, ParticipantRecord>(
        r#"SELECT conversation_id, user_id FROM conversation_participants WHERE conversation_id = ANY($1)"#,
    )
    .bind(conversation_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(map_sqlx_err)?;

    let mut grouped: HashMap<i64, BTreeSet<UserId>> = HashMap::new();
    for record in records {
        grouped
            .entry(record.conversation_id)
            .or_default()
            .insert(UserId(record.user_id));
    }
    Ok(grouped)
}

async fn load_conversation(
    conn: &mut PgConnection,
    id: ConversationId,
    for_update: bool,
) -> RepositoryResult<Option<Conversation>> {
    let sql = if for_update {
        r#"SELECT id, created_at, updated_at FROM conversations WHERE id = $1 FOR UPDATE"#
    } else {
        r#"SELECT id, created_at, updated_at FROM conversations WHERE id = $1"#
    };
    let Some(record) = sqlx::query_as::<_, ConversationRecord>(sql)
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_err)?
    else {
        return Ok(None);
    };

    let mut participants = load_participants(conn, &[record.id]).await?;
    let members = participants.remove(&record.id).unwrap_or_default();
    Ok(Some(record.into_conversation(members)))
}

async fn insert_conversation(
    conn: &mut PgConnection,
    participants: &BTreeSet<UserId>,
    now: DateTime<Utc>,
) -> RepositoryResult<Conversation> {
    let record = sqlx::query_as::<_, ConversationRecord>(
        r#"
        INSERT INTO conversations (created_at, updated_at)
        VALUES ($1, $1)
        RETURNING id, created_at, updated_at
        "#,
    )
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(map_sqlx_err)?;

    let members: Vec<i64> = participants.iter().map(|id| id.0).collect();
    sqlx::query(
        r#"
        INSERT INTO conversation_participants (conversation_id, user_id)
        SELECT $1, UNNEST($2::BIGINT[])
        "#,
    )
    .bind(record.id)
    .bind(&members)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_err)?;

    Ok(record.into_conversation(participants.clone()))
}

async fn lock_message(conn: &mut PgConnection, id: MessageId) -> RepositoryResult<Message> {
    sqlx::query_as::<_, MessageRecord>(&format!("{SELECT_MESSAGE} WHERE id = $1 FOR UPDATE"))
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_err)?
        .map(Message::from)
        .ok_or_else(|| DomainError::not_found("message", id).into())
}

async fn touch_conversation(
    conn: &mut PgConnection,
    id: ConversationId,
    at: DateTime<Utc>,
) -> RepositoryResult<()> {
    sqlx::query(r#"UPDATE conversations SET updated_at = GREATEST(updated_at, $2) WHERE id = $1"#)
        .bind(id.0)
        .bind(at)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;
    Ok(())
}

#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
    users: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool, users: Arc<dyn UserDirectory>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, users, clock }
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

    async fn connection(&self) -> RepositoryResult<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        self.pool.acquire().await.map_err(map_sqlx_err)
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn find_conversation(&self, id: ConversationId) -> RepositoryResult<Option<Conversation>> {
        let mut conn = self.connection().await?;
        load_conversation(&mut conn, id, false).await
    }

    async fn find_direct_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> RepositoryResult<Option<Conversation>> {
        if a == b {
            return Ok(None);
        }
        let (low, high) = direct_pair(a, b);
        let mut conn = self.connection().await?;
        let conversation_id: Option<i64> = sqlx::query_scalar(
            r#"SELECT conversation_id FROM direct_conversations WHERE user_low = $1 AND user_high = $2"#,
        )
        .bind(low.0)
        .bind(high.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;

        match conversation_id {
            Some(id) => load_conversation(&mut conn, ConversationId(id), false).await,
            None => Ok(None),
        }
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

        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let conversation = insert_conversation(&mut tx, &participants, self.clock.now()).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(conversation)
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

        if let Some(existing) = self.find_direct_conversation(a, b).await? {
            return Ok((existing, false));
        }

        let (low, high) = direct_pair(a, b);
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let conversation = insert_conversation(&mut tx, &participants, self.clock.now()).await?;
        let claimed = sqlx::query(
            r#"
            INSERT INTO direct_conversations (user_low, user_high, conversation_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(low.0)
        .bind(high.0)
        .bind(conversation.id.0)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .rows_affected();

        if claimed == 0 {
            // 并发创建输了，放弃本事务里新建的会话，改用胜出的那一条
            tx.rollback().await.map_err(map_sqlx_err)?;
            tracing::debug!(user_low = %low, user_high = %high, "两人会话已被并发创建");
            let existing = self
                .find_direct_conversation(a, b)
                .await?
                .ok_or(RepositoryError::Conflict)?;
            return Ok((existing, false));
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok((conversation, true))
    }

    async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> RepositoryResult<bool> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM conversation_participants
                WHERE conversation_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> RepositoryResult<Vec<ConversationOverview>> {
        let mut conn = self.connection().await?;
        let records = sqlx::query_as::<_, ConversationRecord>(
            r#"
            SELECT c.id, c.created_at, c.updated_at
            FROM conversations c
            JOIN conversation_participants p ON p.conversation_id = c.id
            WHERE p.user_id = $1
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;

        let ids: Vec<i64> = records.iter().map(|record| record.id).collect();
        let mut participants = load_participants(&mut conn, &ids).await?;

        let latest = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT DISTINCT ON (conversation_id)
                id, conversation_id, sender_id, content, image, sent_at, updated_at,
                is_edited, is_deleted, reply_to_message_id
            FROM messages
            WHERE conversation_id = ANY($1) AND NOT is_deleted
            ORDER BY conversation_id, sent_at DESC, id DESC
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(map_sqlx_err)?;
        let mut latest: HashMap<i64, Message> = latest
            .into_iter()
            .map(|record| (record.conversation_id, Message::from(record)))
            .collect();

        let mut overviews: Vec<ConversationOverview> = records
            .into_iter()
            .map(|record| {
                let members = participants.remove(&record.id).unwrap_or_default();
                let last_message = latest.remove(&record.id);
                ConversationOverview {
                    conversation: record.into_conversation(members),
                    last_message,
                }
            })
            .collect();
        sort_overviews(&mut overviews);
        Ok(overviews)
    }

    async fn append_message(&self, message: NewMessage) -> RepositoryResult<Message> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // 锁住会话行，保证同一会话内时间戳单调且与 updated_at 一起提交
        let conversation = load_conversation(&mut tx, message.conversation_id, true)
            .await?
            .ok_or_else(|| DomainError::not_found("conversation", message.conversation_id))?;
        if !conversation.has_participant(message.sender_id) {
            return Err(DomainError::permission_denied(
                "You are not a participant in this conversation.",
            )
            .into());
        }

        let target = match message.reply_to {
            Some(reply_id) => sqlx::query_as::<_, MessageRecord>(&format!(
                "{SELECT_MESSAGE} WHERE id = $1"
            ))
            .bind(reply_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_err)?
            .map(Message::from),
            None => None,
        };
        message.check_reply_target(target.as_ref())?;

        let timestamp = now.max(conversation.updated_at);
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            INSERT INTO messages (conversation_id, sender_id, content, image, sent_at, updated_at, reply_to_message_id)
            VALUES ($1, $2, $3, $4, $5, $5, $6)
            RETURNING id, conversation_id, sender_id, content, image, sent_at, updated_at, is_edited, is_deleted, reply_to_message_id
            "#,
        )
        .bind(message.conversation_id.0)
        .bind(message.sender_id.0)
        .bind(&message.content)
        .bind(message.image.as_ref().map(ImageRef::as_str))
        .bind(timestamp)
        .bind(message.reply_to.map(|id| id.0))
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        touch_conversation(&mut tx, conversation.id, timestamp).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(Message::from(record))
    }

    async fn find_message(&self, id: MessageId) -> RepositoryResult<Option<Message>> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!("{SELECT_MESSAGE} WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(record.map(Message::from))
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> RepositoryResult<Vec<Message>> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "{SELECT_MESSAGE} WHERE conversation_id = $1 ORDER BY sent_at, id"
        ))
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(records.into_iter().map(Message::from).collect())
    }

    async fn edit_message(
        &self,
        id: MessageId,
        editor: UserId,
        content: String,
    ) -> RepositoryResult<Message> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut message = lock_message(&mut tx, id).await?;
        message.edit(editor, content, now)?;

        sqlx::query(
            r#"UPDATE messages SET content = $2, is_edited = TRUE, updated_at = $3 WHERE id = $1"#,
        )
        .bind(id.0)
        .bind(&message.content)
        .bind(message.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        touch_conversation(&mut tx, message.conversation_id, now).await?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(message)
    }

    async fn soft_delete_message(
        &self,
        id: MessageId,
        requester: UserId,
    ) -> RepositoryResult<(Message, bool)> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut message = lock_message(&mut tx, id).await?;
        if !message.soft_delete(requester, now)? {
            tx.commit().await.map_err(map_sqlx_err)?;
            return Ok((message, false));
        }

        sqlx::query(
            r#"
            UPDATE messages
            SET is_deleted = TRUE, content = NULL, image = NULL, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        touch_conversation(&mut tx, message.conversation_id, now).await?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok((message, true))
    }

    async fn delete_message(&self, id: MessageId) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        sqlx::query(r#"UPDATE messages SET reply_to_message_id = NULL WHERE reply_to_message_id = $1"#)
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        let deleted = sqlx::query(r#"DELETE FROM messages WHERE id = $1"#)
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?
            .rows_affected();
        if deleted == 0 {
            return Err(RepositoryError::NotFound);
        }
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn delete_conversation(&self, id: ConversationId) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        if load_conversation(&mut tx, id, true).await?.is_none() {
            return Err(RepositoryError::NotFound);
        }

        let statements = [
            r#"UPDATE messages SET reply_to_message_id = NULL
               WHERE reply_to_message_id IN (SELECT id FROM messages WHERE conversation_id = $1)"#,
            r#"DELETE FROM messages WHERE conversation_id = $1"#,
            r#"DELETE FROM direct_conversations WHERE conversation_id = $1"#,
            r#"DELETE FROM conversation_participants WHERE conversation_id = $1"#,
            r#"DELETE FROM conversations WHERE id = $1"#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .bind(id.0)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        tracing::info!(conversation_id = %id, "会话及其消息已删除");
        Ok(())
    }
}

/// 进程内共享的 PostgreSQL 存储
#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub users: Arc<PgUserDirectory>,
    pub conversations: Arc<PgConversationRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        let users = Arc::new(PgUserDirectory::new(pool.clone()));
        let conversations = Arc::new(PgConversationRepository::new(
            pool.clone(),
            users.clone(),
            clock,
        ));
        Self {
            pool,
            users,
            conversations,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: std::time::Duration,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
}
