use std::collections::BTreeSet;

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, Timestamp, UserId};

/// 会话。两人会话对同一无序用户对最多存在一个。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: BTreeSet<UserId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Conversation {
    pub const MIN_PARTICIPANTS: usize = 2;

    pub fn new(
        id: ConversationId,
        participants: BTreeSet<UserId>,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        if participants.len() < Self::MIN_PARTICIPANTS {
            return Err(DomainError::validation(
                "participant_ids",
                "A conversation requires at least two unique participants.",
            ));
        }
        Ok(Self {
            id,
            participants,
            created_at,
            updated_at: created_at,
        })
    }

    /// 去重并校验参与者数量
    pub fn normalize_participants(
        ids: impl IntoIterator<Item = UserId>,
    ) -> Result<BTreeSet<UserId>, DomainError> {
        let participants: BTreeSet<UserId> = ids.into_iter().collect();
        if participants.len() < Self::MIN_PARTICIPANTS {
            return Err(DomainError::validation(
                "participant_ids",
                "A conversation requires at least two unique participants.",
            ));
        }
        Ok(participants)
    }

    pub fn is_direct(&self) -> bool {
        self.participants.len() == 2
    }

    /// 参与者集合恰好为 {a, b}
    pub fn is_direct_between(&self, a: UserId, b: UserId) -> bool {
        a != b
            && self.is_direct()
            && self.participants.contains(&a)
            && self.participants.contains(&b)
    }

    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participants.contains(&user_id)
    }

    pub fn other_participants(&self, user_id: UserId) -> impl Iterator<Item = UserId> + '_ {
        self.participants
            .iter()
            .copied()
            .filter(move |id| *id != user_id)
    }

    /// 更新会话活跃时间，保持单调递增
    pub fn touch(&mut self, at: Timestamp) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }
}

/// 两人会话的无序用户对键，小 ID 在前
pub fn direct_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
