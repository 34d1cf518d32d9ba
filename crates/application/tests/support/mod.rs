#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use application::{
    Channel, ConversationService, ConversationServiceDependencies, GroupBroadcaster,
    InMemoryConversationRepository, InMemoryUserDirectory, LocalGroupBroadcaster, ManualClock,
    MemoryPresenceStore, NoUnreadCounter, OutboundEvent, SessionDependencies,
};
use chrono::{TimeZone, Utc};
use domain::{Conversation, UserId, UserProfile};

pub const ALICE: UserId = UserId(1);
pub const BOB: UserId = UserId(2);
pub const CAROL: UserId = UserId(3);
pub const DAVE: UserId = UserId(7);

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub users: Arc<InMemoryUserDirectory>,
    pub repository: Arc<InMemoryConversationRepository>,
    pub broadcaster: Arc<LocalGroupBroadcaster>,
    pub presence: Arc<MemoryPresenceStore>,
}

impl Harness {
    pub fn new() -> Self {
        let users = Arc::new(InMemoryUserDirectory::with_users([
            UserProfile::new(ALICE, Some("alice".into()), "alice@example.com"),
            UserProfile::new(BOB, Some("bob".into()), "bob@example.com")
                .with_names("Bob", "Builder"),
            UserProfile::new(CAROL, None, "carol@example.com"),
            UserProfile::new(DAVE, Some("dave".into()), "dave@example.com"),
        ]));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ));
        let repository = Arc::new(InMemoryConversationRepository::new(
            users.clone(),
            clock.clone(),
        ));

        Self {
            clock,
            users,
            repository,
            broadcaster: Arc::new(LocalGroupBroadcaster::default()),
            presence: Arc::new(MemoryPresenceStore::new()),
        }
    }

    pub fn session_deps(&self) -> SessionDependencies {
        SessionDependencies {
            repository: self.repository.clone(),
            users: self.users.clone(),
            broadcaster: self.broadcaster.clone(),
            presence: self.presence.clone(),
        }
    }

    pub fn service(&self) -> ConversationService {
        ConversationService::new(ConversationServiceDependencies {
            repository: self.repository.clone(),
            users: self.users.clone(),
            broadcaster: self.broadcaster.clone(),
            unread_counter: Arc::new(NoUnreadCounter),
        })
    }

    pub async fn direct(&self, a: UserId, b: UserId) -> Conversation {
        use application::ConversationRepository;

        self.repository
            .get_or_create_direct_conversation(a, b)
            .await
            .expect("direct conversation")
            .0
    }

    pub async fn channel(&self) -> Channel {
        self.broadcaster.register_channel().await
    }

    pub async fn listen(&self, group: &str) -> Channel {
        let channel = self.broadcaster.register_channel().await;
        self.broadcaster
            .join_group(group, channel.id)
            .await
            .expect("join group");
        channel
    }
}

pub async fn recv(channel: &mut Channel) -> OutboundEvent {
    tokio::time::timeout(Duration::from_secs(1), channel.receiver.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

pub fn assert_silent(channel: &mut Channel) {
    if let Ok(event) = channel.receiver.try_recv() {
        panic!("unexpected event: {event:?}");
    }
}
