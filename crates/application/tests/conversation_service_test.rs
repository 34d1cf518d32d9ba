mod support;

use application::{
    conversation_group, user_group, ApplicationError, ConversationRepository,
    CreateConversationRequest, EditMessageRequest, MessageDraft, OutboundEvent,
    PostConversationMessageRequest, SendMessageToUserRequest,
};
use chrono::Duration;
use domain::{DomainError, MessageId, UserId};
use support::{assert_silent, recv, Harness, ALICE, BOB, CAROL, DAVE};

fn text(content: &str) -> MessageDraft {
    MessageDraft {
        content: Some(content.to_string()),
        ..MessageDraft::default()
    }
}

fn send(sender: UserId, receiver: UserId, content: &str) -> SendMessageToUserRequest {
    SendMessageToUserRequest {
        sender_id: sender,
        receiver_id: receiver,
        draft: text(content),
    }
}

#[tokio::test]
async fn first_message_creates_direct_conversation_and_notifies_receiver() {
    let harness = Harness::new();
    let service = harness.service();
    let mut bob_inbox = harness.listen(&user_group(BOB)).await;
    let mut alice_inbox = harness.listen(&user_group(ALICE)).await;

    let message = service.send_message_to_user(send(ALICE, BOB, "hi")).await.unwrap();

    let conversation = harness
        .repository
        .find_direct_conversation(ALICE, BOB)
        .await
        .unwrap()
        .expect("conversation created");
    assert_eq!(message.conversation, conversation.id);
    assert_eq!(message.sender.username.as_deref(), Some("alice"));

    match recv(&mut bob_inbox).await {
        OutboundEvent::NewMessageNotification {
            conversation_id,
            sender_id,
            sender_username,
            message: notified,
        } => {
            assert_eq!(conversation_id, conversation.id);
            assert_eq!(sender_id, ALICE);
            assert_eq!(sender_username, "alice");
            assert_eq!(notified.id, message.id);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_silent(&mut alice_inbox);

    service.send_message_to_user(send(BOB, ALICE, "hey")).await.unwrap();
    let again = harness
        .repository
        .find_direct_conversation(BOB, ALICE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, conversation.id);
}

#[tokio::test]
async fn sending_publishes_to_open_chat_sockets() {
    let harness = Harness::new();
    let service = harness.service();
    let conversation = harness.direct(ALICE, BOB).await;
    let mut room = harness.listen(&conversation_group(conversation.id)).await;

    service.send_message_to_user(send(BOB, ALICE, "ping")).await.unwrap();
    match recv(&mut room).await {
        OutboundEvent::ChatMessage { message } => {
            assert_eq!(message.content.as_deref(), Some("ping"));
            assert_eq!(message.sender.full_name, "Bob Builder");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn invalid_sends_are_rejected_without_side_effects() {
    let harness = Harness::new();
    let service = harness.service();

    let err = service.send_message_to_user(send(ALICE, ALICE, "me")).await.unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::Validation { .. })));

    let err = service
        .send_message_to_user(send(ALICE, UserId(404), "ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::NotFound { .. })));

    let err = service
        .send_message_to_user(SendMessageToUserRequest {
            sender_id: ALICE,
            receiver_id: BOB,
            draft: MessageDraft::default(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::Validation { .. })));
    assert!(harness
        .repository
        .find_direct_conversation(ALICE, BOB)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn image_only_message_is_accepted() {
    let harness = Harness::new();
    let message = harness
        .service()
        .send_message_to_user(SendMessageToUserRequest {
            sender_id: ALICE,
            receiver_id: BOB,
            draft: MessageDraft {
                image: Some("message_images/sunset.jpg".into()),
                ..MessageDraft::default()
            },
        })
        .await
        .unwrap();
    assert!(message.content.is_none());
    assert_eq!(
        message.image_url.as_deref(),
        Some("/media/message_images/sunset.jpg")
    );
}

#[tokio::test]
async fn creating_existing_direct_conversation_returns_it_without_notifying() {
    let harness = Harness::new();
    let service = harness.service();
    let mut bob_inbox = harness.listen(&user_group(BOB)).await;

    let created = service
        .create_conversation(CreateConversationRequest {
            requester_id: ALICE,
            participant_ids: vec![BOB],
        })
        .await
        .unwrap();
    match recv(&mut bob_inbox).await {
        OutboundEvent::NewConversationAdded {
            conversation_id,
            created_by,
            conversation,
        } => {
            assert_eq!(conversation_id, created.id);
            assert_eq!(created_by, ALICE);
            assert_eq!(conversation.participants.len(), 2);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let existing = service
        .create_conversation(CreateConversationRequest {
            requester_id: BOB,
            participant_ids: vec![ALICE, BOB],
        })
        .await
        .unwrap();
    assert_eq!(existing.id, created.id);
    assert_silent(&mut bob_inbox);
}

#[tokio::test]
async fn group_creation_validates_and_notifies_every_other_participant() {
    let harness = Harness::new();
    let service = harness.service();
    let mut carol_inbox = harness.listen(&user_group(CAROL)).await;
    let mut dave_inbox = harness.listen(&user_group(DAVE)).await;
    let mut alice_inbox = harness.listen(&user_group(ALICE)).await;

    let err = service
        .create_conversation(CreateConversationRequest {
            requester_id: ALICE,
            participant_ids: vec![ALICE],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::Validation { .. })));

    let err = service
        .create_conversation(CreateConversationRequest {
            requester_id: ALICE,
            participant_ids: vec![CAROL, UserId(404)],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::Validation { .. })));

    let group = service
        .create_conversation(CreateConversationRequest {
            requester_id: ALICE,
            participant_ids: vec![CAROL, DAVE],
        })
        .await
        .unwrap();
    assert_eq!(group.participants.len(), 3);
    assert_eq!(group.unread_count, 0);

    for inbox in [&mut carol_inbox, &mut dave_inbox] {
        assert!(matches!(
            recv(inbox).await,
            OutboundEvent::NewConversationAdded { conversation_id, .. } if conversation_id == group.id
        ));
    }
    assert_silent(&mut alice_inbox);
}

#[tokio::test]
async fn conversation_messages_are_participant_only() {
    let harness = Harness::new();
    let service = harness.service();
    let conversation = harness.direct(ALICE, BOB).await;
    let mut carol_inbox = harness.listen(&user_group(CAROL)).await;

    let posted = service
        .post_conversation_message(PostConversationMessageRequest {
            conversation_id: conversation.id,
            sender_id: ALICE,
            draft: text("first"),
        })
        .await
        .unwrap();

    let history = service
        .conversation_messages(BOB, conversation.id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, posted.id);

    let err = service
        .conversation_messages(CAROL, conversation.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::NotFound { .. })));

    let err = service
        .post_conversation_message(PostConversationMessageRequest {
            conversation_id: conversation.id,
            sender_id: CAROL,
            draft: text("let me in"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::NotFound { .. })));
    assert_silent(&mut carol_inbox);

    let err = service.get_message(CAROL, posted.id).await.unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::NotFound { .. })));
    assert_eq!(service.get_message(BOB, posted.id).await.unwrap().id, posted.id);
}

#[tokio::test]
async fn replies_carry_target_preview() {
    let harness = Harness::new();
    let service = harness.service();
    let original = service.send_message_to_user(send(ALICE, BOB, "lunch?")).await.unwrap();

    let reply = service
        .send_message_to_user(SendMessageToUserRequest {
            sender_id: BOB,
            receiver_id: ALICE,
            draft: MessageDraft {
                content: Some("sure".into()),
                reply_to: Some(original.id),
                ..MessageDraft::default()
            },
        })
        .await
        .unwrap();

    assert_eq!(reply.reply_to_message, Some(original.id));
    let details = reply.reply_to_message_details.expect("reply preview");
    assert_eq!(details.content.as_deref(), Some("lunch?"));
    assert_eq!(details.sender.id, ALICE);

    let err = service
        .send_message_to_user(SendMessageToUserRequest {
            sender_id: BOB,
            receiver_id: ALICE,
            draft: MessageDraft {
                content: Some("??".into()),
                reply_to: Some(MessageId(424242)),
                ..MessageDraft::default()
            },
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::Validation { .. })));
}

#[tokio::test]
async fn invalid_reply_target_does_not_create_direct_conversation() {
    let harness = Harness::new();
    let service = harness.service();
    // 另一个会话里的消息，不能作为 Alice 与 Carol 首条消息的回复目标
    let elsewhere = service.send_message_to_user(send(ALICE, BOB, "hi")).await.unwrap();
    let mut carol_inbox = harness.listen(&user_group(CAROL)).await;

    for reply_to in [MessageId(999), elsewhere.id] {
        let err = service
            .send_message_to_user(SendMessageToUserRequest {
                sender_id: ALICE,
                receiver_id: CAROL,
                draft: MessageDraft {
                    content: Some("re".into()),
                    reply_to: Some(reply_to),
                    ..MessageDraft::default()
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Domain(DomainError::Validation { .. })));
    }

    assert!(harness
        .repository
        .find_direct_conversation(ALICE, CAROL)
        .await
        .unwrap()
        .is_none());
    assert!(service.list_conversations(CAROL).await.unwrap().is_empty());
    assert_silent(&mut carol_inbox);
}

#[tokio::test]
async fn edit_broadcasts_update_within_window_only() {
    let harness = Harness::new();
    let service = harness.service();
    let message = service.send_message_to_user(send(ALICE, BOB, "teh")).await.unwrap();
    let mut room = harness.listen(&conversation_group(message.conversation)).await;

    harness.clock.advance(Duration::hours(24));
    let edited = service
        .edit_message(EditMessageRequest {
            message_id: message.id,
            editor_id: ALICE,
            content: "the".into(),
        })
        .await
        .unwrap();
    assert!(edited.is_edited);
    assert_eq!(edited.timestamp, message.timestamp);
    assert_eq!(
        recv(&mut room).await,
        OutboundEvent::MessageUpdated {
            message: edited.clone()
        }
    );

    let err = service
        .edit_message(EditMessageRequest {
            message_id: message.id,
            editor_id: BOB,
            content: "hijack".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::PermissionDenied { .. })));

    harness.clock.advance(Duration::seconds(1));
    let err = service
        .edit_message(EditMessageRequest {
            message_id: message.id,
            editor_id: ALICE,
            content: "too late".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::PermissionDenied { .. })));
    assert_silent(&mut room);
}

#[tokio::test]
async fn delete_broadcasts_once_and_blocks_further_edits() {
    let harness = Harness::new();
    let service = harness.service();
    let message = service.send_message_to_user(send(ALICE, BOB, "oops")).await.unwrap();
    let mut room = harness.listen(&conversation_group(message.conversation)).await;

    service.delete_message(ALICE, message.id).await.unwrap();
    match recv(&mut room).await {
        OutboundEvent::MessageDeleted {
            message_id,
            conversation_id,
            message: deleted,
        } => {
            assert_eq!(message_id, message.id);
            assert_eq!(conversation_id, message.conversation);
            assert!(deleted.is_deleted);
            assert!(deleted.content.is_none());
        }
        other => panic!("unexpected event: {other:?}"),
    }

    service.delete_message(ALICE, message.id).await.unwrap();
    assert_silent(&mut room);

    let err = service
        .edit_message(EditMessageRequest {
            message_id: message.id,
            editor_id: ALICE,
            content: "undo".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::InvalidState { .. })));

    let err = service.delete_message(BOB, message.id).await.unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(DomainError::PermissionDenied { .. })));
}

#[tokio::test]
async fn conversation_list_shows_latest_visible_message() {
    let harness = Harness::new();
    let service = harness.service();
    service.send_message_to_user(send(ALICE, BOB, "older")).await.unwrap();
    harness.clock.advance(Duration::seconds(1));
    let newest = service.send_message_to_user(send(ALICE, BOB, "newest")).await.unwrap();
    harness.clock.advance(Duration::seconds(1));
    service.send_message_to_user(send(ALICE, CAROL, "hello carol")).await.unwrap();

    let listed = service.list_conversations(ALICE).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(
        listed[0].last_message.as_ref().and_then(|m| m.content.as_deref()),
        Some("hello carol")
    );
    assert_eq!(listed[1].last_message.as_ref().map(|m| m.id), Some(newest.id));

    harness.clock.advance(Duration::seconds(1));
    service.delete_message(ALICE, newest.id).await.unwrap();
    let listed = service.list_conversations(ALICE).await.unwrap();
    assert_eq!(
        listed[0].last_message.as_ref().and_then(|m| m.content.as_deref()),
        Some("older")
    );

    let history = service.messages_with_user(BOB, ALICE).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(service.messages_with_user(ALICE, ALICE).await.unwrap().is_empty());
    assert!(service.messages_with_user(CAROL, DAVE).await.unwrap().is_empty());
}
