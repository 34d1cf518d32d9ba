mod support;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message as TungsteniteMessage};

use support::{
    assert_silent, drain, next_event_of, next_json, TestServer, TestSocket, ALICE, BOB, CAROL,
};

async fn start_direct_conversation(server: &TestServer) -> i64 {
    let message: Value = Client::new()
        .post(server.http(&format!("/api/messages/send/{}", BOB.0)))
        .bearer_auth(server.token(ALICE))
        .json(&json!({ "content": "first" }))
        .send()
        .await
        .expect("send")
        .json()
        .await
        .expect("json");
    message["conversation"].as_i64().expect("conversation id")
}

async fn send_json(socket: &mut TestSocket, value: Value) {
    socket
        .send(TungsteniteMessage::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

async fn expect_close_code(url: String, expected: u16) {
    let (mut socket, _) = connect_async(url).await.expect("upgrade");
    let frame = timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended")
        .expect("frame");
    match frame {
        TungsteniteMessage::Close(Some(close)) => assert_eq!(u16::from(close.code), expected),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn chat_socket_broadcasts_messages_and_typing() {
    let server = TestServer::start().await;
    let conversation_id = start_direct_conversation(&server).await;

    let mut alice = server.connect_chat(conversation_id, ALICE).await;
    let mut bob = server.connect_chat(conversation_id, BOB).await;
    // 等待两个连接完成加入
    sleep(Duration::from_millis(100)).await;

    send_json(
        &mut alice,
        json!({ "type": "chat_message_new", "conversation_id": conversation_id, "content": "hello" }),
    )
    .await;

    for socket in [&mut alice, &mut bob] {
        let event = next_json(socket).await;
        assert_eq!(event["type"], "chat_message");
        assert_eq!(event["message"]["content"], "hello");
        assert_eq!(event["message"]["sender"]["id"], ALICE.0);
    }

    // 输入状态不回显给自己
    send_json(
        &mut bob,
        json!({ "type": "typing_started", "conversation_id": conversation_id.to_string() }),
    )
    .await;
    let typing = next_json(&mut alice).await;
    assert_eq!(typing["type"], "user_typing_started");
    assert_eq!(typing["user_id"], BOB.0);
    assert_eq!(typing["username"], "bob");
    assert_silent(&mut bob).await;

    // 空消息只回给发送者一个错误帧
    send_json(
        &mut alice,
        json!({ "type": "chat_message_new", "conversation_id": conversation_id, "content": "  " }),
    )
    .await;
    let error = next_json(&mut alice).await;
    assert!(error["error"].is_string());
    assert_silent(&mut bob).await;

    // 声明了其他会话的事件被丢弃
    send_json(
        &mut alice,
        json!({ "type": "chat_message_new", "conversation_id": conversation_id + 100, "content": "x" }),
    )
    .await;
    assert_silent(&mut bob).await;

    // 断开时补发一次停止输入
    bob.close(None).await.expect("close bob");
    let stopped = next_event_of(&mut alice, "user_typing_stopped").await;
    assert_eq!(stopped["user_id"], BOB.0);
}

#[tokio::test]
async fn rest_changes_reach_open_chat_sockets() {
    let server = TestServer::start().await;
    let conversation_id = start_direct_conversation(&server).await;
    let mut bob = server.connect_chat(conversation_id, BOB).await;
    sleep(Duration::from_millis(100)).await;

    let client = Client::new();
    let message: Value = client
        .post(server.http(&format!(
            "/api/messages/conversations/{conversation_id}/messages"
        )))
        .bearer_auth(server.token(ALICE))
        .json(&json!({ "content": "via rest" }))
        .send()
        .await
        .expect("post")
        .json()
        .await
        .expect("json");
    let message_id = message["id"].as_i64().expect("id");

    let event = next_json(&mut bob).await;
    assert_eq!(event["type"], "chat_message");
    assert_eq!(event["message"]["id"], message_id);

    client
        .patch(server.http(&format!("/api/messages/{message_id}")))
        .bearer_auth(server.token(ALICE))
        .json(&json!({ "content": "via rest (edited)" }))
        .send()
        .await
        .expect("edit");
    let event = next_json(&mut bob).await;
    assert_eq!(event["type"], "message_updated");
    assert_eq!(event["message"]["is_edited"], true);

    client
        .delete(server.http(&format!("/api/messages/{message_id}")))
        .bearer_auth(server.token(ALICE))
        .send()
        .await
        .expect("delete");
    let event = next_json(&mut bob).await;
    assert_eq!(event["type"], "message_deleted");
    assert_eq!(event["message_id"], message_id);
    assert_eq!(event["conversation_id"], conversation_id);

    // 再次删除不会重复推送
    client
        .delete(server.http(&format!("/api/messages/{message_id}")))
        .bearer_auth(server.token(ALICE))
        .send()
        .await
        .expect("delete again");
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn chat_socket_rejects_bad_identity_and_outsiders() {
    let server = TestServer::start().await;
    let conversation_id = start_direct_conversation(&server).await;

    expect_close_code(
        format!("ws://{}/ws/chat/{conversation_id}", server.addr),
        4001,
    )
    .await;
    expect_close_code(
        format!("ws://{}/ws/chat/{conversation_id}?token=garbage", server.addr),
        4001,
    )
    .await;
    expect_close_code(
        format!(
            "ws://{}/ws/chat/{conversation_id}?token={}",
            server.addr,
            server.token(CAROL)
        ),
        4003,
    )
    .await;
    expect_close_code(
        format!(
            "ws://{}/ws/chat/not-a-number?token={}",
            server.addr,
            server.token(ALICE)
        ),
        4003,
    )
    .await;
    expect_close_code(format!("ws://{}/ws/presence", server.addr), 4001).await;
}

#[tokio::test]
async fn presence_tracks_online_users() {
    let server = TestServer::start().await;

    let mut alice = server.connect_presence(ALICE).await;
    let greeting = next_json(&mut alice).await;
    assert_eq!(greeting["type"], "online_users_list");
    assert_eq!(greeting["users"], json!([ALICE.0.to_string()]));

    let mut bob = server.connect_presence(BOB).await;
    let both = json!([ALICE.0.to_string(), BOB.0.to_string()]);
    loop {
        let event = next_event_of(&mut alice, "online_users_list").await;
        if event["users"] == both {
            break;
        }
    }

    // 同一用户的第二个连接关闭后仍然在线
    let mut alice_second = server.connect_presence(ALICE).await;
    next_event_of(&mut alice_second, "online_users_list").await;
    alice_second.close(None).await.expect("close second");
    sleep(Duration::from_millis(100)).await;

    drain(&mut bob).await;
    send_json(&mut bob, json!({ "type": "get_online_users_request" })).await;
    let reply = next_json(&mut bob).await;
    assert_eq!(reply["type"], "online_users_list");
    assert_eq!(reply["users"], both);

    bob.close(None).await.expect("close bob");
    loop {
        let event = next_event_of(&mut alice, "online_users_list").await;
        if event["users"] == json!([ALICE.0.to_string()]) {
            break;
        }
    }
}

#[tokio::test]
async fn presence_socket_receives_personal_notifications() {
    let server = TestServer::start().await;
    let mut bob = server.connect_presence(BOB).await;
    next_event_of(&mut bob, "online_users_list").await;

    let conversation_id = start_direct_conversation(&server).await;
    let notification = next_event_of(&mut bob, "new_message_notification").await;
    assert_eq!(notification["conversation_id"], conversation_id);
    assert_eq!(notification["sender_id"], ALICE.0);
    assert_eq!(notification["message"]["content"], "first");

    let conversation: Value = Client::new()
        .post(server.http("/api/messages/conversations"))
        .bearer_auth(server.token(ALICE))
        .json(&json!({ "participant_ids": [BOB.0, CAROL.0] }))
        .send()
        .await
        .expect("create group")
        .json()
        .await
        .expect("json");
    let added = next_event_of(&mut bob, "new_conversation_added").await;
    assert_eq!(added["conversation_id"], conversation["id"]);
    assert_eq!(added["created_by"], ALICE.0);
}
