//! WebSocket 升级入口：认证、建立会话，然后交给连接循环

use application::{ChatSession, ChannelId, PresenceSession, SessionRejection};
use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::{auth::socket_identity, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Default, Deserialize)]
pub struct SocketAuthQuery {
    pub token: Option<String>,
}

/// 会话聊天连接
pub async fn chat_socket(
    ws: WebSocketUpgrade,
    Path(conversation_id): Path<String>,
    Query(query): Query<SocketAuthQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state, conversation_id, query.token))
}

/// 全局在线状态连接
pub async fn presence_socket(
    ws: WebSocketUpgrade,
    Query(query): Query<SocketAuthQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_presence_socket(socket, state, query.token))
}

async fn handle_chat_socket(
    socket: WebSocket,
    state: AppState,
    conversation_id: String,
    token: Option<String>,
) {
    let identity = socket_identity(&state, token.as_deref()).await;
    let broadcaster = state.sessions.broadcaster.clone();
    let channel = broadcaster.register_channel().await;

    let mut session = ChatSession::new(state.sessions.clone(), channel.id, conversation_id);
    match session.connect(identity).await {
        Ok(()) => {
            WebSocketConnection::new(socket, session, channel, broadcaster)
                .run(None)
                .await;
        }
        Err(rejection) => reject(socket, &state, channel.id, rejection).await,
    }
}

async fn handle_presence_socket(socket: WebSocket, state: AppState, token: Option<String>) {
    let identity = socket_identity(&state, token.as_deref()).await;
    let broadcaster = state.sessions.broadcaster.clone();
    let channel = broadcaster.register_channel().await;

    let mut session = PresenceSession::new(state.sessions.clone(), channel.id);
    match session.connect(identity).await {
        Ok(snapshot) => {
            WebSocketConnection::new(socket, session, channel, broadcaster)
                .run(Some(snapshot))
                .await;
        }
        Err(rejection) => reject(socket, &state, channel.id, rejection).await,
    }
}

/// 发送关闭帧，不推送任何事件
async fn reject(
    mut socket: WebSocket,
    state: &AppState,
    channel: ChannelId,
    rejection: SessionRejection,
) {
    let frame = CloseFrame {
        code: rejection.close_code(),
        reason: rejection.to_string().into(),
    };
    if let Err(err) = socket.send(WsMessage::Close(Some(frame))).await {
        tracing::debug!(channel = %channel, error = %err, "发送关闭帧失败");
    }
    state.sessions.broadcaster.unregister_channel(channel).await;
}
