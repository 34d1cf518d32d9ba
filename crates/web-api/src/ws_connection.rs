//! 单个 WebSocket 连接的读写循环
//!
//! 同时等待两件事：通道里待推送的事件、客户端发来的帧。
//! 任一方向结束都会退出循环，随后执行会话清理并注销通道。

use std::sync::Arc;

use application::{Channel, GroupBroadcaster, ServerFrame, SocketSession};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};

type WsSender = SplitSink<WebSocket, WsMessage>;

pub struct WebSocketConnection<S> {
    socket: WebSocket,
    session: S,
    channel: Channel,
    broadcaster: Arc<dyn GroupBroadcaster>,
}

impl<S: SocketSession> WebSocketConnection<S> {
    pub fn new(
        socket: WebSocket,
        session: S,
        channel: Channel,
        broadcaster: Arc<dyn GroupBroadcaster>,
    ) -> Self {
        Self {
            socket,
            session,
            channel,
            broadcaster,
        }
    }

    /// 运行到连接关闭；`greeting` 在进入循环前先发给客户端
    pub async fn run(self, greeting: Option<ServerFrame>) {
        let Self {
            socket,
            mut session,
            channel,
            broadcaster,
        } = self;
        let Channel {
            id: channel_id,
            mut receiver,
        } = channel;
        let (mut sender, mut incoming) = socket.split();

        let greeted = match greeting {
            Some(frame) => send_frame(&mut sender, &frame).await,
            None => true,
        };

        if greeted {
            loop {
                tokio::select! {
                    event = receiver.recv() => {
                        let Some(event) = event else {
                            tracing::warn!(channel = %channel_id, "出站通道已关闭");
                            break;
                        };
                        if !send_frame(&mut sender, &ServerFrame::Event(event)).await {
                            break;
                        }
                    }
                    frame = incoming.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(reply) = session.handle_text(text.as_str()).await {
                                if !send_frame(&mut sender, &reply).await {
                                    break;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            if sender.send(WsMessage::Pong(data)).await.is_err() {
                                tracing::warn!(channel = %channel_id, "Failed to send pong message");
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            tracing::debug!(channel = %channel_id, "客户端关闭连接");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::warn!(channel = %channel_id, error = %err, "读取 WebSocket 帧失败");
                            break;
                        }
                    }
                }
            }
        }

        session.disconnect().await;
        broadcaster.unregister_channel(channel_id).await;
        tracing::info!(channel = %channel_id, "WebSocket 连接已清理");
    }
}

/// 发送一帧；返回 false 表示连接已不可写
async fn send_frame(sender: &mut WsSender, frame: &ServerFrame) -> bool {
    let payload = match frame.to_json() {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(error = %err, "序列化出站事件失败");
            return true;
        }
    };
    match sender.send(WsMessage::Text(payload.into())).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to send text message");
            false
        }
    }
}
