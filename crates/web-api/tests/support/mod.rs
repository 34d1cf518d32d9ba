#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{
    Clock, ConversationService, ConversationServiceDependencies, InMemoryConversationRepository,
    InMemoryUserDirectory, LocalGroupBroadcaster, MemoryPresenceStore, NoUnreadCounter,
    SessionDependencies, SystemClock,
};
use domain::{UserId, UserProfile};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use web_api::{router, AppState, JwtConfig, JwtService};

pub const ALICE: UserId = UserId(1);
pub const BOB: UserId = UserId(2);
pub const CAROL: UserId = UserId(3);

pub type TestSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// 使用内存实现启动在随机端口上的服务
pub struct TestServer {
    pub addr: SocketAddr,
    pub jwt: Arc<JwtService>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let users = Arc::new(InMemoryUserDirectory::with_users([
            UserProfile::new(ALICE, Some("alice".into()), "alice@example.com")
                .with_names("Alice", "Liddell"),
            UserProfile::new(BOB, Some("bob".into()), "bob@example.com"),
            UserProfile::new(CAROL, Some("carol".into()), "carol@example.com"),
        ]));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let repository = Arc::new(InMemoryConversationRepository::new(users.clone(), clock));
        let broadcaster = Arc::new(LocalGroupBroadcaster::default());

        let conversations = ConversationService::new(ConversationServiceDependencies {
            repository: repository.clone(),
            users: users.clone(),
            broadcaster: broadcaster.clone(),
            unread_counter: Arc::new(NoUnreadCounter),
        });
        let sessions = SessionDependencies {
            repository,
            users,
            broadcaster,
            presence: Arc::new(MemoryPresenceStore::new()),
        };
        let jwt = Arc::new(JwtService::new(JwtConfig {
            secret: "integration-test-secret-0123456789abcdef".to_string(),
            expiration_hours: 1,
        }));

        let state = AppState::new(Arc::new(conversations), sessions, jwt.clone());
        let app = router(state, &["*".to_string()]);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            jwt,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn token(&self, user: UserId) -> String {
        self.jwt.generate_token(user).expect("token")
    }

    pub async fn connect_chat(&self, conversation_id: i64, user: UserId) -> TestSocket {
        let url = format!(
            "ws://{}/ws/chat/{}?token={}",
            self.addr,
            conversation_id,
            self.token(user)
        );
        let (socket, _) = connect_async(url).await.expect("connect chat socket");
        socket
    }

    pub async fn connect_presence(&self, user: UserId) -> TestSocket {
        let url = format!("ws://{}/ws/presence?token={}", self.addr, self.token(user));
        let (socket, _) = connect_async(url).await.expect("connect presence socket");
        socket
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// 读取下一条文本帧并解析为 JSON，跳过控制帧
pub async fn next_json(socket: &mut TestSocket) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("frame error");
        match frame {
            TungsteniteMessage::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("json frame")
            }
            TungsteniteMessage::Ping(_) | TungsteniteMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// 读取直到出现指定类型的事件
pub async fn next_event_of(socket: &mut TestSocket, event_type: &str) -> Value {
    loop {
        let value = next_json(socket).await;
        if value["type"] == event_type {
            return value;
        }
    }
}

/// 断言短时间内没有任何文本帧
pub async fn assert_silent(socket: &mut TestSocket) {
    let result = timeout(Duration::from_millis(200), socket.next()).await;
    if let Ok(Some(Ok(TungsteniteMessage::Text(text)))) = result {
        panic!("unexpected frame: {}", text.as_str());
    }
}

/// 丢弃当前已到达的所有帧
pub async fn drain(socket: &mut TestSocket) {
    while let Ok(Some(Ok(_))) = timeout(Duration::from_millis(200), socket.next()).await {}
}
