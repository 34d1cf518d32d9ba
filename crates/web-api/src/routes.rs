use application::{
    ConversationDto, CreateConversationRequest, EditMessageRequest, MessageDraft, MessageDto,
    PostConversationMessageRequest, SendMessageToUserRequest,
};
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post, MethodRouter},
    Json, Router,
};
use domain::{ConversationId, MessageId, UserId};
use serde::Deserialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    auth::AuthUser,
    error::ApiError,
    extract::{ApiJson, ApiPath},
    state::AppState,
    websocket::{chat_socket, presence_socket},
};

/// 构建完整的 HTTP 路由
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(api_routes())
        .merge(socket_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// 健康检查端点
async fn health_check() -> &'static str {
    "OK"
}

fn api_routes() -> Router<AppState> {
    let routes = [
        ("/api/messages/user/{user_id}", get(messages_with_user)),
        ("/api/messages/send/{receiver_id}", post(send_message_to_user)),
        (
            "/api/messages/conversations",
            get(list_conversations).post(create_conversation),
        ),
        (
            "/api/messages/conversations/{conversation_id}/messages",
            get(conversation_messages).post(post_conversation_message),
        ),
        (
            "/api/messages/{message_id}",
            get(get_message)
                .patch(edit_message)
                .put(edit_message)
                .delete(delete_message),
        ),
    ];

    routes
        .into_iter()
        .fold(Router::new(), |router, (path, handler)| {
            with_trailing_slash(router, path, handler)
        })
}

fn socket_routes() -> Router<AppState> {
    let router = with_trailing_slash(Router::new(), "/ws/chat/{conversation_id}", get(chat_socket));
    with_trailing_slash(router, "/ws/presence", get(presence_socket))
}

/// 同一个处理器同时挂在带和不带结尾斜杠的路径上
fn with_trailing_slash(
    router: Router<AppState>,
    path: &str,
    handler: MethodRouter<AppState>,
) -> Router<AppState> {
    router
        .route(path, handler.clone())
        .route(&format!("{path}/"), handler)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(origin = %origin, error = %err, "忽略非法的 CORS 来源");
                None
            }
        })
        .collect();
    layer.allow_origin(allowed)
}

#[derive(Debug, Default, Deserialize)]
struct SendMessageBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    reply_to_message_id: Option<MessageId>,
}

impl From<SendMessageBody> for MessageDraft {
    fn from(body: SendMessageBody) -> Self {
        MessageDraft {
            content: body.content,
            image: body.image,
            reply_to: body.reply_to_message_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateConversationBody {
    #[serde(default)]
    participant_ids: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
struct EditMessageBody {
    content: String,
}

async fn messages_with_user(
    State(state): State<AppState>,
    AuthUser(requester): AuthUser,
    ApiPath(user_id): ApiPath<i64>,
) -> Result<Json<Vec<MessageDto>>, ApiError> {
    let messages = state
        .conversations
        .messages_with_user(requester, UserId(user_id))
        .await?;
    Ok(Json(messages))
}

async fn send_message_to_user(
    State(state): State<AppState>,
    AuthUser(sender): AuthUser,
    ApiPath(receiver_id): ApiPath<i64>,
    ApiJson(body): ApiJson<SendMessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .conversations
        .send_message_to_user(SendMessageToUserRequest {
            sender_id: sender,
            receiver_id: UserId(receiver_id),
            draft: body.into(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(requester): AuthUser,
) -> Result<Json<Vec<ConversationDto>>, ApiError> {
    let conversations = state.conversations.list_conversations(requester).await?;
    Ok(Json(conversations))
}

async fn create_conversation(
    State(state): State<AppState>,
    AuthUser(requester): AuthUser,
    ApiJson(body): ApiJson<CreateConversationBody>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state
        .conversations
        .create_conversation(CreateConversationRequest {
            requester_id: requester,
            participant_ids: body.participant_ids,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn conversation_messages(
    State(state): State<AppState>,
    AuthUser(requester): AuthUser,
    ApiPath(conversation_id): ApiPath<i64>,
) -> Result<Json<Vec<MessageDto>>, ApiError> {
    let messages = state
        .conversations
        .conversation_messages(requester, ConversationId(conversation_id))
        .await?;
    Ok(Json(messages))
}

async fn post_conversation_message(
    State(state): State<AppState>,
    AuthUser(sender): AuthUser,
    ApiPath(conversation_id): ApiPath<i64>,
    ApiJson(body): ApiJson<SendMessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .conversations
        .post_conversation_message(PostConversationMessageRequest {
            conversation_id: ConversationId(conversation_id),
            sender_id: sender,
            draft: body.into(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn get_message(
    State(state): State<AppState>,
    AuthUser(requester): AuthUser,
    ApiPath(message_id): ApiPath<i64>,
) -> Result<Json<MessageDto>, ApiError> {
    let message = state
        .conversations
        .get_message(requester, MessageId(message_id))
        .await?;
    Ok(Json(message))
}

async fn edit_message(
    State(state): State<AppState>,
    AuthUser(editor): AuthUser,
    ApiPath(message_id): ApiPath<i64>,
    ApiJson(body): ApiJson<EditMessageBody>,
) -> Result<Json<MessageDto>, ApiError> {
    let message = state
        .conversations
        .edit_message(EditMessageRequest {
            message_id: MessageId(message_id),
            editor_id: editor,
            content: body.content,
        })
        .await?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<AppState>,
    AuthUser(requester): AuthUser,
    ApiPath(message_id): ApiPath<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .conversations
        .delete_message(requester, MessageId(message_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
