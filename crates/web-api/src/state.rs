use std::sync::Arc;

use application::{ConversationService, SessionDependencies};

use crate::auth::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub conversations: Arc<ConversationService>,
    pub sessions: SessionDependencies,
    pub jwt_service: Arc<JwtService>,
}

impl AppState {
    pub fn new(
        conversations: Arc<ConversationService>,
        sessions: SessionDependencies,
        jwt_service: Arc<JwtService>,
    ) -> Self {
        Self {
            conversations,
            sessions,
            jwt_service,
        }
    }
}
