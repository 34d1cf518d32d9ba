//! HTTP 与 WebSocket 接入层

pub mod auth;
pub mod error;
pub mod extract;
pub mod routes;
pub mod state;
pub mod websocket;
pub mod ws_connection;

pub use auth::{AuthUser, Claims, JwtService};
pub use config::JwtConfig;
pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::AppState;
