//! 主应用程序入口
//!
//! 读取配置、装配基础设施和应用服务，然后启动 Axum 服务。

use std::sync::Arc;

use anyhow::Context;
use application::{
    Clock, ConversationService, ConversationServiceDependencies, NoUnreadCounter,
    SessionDependencies, SystemClock,
};
use config::{AppConfig, LogFormat};
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("加载配置失败")?;
    init_tracing(config.log_format);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let infrastructure = Infrastructure::connect(&config, clock)
        .await
        .context("初始化基础设施失败")?;
    tracing::info!(presence_backend = %infrastructure.presence.backend(), "基础设施就绪");

    let conversations = ConversationService::new(ConversationServiceDependencies {
        repository: infrastructure.repository(),
        users: infrastructure.users(),
        broadcaster: infrastructure.broadcaster.clone(),
        unread_counter: Arc::new(NoUnreadCounter),
    });
    let sessions = SessionDependencies {
        repository: infrastructure.repository(),
        users: infrastructure.users(),
        broadcaster: infrastructure.broadcaster.clone(),
        presence: infrastructure.presence.clone(),
    };
    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));

    let state = AppState::new(Arc::new(conversations), sessions, jwt_service);
    let app = router(state, &config.server.cors_origins);

    let bind_addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("无法监听 {bind_addr}"))?;

    tracing::info!(addr = %bind_addr, "聊天服务已启动");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("服务已停止");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "监听退出信号失败");
    }
    tracing::info!("收到退出信号，开始关闭");
}
