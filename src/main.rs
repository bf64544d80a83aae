use std::sync::Arc;
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing::{info, warn};

use link_vault::{
    config::{BackendMode, Config},
    models::session::AuthUser,
    routes,
    services::{GateOptions, HostedStore, MemoryStore, RemoteStore, SessionGate},
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    dotenv::dotenv().ok();

    let config = Config::from_env()?;

    // 初始化日志，生产环境输出 JSON
    let production = config.is_production();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with((!production).then(|| tracing_subscriber::fmt::layer()))
        .with(production.then(|| tracing_subscriber::fmt::layer().json()))
        .init();

    info!("Starting link-vault service in {} mode...", config.environment);

    // 初始化后端存储
    let store: Arc<dyn RemoteStore> = match config.backend_mode {
        BackendMode::Hosted => {
            info!("Using hosted backend at {}", config.backend_url);
            Arc::new(HostedStore::new(&config)?)
        }
        BackendMode::Memory => {
            warn!("Using in-memory backend; bookmarks are lost on restart");
            Arc::new(MemoryStore::new(AuthUser {
                id: config.local_user_id.clone(),
                email: Some(config.local_user_email.clone()),
            }))
        }
    };

    let gate = SessionGate::new(store, GateOptions::from(&config));
    let app_state = Arc::new(AppState::new(config.clone(), gate));

    // 配置 CORS
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(
            config.cors_allowed_origins
                .split(',')
                .filter_map(|origin| origin.trim().parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        );

    let app = routes::app(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server_host, config.server_port);
    info!("Starting server on http://{}", addr);

    axum::Server::bind(&addr.parse()?)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
