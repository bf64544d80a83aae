use axum::{routing::get, Router};
use std::sync::Arc;

use crate::state::AppState;

pub mod auth;
pub mod bookmarks;

/// 构建应用路由
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .nest("/api/vault/auth", auth::router())
        .nest("/api/vault/bookmarks", bookmarks::router())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "link-vault is running!"
}
