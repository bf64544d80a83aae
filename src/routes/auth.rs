use crate::{
    error::{AppError, Result},
    models::session::OAuthProvider,
    services::LoginEntry,
    state::AppState,
};
use axum::{
    extract::{Query, State},
    response::{Json, Redirect},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/entry", get(login_entry))
        .route("/login", get(login))
        .route("/callback", get(callback))
        .route("/logout", post(logout))
}

/// 登录页入口
/// GET /api/vault/auth/entry
async fn login_entry(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let route = match state.gate.enter_login().await? {
        LoginEntry::RedirectToDashboard => "dashboard",
        LoginEntry::ShowLogin => "login",
    };

    Ok(Json(json!({
        "success": true,
        "data": { "route": route }
    })))
}

/// 跳转到第三方登录
/// GET /api/vault/auth/login?provider=google
async fn login(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LoginQuery>,
) -> Result<Redirect> {
    let name = query
        .provider
        .unwrap_or_else(|| state.config.oauth_provider.clone());
    let provider = OAuthProvider::parse(&name)
        .ok_or_else(|| AppError::bad_request(&format!("Unsupported provider: {}", name)))?;

    let url = state.gate.begin_sign_in(provider).await?;
    debug!("Redirecting to {} sign-in", provider);
    Ok(Redirect::to(&url))
}

/// 第三方登录回调
/// GET /api/vault/auth/callback?code=...
async fn callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Redirect {
    if let Some(error) = query.error {
        warn!(
            "Provider returned error {}: {}",
            error,
            query.error_description.unwrap_or_default()
        );
        return Redirect::to(&state.config.login_url);
    }

    let code = match query.code {
        Some(code) => code,
        None => return Redirect::to(&state.config.login_url),
    };

    match state.gate.complete_sign_in(&code).await {
        Ok(user) => {
            info!("Sign-in completed for user: {}", user.id);
            Redirect::to(&state.config.dashboard_url)
        }
        Err(e) => {
            warn!("Sign-in failed: {}", e);
            Redirect::to(&state.config.login_url)
        }
    }
}

/// 退出登录
/// POST /api/vault/auth/logout
async fn logout(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    state.gate.sign_out().await?;

    Ok(Json(json!({
        "success": true,
        "message": "Signed out"
    })))
}
