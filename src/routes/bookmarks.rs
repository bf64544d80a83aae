use crate::{
    error::{AppError, Result},
    models::bookmark::CreateBookmarkRequest,
    services::{Route, VaultSession},
    state::AppState,
};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use validator::Validate;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_bookmarks).post(add_bookmark))
        .route("/reload", post(reload_bookmarks))
        .route("/:id", delete(remove_bookmark))
        .route("/:id/copy", post(copy_bookmark))
}

/// Dashboard gate: the active session context, or 401.
async fn dashboard(state: &AppState) -> Result<Arc<VaultSession>> {
    match state.gate.enter_dashboard().await? {
        Route::Dashboard(ctx) => Ok(ctx),
        Route::Login => Err(AppError::unauthorized("Sign in required")),
    }
}

fn list_payload(ctx: &VaultSession) -> Value {
    json!({
        "user": ctx.user(),
        "bookmarks": ctx.views(),
        "copied_id": ctx.copied_id(),
    })
}

/// 获取书签列表
/// GET /api/vault/bookmarks
async fn list_bookmarks(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let ctx = dashboard(&state).await?;

    Ok(Json(json!({
        "success": true,
        "data": list_payload(&ctx)
    })))
}

/// 添加书签
/// POST /api/vault/bookmarks
///
/// The record shows up at once with a temporary id; the backend write
/// finishes in the background.
async fn add_bookmark(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateBookmarkRequest>,
) -> Result<Json<Value>> {
    let ctx = dashboard(&state).await?;
    request.validate()?;

    let pending = match ctx.vault().add(&request.title, &request.url) {
        Some(pending) => pending,
        None => {
            debug!("Ignoring bookmark with empty title or url");
            return Ok(Json(json!({
                "success": true,
                "data": { "accepted": false }
            })));
        }
    };

    debug!("Bookmark {} added for user: {}", pending.id(), ctx.user().id);
    let id = pending.id().to_string();

    Ok(Json(json!({
        "success": true,
        "data": {
            "accepted": true,
            "id": id,
            "bookmarks": ctx.views()
        }
    })))
}

/// 删除书签
/// DELETE /api/vault/bookmarks/:id
async fn remove_bookmark(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let ctx = dashboard(&state).await?;
    ctx.vault().remove(&id);

    Ok(Json(json!({
        "success": true,
        "data": { "id": id, "bookmarks": ctx.views() }
    })))
}

/// 复制链接
/// POST /api/vault/bookmarks/:id/copy
async fn copy_bookmark(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let ctx = dashboard(&state).await?;
    let url = ctx
        .copy_link(&id)
        .ok_or_else(|| AppError::not_found(&format!("Bookmark {}", id)))?;

    Ok(Json(json!({
        "success": true,
        "data": { "id": id, "url": url }
    })))
}

/// 重新加载
/// POST /api/vault/bookmarks/reload
async fn reload_bookmarks(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let ctx = dashboard(&state).await?;
    ctx.vault().load().await?;

    Ok(Json(json!({
        "success": true,
        "data": list_payload(&ctx)
    })))
}
