use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::{
        bookmark::{Bookmark, NewBookmark},
        realtime::{ChangeEvent, ChangeKind},
        session::{AuthUser, OAuthOptions, OAuthProvider, Session},
    },
    services::remote::{ChangeSubscription, RemoteStore, SelectQuery},
};

/// Operations whose failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Select,
    Insert,
    Delete,
    Subscribe,
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<Bookmark>,
    session: Option<Session>,
    failing: HashSet<StoreOp>,
}

/// In-process backend with the hosted store's semantics. Used for local
/// development and tests.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    changes: broadcast::Sender<ChangeEvent>,
    local_user: AuthUser,
    latency: Arc<RwLock<Duration>>,
    select_calls: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new(local_user: AuthUser) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            changes,
            local_user,
            latency: Arc::new(RwLock::new(Duration::ZERO)),
            select_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A store already signed in as `local_user`.
    pub fn signed_in(local_user: AuthUser) -> Self {
        let store = Self::new(local_user.clone());
        store.state.write().session = Some(Self::session_for(local_user));
        store
    }

    fn session_for(user: AuthUser) -> Session {
        Session {
            access_token: format!("memory-{}", Uuid::new_v4()),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::days(365),
            user,
        }
    }

    pub fn set_failing(&self, op: StoreOp, failing: bool) {
        let mut state = self.state.write();
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    /// Delay applied to every record operation before it takes effect.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    pub fn select_calls(&self) -> u64 {
        self.select_calls.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<Bookmark> {
        self.state.read().rows.clone()
    }

    /// Inserts a row as another session (or another owner) would, emitting
    /// the matching change event.
    pub fn insert_external(&self, table: &str, row: NewBookmark) -> Bookmark {
        let bookmark = self.store_row(row);
        self.emit(ChangeKind::Insert, table, Some(&bookmark), None);
        bookmark
    }

    pub fn delete_external(&self, table: &str, id: &str) -> Option<Bookmark> {
        let removed = self.remove_row(id);
        if let Some(ref bookmark) = removed {
            self.emit(ChangeKind::Delete, table, None, Some(bookmark));
        }
        removed
    }

    /// Emits a change event without touching the rows.
    pub fn emit_change(&self, event: ChangeEvent) {
        // No receivers is fine.
        let _ = self.changes.send(event);
    }

    fn store_row(&self, row: NewBookmark) -> Bookmark {
        let bookmark = Bookmark {
            id: Uuid::new_v4().to_string(),
            url: row.url,
            title: row.title,
            user_id: row.user_id,
            created_at: Utc::now(),
        };
        self.state.write().rows.push(bookmark.clone());
        bookmark
    }

    fn remove_row(&self, id: &str) -> Option<Bookmark> {
        let mut state = self.state.write();
        let index = state.rows.iter().position(|b| b.id == id)?;
        Some(state.rows.remove(index))
    }

    fn emit(&self, kind: ChangeKind, table: &str, record: Option<&Bookmark>, old: Option<&Bookmark>) {
        let mut event = ChangeEvent::new(kind, table);
        event.record = record.and_then(|b| serde_json::to_value(b).ok());
        event.old_record = old.and_then(|b| serde_json::to_value(b).ok());
        event.commit_timestamp = Some(Utc::now());
        self.emit_change(event);
    }

    fn check(&self, op: StoreOp) -> Result<()> {
        if self.state.read().failing.contains(&op) {
            return Err(AppError::backend(503, format!("{:?} unavailable", op)));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn require_session(&self) -> Result<Session> {
        self.state
            .read()
            .session
            .clone()
            .ok_or_else(|| AppError::unauthorized("No active session"))
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn current_session(&self) -> Result<Option<Session>> {
        Ok(self.state.read().session.clone())
    }

    async fn sign_in_with_oauth(&self, provider: OAuthProvider, options: OAuthOptions) -> Result<String> {
        let mut url = format!("memory://oauth/{}?code=local", provider);
        if options.force_account_chooser {
            url.push_str("&prompt=select_account");
        }
        Ok(url)
    }

    async fn exchange_code(&self, code: &str) -> Result<Session> {
        if code.is_empty() {
            return Err(AppError::unauthorized("Missing authorization code"));
        }
        let session = Self::session_for(self.local_user.clone());
        self.state.write().session = Some(session.clone());
        info!("Memory store signed in user: {}", session.user.id);
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        self.state.write().session = None;
        Ok(())
    }

    async fn select(&self, query: &SelectQuery) -> Result<Vec<Bookmark>> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check(StoreOp::Select)?;
        self.require_session()?;

        let mut rows: Vec<Bookmark> = self
            .state
            .read()
            .rows
            .iter()
            .filter(|b| b.user_id == query.owner_id)
            .cloned()
            .collect();

        // created_at is the only sort key.
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if !query.ascending {
            rows.reverse();
        }
        debug!("Memory select returned {} rows for owner: {}", rows.len(), query.owner_id);
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: &NewBookmark) -> Result<()> {
        self.simulate_latency().await;
        self.check(StoreOp::Insert)?;
        self.require_session()?;

        let bookmark = self.store_row(row.clone());
        self.emit(ChangeKind::Insert, table, Some(&bookmark), None);
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.simulate_latency().await;
        self.check(StoreOp::Delete)?;
        self.require_session()?;

        // Deleting a missing row succeeds with no event, like a filtered DELETE.
        if let Some(removed) = self.remove_row(id) {
            self.emit(ChangeKind::Delete, table, None, Some(&removed));
        }
        Ok(())
    }

    async fn subscribe(&self, table: &str, kinds: &[ChangeKind]) -> Result<ChangeSubscription> {
        self.check(StoreOp::Subscribe)?;

        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let table = table.to_string();
        let kinds: Vec<ChangeKind> = kinds.to_vec();

        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) => {
                        if event.table != table || !kinds.contains(&event.kind) {
                            continue;
                        }
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Memory change feed lagged by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(ChangeSubscription::new(rx, task))
    }
}
