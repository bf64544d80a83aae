use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    error::Result,
    models::{
        bookmark::{Bookmark, NewBookmark},
        realtime::{ChangeEvent, ChangeKind},
        session::{OAuthOptions, OAuthProvider, Session},
    },
};

/// Owner-scoped select on a record collection.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub table: String,
    pub owner_id: String,
    pub order_by: String,
    pub ascending: bool,
}

impl SelectQuery {
    /// Every record of `owner_id`, newest first.
    pub fn newest_first(table: &str, owner_id: &str) -> Self {
        Self {
            table: table.to_string(),
            owner_id: owner_id.to_string(),
            order_by: "created_at".to_string(),
            ascending: false,
        }
    }
}

/// A live change feed. Dropping it, or calling `unsubscribe`, stops the
/// background task that delivers events.
pub struct ChangeSubscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    task: Option<JoinHandle<()>>,
}

impl ChangeSubscription {
    pub fn new(events: mpsc::UnboundedReceiver<ChangeEvent>, task: JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
        }
    }

    /// Next event, or `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events.close();
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The hosted backend as the sync core sees it: auth session, one record
/// collection and its change feed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// The current session, or `None` when signed out.
    async fn current_session(&self) -> Result<Option<Session>>;

    /// Starts the provider redirect flow and returns the URL to send the
    /// browser to.
    async fn sign_in_with_oauth(&self, provider: OAuthProvider, options: OAuthOptions) -> Result<String>;

    /// Completes the redirect flow with the callback code.
    async fn exchange_code(&self, code: &str) -> Result<Session>;

    async fn sign_out(&self) -> Result<()>;

    async fn select(&self, query: &SelectQuery) -> Result<Vec<Bookmark>>;

    async fn insert(&self, table: &str, row: &NewBookmark) -> Result<()>;

    async fn delete(&self, table: &str, id: &str) -> Result<()>;

    async fn subscribe(&self, table: &str, kinds: &[ChangeKind]) -> Result<ChangeSubscription>;
}
