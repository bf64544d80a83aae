use chrono::Utc;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    models::{
        bookmark::{Bookmark, NewBookmark},
        realtime::ChangeKind,
        session::AuthUser,
    },
    services::{
        pending::{Inverse, PendingOp, PendingWrite, TempIdGenerator, WriteOutcome},
        remote::{ChangeSubscription, RemoteStore, SelectQuery},
    },
    utils::normalize_url,
};

/// Change kinds that trigger a reload.
pub const RELOAD_ON: [ChangeKind; 2] = [ChangeKind::Insert, ChangeKind::Delete];

/// Monotonic session counter. Issuing a new generation invalidates every
/// generation issued before it.
#[derive(Debug, Clone, Default)]
pub struct GenerationCounter {
    current: Arc<AtomicU64>,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> Generation {
        let issued = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        Generation {
            issued,
            current: self.current.clone(),
        }
    }

    pub fn advance(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    issued: u64,
    current: Arc<AtomicU64>,
}

impl Generation {
    pub fn value(&self) -> u64 {
        self.issued
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.issued
    }
}

#[derive(Debug, Clone)]
pub struct VaultOptions {
    pub table: String,
    pub restore_failed_deletes: bool,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            table: "bookmarks".to_string(),
            restore_failed_deletes: false,
        }
    }
}

/// 书签同步模型
///
/// The owner's bookmarks, newest first, mirrored from the remote store.
/// Adds and removes apply locally at once and are confirmed in the
/// background; every notified insert or delete triggers a full reload.
#[derive(Clone)]
pub struct BookmarkVault {
    store: Arc<dyn RemoteStore>,
    owner: AuthUser,
    options: VaultOptions,
    list: Arc<RwLock<Arc<Vec<Bookmark>>>>,
    temp_ids: Arc<TempIdGenerator>,
    generation: Generation,
    feed_reloads: Arc<AtomicU64>,
}

impl BookmarkVault {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        owner: AuthUser,
        generation: Generation,
        options: VaultOptions,
    ) -> Self {
        Self {
            store,
            owner,
            options,
            list: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            temp_ids: Arc::new(TempIdGenerator::new()),
            generation,
            feed_reloads: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn owner(&self) -> &AuthUser {
        &self.owner
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    /// The current list. Mutations install a new list, so a snapshot never
    /// changes under the reader.
    pub fn snapshot(&self) -> Arc<Vec<Bookmark>> {
        self.list.read().clone()
    }

    pub fn find(&self, id: &str) -> Option<Bookmark> {
        self.snapshot().iter().find(|b| b.id == id).cloned()
    }

    /// Number of reloads triggered by the change feed so far.
    pub fn feed_reload_count(&self) -> u64 {
        self.feed_reloads.load(Ordering::SeqCst)
    }

    fn install(&self, next: Vec<Bookmark>) {
        *self.list.write() = Arc::new(next);
    }

    /// Replaces the whole list with the owner's records from the store. On
    /// failure the list is left as it was.
    pub async fn load(&self) -> Result<()> {
        let query = SelectQuery::newest_first(&self.options.table, &self.owner.id);

        let rows = match self.store.select(&query).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to load bookmarks for user {}: {}", self.owner.id, e);
                return Err(e);
            }
        };

        if !self.generation.is_current() {
            debug!("Discarding bookmark load for ended session {}", self.generation.value());
            return Ok(());
        }

        debug!("Loaded {} bookmarks for user: {}", rows.len(), self.owner.id);
        self.install(rows);
        Ok(())
    }

    /// Optimistically adds a bookmark. Returns `None`, changing nothing, when
    /// either field is blank.
    pub fn add(&self, title: &str, url: &str) -> Option<PendingWrite> {
        let title = title.trim();
        let url = url.trim();
        if title.is_empty() || url.is_empty() {
            debug!("Ignoring bookmark with empty title or url");
            return None;
        }

        let url = normalize_url(url);
        let temp_id = self.temp_ids.next_id();
        let record = Bookmark {
            id: temp_id.clone(),
            url: url.clone(),
            title: title.to_string(),
            user_id: self.owner.id.clone(),
            created_at: Utc::now(),
        };

        {
            let mut list = self.list.write();
            let mut next = Vec::with_capacity(list.len() + 1);
            next.push(record);
            next.extend(list.iter().cloned());
            *list = Arc::new(next);
        }
        debug!("Optimistically added bookmark {} for user: {}", temp_id, self.owner.id);

        let row = NewBookmark {
            url,
            title: title.to_string(),
            user_id: self.owner.id.clone(),
        };
        let op = PendingOp::insert(&temp_id);
        let vault = self.clone();
        let handle = tokio::spawn(async move {
            match vault.store.insert(&vault.options.table, &row).await {
                Ok(()) => {
                    debug!("Bookmark {} confirmed by backend", op.target_id);
                    WriteOutcome::Confirmed
                }
                Err(e) => {
                    warn!("Failed to insert bookmark {}: {}", op.target_id, e);
                    vault.settle_failure(&op)
                }
            }
        });

        Some(PendingWrite::new(temp_id, handle))
    }

    /// Removes a bookmark from the list at once and deletes it remotely in
    /// the background.
    pub fn remove(&self, id: &str) -> PendingWrite {
        let removed = {
            let mut list = self.list.write();
            let removed = list.iter().find(|b| b.id == id).cloned();
            if removed.is_some() {
                *list = Arc::new(list.iter().filter(|b| b.id != id).cloned().collect());
            }
            removed
        };
        debug!("Optimistically removed bookmark {} for user: {}", id, self.owner.id);

        let op = PendingOp::delete(id, removed, self.options.restore_failed_deletes);
        let vault = self.clone();
        let handle = tokio::spawn(async move {
            match vault.store.delete(&vault.options.table, &op.target_id).await {
                Ok(()) => WriteOutcome::Confirmed,
                Err(e) => {
                    warn!("Failed to delete bookmark {}: {}", op.target_id, e);
                    vault.settle_failure(&op)
                }
            }
        });

        PendingWrite::new(id.to_string(), handle)
    }

    fn settle_failure(&self, op: &PendingOp) -> WriteOutcome {
        if !self.generation.is_current() {
            return WriteOutcome::Stale;
        }
        if op.inverse == Inverse::Nothing {
            return WriteOutcome::Kept;
        }

        let mut list = self.list.write();
        if let Some(next) = op.inverse.apply(&list) {
            *list = Arc::new(next);
        }
        info!("Rolled back {:?} of bookmark {}", op.kind, op.target_id);
        WriteOutcome::RolledBack
    }

    /// Reloads once per insert or delete event until the feed ends or the
    /// session is torn down. Load failures are logged and otherwise ignored.
    pub fn attach_feed(&self, mut feed: ChangeSubscription) -> JoinHandle<()> {
        let vault = self.clone();
        tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                if !vault.generation.is_current() {
                    break;
                }
                if !RELOAD_ON.contains(&event.kind) {
                    debug!("Ignoring {:?} event on {}", event.kind, event.table);
                    continue;
                }

                vault.feed_reloads.fetch_add(1, Ordering::SeqCst);
                debug!("{:?} on {} triggered a reload", event.kind, event.table);
                // failure already logged by load
                let _ = vault.load().await;
            }
            debug!("Change feed ended for user: {}", vault.owner.id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::realtime::ChangeEvent,
        services::memory::{MemoryStore, StoreOp},
    };
    use std::time::Duration;

    fn owner() -> AuthUser {
        AuthUser { id: "u-1".to_string(), email: Some("u1@example.com".to_string()) }
    }

    fn setup(options: VaultOptions) -> (MemoryStore, GenerationCounter, BookmarkVault) {
        let store = MemoryStore::signed_in(owner());
        let counter = GenerationCounter::new();
        let vault = BookmarkVault::new(Arc::new(store.clone()), owner(), counter.issue(), options);
        (store, counter, vault)
    }

    async fn seed(store: &MemoryStore, titles: &[&str]) {
        for title in titles {
            store
                .insert(
                    "bookmarks",
                    &NewBookmark {
                        url: format!("https://{}.example.com", title),
                        title: title.to_string(),
                        user_id: "u-1".to_string(),
                    },
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_load_is_idempotent_and_newest_first() {
        let (store, _, vault) = setup(VaultOptions::default());
        seed(&store, &["one", "two", "three"]).await;

        vault.load().await.unwrap();
        let first = vault.snapshot();
        vault.load().await.unwrap();
        let second = vault.snapshot();

        assert_eq!(first, second);
        let titles: Vec<&str> = second.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, vec!["three", "two", "one"]);
        assert!(second.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn test_load_failure_keeps_list() {
        let (store, _, vault) = setup(VaultOptions::default());
        seed(&store, &["one"]).await;
        vault.load().await.unwrap();

        store.set_failing(StoreOp::Select, true);
        seed(&store, &["two"]).await;
        assert!(vault.load().await.is_err());
        assert_eq!(vault.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_add_then_reload_does_not_duplicate() {
        let (_store, _, vault) = setup(VaultOptions::default());

        let pending = vault.add("Example", "example.com").unwrap();
        let list = vault.snapshot();
        assert_eq!(list[0].title, "Example");
        assert_eq!(list[0].url, "https://example.com");
        assert_eq!(list[0].id, pending.id());
        assert!(list[0].is_temporary());

        assert_eq!(pending.settled().await, WriteOutcome::Confirmed);
        vault.load().await.unwrap();

        let list = vault.snapshot();
        let matching: Vec<&Bookmark> = list
            .iter()
            .filter(|b| b.title == "Example" && b.url == "https://example.com")
            .collect();
        assert_eq!(matching.len(), 1);
        assert!(!matching[0].is_temporary());
    }

    #[tokio::test]
    async fn test_add_failure_rolls_back() {
        let (store, _, vault) = setup(VaultOptions::default());
        seed(&store, &["one", "two"]).await;
        vault.load().await.unwrap();
        let before = vault.snapshot().len();

        store.set_failing(StoreOp::Insert, true);
        store.set_latency(Duration::from_millis(20));
        let pending = vault.add("Broken", "broken.example.com").unwrap();
        let temp_id = pending.id().to_string();

        assert_eq!(vault.snapshot().len(), before + 1);
        assert!(vault.find(&temp_id).is_some());

        assert_eq!(pending.settled().await, WriteOutcome::RolledBack);
        assert_eq!(vault.snapshot().len(), before);
        assert!(vault.find(&temp_id).is_none());
        assert_eq!(store.rows().len(), 2);
    }

    #[tokio::test]
    async fn test_add_ignores_blank_fields() {
        let (store, _, vault) = setup(VaultOptions::default());

        assert!(vault.add("", "example.com").is_none());
        assert!(vault.add("Example", "").is_none());
        assert!(vault.add("   ", "example.com").is_none());
        assert!(vault.snapshot().is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn test_add_keeps_existing_scheme_and_trims() {
        let (_store, _, vault) = setup(VaultOptions::default());
        let pending = vault.add("  Plain  ", " HTTP://plain.example.com ").unwrap();

        let record = vault.find(pending.id()).unwrap();
        assert_eq!(record.title, "Plain");
        assert_eq!(record.url, "HTTP://plain.example.com");
        pending.settled().await;
    }

    #[tokio::test]
    async fn test_remove_is_immediate_even_when_delete_fails() {
        let (store, _, vault) = setup(VaultOptions::default());
        seed(&store, &["one", "two"]).await;
        vault.load().await.unwrap();
        let target = vault.snapshot()[0].id.clone();

        store.set_failing(StoreOp::Delete, true);
        store.set_latency(Duration::from_millis(20));
        let pending = vault.remove(&target);

        assert!(vault.find(&target).is_none());
        assert_eq!(vault.snapshot().len(), 1);

        assert_eq!(pending.settled().await, WriteOutcome::Kept);
        assert!(vault.find(&target).is_none());
        assert_eq!(store.rows().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_delete_restored_when_enabled() {
        let (store, _, vault) = setup(VaultOptions {
            restore_failed_deletes: true,
            ..Default::default()
        });
        seed(&store, &["one", "two", "three"]).await;
        vault.load().await.unwrap();
        let original = vault.snapshot();
        let target = original[1].id.clone();

        store.set_failing(StoreOp::Delete, true);
        let pending = vault.remove(&target);
        assert!(vault.find(&target).is_none());

        assert_eq!(pending.settled().await, WriteOutcome::RolledBack);
        assert_eq!(vault.snapshot(), original);
    }

    #[tokio::test]
    async fn test_add_then_remove_scenario() {
        let (_store, _, vault) = setup(VaultOptions::default());
        assert!(vault.snapshot().is_empty());

        let pending = vault.add("Docs", "docs.example.com").unwrap();
        let list = vault.snapshot();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].url, "https://docs.example.com");

        let id = pending.id().to_string();
        vault.remove(&id);
        assert!(vault.snapshot().is_empty());
        pending.settled().await;
    }

    #[tokio::test]
    async fn test_each_feed_event_reloads_once() {
        let (store, _, vault) = setup(VaultOptions::default());
        let feed = store.subscribe("bookmarks", &RELOAD_ON).await.unwrap();
        let listener = vault.attach_feed(feed);

        store.insert_external(
            "bookmarks",
            NewBookmark {
                url: "https://remote.example.com".to_string(),
                title: "Remote".to_string(),
                user_id: "u-1".to_string(),
            },
        );
        wait_until(|| vault.snapshot().len() == 1).await;
        assert_eq!(vault.feed_reload_count(), 1);
        assert_eq!(store.select_calls(), 1);

        for _ in 0..3 {
            store.emit_change(ChangeEvent::new(ChangeKind::Insert, "bookmarks"));
        }
        wait_until(|| store.select_calls() == 4).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.select_calls(), 4);
        assert_eq!(vault.feed_reload_count(), 4);

        listener.abort();
    }

    #[tokio::test]
    async fn test_feed_reloads_on_other_owner_changes() {
        let (store, _, vault) = setup(VaultOptions::default());
        let listener = vault.attach_feed(store.subscribe("bookmarks", &RELOAD_ON).await.unwrap());

        store.insert_external(
            "bookmarks",
            NewBookmark {
                url: "https://elsewhere.example.com".to_string(),
                title: "Not mine".to_string(),
                user_id: "u-2".to_string(),
            },
        );
        wait_until(|| vault.feed_reload_count() == 1).await;
        wait_until(|| store.select_calls() == 1).await;
        assert!(vault.snapshot().is_empty());

        listener.abort();
    }

    #[tokio::test]
    async fn test_feed_supersedes_temporary_entry() {
        let (store, _, vault) = setup(VaultOptions::default());
        let listener = vault.attach_feed(store.subscribe("bookmarks", &RELOAD_ON).await.unwrap());

        let pending = vault.add("Example", "example.com").unwrap();
        assert_eq!(pending.settled().await, WriteOutcome::Confirmed);

        wait_until(|| vault.snapshot().iter().all(|b| !b.is_temporary())).await;
        assert_eq!(vault.snapshot().len(), 1);

        listener.abort();
    }

    #[tokio::test]
    async fn test_stale_generation_discards_results() {
        let (store, counter, vault) = setup(VaultOptions::default());
        store.set_failing(StoreOp::Insert, true);
        store.set_latency(Duration::from_millis(20));

        let pending = vault.add("Late", "late.example.com").unwrap();
        counter.advance();

        assert_eq!(pending.settled().await, WriteOutcome::Stale);
        // rollback skipped: the session that owned this list is gone
        assert_eq!(vault.snapshot().len(), 1);

        store.set_failing(StoreOp::Insert, false);
        seed(&store, &["fresh"]).await;
        vault.load().await.unwrap();
        assert_eq!(vault.snapshot().len(), 1);
        assert!(vault.snapshot()[0].is_temporary());
    }

    #[test]
    fn test_generation_counter() {
        let counter = GenerationCounter::new();
        let first = counter.issue();
        assert!(first.is_current());

        let second = counter.issue();
        assert!(!first.is_current());
        assert!(second.is_current());

        counter.advance();
        assert!(!second.is_current());
    }
}
