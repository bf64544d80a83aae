use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::Result,
    models::{
        bookmark::BookmarkView,
        session::{AuthUser, OAuthOptions, OAuthProvider},
    },
    services::{
        copy::CopyFeedback,
        remote::RemoteStore,
        vault::{BookmarkVault, GenerationCounter, VaultOptions, RELOAD_ON},
    },
};

/// Where the dashboard entry point sends the caller.
pub enum Route {
    Login,
    Dashboard(Arc<VaultSession>),
}

/// Where the login entry point sends the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginEntry {
    ShowLogin,
    RedirectToDashboard,
}

#[derive(Debug, Clone)]
pub struct GateOptions {
    pub vault: VaultOptions,
    pub copy_window: Duration,
    pub oauth_redirect_url: Option<String>,
}

impl From<&Config> for GateOptions {
    fn from(config: &Config) -> Self {
        Self {
            vault: VaultOptions {
                table: config.bookmarks_table.clone(),
                restore_failed_deletes: config.rollback_failed_deletes,
            },
            copy_window: config.copy_feedback(),
            oauth_redirect_url: Some(config.oauth_redirect_url.clone()),
        }
    }
}

/// 会话上下文
///
/// Everything that lives exactly as long as one signed-in session: the
/// user, its bookmark list, the change-feed listener and the copy mark.
pub struct VaultSession {
    user: AuthUser,
    vault: BookmarkVault,
    copy: CopyFeedback,
    feed: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl VaultSession {
    pub fn user(&self) -> &AuthUser {
        &self.user
    }

    pub fn vault(&self) -> &BookmarkVault {
        &self.vault
    }

    pub fn has_live_feed(&self) -> bool {
        self.feed.lock().is_some()
    }

    /// Returns the bookmark's URL for the clipboard and marks it as copied.
    pub fn copy_link(&self, id: &str) -> Option<String> {
        let bookmark = self.vault.find(id)?;
        self.copy.mark(id);
        Some(bookmark.url)
    }

    pub fn copied_id(&self) -> Option<String> {
        self.copy.copied_id()
    }

    pub fn views(&self) -> Vec<BookmarkView> {
        let copied = self.copied_id();
        self.vault
            .snapshot()
            .iter()
            .cloned()
            .map(|b| BookmarkView::new(b, copied.as_deref()))
            .collect()
    }

    fn teardown(&self) {
        if let Some(feed) = self.feed.lock().take() {
            feed.abort();
        }
    }
}

impl Drop for VaultSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Two-state gate in front of the dashboard. Owns the active session
/// context and tears it down on sign-out.
pub struct SessionGate {
    store: Arc<dyn RemoteStore>,
    options: GateOptions,
    generations: GenerationCounter,
    active: Mutex<Option<Arc<VaultSession>>>,
    force_account_chooser: AtomicBool,
}

impl SessionGate {
    pub fn new(store: Arc<dyn RemoteStore>, options: GateOptions) -> Self {
        Self {
            store,
            options,
            generations: GenerationCounter::new(),
            active: Mutex::new(None),
            force_account_chooser: AtomicBool::new(false),
        }
    }

    pub async fn active(&self) -> Option<Arc<VaultSession>> {
        self.active.lock().await.clone()
    }

    /// Dashboard entry: no session means back to login. The first entry for
    /// a user builds its context, subscribes to the feed and loads the list.
    pub async fn enter_dashboard(&self) -> Result<Route> {
        let session = match self.store.current_session().await? {
            Some(session) => session,
            None => {
                debug!("No active session, routing to login");
                self.close_active().await;
                return Ok(Route::Login);
            }
        };

        let mut active = self.active.lock().await;
        if let Some(ctx) = active.as_ref() {
            if ctx.user.id == session.user.id && ctx.vault.generation().is_current() {
                return Ok(Route::Dashboard(ctx.clone()));
            }
        }

        if let Some(previous) = active.take() {
            info!("Session user changed from {}, closing old context", previous.user.id);
            self.generations.advance();
            previous.teardown();
        }

        let ctx = self.open(session.user).await;
        *active = Some(ctx.clone());
        Ok(Route::Dashboard(ctx))
    }

    /// Login entry: skip the prompt when a session already exists.
    pub async fn enter_login(&self) -> Result<LoginEntry> {
        match self.store.current_session().await? {
            Some(_) => Ok(LoginEntry::RedirectToDashboard),
            None => Ok(LoginEntry::ShowLogin),
        }
    }

    /// URL of the provider's sign-in page.
    pub async fn begin_sign_in(&self, provider: OAuthProvider) -> Result<String> {
        let options = OAuthOptions {
            redirect_to: self.options.oauth_redirect_url.clone(),
            force_account_chooser: self.force_account_chooser.load(Ordering::SeqCst),
        };

        let url = self.store.sign_in_with_oauth(provider, options).await?;
        self.force_account_chooser.store(false, Ordering::SeqCst);
        debug!("Starting {} sign-in", provider);
        Ok(url)
    }

    pub async fn complete_sign_in(&self, code: &str) -> Result<AuthUser> {
        let session = self.store.exchange_code(code).await?;
        info!("User signed in: {}", session.user.id);
        Ok(session.user)
    }

    /// Ends the remote session and the local context. A remote failure is
    /// logged; the local context is closed either way.
    pub async fn sign_out(&self) -> Result<()> {
        if let Err(e) = self.store.sign_out().await {
            warn!("Remote sign-out failed: {}", e);
        }
        self.close_active().await;
        self.force_account_chooser.store(true, Ordering::SeqCst);
        info!("Signed out");
        Ok(())
    }

    async fn open(&self, user: AuthUser) -> Arc<VaultSession> {
        let generation = self.generations.issue();
        info!("Opening vault session {} for user: {}", generation.value(), user.id);

        let vault = BookmarkVault::new(self.store.clone(), user.clone(), generation, self.options.vault.clone());

        // subscribe before the first load; the hosted feed returns once the server acknowledges its join
        let feed = match self.store.subscribe(&self.options.vault.table, &RELOAD_ON).await {
            Ok(feed) => Some(vault.attach_feed(feed)),
            Err(e) => {
                warn!("Live updates unavailable for user {}: {}", user.id, e);
                None
            }
        };

        // failure already logged by load; the list stays empty until the next reload
        let _ = vault.load().await;

        Arc::new(VaultSession {
            user,
            vault,
            copy: CopyFeedback::new(self.options.copy_window),
            feed: parking_lot::Mutex::new(feed),
        })
    }

    async fn close_active(&self) {
        self.generations.advance();
        if let Some(ctx) = self.active.lock().await.take() {
            debug!("Closing vault session for user: {}", ctx.user.id);
            ctx.teardown();
        }
    }
}
