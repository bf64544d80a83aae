use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Client, Response,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::Config,
    error::{AppError, Result},
    models::{
        bookmark::{Bookmark, NewBookmark},
        realtime::ChangeKind,
        session::{OAuthOptions, OAuthProvider, Session, TokenResponse},
    },
    services::{
        realtime::{RealtimeClient, TokenSource},
        remote::{ChangeSubscription, RemoteStore, SelectQuery},
    },
};

/// 托管后端客户端
///
/// REST, auth and realtime access to a PostgREST/GoTrue style backend. The
/// session lives in memory and is refreshed when it expires.
#[derive(Clone)]
pub struct HostedStore {
    http_client: Client,
    base_url: String,
    anon_key: String,
    session: Arc<RwLock<Option<Session>>>,
    pkce_verifier: Arc<Mutex<Option<String>>>,
    /// Held while a refresh is in flight so concurrent callers share it.
    refresh_lock: Arc<AsyncMutex<()>>,
    realtime: RealtimeClient,
}

/// PKCE pair for one authorization round trip.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self { verifier, challenge }
    }
}

impl HostedStore {
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            anon_key: config.backend_anon_key.clone(),
            session: Arc::new(RwLock::new(None)),
            pkce_verifier: Arc::new(Mutex::new(None)),
            refresh_lock: Arc::new(AsyncMutex::new(())),
            realtime: RealtimeClient::from_config(config)?,
        })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn get_headers(&self, access_token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.anon_key) {
            headers.insert("apikey", value);
        }
        let bearer = access_token.unwrap_or(&self.anon_key);
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", bearer)) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    /// Access token of the live session, refreshing it first if needed.
    async fn bearer_token(&self) -> Result<String> {
        match self.current_session().await? {
            Some(session) => Ok(session.access_token),
            None => Err(AppError::unauthorized("No active session")),
        }
    }

    async fn check(response: Response, context: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        error!("{} failed with {}: {}", context, status, body);
        Err(AppError::backend(status.as_u16(), format!("{} failed: {}", context, body)))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        debug!("Refreshing expired session");
        let response = self
            .http_client
            .post(self.auth_url("token"))
            .query(&[("grant_type", "refresh_token")])
            .headers(self.get_headers(None))
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        let token: TokenResponse = Self::check(response, "Session refresh").await?.json().await?;
        let session = Session::from(token);
        *self.session.write() = Some(session.clone());
        Ok(session)
    }
}

#[async_trait]
impl RemoteStore for HostedStore {
    async fn current_session(&self) -> Result<Option<Session>> {
        let stored = self.session.read().clone();
        match stored {
            Some(session) if !session.is_expired() => return Ok(Some(session)),
            Some(_) => {}
            None => return Ok(None),
        }

        let _refreshing = self.refresh_lock.lock().await;
        // another caller may have refreshed or dropped it while we waited
        let stored = self.session.read().clone();
        let session = match stored {
            Some(session) if !session.is_expired() => return Ok(Some(session)),
            Some(session) => session,
            None => return Ok(None),
        };

        let refreshed = match session.refresh_token.as_deref() {
            Some(refresh_token) => self.refresh(refresh_token).await,
            None => Err(AppError::unauthorized("Session expired")),
        };
        match refreshed {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!("Dropping expired session for user {}: {}", session.user.id, e);
                let mut stored = self.session.write();
                if (*stored).as_ref().map_or(false, |s| s.access_token == session.access_token) {
                    *stored = None;
                }
                Ok(None)
            }
        }
    }

    async fn sign_in_with_oauth(&self, provider: OAuthProvider, options: OAuthOptions) -> Result<String> {
        let pkce = PkceChallenge::generate();

        let mut url = Url::parse(&self.auth_url("authorize"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("provider", provider.as_str());
            if let Some(redirect_to) = options.redirect_to.as_deref() {
                query.append_pair("redirect_to", redirect_to);
            }
            query
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", "s256");
            if options.force_account_chooser {
                query.append_pair("prompt", "select_account");
            }
        }

        *self.pkce_verifier.lock() = Some(pkce.verifier);
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> Result<Session> {
        if code.is_empty() {
            return Err(AppError::unauthorized("Missing authorization code"));
        }
        let verifier = self
            .pkce_verifier
            .lock()
            .take()
            .ok_or_else(|| AppError::unauthorized("No sign-in in progress"))?;

        let response = self
            .http_client
            .post(self.auth_url("token"))
            .query(&[("grant_type", "pkce")])
            .headers(self.get_headers(None))
            .json(&json!({ "auth_code": code, "code_verifier": verifier }))
            .send()
            .await?;

        let response = Self::check(response, "Code exchange")
            .await
            .map_err(|e| AppError::unauthorized(&e.to_string()))?;
        let token: TokenResponse = response.json().await?;
        let session = Session::from(token);

        info!("Signed in user: {}", session.user.id);
        *self.session.write() = Some(session.clone());
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        let session = {
            let _refreshing = self.refresh_lock.lock().await;
            self.session.write().take()
        };
        let session = match session {
            Some(session) => session,
            None => return Ok(()),
        };

        let response = self
            .http_client
            .post(self.auth_url("logout"))
            .headers(self.get_headers(Some(&session.access_token)))
            .send()
            .await?;
        Self::check(response, "Sign-out").await?;

        info!("Signed out user: {}", session.user.id);
        Ok(())
    }

    async fn select(&self, query: &SelectQuery) -> Result<Vec<Bookmark>> {
        let token = self.bearer_token().await?;
        let direction = if query.ascending { "asc" } else { "desc" };

        let response = self
            .http_client
            .get(self.rest_url(&query.table))
            .headers(self.get_headers(Some(&token)))
            .query(&[
                ("select", "*".to_string()),
                ("user_id", format!("eq.{}", query.owner_id)),
                ("order", format!("{}.{}", query.order_by, direction)),
            ])
            .send()
            .await?;

        let rows: Vec<Bookmark> = Self::check(response, "Select").await?.json().await?;
        debug!("Selected {} rows from {}", rows.len(), query.table);
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: &NewBookmark) -> Result<()> {
        let token = self.bearer_token().await?;

        let response = self
            .http_client
            .post(self.rest_url(table))
            .headers(self.get_headers(Some(&token)))
            .header("Prefer", "return=minimal")
            .json(&[row])
            .send()
            .await?;

        Self::check(response, "Insert").await?;
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let token = self.bearer_token().await?;

        let response = self
            .http_client
            .delete(self.rest_url(table))
            .headers(self.get_headers(Some(&token)))
            .query(&[("id", format!("eq.{}", id))])
            .send()
            .await?;

        Self::check(response, "Delete").await?;
        Ok(())
    }

    async fn subscribe(&self, table: &str, kinds: &[ChangeKind]) -> Result<ChangeSubscription> {
        Ok(self.realtime.subscribe(table, kinds, Arc::new(self.clone())).await)
    }
}

#[async_trait]
impl TokenSource for HostedStore {
    async fn access_token(&self) -> Option<String> {
        match self.current_session().await {
            Ok(session) => session.map(|s| s.access_token),
            Err(e) => {
                warn!("No token for realtime join: {}", e);
                None
            }
        }
    }
}
