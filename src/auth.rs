//! Per-backend credential lifecycle
//!
//! An [`AuthManager`] owns one backend's credential: it answers validity
//! questions from its cache, renews silently through the backend's
//! [`Authenticator`], and falls back to interactive authorization when asked.
//! Every renewal commits to the store first and the cache second, so a
//! failed renewal leaves both untouched.

use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backends::{ApiError, BackendId};
use crate::config::ConnectionConfig;
use crate::credential_store::{Credential, CredentialStore, StoreError};
use crate::oauth::OAuthError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("OAuth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Credential rejected: {0}")]
    Rejected(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("No refresh token available")]
    NoRefreshToken,
    #[error("{0} credentials are not configured")]
    NotConfigured(BackendId),
    #[error("{0} does not support interactive sign-in")]
    InteractiveUnsupported(BackendId),
    #[error("Authorization cancelled")]
    Cancelled,
    #[error("Authorization timed out after {0}s")]
    TimedOut(u64),
    #[error("Token endpoint did not answer in time")]
    NetworkTimeout,
}

impl AuthError {
    /// Failures that may succeed on a later attempt without user action
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            AuthError::OAuth(e) => e.is_transient(),
            AuthError::Api(_) | AuthError::NetworkTimeout => true,
            _ => false,
        }
    }

    /// Classify onto the backend call taxonomy
    pub fn kind(&self) -> ApiError {
        match self {
            AuthError::Cancelled => ApiError::UserCancelled,
            e if e.is_transient() => ApiError::Transient(e.to_string()),
            AuthError::Store(e) => ApiError::Data(e.to_string()),
            e => ApiError::Auth(e.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        e.kind()
    }
}

/// Grant mechanics for one backend
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn backend(&self) -> BackendId;

    /// Produce a fresh credential without user involvement.
    ///
    /// `current` is the cached credential, if any; refresh-token grants
    /// read their refresh token from it.
    async fn refresh(&self, current: Option<&Credential>) -> Result<Credential, AuthError>;

    /// Interactive sign-in (browser or similar)
    async fn authorize(&self) -> Result<Credential, AuthError>;

    fn supports_interactive(&self) -> bool {
        true
    }
}

/// Backends authenticated by long-lived keys taken from the environment.
///
/// Renewal re-reads the configured key material; there is nothing to sign
/// in to interactively.
pub struct StaticKeyAuthenticator {
    backend: BackendId,
    key: Option<String>,
    endpoint: Option<String>,
}

impl StaticKeyAuthenticator {
    /// `key` is the full secret the backend expects (`key:secret` for Basic
    /// auth backends, the user token for QuickBase).
    pub fn new(backend: BackendId, key: Option<String>, endpoint: Option<String>) -> Self {
        Self {
            backend,
            key,
            endpoint,
        }
    }
}

#[async_trait]
impl Authenticator for StaticKeyAuthenticator {
    fn backend(&self) -> BackendId {
        self.backend
    }

    async fn refresh(&self, _current: Option<&Credential>) -> Result<Credential, AuthError> {
        let key = self
            .key
            .as_deref()
            .ok_or(AuthError::NotConfigured(self.backend))?;
        let credential = Credential::new(self.backend, key);
        Ok(match &self.endpoint {
            Some(endpoint) => credential.with_instance_url(endpoint.clone()),
            None => credential,
        })
    }

    async fn authorize(&self) -> Result<Credential, AuthError> {
        Err(AuthError::InteractiveUnsupported(self.backend))
    }

    fn supports_interactive(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AuthSettings {
    /// Credentials expiring within this window count as expired
    pub refresh_buffer: Duration,
    /// Upper bound on one silent renewal
    pub network_timeout: Duration,
    /// Upper bound on one interactive sign-in
    pub reauthorize_timeout: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(300),
            network_timeout: Duration::from_secs(60),
            reauthorize_timeout: Duration::from_secs(120),
        }
    }
}

impl AuthSettings {
    pub fn from_config(connection: &ConnectionConfig, network_timeout: Duration) -> Self {
        Self {
            refresh_buffer: connection.refresh_buffer(),
            network_timeout,
            reauthorize_timeout: connection.reauthorize_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NoCredential,
    Valid,
    Expired,
    /// An interactive sign-in was cancelled or timed out
    Unavailable,
}

#[derive(Default)]
struct CacheEntry {
    credential: Option<Credential>,
    /// A server refused the cached credential
    rejected: bool,
    /// Silent renewal was refused; only interactive sign-in can recover
    needs_reauthorization: bool,
    unavailable: bool,
}

/// Owns the credential lifecycle of one backend
pub struct AuthManager {
    backend: BackendId,
    authenticator: Arc<dyn Authenticator>,
    store: Arc<CredentialStore>,
    settings: AuthSettings,
    cache: RwLock<CacheEntry>,
    /// Serializes refresh and reauthorize
    renewal: Mutex<()>,
}

impl AuthManager {
    /// Create a manager and prime its cache from the store
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        store: Arc<CredentialStore>,
        settings: AuthSettings,
    ) -> Self {
        let backend = authenticator.backend();
        let credential = match store.load(backend) {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!("Could not load stored {} credential: {}", backend, e);
                None
            }
        };

        if let Some(credential) = &credential {
            tracing::debug!(
                "Loaded {} credential {} from store",
                backend,
                credential.fingerprint()
            );
        }

        Self {
            backend,
            authenticator,
            store,
            settings,
            cache: RwLock::new(CacheEntry {
                credential,
                ..CacheEntry::default()
            }),
            renewal: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    pub fn supports_interactive(&self) -> bool {
        self.authenticator.supports_interactive()
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, CacheEntry> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, CacheEntry> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached, not rejected and not about to expire. Never touches the network.
    pub fn is_valid(&self) -> bool {
        let cache = self.read_cache();
        match &cache.credential {
            Some(credential) => {
                !cache.rejected
                    && !cache.needs_reauthorization
                    && !credential.is_expired(self.settings.refresh_buffer)
            }
            None => false,
        }
    }

    pub fn state(&self) -> AuthState {
        let cache = self.read_cache();
        if cache.unavailable {
            return AuthState::Unavailable;
        }
        match &cache.credential {
            None => AuthState::NoCredential,
            Some(_) if cache.needs_reauthorization => AuthState::NoCredential,
            Some(credential) if cache.rejected || credential.is_expired(self.settings.refresh_buffer) => {
                AuthState::Expired
            }
            Some(_) => AuthState::Valid,
        }
    }

    pub fn credential(&self) -> Option<Credential> {
        self.read_cache().credential.clone()
    }

    /// Record that a server refused the cached credential
    pub fn invalidate(&self) {
        let mut cache = self.write_cache();
        if let Some(credential) = &cache.credential {
            tracing::info!(
                "{} credential {} rejected by server",
                self.backend,
                credential.fingerprint()
            );
        }
        cache.rejected = true;
    }

    pub async fn refresh(&self) -> bool {
        self.try_refresh().await.is_ok()
    }

    /// Silent renewal. Either the new credential is committed or nothing changes.
    pub async fn try_refresh(&self) -> Result<(), AuthError> {
        let seen = self.credential();
        let _guard = self.renewal.lock().await;
        let current = self.credential();
        if current != seen && self.is_valid() {
            tracing::debug!("{} was renewed while waiting, skipping refresh", self.backend);
            return Ok(());
        }

        tracing::debug!("Refreshing {} credential", self.backend);
        let outcome = match tokio::time::timeout(
            self.settings.network_timeout,
            self.authenticator.refresh(current.as_ref()),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(AuthError::NetworkTimeout),
        };

        match outcome {
            Ok(credential) => self.commit(credential),
            Err(e) => {
                if !e.is_transient() {
                    self.write_cache().needs_reauthorization = true;
                }
                tracing::warn!("{} refresh failed: {}", self.backend, e);
                Err(e)
            }
        }
    }

    pub async fn reauthorize(&self, cancel: &CancellationToken) -> bool {
        self.try_reauthorize(cancel).await.is_ok()
    }

    /// Interactive sign-in, raced against `cancel` and the sign-in timeout
    pub async fn try_reauthorize(&self, cancel: &CancellationToken) -> Result<(), AuthError> {
        if !self.authenticator.supports_interactive() {
            return Err(AuthError::InteractiveUnsupported(self.backend));
        }

        let _guard = self.renewal.lock().await;
        let started_valid = self.is_valid();
        let timeout = self.settings.reauthorize_timeout;

        tracing::info!("Starting interactive sign-in for {}", self.backend);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuthError::Cancelled),
            result = tokio::time::timeout(timeout, self.authenticator.authorize()) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(AuthError::TimedOut(timeout.as_secs())),
            },
        };

        match outcome {
            Ok(credential) => self.commit(credential),
            Err(e) => {
                if matches!(e, AuthError::Cancelled | AuthError::TimedOut(_)) && !started_valid {
                    self.write_cache().unavailable = true;
                }
                tracing::warn!("{} sign-in did not complete: {}", self.backend, e);
                Err(e)
            }
        }
    }

    /// Logout: forget the credential in the store and the cache
    pub async fn clear(&self) -> Result<(), AuthError> {
        let _guard = self.renewal.lock().await;
        self.store.delete(self.backend)?;
        *self.write_cache() = CacheEntry::default();
        tracing::info!("Cleared {} credential", self.backend);
        Ok(())
    }

    fn commit(&self, credential: Credential) -> Result<(), AuthError> {
        self.store.save(&credential)?;

        tracing::info!(
            "Committed {} credential {} (expires in {})",
            self.backend,
            credential.fingerprint(),
            credential
                .seconds_remaining()
                .map(|s| format!("{}s", s))
                .unwrap_or_else(|| "never".to_string())
        );

        *self.write_cache() = CacheEntry {
            credential: Some(credential),
            ..CacheEntry::default()
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_store::{unix_now, MemoryStore};
    use crate::test_support::{BrokenStore, FakeAuthenticator, FakeMode};

    fn settings() -> AuthSettings {
        AuthSettings {
            refresh_buffer: Duration::from_secs(300),
            network_timeout: Duration::from_secs(5),
            reauthorize_timeout: Duration::from_millis(200),
        }
    }

    fn store_with(credential: Option<Credential>) -> Arc<CredentialStore> {
        let store = CredentialStore::new(MemoryStore::new());
        if let Some(credential) = credential {
            store.save(&credential).unwrap();
        }
        Arc::new(store)
    }

    fn live_credential() -> Credential {
        Credential::new(BackendId::Salesforce, "live")
            .with_refresh_token("rt")
            .with_expires_at(unix_now() + 3600)
    }

    fn expired_credential() -> Credential {
        Credential::new(BackendId::Salesforce, "stale")
            .with_refresh_token("rt")
            .with_expires_at(unix_now() - 1)
    }

    #[test]
    fn test_is_valid_uses_cache_only() {
        let fake = Arc::new(FakeAuthenticator::new(BackendId::Salesforce));
        let manager = AuthManager::new(fake.clone(), store_with(Some(live_credential())), settings());

        assert!(manager.is_valid());
        assert_eq!(manager.state(), AuthState::Valid);
        assert_eq!(fake.refresh_calls(), 0);
        assert_eq!(fake.authorize_calls(), 0);
    }

    #[test]
    fn test_credential_inside_buffer_is_not_valid() {
        let fake = Arc::new(FakeAuthenticator::new(BackendId::Salesforce));
        let soon = live_credential().with_expires_at(unix_now() + 60);
        let manager = AuthManager::new(fake, store_with(Some(soon)), settings());

        assert!(!manager.is_valid());
        assert_eq!(manager.state(), AuthState::Expired);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_grant() {
        let fake = Arc::new(
            FakeAuthenticator::new(BackendId::Salesforce).refresh_delay(Duration::from_millis(50)),
        );
        let manager = AuthManager::new(fake.clone(), store_with(Some(expired_credential())), settings());

        let (first, second) = tokio::join!(manager.try_refresh(), manager.try_refresh());
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(fake.refresh_calls(), 1);
        assert!(manager.is_valid());
    }

    #[tokio::test]
    async fn test_refresh_commits_to_store_and_cache() {
        let fake = Arc::new(FakeAuthenticator::new(BackendId::Salesforce));
        let store = store_with(Some(expired_credential()));
        let manager = AuthManager::new(fake.clone(), store.clone(), settings());

        assert!(manager.refresh().await);
        assert!(manager.is_valid());
        assert_eq!(fake.refresh_calls(), 1);
        assert_eq!(fake.authorize_calls(), 0);

        let stored = store.load(BackendId::Salesforce).unwrap().unwrap();
        assert_eq!(Some(stored), manager.credential());
    }

    #[tokio::test]
    async fn test_failed_refresh_changes_nothing() {
        let fake = Arc::new(FakeAuthenticator::new(BackendId::Salesforce).refresh_mode(FakeMode::Reject));
        let original = expired_credential();
        let store = store_with(Some(original.clone()));
        let manager = AuthManager::new(fake, store.clone(), settings());

        assert!(!manager.refresh().await);
        assert_eq!(manager.credential(), Some(original.clone()));
        assert_eq!(store.load(BackendId::Salesforce).unwrap(), Some(original));
        assert_eq!(manager.state(), AuthState::NoCredential);
    }

    #[tokio::test]
    async fn test_transient_refresh_failure_keeps_expired_state() {
        let fake =
            Arc::new(FakeAuthenticator::new(BackendId::Salesforce).refresh_mode(FakeMode::Transient));
        let manager = AuthManager::new(fake, store_with(Some(expired_credential())), settings());

        let err = manager.try_refresh().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(manager.state(), AuthState::Expired);
    }

    #[tokio::test]
    async fn test_store_failure_leaves_cache_untouched() {
        let fake = Arc::new(FakeAuthenticator::new(BackendId::Salesforce));
        let manager = AuthManager::new(fake, Arc::new(CredentialStore::new(BrokenStore)), settings());

        assert!(matches!(manager.try_refresh().await, Err(AuthError::Store(_))));
        assert!(manager.credential().is_none());
        assert!(!manager.is_valid());
    }

    #[tokio::test]
    async fn test_invalidate_until_next_commit() {
        let fake = Arc::new(FakeAuthenticator::new(BackendId::Salesforce));
        let manager = AuthManager::new(fake, store_with(Some(live_credential())), settings());

        manager.invalidate();
        assert!(!manager.is_valid());
        assert_eq!(manager.state(), AuthState::Expired);

        assert!(manager.refresh().await);
        assert!(manager.is_valid());
    }

    #[tokio::test]
    async fn test_reauthorize_cancelled_commits_nothing() {
        let fake = Arc::new(FakeAuthenticator::new(BackendId::Salesforce).authorize_mode(FakeMode::Hang));
        let store = store_with(None);
        let manager = AuthManager::new(fake.clone(), store.clone(), settings());

        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            manager.try_reauthorize(&cancel).await,
            Err(AuthError::Cancelled)
        ));
        assert!(manager.credential().is_none());
        assert!(store.load(BackendId::Salesforce).unwrap().is_none());
        assert_eq!(manager.state(), AuthState::Unavailable);
    }

    #[tokio::test]
    async fn test_reauthorize_times_out() {
        let fake = Arc::new(FakeAuthenticator::new(BackendId::Salesforce).authorize_mode(FakeMode::Hang));
        let manager = AuthManager::new(fake, store_with(None), settings());

        let result = manager.try_reauthorize(&CancellationToken::new()).await;
        assert!(matches!(result, Err(AuthError::TimedOut(_))));
        assert_eq!(manager.state(), AuthState::Unavailable);
    }

    #[tokio::test]
    async fn test_reauthorize_recovers_from_unavailable() {
        let fake = Arc::new(FakeAuthenticator::new(BackendId::Salesforce).authorize_mode(FakeMode::Hang));
        let manager = AuthManager::new(fake.clone(), store_with(None), settings());

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(!manager.reauthorize(&cancelled).await);

        fake.set_authorize_mode(FakeMode::Succeed);
        assert!(manager.reauthorize(&CancellationToken::new()).await);
        assert_eq!(manager.state(), AuthState::Valid);
    }

    #[tokio::test]
    async fn test_clear_removes_credential_everywhere() {
        let fake = Arc::new(FakeAuthenticator::new(BackendId::Salesforce));
        let store = store_with(Some(live_credential()));
        let manager = AuthManager::new(fake, store.clone(), settings());

        manager.clear().await.unwrap();
        assert_eq!(manager.state(), AuthState::NoCredential);
        assert!(store.load(BackendId::Salesforce).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_static_keys_refresh_without_network() {
        let authenticator = Arc::new(StaticKeyAuthenticator::new(
            BackendId::WooCommerce,
            Some("ck_123:cs_456".to_string()),
            Some("https://shop.example.com".to_string()),
        ));
        let manager = AuthManager::new(authenticator, store_with(None), settings());

        assert!(!manager.supports_interactive());
        assert!(manager.refresh().await);

        let credential = manager.credential().unwrap();
        assert_eq!(credential.access_token, "ck_123:cs_456");
        assert_eq!(credential.instance_url.as_deref(), Some("https://shop.example.com"));
        assert_eq!(credential.expires_at, None);

        assert!(matches!(
            manager.try_reauthorize(&CancellationToken::new()).await,
            Err(AuthError::InteractiveUnsupported(BackendId::WooCommerce))
        ));
    }

    #[tokio::test]
    async fn test_missing_static_keys_report_not_configured() {
        let authenticator = Arc::new(StaticKeyAuthenticator::new(BackendId::Avalara, None, None));
        let manager = AuthManager::new(authenticator, store_with(None), settings());

        assert!(matches!(
            manager.try_refresh().await,
            Err(AuthError::NotConfigured(BackendId::Avalara))
        ));
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(AuthError::Cancelled.kind(), ApiError::UserCancelled);
        assert!(AuthError::NetworkTimeout.kind().is_transient());
        assert!(AuthError::Rejected("invalid_grant".into()).kind().is_auth());
        assert!(AuthError::NoRefreshToken.kind().is_auth());
    }
}
