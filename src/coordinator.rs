//! Connection bring-up and data routing across all registered backends.
//!
//! Every backend gets exactly one [`AuthManager`] and one [`BackendClient`].
//! Bring-up runs for all backends concurrently; each backend's work runs
//! under its own cancellation token so cancelling one never disturbs the
//! others. Connection state is only ever written through `set_state`.

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthError, AuthManager};
use crate::backends::http::RetryPolicy;
use crate::backends::{ApiError, BackendClient, BackendId, DataSourceDescriptor, Filter, Table};
use crate::config::ConnectionConfig;
use crate::credential_store::{unix_now, Credential};

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("{0} is registered twice")]
    DuplicateBackend(BackendId),
    #[error("Auth manager for {auth} cannot be paired with a {client} client")]
    BackendMismatch { auth: BackendId, client: BackendId },
    #[error("{0} is not configured")]
    NotRegistered(BackendId),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    AuthRequired,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::AuthRequired => "sign-in required",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Snapshot of one backend's connection, as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub backend: BackendId,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    /// When the session was last confirmed against the server (unix seconds)
    pub last_checked_at: Option<u64>,
}

impl ConnectionState {
    fn new(backend: BackendId) -> Self {
        Self {
            backend,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            last_checked_at: None,
        }
    }
}

/// Step of a bring-up, reported through [`ProgressEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Connecting,
    Confirming,
    Refreshing,
    AuthRequired,
    Authorizing,
    LoadingSources,
    Connected,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub backend: BackendId,
    pub phase: Phase,
    pub message: String,
    pub at: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    /// Re-confirm a connected backend once its last check is this old
    pub stale_after: Duration,
    pub retry: RetryPolicy,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(connection: &ConnectionConfig) -> Self {
        Self {
            stale_after: connection.stale_after(),
            retry: RetryPolicy {
                max_retries: connection.max_retries,
                base_delay: connection.retry_base_delay(),
            },
        }
    }
}

/// How far a bring-up may go to obtain a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Renewal {
    SilentOnly,
    AllowInteractive,
    /// Skip the saved session and sign in again
    ForceInteractive,
}

/// Why a bring-up stopped short of Connected
#[derive(Debug)]
enum Halt {
    AuthRequired(String),
    Failed(ApiError),
    Cancelled,
}

struct Backend {
    auth: Arc<AuthManager>,
    client: Arc<dyn BackendClient>,
    cancel: Mutex<CancellationToken>,
    sources: RwLock<Option<Vec<DataSourceDescriptor>>>,
    /// The last data call was refused and no renewal has been confirmed since
    auth_error_pending: AtomicBool,
}

impl Backend {
    fn id(&self) -> BackendId {
        self.auth.backend()
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cached_sources(&self) -> Option<Vec<DataSourceDescriptor>> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_sources(&self, sources: Option<Vec<DataSourceDescriptor>>) {
        *self.sources.write().unwrap_or_else(PoisonError::into_inner) = sources;
    }

    /// Map a failed call onto how the bring-up ends
    fn halt(&self, error: ApiError) -> Halt {
        match error {
            ApiError::Auth(msg) => {
                self.auth.invalidate();
                Halt::AuthRequired(msg)
            }
            ApiError::UserCancelled => Halt::Cancelled,
            other => Halt::Failed(other),
        }
    }
}

pub struct CoordinatorBuilder {
    settings: CoordinatorSettings,
    root: CancellationToken,
    backends: BTreeMap<BackendId, Backend>,
}

impl CoordinatorBuilder {
    /// Add a backend. Each backend may be registered once, with an auth
    /// manager and client for the same backend.
    pub fn register(
        mut self,
        auth: Arc<AuthManager>,
        client: Arc<dyn BackendClient>,
    ) -> Result<Self, CoordinatorError> {
        let backend = auth.backend();
        if client.backend() != backend {
            return Err(CoordinatorError::BackendMismatch {
                auth: backend,
                client: client.backend(),
            });
        }
        if self.backends.contains_key(&backend) {
            return Err(CoordinatorError::DuplicateBackend(backend));
        }

        self.backends.insert(
            backend,
            Backend {
                auth,
                client,
                cancel: Mutex::new(self.root.child_token()),
                sources: RwLock::new(None),
                auth_error_pending: AtomicBool::new(false),
            },
        );
        Ok(self)
    }

    pub fn build(self) -> ConnectionCoordinator {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let states = self
            .backends
            .keys()
            .map(|backend| (*backend, ConnectionState::new(*backend)))
            .collect();

        ConnectionCoordinator {
            backends: self.backends,
            settings: self.settings,
            states: Mutex::new(states),
            events,
            root: self.root,
        }
    }
}

pub struct ConnectionCoordinator {
    backends: BTreeMap<BackendId, Backend>,
    settings: CoordinatorSettings,
    states: Mutex<BTreeMap<BackendId, ConnectionState>>,
    events: broadcast::Sender<ProgressEvent>,
    root: CancellationToken,
}

impl ConnectionCoordinator {
    pub fn builder(settings: CoordinatorSettings) -> CoordinatorBuilder {
        CoordinatorBuilder {
            settings,
            root: CancellationToken::new(),
            backends: BTreeMap::new(),
        }
    }

    /// Registered backends in a stable order
    pub fn backends(&self) -> impl Iterator<Item = BackendId> + '_ {
        self.backends.keys().copied()
    }

    pub fn auth(&self, backend: BackendId) -> Option<Arc<AuthManager>> {
        self.backends.get(&backend).map(|entry| entry.auth.clone())
    }

    fn entry(&self, backend: BackendId) -> Result<&Backend, CoordinatorError> {
        self.backends
            .get(&backend)
            .ok_or(CoordinatorError::NotRegistered(backend))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn state(&self, backend: BackendId) -> Option<ConnectionState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&backend)
            .cloned()
    }

    fn set_state<F>(&self, backend: BackendId, update: F) -> ConnectionState
    where
        F: FnOnce(&mut ConnectionState),
    {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(backend)
            .or_insert_with(|| ConnectionState::new(backend));
        let before = state.status;
        update(state);

        if state.status != before {
            match &state.last_error {
                Some(error) => tracing::info!("{}: {} -> {} ({})", backend, before, state.status, error),
                None => tracing::info!("{}: {} -> {}", backend, before, state.status),
            }
        }
        state.clone()
    }

    fn emit(&self, backend: BackendId, phase: Phase, message: impl Into<String>) {
        let event = ProgressEvent {
            backend,
            phase,
            message: message.into(),
            at: unix_now(),
        };
        tracing::debug!("{} {:?}: {}", backend, phase, event.message);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Bring every registered backend up concurrently. Always completes;
    /// inspect the returned states for per-backend outcomes.
    pub async fn connect_all(&self, interactive: bool) -> Vec<ConnectionState> {
        let renewal = if interactive {
            Renewal::AllowInteractive
        } else {
            Renewal::SilentOnly
        };
        join_all(self.backends.values().map(|entry| self.bring_up(entry, renewal))).await
    }

    pub async fn connect(
        &self,
        backend: BackendId,
        interactive: bool,
    ) -> Result<ConnectionState, CoordinatorError> {
        let entry = self.entry(backend)?;
        let renewal = if interactive {
            Renewal::AllowInteractive
        } else {
            Renewal::SilentOnly
        };
        Ok(self.bring_up(entry, renewal).await)
    }

    /// Interactive sign-in regardless of the saved session
    pub async fn reauthorize(&self, backend: BackendId) -> Result<ConnectionState, CoordinatorError> {
        let entry = self.entry(backend)?;
        Ok(self.bring_up(entry, Renewal::ForceInteractive).await)
    }

    /// Abort whatever `backend` is doing (typically a browser sign-in).
    /// Later operations on the backend get a fresh token.
    pub fn cancel(&self, backend: BackendId) -> Result<(), CoordinatorError> {
        let entry = self.entry(backend)?;
        let mut token = entry.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = self.root.child_token();
        tracing::info!("Cancelled pending work for {}", backend);
        Ok(())
    }

    /// Cancel all in-flight work. Later bring-ups end as cancelled.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down connections");
        self.root.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Log out: forget the stored credential and cached sources
    pub async fn disconnect(&self, backend: BackendId) -> Result<(), CoordinatorError> {
        let entry = self.entry(backend)?;
        self.cancel(backend)?;
        entry.auth.clear().await?;
        entry.set_sources(None);
        entry.auth_error_pending.store(false, Ordering::SeqCst);
        self.set_state(backend, |state| *state = ConnectionState::new(backend));
        Ok(())
    }

    /// Data sources of a backend; listed once and served from cache after
    pub async fn list_data_sources(
        &self,
        backend: BackendId,
    ) -> Result<Vec<DataSourceDescriptor>, CoordinatorError> {
        let entry = self.entry(backend)?;
        if let Some(sources) = entry.cached_sources() {
            return Ok(sources);
        }

        let client = &entry.client;
        let sources = self
            .call(entry, "list data sources", move |credential| async move {
                client.list_data_sources(&credential).await
            })
            .await?;
        entry.set_sources(Some(sources.clone()));
        Ok(sources)
    }

    pub async fn fetch_data(
        &self,
        source: &DataSourceDescriptor,
        filters: &[Filter],
    ) -> Result<Table, CoordinatorError> {
        let entry = self.entry(source.backend)?;
        let client = &entry.client;
        let table = self
            .call(entry, "fetch data", move |credential| async move {
                client.fetch_data(&credential, source, filters).await
            })
            .await?;

        tracing::info!(
            "Fetched {} rows from {} source {}",
            table.len(),
            source.backend,
            source.id
        );
        Ok(table)
    }

    /// Re-check sessions that are due: connected ones whose last check is
    /// older than the staleness threshold, and any whose last data call was
    /// refused. Only silent renewal is attempted. Returns the backends checked.
    pub async fn refresh_if_stale(&self) -> Vec<BackendId> {
        let now = unix_now();
        let stale_after = self.settings.stale_after.as_secs();

        let due: Vec<&Backend> = self
            .backends
            .values()
            .filter(|entry| {
                let pending = entry.auth_error_pending.load(Ordering::SeqCst);
                let stale = self.state(entry.id()).is_some_and(|state| {
                    state.status == ConnectionStatus::Connected
                        && state
                            .last_checked_at
                            .map_or(true, |at| now.saturating_sub(at) >= stale_after)
                });
                pending || stale
            })
            .collect();

        if due.is_empty() {
            tracing::debug!("No sessions due for a check");
            return Vec::new();
        }

        join_all(due.into_iter().map(|entry| async move {
            self.revalidate(entry).await;
            entry.id()
        }))
        .await
    }

    async fn bring_up(&self, entry: &Backend, renewal: Renewal) -> ConnectionState {
        let backend = entry.id();
        let cancel = entry.current_token();

        self.set_state(backend, |state| {
            state.status = ConnectionStatus::Connecting;
            state.last_error = None;
        });
        self.emit(
            backend,
            Phase::Connecting,
            format!("Connecting to {}", backend.display_name()),
        );

        // The bring-up is polled first so a sign-in in progress sees the
        // cancellation itself and records it.
        let outcome = tokio::select! {
            biased;
            outcome = self.establish(entry, renewal, &cancel) => outcome,
            _ = cancel.cancelled() => Err(Halt::Cancelled),
        };
        self.settle(entry, outcome)
    }

    async fn establish(
        &self,
        entry: &Backend,
        renewal: Renewal,
        cancel: &CancellationToken,
    ) -> Result<String, Halt> {
        self.authenticate(entry, renewal, cancel).await?;

        self.emit(entry.id(), Phase::LoadingSources, "Loading data sources");
        let credential = current_credential(entry).map_err(|e| entry.halt(e))?;
        let sources = self
            .settings
            .retry
            .run("list data sources", || entry.client.list_data_sources(&credential))
            .await
            .map_err(|e| entry.halt(e))?;

        let message = format!("Connected with {} data sources", sources.len());
        entry.set_sources(Some(sources));
        Ok(message)
    }

    async fn revalidate(&self, entry: &Backend) {
        let cancel = entry.current_token();
        let outcome = tokio::select! {
            biased;
            outcome = self.authenticate(entry, Renewal::SilentOnly, &cancel) => {
                outcome.map(|()| "Session confirmed".to_string())
            }
            _ = cancel.cancelled() => Err(Halt::Cancelled),
        };
        self.settle(entry, outcome);
    }

    /// Steps up to a confirmed session: check the cache, confirm, renew
    /// silently, then sign in interactively if allowed.
    async fn authenticate(
        &self,
        entry: &Backend,
        renewal: Renewal,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        let backend = entry.id();

        if renewal != Renewal::ForceInteractive {
            if entry.auth.is_valid() {
                self.emit(backend, Phase::Confirming, "Confirming saved session");
                match self.confirm(entry).await {
                    Ok(()) => return Ok(()),
                    Err(ApiError::Auth(msg)) => {
                        tracing::info!("{} refused the saved session: {}", backend, msg);
                        entry.auth.invalidate();
                    }
                    Err(e) => return Err(entry.halt(e)),
                }
            }

            self.emit(backend, Phase::Refreshing, "Renewing session");
            match entry.auth.try_refresh().await {
                Ok(()) => {
                    self.emit(backend, Phase::Confirming, "Confirming renewed session");
                    return self.confirm(entry).await.map_err(|e| entry.halt(e));
                }
                Err(e) if e.is_transient() => return Err(Halt::Failed(e.kind())),
                Err(e) => tracing::debug!("{} cannot renew silently: {}", backend, e),
            }
        }

        if renewal == Renewal::SilentOnly || !entry.auth.supports_interactive() {
            return Err(Halt::AuthRequired(format!(
                "{} needs to be signed in",
                backend.display_name()
            )));
        }

        self.emit(backend, Phase::Authorizing, "Waiting for sign-in in the browser");
        match entry.auth.try_reauthorize(cancel).await {
            Ok(()) => {}
            Err(AuthError::Cancelled) => return Err(Halt::Cancelled),
            Err(e) => return Err(Halt::AuthRequired(e.to_string())),
        }

        self.emit(backend, Phase::Confirming, "Confirming new session");
        self.confirm(entry).await.map_err(|e| entry.halt(e))
    }

    async fn confirm(&self, entry: &Backend) -> Result<(), ApiError> {
        let credential = current_credential(entry)?;
        self.settings
            .retry
            .run("confirm session", || entry.client.confirm(&credential))
            .await
    }

    /// Record how a bring-up or check ended
    fn settle(&self, entry: &Backend, outcome: Result<String, Halt>) -> ConnectionState {
        let backend = entry.id();
        match outcome {
            Ok(message) => {
                entry.auth_error_pending.store(false, Ordering::SeqCst);
                let state = self.set_state(backend, |state| {
                    state.status = ConnectionStatus::Connected;
                    state.last_error = None;
                    state.last_checked_at = Some(unix_now());
                });
                self.emit(backend, Phase::Connected, message);
                state
            }
            Err(Halt::AuthRequired(reason)) => {
                // Only a new sign-in or a new rejection makes this backend due again
                entry.auth_error_pending.store(false, Ordering::SeqCst);
                let state = self.set_state(backend, |state| {
                    state.status = ConnectionStatus::AuthRequired;
                    state.last_error = Some(reason.clone());
                });
                self.emit(backend, Phase::AuthRequired, format!("Sign-in required: {}", reason));
                state
            }
            Err(Halt::Failed(error)) => {
                tracing::error!("{} connection failed: {}", backend, error);
                let state = self.set_state(backend, |state| {
                    state.status = ConnectionStatus::Failed;
                    state.last_error = Some(error.to_string());
                });
                self.emit(backend, Phase::Failed, error.to_string());
                state
            }
            Err(Halt::Cancelled) => {
                let state = self.set_state(backend, |state| {
                    state.status = ConnectionStatus::Disconnected;
                    state.last_error = Some(ApiError::UserCancelled.to_string());
                });
                self.emit(backend, Phase::Cancelled, "Cancelled");
                state
            }
        }
    }

    fn require_sign_in(&self, backend: BackendId, reason: &str) {
        self.set_state(backend, |state| {
            state.status = ConnectionStatus::AuthRequired;
            state.last_error = Some(reason.to_string());
        });
        self.emit(backend, Phase::AuthRequired, format!("Sign-in required: {}", reason));
    }

    /// A credential fit for use, renewing silently when the cached one is not
    async fn usable_credential(&self, entry: &Backend) -> Result<Credential, ApiError> {
        if entry.auth.is_valid() {
            return current_credential(entry);
        }

        match entry.auth.try_refresh().await {
            Ok(()) => current_credential(entry),
            Err(e) => {
                let error = e.kind();
                if error.is_auth() {
                    self.require_sign_in(entry.id(), &e.to_string());
                }
                Err(error)
            }
        }
    }

    /// Run a data call. A refused credential is renewed silently and the
    /// call retried once; transient failures back off and retry.
    async fn call<T, F, Fut>(&self, entry: &Backend, label: &str, op: F) -> Result<T, ApiError>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let backend = entry.id();
        let credential = self.usable_credential(entry).await?;

        let reason = match self.settings.retry.run(label, || op(credential.clone())).await {
            Err(ApiError::Auth(reason)) => reason,
            other => {
                if other.is_ok() {
                    entry.auth_error_pending.store(false, Ordering::SeqCst);
                }
                return other;
            }
        };

        tracing::info!("{} refused the session during {}: {}", backend, label, reason);
        entry.auth.invalidate();
        entry.auth_error_pending.store(true, Ordering::SeqCst);

        if !entry.auth.refresh().await {
            self.require_sign_in(backend, &reason);
            return Err(ApiError::Auth(reason));
        }

        let credential = current_credential(entry)?;
        let retried = self.settings.retry.run(label, || op(credential.clone())).await;
        match &retried {
            Ok(_) => entry.auth_error_pending.store(false, Ordering::SeqCst),
            Err(ApiError::Auth(reason)) => {
                entry.auth.invalidate();
                self.require_sign_in(backend, reason);
            }
            Err(_) => {}
        }
        retried
    }
}

fn current_credential(entry: &Backend) -> Result<Credential, ApiError> {
    entry
        .auth
        .credential()
        .ok_or_else(|| ApiError::Auth(format!("No {} credential", entry.id())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthSettings, AuthState, Authenticator};
    use crate::credential_store::{CredentialStore, MemoryStore};
    use crate::test_support::{FakeAuthenticator, FakeClient, FakeMode};

    struct Harness {
        coordinator: Arc<ConnectionCoordinator>,
        store: Arc<CredentialStore>,
        fakes: BTreeMap<BackendId, (Arc<FakeAuthenticator>, Arc<FakeClient>)>,
    }

    impl Harness {
        fn authenticator(&self, backend: BackendId) -> &FakeAuthenticator {
            &self.fakes[&backend].0
        }

        fn client(&self, backend: BackendId) -> &FakeClient {
            &self.fakes[&backend].1
        }

        fn auth(&self, backend: BackendId) -> Arc<AuthManager> {
            self.coordinator.auth(backend).unwrap()
        }
    }

    fn auth_settings() -> AuthSettings {
        AuthSettings {
            refresh_buffer: Duration::from_secs(300),
            network_timeout: Duration::from_secs(5),
            reauthorize_timeout: Duration::from_secs(10),
        }
    }

    fn quick_retry() -> CoordinatorSettings {
        CoordinatorSettings {
            stale_after: Duration::from_secs(300),
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
            },
        }
    }

    fn harness_with(
        settings: CoordinatorSettings,
        setups: Vec<(Option<Credential>, FakeAuthenticator)>,
    ) -> Harness {
        let store = Arc::new(CredentialStore::new(MemoryStore::new()));
        let mut builder = ConnectionCoordinator::builder(settings);
        let mut fakes = BTreeMap::new();

        for (credential, authenticator) in setups {
            if let Some(credential) = credential {
                store.save(&credential).unwrap();
            }
            let backend = authenticator.backend();
            let authenticator = Arc::new(authenticator);
            let client = Arc::new(FakeClient::new(backend));
            let auth = Arc::new(AuthManager::new(authenticator.clone(), store.clone(), auth_settings()));

            builder = builder.register(auth, client.clone()).unwrap();
            fakes.insert(backend, (authenticator, client));
        }

        Harness {
            coordinator: Arc::new(builder.build()),
            store,
            fakes,
        }
    }

    fn harness(setups: Vec<(Option<Credential>, FakeAuthenticator)>) -> Harness {
        harness_with(quick_retry(), setups)
    }

    fn live(backend: BackendId) -> Option<Credential> {
        Some(
            Credential::new(backend, "live")
                .with_refresh_token("rt")
                .with_expires_at(unix_now() + 3600),
        )
    }

    fn expired(backend: BackendId) -> Option<Credential> {
        Some(
            Credential::new(backend, "stale")
                .with_refresh_token("rt")
                .with_expires_at(unix_now() - 1),
        )
    }

    fn source(backend: BackendId) -> DataSourceDescriptor {
        DataSourceDescriptor::new(backend, crate::backends::DataSourceKind::Report, "r1", "Pipeline")
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<ProgressEvent>,
        backend: BackendId,
        phase: Phase,
    ) -> ProgressEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.backend == backend && event.phase == phase {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    fn drain(events: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    const SF: BackendId = BackendId::Salesforce;
    const AVA: BackendId = BackendId::Avalara;

    #[test]
    fn test_registering_a_backend_twice_fails() {
        let store = Arc::new(CredentialStore::new(MemoryStore::new()));
        let manager = |backend: BackendId| {
            Arc::new(AuthManager::new(
                Arc::new(FakeAuthenticator::new(backend)),
                store.clone(),
                auth_settings(),
            ))
        };

        let builder = ConnectionCoordinator::builder(CoordinatorSettings::default())
            .register(manager(SF), Arc::new(FakeClient::new(SF)))
            .unwrap();
        assert!(matches!(
            builder.register(manager(SF), Arc::new(FakeClient::new(SF))),
            Err(CoordinatorError::DuplicateBackend(SF))
        ));

        let mismatched = ConnectionCoordinator::builder(CoordinatorSettings::default())
            .register(manager(SF), Arc::new(FakeClient::new(AVA)));
        assert!(matches!(
            mismatched,
            Err(CoordinatorError::BackendMismatch { auth: SF, client: AVA })
        ));
    }

    #[tokio::test]
    async fn test_all_backends_start_disconnected() {
        let h = harness(vec![
            (None, FakeAuthenticator::new(SF)),
            (None, FakeAuthenticator::new(AVA)),
        ]);

        let states = h.coordinator.states();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.status == ConnectionStatus::Disconnected));
        assert!(matches!(
            h.coordinator.connect(BackendId::QuickBase, false).await,
            Err(CoordinatorError::NotRegistered(BackendId::QuickBase))
        ));
    }

    #[tokio::test]
    async fn test_expired_credential_refreshes_once_and_connects() {
        let h = harness(vec![(expired(SF), FakeAuthenticator::new(SF))]);

        let states = h.coordinator.connect_all(false).await;

        assert_eq!(states[0].status, ConnectionStatus::Connected);
        assert!(states[0].last_checked_at.is_some());
        assert_eq!(h.authenticator(SF).refresh_calls(), 1);
        assert_eq!(h.authenticator(SF).authorize_calls(), 0);
        assert_eq!(h.client(SF).confirm_calls(), 1);
        assert_eq!(h.client(SF).list_calls(), 1);
    }

    #[tokio::test]
    async fn test_valid_credential_is_only_confirmed() {
        let h = harness(vec![(live(SF), FakeAuthenticator::new(SF))]);

        let state = h.coordinator.connect(SF, false).await.unwrap();

        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(h.authenticator(SF).auth_calls(), 0);
        assert_eq!(h.client(SF).confirm_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_credential_requires_sign_in() {
        let h = harness(vec![(
            None,
            FakeAuthenticator::new(SF).refresh_mode(FakeMode::Reject),
        )]);
        let mut events = h.coordinator.subscribe();

        let states = h.coordinator.connect_all(false).await;

        assert_eq!(states[0].status, ConnectionStatus::AuthRequired);
        assert!(states[0].last_error.is_some());
        assert_eq!(h.authenticator(SF).authorize_calls(), 0);

        let phases: Vec<Phase> = drain(&mut events).into_iter().map(|e| e.phase).collect();
        assert_eq!(phases.first(), Some(&Phase::Connecting));
        assert!(phases.contains(&Phase::AuthRequired));
    }

    #[tokio::test]
    async fn test_interactive_bring_up_signs_in() {
        let h = harness(vec![(
            None,
            FakeAuthenticator::new(SF).refresh_mode(FakeMode::Reject),
        )]);

        let states = h.coordinator.connect_all(true).await;

        assert_eq!(states[0].status, ConnectionStatus::Connected);
        assert_eq!(h.authenticator(SF).authorize_calls(), 1);
        assert!(h.store.load(SF).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_non_interactive_backend_is_never_asked_to_sign_in() {
        let h = harness(vec![(
            None,
            FakeAuthenticator::new(AVA)
                .refresh_mode(FakeMode::Reject)
                .non_interactive(),
        )]);

        let states = h.coordinator.connect_all(true).await;

        assert_eq!(states[0].status, ConnectionStatus::AuthRequired);
        assert_eq!(h.authenticator(AVA).authorize_calls(), 0);
    }

    #[tokio::test]
    async fn test_refused_saved_session_is_renewed() {
        let h = harness(vec![(live(SF), FakeAuthenticator::new(SF))]);
        h.client(SF).fail_confirm([ApiError::Auth("Session expired".to_string())]);

        let state = h.coordinator.connect(SF, false).await.unwrap();

        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(h.authenticator(SF).refresh_calls(), 1);
        assert_eq!(h.client(SF).confirm_calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_confirm_failures_are_retried() {
        let h = harness(vec![(live(SF), FakeAuthenticator::new(SF))]);
        h.client(SF).fail_confirm([
            ApiError::Transient("503".to_string()),
            ApiError::Transient("503".to_string()),
        ]);

        let state = h.coordinator.connect(SF, false).await.unwrap();

        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(h.client(SF).confirm_calls(), 3);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_the_others() {
        let h = harness(vec![
            (live(SF), FakeAuthenticator::new(SF)),
            (live(AVA), FakeAuthenticator::new(AVA)),
        ]);
        h.client(AVA).fail_confirm([ApiError::Data("Unexpected payload".to_string())]);

        h.coordinator.connect_all(false).await;

        assert_eq!(h.coordinator.state(SF).unwrap().status, ConnectionStatus::Connected);
        let avalara = h.coordinator.state(AVA).unwrap();
        assert_eq!(avalara.status, ConnectionStatus::Failed);
        assert!(avalara.last_error.unwrap().contains("Unexpected payload"));
    }

    #[tokio::test]
    async fn test_backends_come_up_concurrently() {
        let h = harness(vec![
            (live(SF), FakeAuthenticator::new(SF)),
            (live(AVA), FakeAuthenticator::new(AVA)),
        ]);
        h.client(SF).delay_confirm(Duration::from_millis(300));
        h.client(AVA).delay_confirm(Duration::from_millis(300));

        let started = std::time::Instant::now();
        h.coordinator.connect_all(false).await;

        assert!(started.elapsed() < Duration::from_millis(550));
        assert!(h
            .coordinator
            .states()
            .iter()
            .all(|s| s.status == ConnectionStatus::Connected));
    }

    #[tokio::test]
    async fn test_cancelling_one_sign_in_leaves_others_alone() {
        let h = harness(vec![
            (
                None,
                FakeAuthenticator::new(SF)
                    .refresh_mode(FakeMode::Reject)
                    .authorize_mode(FakeMode::Hang),
            ),
            (live(AVA), FakeAuthenticator::new(AVA)),
        ]);
        h.coordinator.connect(AVA, false).await.unwrap();
        let avalara_before = h.coordinator.state(AVA);
        let mut events = h.coordinator.subscribe();

        let coordinator = h.coordinator.clone();
        let sign_in = tokio::spawn(async move { coordinator.connect(SF, true).await });
        wait_for(&mut events, SF, Phase::Authorizing).await;
        h.coordinator.cancel(SF).unwrap();

        let salesforce = sign_in.await.unwrap().unwrap();
        assert_eq!(salesforce.status, ConnectionStatus::Disconnected);
        assert!(salesforce.last_error.unwrap().contains("Cancelled"));
        assert_eq!(h.auth(SF).state(), AuthState::Unavailable);
        assert_eq!(h.coordinator.state(AVA), avalara_before);
        assert!(h.store.load(SF).unwrap().is_none());

        // a new attempt gets a fresh token
        h.authenticator(SF).set_authorize_mode(FakeMode::Succeed);
        let retried = h.coordinator.reauthorize(SF).await.unwrap();
        assert_eq!(retried.status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_sign_in() {
        let h = harness(vec![(
            None,
            FakeAuthenticator::new(SF)
                .refresh_mode(FakeMode::Reject)
                .authorize_mode(FakeMode::Hang),
        )]);
        let mut events = h.coordinator.subscribe();

        let coordinator = h.coordinator.clone();
        let bring_up = tokio::spawn(async move { coordinator.connect_all(true).await });
        wait_for(&mut events, SF, Phase::Authorizing).await;
        h.coordinator.shutdown();

        let states = bring_up.await.unwrap();
        assert_eq!(states[0].status, ConnectionStatus::Disconnected);
        assert!(h.coordinator.is_shut_down());
        wait_for(&mut events, SF, Phase::Cancelled).await;
    }

    #[tokio::test]
    async fn test_fetch_renews_refused_session_and_retries_once() {
        let h = harness(vec![(live(SF), FakeAuthenticator::new(SF))]);
        h.client(SF).fail_fetch([ApiError::Auth("INVALID_SESSION_ID".to_string())]);

        let table = h.coordinator.fetch_data(&source(SF), &[]).await.unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(h.client(SF).tokens_seen(), vec!["live", "token-1"]);
        assert_eq!(h.authenticator(SF).refresh_calls(), 1);
        assert_eq!(h.authenticator(SF).authorize_calls(), 0);
        assert!(h.auth(SF).is_valid());
    }

    #[tokio::test]
    async fn test_refused_fetch_without_renewal_requires_sign_in() {
        let h = harness(vec![(
            live(SF),
            FakeAuthenticator::new(SF).refresh_mode(FakeMode::Reject),
        )]);
        h.client(SF).fail_fetch([ApiError::Auth("INVALID_SESSION_ID".to_string())]);

        let err = h.coordinator.fetch_data(&source(SF), &[]).await.unwrap_err();

        assert!(matches!(err, CoordinatorError::Api(ApiError::Auth(_))));
        assert!(!h.auth(SF).is_valid());
        assert_eq!(h.coordinator.state(SF).unwrap().status, ConnectionStatus::AuthRequired);
        assert_eq!(h.client(SF).fetch_calls(), 1);
        assert_eq!(h.authenticator(SF).authorize_calls(), 0);
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_but_not_data_errors() {
        let h = harness(vec![(live(SF), FakeAuthenticator::new(SF))]);
        h.client(SF).fail_fetch([
            ApiError::Transient("timeout".to_string()),
            ApiError::Transient("timeout".to_string()),
        ]);
        h.coordinator.fetch_data(&source(SF), &[]).await.unwrap();
        assert_eq!(h.client(SF).fetch_calls(), 3);

        h.client(SF).fail_fetch([ApiError::Data("MALFORMED_QUERY".to_string())]);
        let err = h.coordinator.fetch_data(&source(SF), &[]).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Api(ApiError::Data(_))));
        assert_eq!(h.client(SF).fetch_calls(), 4);
    }

    #[tokio::test]
    async fn test_sources_are_listed_once() {
        let h = harness(vec![(live(SF), FakeAuthenticator::new(SF))]);

        h.coordinator.connect(SF, false).await.unwrap();
        let first = h.coordinator.list_data_sources(SF).await.unwrap();
        let second = h.coordinator.list_data_sources(SF).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(h.client(SF).list_calls(), 1);
    }

    #[tokio::test]
    async fn test_fresh_sessions_are_not_rechecked() {
        let h = harness(vec![(live(SF), FakeAuthenticator::new(SF))]);
        h.coordinator.connect(SF, false).await.unwrap();

        assert!(h.coordinator.refresh_if_stale().await.is_empty());
        assert!(h.coordinator.refresh_if_stale().await.is_empty());
        assert_eq!(h.authenticator(SF).auth_calls(), 0);
        assert_eq!(h.client(SF).confirm_calls(), 1);
    }

    #[tokio::test]
    async fn test_refused_data_call_is_rechecked_once() {
        let h = harness(vec![(live(SF), FakeAuthenticator::new(SF))]);
        h.coordinator.connect(SF, false).await.unwrap();
        h.client(SF).fail_fetch([
            ApiError::Auth("INVALID_SESSION_ID".to_string()),
            ApiError::Auth("INVALID_SESSION_ID".to_string()),
        ]);
        assert!(h.coordinator.fetch_data(&source(SF), &[]).await.is_err());
        assert_eq!(h.authenticator(SF).refresh_calls(), 1);

        assert_eq!(h.coordinator.refresh_if_stale().await, vec![SF]);
        assert_eq!(h.authenticator(SF).refresh_calls(), 2);
        assert_eq!(h.coordinator.state(SF).unwrap().status, ConnectionStatus::Connected);

        let calls = h.authenticator(SF).auth_calls();
        assert!(h.coordinator.refresh_if_stale().await.is_empty());
        assert_eq!(h.authenticator(SF).auth_calls(), calls);
    }

    #[tokio::test]
    async fn test_refused_renewal_is_not_retried_every_check() {
        let h = harness(vec![(live(SF), FakeAuthenticator::new(SF))]);
        h.coordinator.connect(SF, false).await.unwrap();
        h.client(SF).fail_fetch([ApiError::Auth("INVALID_SESSION_ID".to_string())]);
        h.authenticator(SF).set_refresh_mode(FakeMode::Reject);

        assert!(h.coordinator.fetch_data(&source(SF), &[]).await.is_err());
        assert_eq!(h.authenticator(SF).refresh_calls(), 1);

        assert_eq!(h.coordinator.refresh_if_stale().await, vec![SF]);
        assert_eq!(h.authenticator(SF).refresh_calls(), 2);
        assert_eq!(h.coordinator.state(SF).unwrap().status, ConnectionStatus::AuthRequired);

        assert!(h.coordinator.refresh_if_stale().await.is_empty());
        assert!(h.coordinator.refresh_if_stale().await.is_empty());
        assert_eq!(h.authenticator(SF).auth_calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_session_is_confirmed_without_renewal() {
        let settings = CoordinatorSettings {
            stale_after: Duration::ZERO,
            ..quick_retry()
        };
        let h = harness_with(settings, vec![(live(SF), FakeAuthenticator::new(SF))]);
        h.coordinator.connect(SF, false).await.unwrap();

        assert_eq!(h.coordinator.refresh_if_stale().await, vec![SF]);
        assert_eq!(h.client(SF).confirm_calls(), 2);
        assert_eq!(h.authenticator(SF).auth_calls(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_forgets_the_session() {
        let h = harness(vec![(live(SF), FakeAuthenticator::new(SF))]);
        h.coordinator.connect(SF, false).await.unwrap();

        h.coordinator.disconnect(SF).await.unwrap();

        let state = h.coordinator.state(SF).unwrap();
        assert_eq!(state, ConnectionState::new(SF));
        assert!(h.store.load(SF).unwrap().is_none());
        assert_eq!(h.auth(SF).state(), AuthState::NoCredential);
    }
}
