//! Token Manager module for background session upkeep
//!
//! Periodically asks the coordinator to re-check sessions that have gone
//! stale or were refused, so expiring credentials are renewed before the
//! next data call needs them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;

use crate::coordinator::ConnectionCoordinator;

/// Keep-alive loop around [`ConnectionCoordinator::refresh_if_stale`]
pub struct TokenManager {
    coordinator: Arc<ConnectionCoordinator>,
    check_interval: Duration,
    /// Whether the manager is running
    running: Arc<RwLock<bool>>,
}

impl TokenManager {
    pub fn new(coordinator: Arc<ConnectionCoordinator>, check_interval: Duration) -> Self {
        Self {
            coordinator,
            check_interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Start the background refresh task
    ///
    /// The task ends after `stop()` or once the coordinator shuts down.
    pub fn start_background_refresh(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let running = self.running.clone();
        let period = self.check_interval;

        tokio::spawn(async move {
            {
                let mut r = running.write().await;
                *r = true;
            }
            tracing::info!("Keep-alive started, checking every {:?}", period);

            let mut check_interval = interval(period);
            // The first tick fires immediately; sessions were just brought up
            check_interval.tick().await;

            loop {
                check_interval.tick().await;

                if !*running.read().await || coordinator.is_shut_down() {
                    tracing::info!("Keep-alive stopping");
                    break;
                }

                let checked = coordinator.refresh_if_stale().await;
                if checked.is_empty() {
                    tracing::debug!("All sessions fresh");
                    continue;
                }

                for backend in checked {
                    match coordinator.state(backend) {
                        Some(state) => tracing::info!("Re-checked {}: {}", backend, state.status),
                        None => tracing::debug!("Re-checked {}", backend),
                    }
                }
            }

            *running.write().await = false;
        })
    }

    /// Stop the background refresh task
    pub async fn stop(&self) {
        let mut r = self.running.write().await;
        *r = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthManager, AuthSettings};
    use crate::backends::BackendId;
    use crate::coordinator::CoordinatorSettings;
    use crate::credential_store::{unix_now, Credential, CredentialStore, MemoryStore};
    use crate::test_support::{FakeAuthenticator, FakeClient};

    fn coordinator_with(
        stale_after: Duration,
    ) -> (Arc<ConnectionCoordinator>, Arc<FakeAuthenticator>, Arc<FakeClient>) {
        let store = Arc::new(CredentialStore::new(MemoryStore::new()));
        store
            .save(
                &Credential::new(BackendId::Salesforce, "live")
                    .with_refresh_token("rt")
                    .with_expires_at(unix_now() + 3600),
            )
            .unwrap();

        let authenticator = Arc::new(FakeAuthenticator::new(BackendId::Salesforce));
        let client = Arc::new(FakeClient::new(BackendId::Salesforce));
        let auth = Arc::new(AuthManager::new(
            authenticator.clone(),
            store,
            AuthSettings::default(),
        ));
        let settings = CoordinatorSettings {
            stale_after,
            ..CoordinatorSettings::default()
        };
        let coordinator = ConnectionCoordinator::builder(settings)
            .register(auth, client.clone())
            .unwrap()
            .build();
        (Arc::new(coordinator), authenticator, client)
    }

    #[tokio::test]
    async fn test_keep_alive_rechecks_stale_sessions_until_stopped() {
        let (coordinator, authenticator, client) = coordinator_with(Duration::ZERO);
        coordinator.connect(BackendId::Salesforce, false).await.unwrap();

        let manager = TokenManager::new(coordinator, Duration::from_millis(20));
        let handle = manager.start_background_refresh();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(manager.is_running().await);
        assert!(client.confirm_calls() > 1);
        assert_eq!(authenticator.auth_calls(), 0);

        manager.stop().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn test_keep_alive_leaves_fresh_sessions_alone() {
        let (coordinator, authenticator, client) = coordinator_with(Duration::from_secs(300));
        coordinator.connect(BackendId::Salesforce, false).await.unwrap();

        let manager = TokenManager::new(coordinator.clone(), Duration::from_millis(20));
        let handle = manager.start_background_refresh();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(client.confirm_calls(), 1);
        assert_eq!(authenticator.auth_calls(), 0);

        coordinator.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
