pub mod auth;
pub mod backends;
pub mod config;
pub mod coordinator;
pub mod credential_store;
pub mod oauth;
pub mod token_manager;

#[cfg(test)]
mod test_support;

pub use auth::{AuthManager, AuthSettings, Authenticator};
pub use backends::{BackendClient, BackendId, DataSourceDescriptor, Filter, Table};
pub use config::{Config, Secrets};
pub use coordinator::{ConnectionCoordinator, ConnectionState, ConnectionStatus, ProgressEvent};
pub use credential_store::{Credential, CredentialStore};
pub use token_manager::TokenManager;
