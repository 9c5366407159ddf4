use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use reportpull_lib::auth::{AuthError, AuthSettings, Authenticator, StaticKeyAuthenticator};
use reportpull_lib::backends::salesforce::{SalesforceJwtFlow, SalesforceWebFlow};
use reportpull_lib::backends::{
    ApiError, AvalaraClient, BackendClient, BackendId, Filter, QuickBaseClient, SalesforceClient,
    UnknownBackend, WooCommerceClient,
};
use reportpull_lib::config::{self, ConfigError, SalesforceAuthMethod};
use reportpull_lib::coordinator::{
    ConnectionCoordinator, ConnectionStatus, CoordinatorError, CoordinatorSettings, ProgressEvent,
};
use reportpull_lib::{AuthManager, Config, CredentialStore, Secrets, TokenManager};

#[derive(Parser)]
#[command(name = "reportpull")]
#[command(about = "ReportPull - connect to business systems and pull report data")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every enabled backend and show the result
    Connect {
        /// Open the browser when a backend needs signing in
        #[arg(long)]
        interactive: bool,
    },
    /// Authentication commands
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
    /// List the reports and tables a backend exposes
    Sources { backend: BackendId },
    /// Load a data source and print its rows as JSON lines
    Fetch {
        backend: BackendId,
        source: String,
        /// column:operator:value, may be repeated
        #[arg(long = "filter", value_parser = Filter::parse)]
        filters: Vec<Filter>,
    },
    /// Connect, then keep sessions alive until Ctrl-C
    Watch {
        #[arg(long)]
        interactive: bool,
    },
}

#[derive(Subcommand)]
enum AuthAction {
    /// Sign in to a backend in the browser
    Login { backend: BackendId },
    /// Log out and clear stored credentials
    Logout { backend: BackendId },
    /// Show current auth status
    Status,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Backend(#[from] UnknownBackend),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{backend} is {status}{}", .detail.as_deref().map(|d| format!(": {}", d)).unwrap_or_default())]
    NotConnected {
        backend: BackendId,
        status: ConnectionStatus,
        detail: Option<String>,
    },
    #[error("{0} has no data source '{1}'")]
    UnknownSource(BackendId, String),
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("reportpull=info,reportpull_lib=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<(), CliError> {
    let mut config = config::load_config()?;
    config.apply_env_overrides(|name| std::env::var(name).ok());
    let secrets = Secrets::from_env();
    tracing::debug!("Loaded secrets: {:?}", secrets);

    let coordinator = Arc::new(build_coordinator(&config, &secrets)?);

    match command {
        Commands::Connect { interactive } => {
            let printer = print_progress(coordinator.subscribe());
            cancel_on_ctrl_c(coordinator.clone(), None);

            let interactive = interactive || config.connection.auto_reauthorize;
            coordinator.connect_all(interactive).await;
            printer.abort();
            print_states(&coordinator);
        }
        Commands::Auth { action } => match action {
            AuthAction::Login { backend } => {
                let printer = print_progress(coordinator.subscribe());
                cancel_on_ctrl_c(coordinator.clone(), Some(backend));

                let state = coordinator.reauthorize(backend).await?;
                printer.abort();
                ensure_connected(&state)?;
                println!("Signed in to {}", backend.display_name());
            }
            AuthAction::Logout { backend } => {
                coordinator.disconnect(backend).await?;
                println!("Logged out of {}", backend.display_name());
            }
            AuthAction::Status => print_auth_status(&coordinator),
        },
        Commands::Sources { backend } => {
            let state = coordinator.connect(backend, false).await?;
            ensure_connected(&state)?;

            for source in coordinator.list_data_sources(backend).await? {
                println!(
                    "{:<10} {:<40} {}{}",
                    format!("{:?}", source.kind).to_lowercase(),
                    source.id,
                    source.display_name,
                    source
                        .folder
                        .map(|f| format!("  [{}]", f))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Fetch {
            backend,
            source,
            filters,
        } => {
            let state = coordinator.connect(backend, false).await?;
            ensure_connected(&state)?;

            let descriptor = coordinator
                .list_data_sources(backend)
                .await?
                .into_iter()
                .find(|s| s.id == source)
                .ok_or_else(|| CliError::UnknownSource(backend, source.clone()))?;

            let table = coordinator.fetch_data(&descriptor, &filters).await?;
            for record in table.records() {
                println!("{}", serde_json::to_string(&record)?);
            }
            tracing::info!("{} rows", table.len());
        }
        Commands::Watch { interactive } => {
            let printer = print_progress(coordinator.subscribe());
            let interactive = interactive || config.connection.auto_reauthorize;
            coordinator.connect_all(interactive).await;
            print_states(&coordinator);

            let keep_alive = TokenManager::new(
                coordinator.clone(),
                config.connection.keep_alive_interval(),
            );
            let handle = keep_alive.start_background_refresh();

            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            keep_alive.stop().await;
            coordinator.shutdown();
            handle.abort();
            printer.abort();
        }
    }

    Ok(())
}

fn build_coordinator(config: &Config, secrets: &Secrets) -> Result<ConnectionCoordinator, CliError> {
    let store = Arc::new(CredentialStore::from_config(&config.storage)?);
    let connection = &config.connection;
    let mut builder = ConnectionCoordinator::builder(CoordinatorSettings::from_config(connection));

    let manager = |authenticator: Arc<dyn Authenticator>, timeout_secs: u64| {
        let settings = AuthSettings::from_config(connection, Duration::from_secs(timeout_secs));
        Arc::new(AuthManager::new(authenticator, store.clone(), settings))
    };

    if config.salesforce.enabled {
        let sf = &config.salesforce;
        let authenticator: Result<Arc<dyn Authenticator>, AuthError> = match sf.auth_method {
            SalesforceAuthMethod::Browser => {
                SalesforceWebFlow::new(sf, secrets).map(|flow| Arc::new(flow) as Arc<dyn Authenticator>)
            }
            SalesforceAuthMethod::Jwt => {
                SalesforceJwtFlow::new(sf, secrets).map(|flow| Arc::new(flow) as Arc<dyn Authenticator>)
            }
        };
        match authenticator {
            Ok(authenticator) => {
                let client: Arc<dyn BackendClient> = Arc::new(SalesforceClient::new(sf)?);
                builder = builder.register(manager(authenticator, sf.timeout_secs), client)?;
            }
            Err(e) => tracing::error!("Salesforce is enabled but cannot be used: {}", e),
        }
    }

    if config.woocommerce.enabled {
        let woo = &config.woocommerce;
        let authenticator = Arc::new(StaticKeyAuthenticator::new(
            BackendId::WooCommerce,
            secrets.woo_key_pair(),
            woo.store_url.clone(),
        ));
        let client: Arc<dyn BackendClient> = Arc::new(WooCommerceClient::new(woo)?);
        builder = builder.register(manager(authenticator, woo.timeout_secs), client)?;
    }

    if config.avalara.enabled {
        let avalara = &config.avalara;
        let authenticator = Arc::new(StaticKeyAuthenticator::new(
            BackendId::Avalara,
            secrets.avalara_key_pair(),
            Some(avalara.resolved_base_url()),
        ));
        let client: Arc<dyn BackendClient> = Arc::new(AvalaraClient::new(avalara)?);
        builder = builder.register(manager(authenticator, avalara.timeout_secs), client)?;
    }

    if config.quickbase.enabled {
        let qb = &config.quickbase;
        let authenticator = Arc::new(StaticKeyAuthenticator::new(
            BackendId::QuickBase,
            secrets.quickbase_user_token.clone(),
            qb.realm_hostname.clone(),
        ));
        let client: Arc<dyn BackendClient> = Arc::new(QuickBaseClient::new(qb)?);
        builder = builder.register(manager(authenticator, qb.timeout_secs), client)?;
    }

    Ok(builder.build())
}

/// Ctrl-C cancels a sign-in in progress: one backend's, or everything
fn cancel_on_ctrl_c(coordinator: Arc<ConnectionCoordinator>, backend: Option<BackendId>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        match backend {
            Some(backend) => {
                if let Err(e) = coordinator.cancel(backend) {
                    tracing::error!("Failed to cancel: {}", e);
                }
            }
            None => coordinator.shutdown(),
        }
    });
}

fn print_progress(mut events: broadcast::Receiver<ProgressEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => eprintln!("[{}] {}", event.backend, event.message),
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!("Progress printer missed {} events", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_states(coordinator: &ConnectionCoordinator) {
    for state in coordinator.states() {
        match &state.last_error {
            Some(error) => println!("{:<12} {} ({})", state.backend, state.status, error),
            None => println!("{:<12} {}", state.backend, state.status),
        }
    }
}

fn print_auth_status(coordinator: &ConnectionCoordinator) {
    for backend in coordinator.backends() {
        let Some(auth) = coordinator.auth(backend) else {
            continue;
        };
        let expiry = auth
            .credential()
            .and_then(|c| c.seconds_remaining())
            .map(|s| format!(", expires in {}m", s / 60))
            .unwrap_or_default();
        println!("{:<12} {:?}{}", backend, auth.state(), expiry);
    }
}

fn ensure_connected(state: &reportpull_lib::ConnectionState) -> Result<(), CliError> {
    if state.status == ConnectionStatus::Connected {
        return Ok(());
    }
    Err(CliError::NotConnected {
        backend: state.backend,
        status: state.status,
        detail: state.last_error.clone(),
    })
}
