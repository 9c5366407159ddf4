//! Salesforce grant mechanics: browser sign-in with PKCE and the JWT bearer flow

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::auth::{AuthError, Authenticator};
use crate::backends::http::build_client;
use crate::backends::BackendId;
use crate::config::{SalesforceConfig, Secrets};
use crate::credential_store::{unix_now, Credential};
use crate::oauth::{self, generate_state, request_token, LoopbackServer, PkceChallenge};

const OAUTH_SCOPE: &str = "full refresh_token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 180;

/// Opens the authorization URL for the user
pub type BrowserLauncher = Arc<dyn Fn(&str) -> std::io::Result<()> + Send + Sync>;

fn endpoint(login_url: &str, path: &str) -> String {
    format!("{}/services/oauth2/{}", login_url.trim_end_matches('/'), path)
}

fn http_client(config: &SalesforceConfig) -> Result<Client, AuthError> {
    build_client(Duration::from_secs(config.timeout_secs))
        .map_err(|e| AuthError::Api(e.to_string()))
}

/// Web server flow: PKCE (S256) through the user's browser, renewed with
/// the refresh-token grant
pub struct SalesforceWebFlow {
    http: Client,
    login_url: String,
    client_id: String,
    client_secret: Option<String>,
    callback_ports: RangeInclusive<u16>,
    launcher: BrowserLauncher,
}

impl SalesforceWebFlow {
    pub fn new(config: &SalesforceConfig, secrets: &Secrets) -> Result<Self, AuthError> {
        let client_id = secrets
            .salesforce_consumer_key
            .clone()
            .ok_or(AuthError::NotConfigured(BackendId::Salesforce))?;

        Ok(Self {
            http: http_client(config)?,
            login_url: config.login_url.clone(),
            client_id,
            client_secret: secrets.salesforce_consumer_secret.clone(),
            callback_ports: config.callback_ports(),
            launcher: Arc::new(oauth::open_browser),
        })
    }

    pub fn with_launcher(mut self, launcher: BrowserLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    fn authorize_url(
        &self,
        redirect_uri: &str,
        pkce: &PkceChallenge,
        state: &str,
    ) -> Result<Url, AuthError> {
        Ok(Url::parse_with_params(
            &endpoint(&self.login_url, "authorize"),
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("code_challenge", pkce.challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("state", state),
                ("scope", OAUTH_SCOPE),
            ],
        )?)
    }

    fn with_client_credentials<'a>(&'a self, form: &mut Vec<(&'a str, &'a str)>) {
        form.push(("client_id", &self.client_id));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret));
        }
    }
}

#[async_trait]
impl Authenticator for SalesforceWebFlow {
    fn backend(&self) -> BackendId {
        BackendId::Salesforce
    }

    async fn refresh(&self, current: Option<&Credential>) -> Result<Credential, AuthError> {
        let current = current.ok_or(AuthError::NoRefreshToken)?;
        let refresh_token = current
            .refresh_token
            .as_deref()
            .ok_or(AuthError::NoRefreshToken)?;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.with_client_credentials(&mut form);

        let token = request_token(&self.http, &endpoint(&self.login_url, "token"), &form).await?;
        let mut credential = token.into_credential(BackendId::Salesforce);

        // refresh responses carry neither a new refresh token nor always the instance
        if credential.refresh_token.is_none() {
            credential.refresh_token = current.refresh_token.clone();
        }
        if credential.instance_url.is_none() {
            credential.instance_url = current.instance_url.clone();
        }
        Ok(credential)
    }

    async fn authorize(&self) -> Result<Credential, AuthError> {
        let server = LoopbackServer::start_in_range(self.callback_ports.clone()).await?;
        let redirect_uri = server.redirect_uri();
        let pkce = PkceChallenge::generate();
        let state = generate_state();
        let auth_url = self.authorize_url(&redirect_uri, &pkce, &state)?;

        if let Err(e) = (self.launcher)(auth_url.as_str()) {
            tracing::warn!("Could not open browser ({}); open this URL to sign in: {}", e, auth_url);
        }

        let callback = server.wait_for_callback(&state).await?;

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", callback.code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("code_verifier", pkce.verifier.as_str()),
        ];
        self.with_client_credentials(&mut form);

        let token = request_token(&self.http, &endpoint(&self.login_url, "token"), &form).await?;
        Ok(token.into_credential(BackendId::Salesforce))
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    exp: u64,
}

/// JWT bearer flow: every renewal signs a fresh assertion, so no user
/// interaction or refresh token is involved
pub struct SalesforceJwtFlow {
    http: Client,
    login_url: String,
    client_id: String,
    subject: String,
    key: EncodingKey,
    key_id: Option<String>,
}

impl SalesforceJwtFlow {
    pub fn new(config: &SalesforceConfig, secrets: &Secrets) -> Result<Self, AuthError> {
        let not_configured = || AuthError::NotConfigured(BackendId::Salesforce);
        let client_id = secrets.salesforce_consumer_key.clone().ok_or_else(not_configured)?;
        let subject = secrets.salesforce_jwt_subject.clone().ok_or_else(not_configured)?;
        let key_path = secrets.salesforce_jwt_key_path.as_ref().ok_or_else(not_configured)?;

        let pem = std::fs::read(key_path)?;
        let key = EncodingKey::from_rsa_pem(&pem)?;

        Ok(Self {
            http: http_client(config)?,
            login_url: config.login_url.trim_end_matches('/').to_string(),
            client_id,
            subject,
            key,
            key_id: secrets.salesforce_jwt_key_id.clone(),
        })
    }

    fn assertion(&self) -> Result<String, AuthError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();

        let claims = AssertionClaims {
            iss: &self.client_id,
            sub: &self.subject,
            aud: &self.login_url,
            exp: unix_now() + ASSERTION_LIFETIME_SECS,
        };
        Ok(jsonwebtoken::encode(&header, &claims, &self.key)?)
    }
}

#[async_trait]
impl Authenticator for SalesforceJwtFlow {
    fn backend(&self) -> BackendId {
        BackendId::Salesforce
    }

    async fn refresh(&self, _current: Option<&Credential>) -> Result<Credential, AuthError> {
        let assertion = self.assertion()?;
        let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];

        let token = request_token(&self.http, &endpoint(&self.login_url, "token"), &form).await?;
        tracing::debug!("Exchanged JWT assertion for {} as {}", BackendId::Salesforce, self.subject);
        Ok(token.into_credential(BackendId::Salesforce))
    }

    async fn authorize(&self) -> Result<Credential, AuthError> {
        Err(AuthError::InteractiveUnsupported(BackendId::Salesforce))
    }

    fn supports_interactive(&self) -> bool {
        false
    }
}
