//! PKCE OAuth plumbing for browser sign-in
//!
//! Implements PKCE (Proof Key for Code Exchange) with a loopback HTTP server
//! that receives the authorization code, plus the token endpoint exchange
//! shared by every OAuth grant.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rand::RngCore;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::backends::BackendId;
use crate::credential_store::{unix_now, Credential};

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("Failed to bind to loopback address: {0}")]
    BindError(#[from] std::io::Error),
    #[error("No free callback port between {0} and {1}")]
    NoFreePort(u16, u16),
    #[error("Failed to receive authorization code")]
    CodeReceiveError,
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),
    #[error("Callback state did not match the request")]
    StateMismatch,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Grant rejected: {0}")]
    GrantRejected(String),
    #[error("Token endpoint error: {0}")]
    TokenEndpoint(String),
}

impl OAuthError {
    /// Failures worth retrying later without user involvement
    pub fn is_transient(&self) -> bool {
        match self {
            OAuthError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            OAuthError::TokenEndpoint(_) => true,
            _ => false,
        }
    }
}

/// PKCE challenge for OAuth 2.0 authorization
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// The code verifier (random string, base64url encoded)
    pub verifier: String,
    /// The code challenge (SHA256 hash of verifier, base64url encoded)
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a new PKCE challenge pair
    ///
    /// Creates a cryptographically random code verifier (32 bytes, base64url encoded)
    /// and derives the code challenge using SHA256.
    pub fn generate() -> Self {
        let verifier = random_token();

        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self { verifier, challenge }
    }
}

/// Random value for the `state` parameter
pub fn generate_state() -> String {
    random_token()
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Result from the loopback callback server
#[derive(Debug)]
pub struct CallbackResult {
    /// The authorization code received from the OAuth provider
    pub code: String,
    /// The state parameter echoed back by the provider
    pub state: Option<String>,
}

type ResultSender = Arc<tokio::sync::Mutex<Option<oneshot::Sender<Result<CallbackResult, OAuthError>>>>>;

/// Loopback HTTP server for receiving OAuth callbacks
pub struct LoopbackServer {
    /// The port the server is listening on
    pub port: u16,
    /// Channel to receive the callback result
    result_rx: oneshot::Receiver<Result<CallbackResult, OAuthError>>,
    /// Dropping this stops the server
    _shutdown_tx: oneshot::Sender<()>,
}

impl LoopbackServer {
    /// Start on the first free port in `ports`.
    ///
    /// Providers such as Salesforce only accept redirect URIs registered in
    /// advance, so the port comes from a fixed range rather than the OS.
    pub async fn start_in_range(ports: RangeInclusive<u16>) -> Result<Self, OAuthError> {
        let (first, last) = (*ports.start(), *ports.end());
        for port in ports {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            match TcpListener::bind(addr).await {
                Ok(listener) => return Self::serve(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    tracing::debug!("Callback port {} in use, trying next", port);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(OAuthError::NoFreePort(first, last))
    }

    fn serve(listener: TcpListener) -> Result<Self, OAuthError> {
        let port = listener.local_addr()?.port();
        tracing::info!("OAuth callback server listening on 127.0.0.1:{}", port);

        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let result_tx: ResultSender = Arc::new(tokio::sync::Mutex::new(Some(result_tx)));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::debug!("OAuth callback server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                let result_tx = result_tx.clone();
                                let io = TokioIo::new(stream);

                                tokio::spawn(async move {
                                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                                        let result_tx = result_tx.clone();
                                        async move {
                                            handle_callback(req, result_tx).await
                                        }
                                    });

                                    if let Err(e) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        tracing::error!("Error serving connection: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Error accepting connection: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            port,
            result_rx,
            _shutdown_tx: shutdown_tx,
        })
    }

    /// Get the redirect URI for this server
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/callback", self.port)
    }

    /// Wait for the callback and check it carries `expected_state`.
    ///
    /// This consumes the server, which shuts down once it returns or is dropped.
    pub async fn wait_for_callback(self, expected_state: &str) -> Result<CallbackResult, OAuthError> {
        let callback = self.result_rx.await.map_err(|_| OAuthError::CodeReceiveError)??;
        if callback.state.as_deref() != Some(expected_state) {
            tracing::warn!("Rejecting OAuth callback with mismatched state");
            return Err(OAuthError::StateMismatch);
        }
        Ok(callback)
    }
}

fn html_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    response
}

fn page(title: &str, message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>{title}</title></head>
<body style="font-family: system-ui; text-align: center; padding: 50px;">
<h1>{title}</h1>
<p>{message}</p>
</body>
</html>"#
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Handle an incoming callback request
async fn handle_callback(
    req: Request<hyper::body::Incoming>,
    result_tx: ResultSender,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if !req.uri().path().starts_with("/callback") {
        return Ok(html_response(StatusCode::NOT_FOUND, page("Not Found", "")));
    }

    let query = req.uri().query().unwrap_or("");
    let params: std::collections::HashMap<_, _> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    if let Some(error) = params.get("error") {
        let error_desc = params
            .get("error_description")
            .map(|s| s.as_str())
            .unwrap_or("Unknown error");

        tracing::error!("OAuth error: {} - {}", error, error_desc);

        if let Some(tx) = result_tx.lock().await.take() {
            let _ = tx.send(Err(OAuthError::AuthorizationFailed(format!(
                "{}: {}",
                error, error_desc
            ))));
        }

        let message = format!(
            "{}: {}<br>You can close this window.",
            escape_html(error),
            escape_html(error_desc)
        );
        return Ok(html_response(
            StatusCode::OK,
            page("Authentication Failed", &message),
        ));
    }

    if let Some(code) = params.get("code").cloned() {
        tracing::info!("Received authorization code");

        let state = params.get("state").cloned();
        if let Some(tx) = result_tx.lock().await.take() {
            let _ = tx.send(Ok(CallbackResult { code, state }));
        }

        return Ok(html_response(
            StatusCode::OK,
            page(
                "Authentication Successful",
                "You can close this window and return to ReportPull.",
            ),
        ));
    }

    Ok(html_response(
        StatusCode::BAD_REQUEST,
        page("Invalid Callback", "No authorization code received."),
    ))
}

/// Token endpoint response (RFC 6749 section 5.1 plus Salesforce extras)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub instance_url: Option<String>,
}

impl TokenResponse {
    pub fn into_credential(self, backend: BackendId) -> Credential {
        let lifetime = self.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        Credential {
            backend,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: Some(unix_now() + lifetime),
            instance_url: self.instance_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// POST a grant to a token endpoint.
///
/// 4xx answers mean the grant itself was refused; 5xx answers are reported
/// as endpoint trouble so callers can retry later.
pub async fn request_token(
    client: &Client,
    token_url: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, OAuthError> {
    let response = client.post(token_url).form(form).send().await?;
    let status = response.status();

    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = match serde_json::from_str::<TokenErrorBody>(&body) {
        Ok(err) => format!("{}: {}", err.error, err.error_description.unwrap_or_default()),
        Err(_) => format!("HTTP {}", status.as_u16()),
    };

    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(OAuthError::TokenEndpoint(detail))
    } else {
        Err(OAuthError::GrantRejected(detail))
    }
}

/// Open a URL in the default browser
pub fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }

    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/c", "start", "", url])
            .spawn()?;
    }

    Ok(())
}
