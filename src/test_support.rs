//! Fakes shared by the unit tests: scripted authenticators and backend
//! clients with call counters, and a small HTTP server standing in for
//! vendor APIs.

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::auth::{AuthError, Authenticator};
use crate::backends::{
    ApiError, BackendClient, BackendId, DataSourceDescriptor, DataSourceKind, Filter, Table,
};
use crate::credential_store::{unix_now, Credential, SecretStore, StoreError};

/// How a fake grant behaves when called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeMode {
    Succeed,
    /// The provider refuses the grant
    Reject,
    /// The network gives out
    Transient,
    /// Never completes; only cancellation or a timeout ends it
    Hang,
}

pub struct FakeAuthenticator {
    backend: BackendId,
    interactive: bool,
    refresh_mode: Mutex<FakeMode>,
    authorize_mode: Mutex<FakeMode>,
    refresh_delay: Option<Duration>,
    refresh_calls: AtomicU32,
    authorize_calls: AtomicU32,
    issued: AtomicU32,
}

impl FakeAuthenticator {
    pub fn new(backend: BackendId) -> Self {
        Self {
            backend,
            interactive: true,
            refresh_mode: Mutex::new(FakeMode::Succeed),
            authorize_mode: Mutex::new(FakeMode::Succeed),
            refresh_delay: None,
            refresh_calls: AtomicU32::new(0),
            authorize_calls: AtomicU32::new(0),
            issued: AtomicU32::new(0),
        }
    }

    pub fn refresh_mode(self, mode: FakeMode) -> Self {
        self.set_refresh_mode(mode);
        self
    }

    pub fn authorize_mode(self, mode: FakeMode) -> Self {
        self.set_authorize_mode(mode);
        self
    }

    /// Refresh grants wait this long before answering
    pub fn refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = Some(delay);
        self
    }

    pub fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }

    pub fn set_refresh_mode(&self, mode: FakeMode) {
        *self.refresh_mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    pub fn set_authorize_mode(&self, mode: FakeMode) {
        *self.authorize_mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn authorize_calls(&self) -> u32 {
        self.authorize_calls.load(Ordering::SeqCst)
    }

    /// Total grant attempts, i.e. auth network calls a real backend would make
    pub fn auth_calls(&self) -> u32 {
        self.refresh_calls() + self.authorize_calls()
    }

    async fn grant(&self, mode: FakeMode) -> Result<Credential, AuthError> {
        match mode {
            FakeMode::Succeed => {
                let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Credential::new(self.backend, format!("token-{}", n))
                    .with_refresh_token("refresh-token")
                    .with_expires_at(unix_now() + 3600))
            }
            FakeMode::Reject => Err(AuthError::Rejected("invalid_grant: expired".to_string())),
            FakeMode::Transient => Err(AuthError::NetworkTimeout),
            FakeMode::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Authenticator for FakeAuthenticator {
    fn backend(&self) -> BackendId {
        self.backend
    }

    async fn refresh(&self, _current: Option<&Credential>) -> Result<Credential, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.refresh_mode.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = self.refresh_delay {
            tokio::time::sleep(delay).await;
        }
        self.grant(mode).await
    }

    async fn authorize(&self) -> Result<Credential, AuthError> {
        self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.authorize_mode.lock().unwrap_or_else(PoisonError::into_inner);
        self.grant(mode).await
    }

    fn supports_interactive(&self) -> bool {
        self.interactive
    }
}

/// A backend client whose answers are scripted per call
pub struct FakeClient {
    backend: BackendId,
    confirm_errors: Mutex<VecDeque<ApiError>>,
    fetch_errors: Mutex<VecDeque<ApiError>>,
    confirm_delay: Mutex<Option<Duration>>,
    confirm_calls: AtomicU32,
    list_calls: AtomicU32,
    fetch_calls: AtomicU32,
    tokens_seen: Mutex<Vec<String>>,
}

impl FakeClient {
    pub fn new(backend: BackendId) -> Self {
        Self {
            backend,
            confirm_errors: Mutex::new(VecDeque::new()),
            fetch_errors: Mutex::new(VecDeque::new()),
            confirm_delay: Mutex::new(None),
            confirm_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
            fetch_calls: AtomicU32::new(0),
            tokens_seen: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next confirm calls with these errors, in order
    pub fn fail_confirm(&self, errors: impl IntoIterator<Item = ApiError>) {
        self.confirm_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(errors);
    }

    /// Fail the next fetch calls with these errors, in order
    pub fn fail_fetch(&self, errors: impl IntoIterator<Item = ApiError>) {
        self.fetch_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(errors);
    }

    pub fn delay_confirm(&self, delay: Duration) {
        *self.confirm_delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    pub fn confirm_calls(&self) -> u32 {
        self.confirm_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Access tokens presented to fetch, oldest first
    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_error(queue: &Mutex<VecDeque<ApiError>>) -> Option<ApiError> {
        queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }
}

#[async_trait]
impl BackendClient for FakeClient {
    fn backend(&self) -> BackendId {
        self.backend
    }

    async fn confirm(&self, _credential: &Credential) -> Result<(), ApiError> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.confirm_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match Self::next_error(&self.confirm_errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn list_data_sources(
        &self,
        _credential: &Credential,
    ) -> Result<Vec<DataSourceDescriptor>, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            DataSourceDescriptor::new(self.backend, DataSourceKind::Report, "r1", "Pipeline"),
            DataSourceDescriptor::new(self.backend, DataSourceKind::Table, "t1", "Accounts"),
        ])
    }

    async fn fetch_data(
        &self,
        credential: &Credential,
        source: &DataSourceDescriptor,
        _filters: &[Filter],
    ) -> Result<Table, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.tokens_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(credential.access_token.clone());
        if let Some(e) = Self::next_error(&self.fetch_errors) {
            return Err(e);
        }

        let records = vec![json!({"source": source.id, "row": 1})];
        Ok(Table::from_records(crate::backends::into_records(records)))
    }
}

/// A secret store that fails every operation
pub struct BrokenStore;

impl SecretStore for BrokenStore {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn load(&self, _backend: BackendId) -> Result<Option<Credential>, StoreError> {
        Err(std::io::Error::other("store unavailable").into())
    }

    fn save(&self, _credential: &Credential) -> Result<(), StoreError> {
        Err(std::io::Error::other("store unavailable").into())
    }

    fn delete(&self, _backend: BackendId) -> Result<(), StoreError> {
        Err(std::io::Error::other("store unavailable").into())
    }
}

/// A request as seen by [`MockServer`]
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl MockRequest {
    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// A field of an `application/x-www-form-urlencoded` body
    pub fn form(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(&self.body)
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// The body parsed as JSON, `Null` when it is not JSON
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
}

impl MockResponse {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

type Handler = Arc<dyn Fn(&MockRequest) -> MockResponse + Send + Sync>;

/// Loopback HTTP/1 server answering every request through one handler and
/// recording what it received. Stops when dropped.
pub struct MockServer {
    port: u16,
    requests: Arc<Mutex<Vec<MockRequest>>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&MockRequest) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let port = listener.local_addr().expect("mock server address").port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                let recorded = recorded.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let handler = handler.clone();
                        let recorded = recorded.clone();
                        async move { respond(req, handler, recorded).await }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            port,
            requests,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn respond(
    req: Request<hyper::body::Incoming>,
    handler: Handler,
    recorded: Arc<Mutex<Vec<MockRequest>>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    let request = MockRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        headers: parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        body,
    };

    let reply = handler(&request);
    recorded
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(request);

    let mut response = Response::new(Full::new(Bytes::from(reply.body)));
    *response.status_mut() = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}
