//! # Precache Net
//!
//! Request and response types plus the network fetch capability used by the
//! precache worker.
//!
//! ## Design Goals
//!
//! 1. **Host capability as a trait**: the worker only sees [`Fetcher`], so it
//!    can run against reqwest or against a scripted fake.
//! 2. **Cheap clones**: [`Response`] bodies are [`Bytes`], so storing a copy
//!    in the cache and returning the original costs a refcount bump.
//! 3. **Offline signal**: a fetch can resolve to [`Fetched::Degenerate`]
//!    instead of a response, which callers treat like a network failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// An outgoing request as seen by the worker.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Per-request timeout. `None` leaves the client default in place.
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Parse `url` and create a GET request.
    pub fn parse_get(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this is a read (GET) request.
    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }

    /// Key under which a response to this request is cached: the absolute
    /// URL without its fragment.
    pub fn cache_key(&self) -> String {
        cache_key(&self.url)
    }
}

/// Cache key for a URL: the URL with its fragment removed.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// A fully loaded HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Set when the response was served out of a cache namespace.
    pub from_cache: bool,
}

impl Response {
    /// Create a response with an empty header map.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            from_cache: false,
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Canonical reason phrase for the status, or empty.
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// What a fetch resolved to.
#[derive(Debug, Clone)]
pub enum Fetched {
    /// A real response, whatever its status.
    Response(Response),
    /// The host resolved the fetch without producing a response. Seen when
    /// offline on some hosts instead of an error.
    Degenerate,
}

impl Fetched {
    /// The response, if there is one.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Fetched::Response(response) => Some(response),
            Fetched::Degenerate => None,
        }
    }
}

/// Network fetch primitive provided by the host.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. An `Err` means the network could not be reached.
    async fn fetch(&self, request: &Request) -> Result<Fetched, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Client-wide timeout. `None` keeps reqwest's default (no timeout).
    pub timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Precache/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            timeout: Some(Duration::from_secs(30)),
            max_redirects: 10,
        }
    }
}

/// reqwest-backed [`Fetcher`].
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    /// Loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn classify(&self, request: &Request, err: reqwest::Error) -> NetError {
        if err.is_timeout() {
            let after = request
                .timeout
                .or(self.config.timeout)
                .unwrap_or_default();
            NetError::Timeout(after)
        } else if err.is_connect() {
            NetError::RequestFailed(format!("{}: {}", request.url, err))
        } else {
            NetError::HttpError(err)
        }
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: &Request) -> Result<Fetched, NetError> {
        debug!(
            id = request.id.raw(),
            url = %request.url,
            method = %request.method,
            "Fetching resource"
        );

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .header("Accept-Language", &self.config.accept_language);

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| self.classify(request, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.classify(request, e))?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Fetched::Response(Response {
            url,
            status,
            headers,
            body,
            from_cache: false,
        }))
    }
}
