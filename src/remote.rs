//! HTTP access to a remote CouchDB-compatible database.
//!
//! [`RemoteDb`] wraps one `reqwest::Client` per replication. Every request
//! carries the replication's custom headers and its authenticator's
//! credentials. Requests made through [`RemoteDb::send_json`] are bounded by
//! a [`Bulkhead`] (default 5 in flight) so a large batch cannot open an
//! unbounded number of connections; the change feed bypasses it since it
//! holds one long-poll open at all times.
//!
//! Cancellation is by dropping: a request future dropped by a `select!`
//! against a shutdown signal aborts the underlying connection.
//!
//! URLs are logged through [`mask_credentials`] so user info embedded in a
//! remote URL never reaches the logs.

use crate::auth::{Authenticator, BasicAuthenticator};
use crate::config::ReplicationSettings;
use crate::error::{CoreError, Result};
use crate::resilience::Bulkhead;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

const USER_AGENT: &str = concat!("couchlite/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 512;

/// Builds the HTTP client a replication talks through.
///
/// The injection point for cookie and TLS policy.
pub trait HttpClientFactory: Send + Sync {
    fn build_client(&self, settings: &ReplicationSettings) -> Result<reqwest::Client>;
}

/// rustls, a per-client cookie store, and the configured connect timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClientFactory;

impl HttpClientFactory for DefaultClientFactory {
    fn build_client(&self, settings: &ReplicationSettings) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .connect_timeout(settings.connect_timeout())
            .build()
            .map_err(|e| CoreError::Config(format!("HTTP client: {e}")))
    }
}

/// Replace user info in a URL with `---:---`.
pub fn mask_credentials(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://---:---@{}", &url[..scheme_end], &rest[at + 1..]),
        None => url.to_string(),
    }
}

fn percent_decode(s: &str) -> String {
    fn hex_val(b: u8) -> Option<u8> {
        (b as char).to_digit(16).map(|d| d as u8)
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A remote database and the client used to reach it.
#[derive(Clone)]
pub struct RemoteDb {
    url: Url,
    masked: String,
    client: reqwest::Client,
    authenticator: Option<Arc<dyn Authenticator>>,
    headers: HeaderMap,
    bulkhead: Arc<Bulkhead>,
    request_timeout: Duration,
}

impl std::fmt::Debug for RemoteDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDb")
            .field("url", &self.masked)
            .field("authenticator", &self.authenticator)
            .finish_non_exhaustive()
    }
}

impl RemoteDb {
    /// Parse `url` and build a client for it.
    ///
    /// Credentials embedded in the URL become a [`BasicAuthenticator`] unless
    /// an explicit authenticator is given; either way they are stripped from
    /// the stored URL.
    pub fn new(
        url: &str,
        settings: &ReplicationSettings,
        factory: &dyn HttpClientFactory,
        authenticator: Option<Arc<dyn Authenticator>>,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut parsed = Url::parse(url)
            .map_err(|e| CoreError::Config(format!("Invalid remote URL {}: {e}", mask_credentials(url))))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CoreError::Config(format!(
                "Unsupported remote scheme: {}",
                parsed.scheme()
            )));
        }

        let mut authenticator = authenticator;
        if !parsed.username().is_empty() {
            if authenticator.is_none() {
                let username = percent_decode(parsed.username());
                let password = percent_decode(parsed.password().unwrap_or(""));
                authenticator = Some(Arc::new(BasicAuthenticator::new(username, password)));
            }
            // Infallible for http(s) URLs.
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
        }
        // Normalize to no trailing slash so joins are uniform.
        if parsed.path().len() > 1 && parsed.path().ends_with('/') {
            let trimmed = parsed.path().trim_end_matches('/').to_string();
            parsed.set_path(&trimmed);
        }

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CoreError::Config(format!("Invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CoreError::Config(format!("Invalid header value for {name}: {e}")))?;
            header_map.insert(name, value);
        }

        Ok(Self {
            masked: mask_credentials(parsed.as_str()),
            url: parsed,
            client: factory.build_client(settings)?,
            authenticator,
            headers: header_map,
            bulkhead: Arc::new(Bulkhead::new(settings.max_concurrent_requests)),
            request_timeout: settings.request_timeout(),
        })
    }

    /// Database URL without credentials.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Database URL safe for logs.
    pub fn masked_url(&self) -> &str {
        &self.masked
    }

    pub fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.authenticator.as_ref()
    }

    /// `relative` appended to the database URL (`_changes`, `/_session`, ...).
    pub fn url_for(&self, relative: &str) -> Result<Url> {
        let base = self.url.as_str().trim_end_matches('/');
        let relative = relative.trim_start_matches('/');
        Url::parse(&format!("{base}/{relative}"))
            .map_err(|e| CoreError::Config(format!("Invalid path {relative}: {e}")))
    }

    /// `path` at the server root, ignoring the database path.
    pub fn server_url_for(&self, path: &str) -> Result<Url> {
        let mut url = self.url.clone();
        url.set_path(path);
        url.set_query(None);
        Ok(url)
    }

    /// URL of a document, keeping the slash of `_design/` IDs.
    pub fn document_url(&self, doc_id: &str) -> Result<Url> {
        let mut url = self.url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| CoreError::Config("Remote URL cannot be a base".into()))?;
            segments.pop_if_empty();
            match doc_id.strip_prefix(crate::revision::DESIGN_DOC_PREFIX) {
                Some(name) => {
                    segments.push("_design").push(name);
                }
                None => {
                    segments.push(doc_id);
                }
            }
        }
        Ok(url)
    }

    /// A request with headers and credentials attached.
    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .headers(self.headers.clone())
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(auth) = &self.authenticator {
            builder = auth.authorize(builder);
        }
        builder
    }

    /// Send without the bulkhead and map error statuses.
    pub async fn execute(&self, request: RequestBuilder, operation: &str) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| CoreError::network(operation.to_string(), e))?;
        check_status(response).await
    }

    /// Send a JSON request through the bulkhead and decode the JSON reply.
    pub async fn send_json(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value> {
        let _permit = self
            .bulkhead
            .acquire()
            .await
            .map_err(|_| CoreError::Shutdown)?;
        let operation = format!("{} {}", method, url.path());
        trace!(remote = %self.masked, %operation, "Sending request");
        let mut request = self.request(method, url).timeout(self.request_timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self.execute(request, &operation).await?;
        let value = read_json(response).await?;
        debug!(remote = %self.masked, %operation, "Request complete");
        Ok(value)
    }

    pub async fn get_json(&self, relative: &str) -> Result<Value> {
        self.send_json(Method::GET, self.url_for(relative)?, None).await
    }

    pub async fn put_json(&self, relative: &str, body: &Value) -> Result<Value> {
        self.send_json(Method::PUT, self.url_for(relative)?, Some(body)).await
    }

    pub async fn post_json(&self, relative: &str, body: &Value) -> Result<Value> {
        self.send_json(Method::POST, self.url_for(relative)?, Some(body)).await
    }
}

/// Turn a non-success status into [`CoreError::RemoteProtocol`].
pub async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut text = response.text().await.unwrap_or_default();
    if text.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    Err(CoreError::status(status.as_u16(), text))
}

/// Decode a JSON body; an empty body reads as `null`.
pub async fn read_json(response: Response) -> Result<Value> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| CoreError::network("read body", e))?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| CoreError::malformed(format!("invalid JSON body: {e}")))
}
