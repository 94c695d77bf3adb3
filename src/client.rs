//! HTTP client seam.
//!
//! The engine talks to the target service through the [`HttpClient`] trait so
//! that tests and alternative transports can slot in. The reqwest-backed
//! implementation attaches the owning session's cookies to every request and
//! enforces cookie attributes: `Secure` cookies are withheld from plaintext
//! requests.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::session::{CookieRecord, Session};

/// Transport-level failure, classified for logging and reporting.
///
/// The engine never retries these; they surface as failed samples and
/// failed checks so that repeated failures show up as threshold breaches.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("transport failure: {0}")]
    Other(String),
}

impl ClientError {
    /// Short label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Timeout(_) => "timeout",
            ClientError::Connect(_) => "connect",
            ClientError::Tls(_) => "tls",
            ClientError::Other(_) => "transport",
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        let message = error.to_string();
        if error.is_timeout() {
            ClientError::Timeout(message)
        } else if error.is_connect() {
            ClientError::Connect(message)
        } else {
            let lower = message.to_lowercase();
            if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
                ClientError::Tls(message)
            } else {
                ClientError::Other(message)
            }
        }
    }
}

/// A completed HTTP exchange with typed accessors.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Cookies parsed from `Set-Cookie`, keyed by cookie name. A server may
    /// set the same name more than once, hence the list.
    pub cookies: HashMap<String, Vec<CookieRecord>>,
    pub body: Vec<u8>,
    pub elapsed: Duration,
    json: OnceLock<Option<Value>>,
}

impl HttpResponse {
    pub fn new(
        status: u16,
        headers: HashMap<String, String>,
        cookies: HashMap<String, Vec<CookieRecord>>,
        body: Vec<u8>,
        elapsed: Duration,
    ) -> Self {
        Self {
            status,
            headers,
            cookies,
            body,
            elapsed,
            json: OnceLock::new(),
        }
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// JSON view of the body, parsed on first access. `None` if the body is
    /// not valid JSON.
    pub fn json(&self) -> Option<&Value> {
        self.json
            .get_or_init(|| serde_json::from_slice(&self.body).ok())
            .as_ref()
    }

    /// First record for a cookie name set by this response.
    pub fn cookie(&self, name: &str) -> Option<&CookieRecord> {
        self.cookies.get(name).and_then(|records| records.first())
    }

    /// Failed in the sample sense: 4xx/5xx counts against `rate` thresholds.
    pub fn is_failure(&self) -> bool {
        self.status >= 400
    }
}

/// Transport abstraction used by steps. The session is read-only here; the
/// set of cookies to send is derived from it, and response cookies flow back
/// into the session at the step-context layer.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        session: &Session,
    ) -> Result<HttpResponse, ClientError>;

    async fn post(
        &self,
        url: &str,
        body: Option<String>,
        headers: &[(String, String)],
        session: &Session,
    ) -> Result<HttpResponse, ClientError>;
}

/// reqwest-backed [`HttpClient`].
///
/// Cookie management is deliberately manual (no `cookie_store`): the
/// per-VU [`Session`] is the single source of truth for cookies, so that
/// explicit injection and inspection behave exactly like header-set cookies.
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Result<Self, ClientError> {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { inner })
    }

    async fn execute(
        &self,
        builder: reqwest::RequestBuilder,
        url: &str,
        headers: &[(String, String)],
        session: &Session,
    ) -> Result<HttpResponse, ClientError> {
        let mut builder = builder;
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(cookie_header) = cookie_header_for(url, session) {
            builder = builder.header(reqwest::header::COOKIE, cookie_header);
        }

        let started = Instant::now();
        let response = builder.send().await?;

        let status = response.status().as_u16();
        let mut header_map = HashMap::new();
        let mut cookies: HashMap<String, Vec<CookieRecord>> = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                if name.as_str() == "set-cookie" {
                    if let Some((cookie_name, record)) = CookieRecord::parse_set_cookie(value) {
                        cookies.entry(cookie_name).or_default().push(record);
                    }
                } else {
                    header_map.insert(name.as_str().to_string(), value.to_string());
                }
            }
        }

        let body = response.bytes().await?.to_vec();
        let elapsed = started.elapsed();

        debug!(
            url,
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            "request completed"
        );

        Ok(HttpResponse::new(status, header_map, cookies, body, elapsed))
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        session: &Session,
    ) -> Result<HttpResponse, ClientError> {
        self.execute(self.inner.get(url), url, headers, session)
            .await
    }

    async fn post(
        &self,
        url: &str,
        body: Option<String>,
        headers: &[(String, String)],
        session: &Session,
    ) -> Result<HttpResponse, ClientError> {
        let mut builder = self.inner.post(url);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        self.execute(builder, url, headers, session).await
    }
}

/// Host portion of a URL, without port.
pub fn url_host(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    authority.split(':').next().unwrap_or(authority)
}

/// Build the `Cookie` header for a request from the session jar.
///
/// Secure cookies are only sent over https; cookies with a domain attribute
/// are only sent to matching hosts.
fn cookie_header_for(url: &str, session: &Session) -> Option<String> {
    let https = url.starts_with("https://");
    let host = url_host(url);

    let pairs: Vec<String> = session
        .cookies()
        .filter(|(_, record)| record.domain_matches(host))
        .filter(|(_, record)| https || !record.attrs.secure)
        .map(|(name, record)| format!("{}={}", name, record.value))
        .collect();

    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}
