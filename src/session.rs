//! Per-virtual-user session state.
//!
//! Each virtual user owns exactly one [`Session`]: a cookie jar keyed by
//! (domain, name) plus a cache of tokens extracted from responses (CSRF
//! token, auth token, ...). The session is mutated only by the steps of the
//! owning VU and is never shared across VUs.
//!
//! Cookie attributes are stored but not enforced here; enforcement (such as
//! withholding a `Secure` cookie on a plaintext request) is the HTTP
//! client's job.

use std::collections::HashMap;

/// SameSite policy carried on a cookie record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// Attributes stored alongside a cookie value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieAttributes {
    pub path: String,
    pub domain: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
}

impl Default for CookieAttributes {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            domain: String::new(),
            secure: false,
            http_only: false,
            same_site: SameSite::Lax,
        }
    }
}

/// A cookie value with its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieRecord {
    pub value: String,
    pub attrs: CookieAttributes,
}

impl CookieRecord {
    /// Parse a `Set-Cookie` header value into `(name, record)`.
    ///
    /// Returns `None` for malformed headers (no `name=value` pair).
    /// Unknown attributes are ignored.
    pub fn parse_set_cookie(header: &str) -> Option<(String, CookieRecord)> {
        let mut parts = header.split(';');

        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut attrs = CookieAttributes::default();
        for part in parts {
            let part = part.trim();
            let (key, val) = match part.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (part, ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "path" => attrs.path = val.to_string(),
                "domain" => attrs.domain = val.trim_start_matches('.').to_string(),
                "secure" => attrs.secure = true,
                "httponly" => attrs.http_only = true,
                "samesite" => {
                    attrs.same_site = match val.to_ascii_lowercase().as_str() {
                        "strict" => SameSite::Strict,
                        "none" => SameSite::None,
                        _ => SameSite::Lax,
                    }
                }
                _ => {}
            }
        }

        Some((
            name.to_string(),
            CookieRecord {
                value: value.trim().to_string(),
                attrs,
            },
        ))
    }

    /// True if this cookie should be sent to `host`.
    ///
    /// An empty stored domain matches any host (host-only cookies set by the
    /// owning session); otherwise the host must equal the domain or be a
    /// subdomain of it.
    pub fn domain_matches(&self, host: &str) -> bool {
        let domain = &self.attrs.domain;
        if domain.is_empty() {
            return true;
        }
        host == domain || host.ends_with(&format!(".{}", domain))
    }
}

/// Cookie jar and extracted-token cache for one virtual user.
#[derive(Debug, Default)]
pub struct Session {
    cookies: HashMap<(String, String), CookieRecord>,
    tokens: HashMap<String, String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or overwrite) a cookie for `(domain, name)`.
    ///
    /// This is also the injection point for explicit session cookies
    /// (a login token placed in the jar by a step rather than by a
    /// `Set-Cookie` header).
    pub fn set_cookie(&mut self, domain: &str, name: &str, value: &str, attrs: CookieAttributes) {
        self.cookies.insert(
            (domain.to_string(), name.to_string()),
            CookieRecord {
                value: value.to_string(),
                attrs,
            },
        );
    }

    /// Read a cookie value. Absent cookies yield `None`, never an error.
    pub fn get_cookie(&self, domain: &str, name: &str) -> Option<&str> {
        self.cookies
            .get(&(domain.to_string(), name.to_string()))
            .map(|record| record.value.as_str())
    }

    /// Full record access, mainly for attribute inspection in tests.
    pub fn cookie_record(&self, domain: &str, name: &str) -> Option<&CookieRecord> {
        self.cookies.get(&(domain.to_string(), name.to_string()))
    }

    /// Iterate all stored cookies as `(name, record)` pairs.
    pub fn cookies(&self) -> impl Iterator<Item = (&str, &CookieRecord)> {
        self.cookies
            .iter()
            .map(|((_, name), record)| (name.as_str(), record))
    }

    pub fn set_token(&mut self, key: &str, value: &str) {
        self.tokens.insert(key.to_string(), value.to_string());
    }

    /// Read a cached token. Absent tokens yield `None`; callers decide
    /// whether absence aborts the step sequence.
    pub fn get_token(&self, key: &str) -> Option<&str> {
        self.tokens.get(key).map(String::as_str)
    }
}
