use std::collections::BTreeMap;
use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Header names are lowercased; `BTreeMap` keeps serialization order stable.
///
/// Repeated response headers are joined with `", "`, except `set-cookie`
/// whose values are joined with `'\n'` (cookie dates contain commas).
pub type HeaderMap = BTreeMap<String, String>;

/// A request as it goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into().to_ascii_uppercase();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(normalize_header_name(name), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// The cache identity of a request: default and caller headers merged,
/// ignorable headers removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: String,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

#[derive(Serialize)]
struct CanonicalRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "is_get")]
    method: &'a str,
    headers: &'a HeaderMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
}

fn is_get(method: &&str) -> bool {
    method.eq_ignore_ascii_case("GET")
}

impl RequestDescriptor {
    /// Descriptor for a plain GET without headers.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Merge `defaults` with the caller's headers (caller wins), then drop
    /// every header named in `ignore`.
    ///
    /// Returns the wire request (ignored headers kept) and the descriptor.
    pub fn build(
        request: &OutboundRequest,
        defaults: &HeaderMap,
        ignore: &[String],
    ) -> (OutboundRequest, Self) {
        let mut headers: HeaderMap = defaults
            .iter()
            .map(|(k, v)| (normalize_header_name(k), v.clone()))
            .collect();
        for (name, value) in &request.headers {
            headers.insert(normalize_header_name(name), value.clone());
        }

        let wire = OutboundRequest {
            method: request.method.to_ascii_uppercase(),
            url: request.url.clone(),
            headers: headers.clone(),
            body: request.body.clone(),
        };

        for name in ignore {
            headers.remove(&normalize_header_name(name));
        }

        let descriptor = Self {
            method: wire.method.clone(),
            url: wire.url.clone(),
            headers,
            body: wire.body.clone(),
        };
        (wire, descriptor)
    }

    /// Order-stable serialization used as the cache key.
    pub fn canonical_key(&self) -> String {
        let canonical = CanonicalRequest {
            url: &self.url,
            method: &self.method,
            headers: &self.headers,
            body: self.body.as_deref(),
        };
        // Serializing strings and a string map cannot fail.
        serde_json::to_string(&canonical).unwrap_or_default()
    }
}

pub fn normalize_header_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Where a response body lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Bytes(Bytes),
    File(PathBuf),
}

impl ResponseBody {
    pub fn filepath(&self) -> Option<&PathBuf> {
        match self {
            ResponseBody::File(path) => Some(path),
            ResponseBody::Bytes(_) => None,
        }
    }
}

/// A persisted response record.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: i64,
    pub request_key: String,
    pub status: u16,
    pub response_headers: HeaderMap,
    pub body: ResponseBody,
    pub expires_on: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Valid iff there is no expiry or the expiry is not before `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on.is_none_or(|expires_on| expires_on >= now)
    }
}

/// DTO for inserting a new cache entry.
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub request_key: String,
    pub status: u16,
    pub response_headers: HeaderMap,
    pub body: ResponseBody,
    pub expires_on: Option<DateTime<Utc>>,
}

/// Pick the entry a lookup should return: among entries valid at `now`, the
/// highest `expires_on` wins, never-expiring entries sort last, and the newest
/// row breaks ties.
pub fn select_entry<'a>(
    entries: impl IntoIterator<Item = &'a CacheEntry>,
    now: DateTime<Utc>,
) -> Option<&'a CacheEntry> {
    entries
        .into_iter()
        .filter(|entry| entry.is_valid_at(now))
        .max_by(|a, b| {
            let rank = |e: &CacheEntry| (e.expires_on.is_some(), e.expires_on, e.id);
            rank(a).cmp(&rank(b))
        })
}

/// The result handed back to a fetch caller.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// True when served from the persistent cache without a network call.
    pub from_cache: bool,
}

/// A cookie parsed from a `set-cookie` response header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
}

impl Cookie {
    /// Parse one `set-cookie` header value (`name=value; Attr=...`).
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';').map(str::trim);
        let (name, value) = parts.next()?.split_once('=')?;
        if name.is_empty() {
            return None;
        }
        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: None,
            path: None,
        };
        for attribute in parts {
            let (key, val) = attribute.split_once('=').unwrap_or((attribute, ""));
            match key.to_ascii_lowercase().as_str() {
                "domain" => cookie.domain = Some(val.trim_start_matches('.').to_string()),
                "path" => cookie.path = Some(val.to_string()),
                _ => {}
            }
        }
        Some(cookie)
    }

    /// Parse every cookie from a response's `set-cookie` header.
    pub fn from_headers(headers: &HeaderMap) -> Vec<Self> {
        headers
            .get("set-cookie")
            .map(|raw| raw.lines().filter_map(Cookie::parse).collect())
            .unwrap_or_default()
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
