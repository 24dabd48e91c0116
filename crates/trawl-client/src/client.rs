use std::net::IpAddr;
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::{Client, Method};
use trawl_core::error::AppError;
use trawl_core::models::{HeaderMap, OutboundRequest, normalize_header_name};
use trawl_core::traits::{HttpClient, HttpResponse};
use url::Url;

const USER_AGENT: &str = "trawl/0.1";

/// HTTP transport using reqwest.
///
/// Response bodies are streamed, so file-mode fetches never hold a whole
/// download in memory. Status codes are returned as-is; deciding which ones
/// are acceptable is the engine's job.
///
/// SSRF protection is **enabled** by default: requests to private/reserved
/// IP ranges are blocked. Use [`allow_private_urls`](Self::allow_private_urls)
/// when scraping hosts on a network you control.
#[derive(Clone)]
pub struct ReqwestClient {
    client: Client,
    timeout_secs: u64,
    ssrf_protection: bool,
}

impl ReqwestClient {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let timeout_secs = timeout.as_secs();
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs,
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    fn map_send_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::HttpError(e.to_string())
        }
    }
}

impl HttpClient for ReqwestClient {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, AppError> {
        if self.ssrf_protection {
            validate_url(&request.url).await?;
        }

        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| AppError::HttpError(format!("Invalid HTTP method '{}'", request.method)))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        tracing::debug!(url = %request.url, status, "Response received");

        let timeout_secs = self.timeout_secs;
        let body = response.bytes_stream().map_err(move |e| {
            if e.is_timeout() {
                AppError::Timeout(timeout_secs)
            } else {
                AppError::NetworkError(format!("Failed to read response body: {e}"))
            }
        });

        Ok(HttpResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

/// Flatten reqwest's multi-map into one value per lowercased name.
fn collect_headers(raw: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in raw {
        let name = normalize_header_name(name.as_str());
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        let separator = if name == "set-cookie" { "\n" } else { ", " };
        headers
            .entry(name)
            .and_modify(|existing: &mut String| {
                existing.push_str(separator);
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    headers
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::HttpError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::HttpError("URL has no host".to_string()))?;

    // IPv6 literals come back bracketed from host_str.
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::HttpError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    if let Some(blocked) = addrs.iter().find(|addr| is_private_ip(addr.ip())) {
        return Err(AppError::HttpError(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            blocked.ip()
        )));
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()           // 127.0.0.0/8
                || v4.is_private()     // 10/8, 172.16/12, 192.168/16
                || v4.is_link_local()  // 169.254.0.0/16
                || v4.is_unspecified() // 0.0.0.0
                || v4.is_broadcast()   // 255.255.255.255
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                // fc00::/7
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    #[test]
    fn test_private_ipv4() {
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("10.0.0.1".parse().unwrap()));
        assert!(is_private_ip("172.16.0.1".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("169.254.169.254".parse().unwrap()));
        assert!(is_private_ip("100.64.0.1".parse().unwrap()));
    }

    #[test]
    fn test_public_ipv4() {
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_private_ip("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn test_private_ipv6() {
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(is_private_ip("fd12::1".parse().unwrap()));
        assert!(is_private_ip("::ffff:10.1.2.3".parse().unwrap()));
        assert!(!is_private_ip("2001:4860:4860::8888".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_validate_url_rejects_private_literals() {
        for url in [
            "http://127.0.0.1/admin",
            "http://169.254.169.254/latest/meta-data/",
            "http://[::1]:8080/",
        ] {
            let err = validate_url(url).await.unwrap_err();
            assert!(err.to_string().contains("SSRF blocked"), "{url}: {err}");
        }
    }

    #[tokio::test]
    async fn test_validate_url_rejects_bad_scheme() {
        let err = validate_url("ftp://example.com/file").await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_validate_url_accepts_public_literal() {
        assert!(validate_url("https://8.8.8.8/").await.is_ok());
    }

    #[tokio::test]
    async fn test_ssrf_guard_blocks_before_sending() {
        let client = ReqwestClient::new().unwrap();
        let err = client
            .send(OutboundRequest::get("http://127.0.0.1:1/"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::HttpError(ref m) if m.contains("SSRF")));
    }

    #[tokio::test]
    async fn test_invalid_method_rejected() {
        let client = ReqwestClient::new().unwrap().allow_private_urls();
        let err = client
            .send(OutboundRequest::get("http://127.0.0.1:1/").with_method("BAD METHOD"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid HTTP method"));
    }

    #[test]
    fn test_collect_headers_joins_repeats() {
        let mut raw = reqwest::header::HeaderMap::new();
        raw.append(
            HeaderName::from_static("set-cookie"),
            HeaderValue::from_static("a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        raw.append(HeaderName::from_static("set-cookie"), HeaderValue::from_static("b=2"));
        raw.append(HeaderName::from_static("vary"), HeaderValue::from_static("accept"));
        raw.append(HeaderName::from_static("vary"), HeaderValue::from_static("origin"));
        raw.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/html"));

        let headers = collect_headers(&raw);
        assert_eq!(
            headers["set-cookie"],
            "a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT\nb=2"
        );
        assert_eq!(headers["vary"], "accept, origin");
        assert_eq!(headers["content-type"], "text/html");
    }
}
