//! Origin dispatch and fetching.
//!
//! Chooses which upstream to contact (shield → consistent-hash ring → first
//! configured origin → fallback origin URL) and performs the actual HTTP
//! fetch, including conditional-revalidation headers when a stale cached
//! entry is being revalidated.

use crate::error::EdgeError;
use crate::ring::HashRing;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A fetched (or revalidated) upstream response.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginResponse {
    pub fn is_not_modified(&self) -> bool {
        self.status_code == 304
    }
}

/// Request headers carried from the client, plus optional conditional
/// revalidators taken from a stale cache entry.
#[derive(Debug, Clone, Default)]
pub struct ConditionalHeaders {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Dispatches requests to the configured upstream set.
pub struct OriginDispatcher {
    client: Client,
    origins: Vec<String>,
    shield_url: Option<String>,
    origin_url: String,
    ring: Option<Arc<HashRing>>,
}

impl OriginDispatcher {
    pub fn new(
        origins: Vec<String>,
        shield_url: Option<String>,
        origin_url: String,
        ring: Option<Arc<HashRing>>,
        timeout: Duration,
        insecure_tls: bool,
    ) -> Result<Self, EdgeError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .map_err(|e| EdgeError::Internal(format!("failed to build upstream client: {e}")))?;

        info!(
            origins = origins.len(),
            ring = ring.is_some(),
            insecure_tls,
            "initialized origin dispatcher"
        );

        Ok(Self {
            client,
            origins,
            shield_url,
            origin_url,
            ring,
        })
    }

    /// Precedence: shield → ring (if non-empty) → first configured origin →
    /// the fallback origin URL.
    pub fn choose_upstream(&self, cache_key: &str) -> &str {
        if let Some(shield) = &self.shield_url {
            return shield;
        }
        if let Some(ring) = &self.ring {
            if !ring.is_empty() {
                let node = ring.get_node(cache_key);
                if !node.is_empty() {
                    return self
                        .origins
                        .iter()
                        .find(|o| o.as_str() == node)
                        .map(String::as_str)
                        .unwrap_or(&self.origin_url);
                }
            }
        }
        if let Some(first) = self.origins.first() {
            return first;
        }
        &self.origin_url
    }

    /// Performs the upstream fetch. `conditional` carries revalidators from
    /// a stale cache entry, if this is a revalidation attempt. `body` is
    /// forwarded verbatim (the cacheable GET/HEAD path never has one; the
    /// non-cache passthrough path does, e.g. a `POST`/`PUT`).
    pub async fn fetch(
        &self,
        upstream_base: &str,
        method: &Method,
        path_and_query: &str,
        request_headers: &HeaderMap,
        conditional: Option<&ConditionalHeaders>,
        body: Option<Bytes>,
    ) -> Result<OriginResponse, EdgeError> {
        let url = build_url(upstream_base, path_and_query);
        debug!(%url, %method, "fetching from origin");

        let mut builder = self.client.request(method.clone(), &url);

        for (name, value) in request_headers.iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        if let Some(cond) = conditional {
            if let Some(etag) = &cond.etag {
                builder = builder.header(http::header::IF_NONE_MATCH, etag);
            }
            if let Some(lm) = &cond.last_modified {
                builder = builder.header(http::header::IF_MODIFIED_SINCE, lm);
            }
        }

        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(%url, error = %e, "origin request failed");
            EdgeError::from(e)
        })?;

        let status_code = response.status().as_u16();
        let headers = convert_headers(response.headers());
        let body = response.bytes().await.map_err(EdgeError::from)?;

        Ok(OriginResponse {
            status_code,
            headers,
            body,
        })
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "host" | "keep-alive" | "proxy-authenticate" | "proxy-authorization"
            | "te" | "trailer" | "transfer-encoding" | "upgrade"
    )
}

fn convert_headers(src: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut dst = HeaderMap::with_capacity(src.len());
    for (name, value) in src.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            dst.append(name, value);
        }
    }
    dst
}

fn build_url(base: &str, path_and_query: &str) -> String {
    let base = base.trim_end_matches('/');
    if path_and_query.starts_with('/') {
        format!("{base}{path_and_query}")
    } else {
        format!("{base}/{path_and_query}")
    }
}
