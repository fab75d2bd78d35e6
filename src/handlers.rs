//! The request handler: the state machine that ties the cache tiers,
//! freshness engine, coalescer, and origin dispatcher together.
//!
//! Mirrors the original edge binary's `ServeHTTP`: method gate, cache-key
//! computation, memory → disk → (range bypass) → coalescer → origin, with
//! conditional revalidation and Vary-aware store-key recomputation.

use crate::cache::{CacheEntry, MemoryCache};
use crate::coalesce::{AcquireResult, RequestCoalescer};
use crate::disk::DiskCache;
use crate::error::EdgeError;
use crate::freshness;
use crate::origin::{ConditionalHeaders, OriginDispatcher};
use crate::range;
use axum::{
    body::Body,
    extract::{OriginalUri, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of an origin fetch, tagged with the `X-Cache` status it should be
/// served with. Broadcast to coalesced waiters verbatim.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    status_code: u16,
    headers: HeaderMap,
    body: Bytes,
    cache_status: &'static str,
}

#[derive(Clone)]
pub struct AppState {
    pub memory: Arc<MemoryCache>,
    pub disk: Option<Arc<DiskCache>>,
    pub dispatcher: Arc<OriginDispatcher>,
    pub coalescer: RequestCoalescer<FetchOutcome>,
}

/// The single catch-all route handler, equivalent to the original binary's
/// `http.HandleFunc("/", proxy.ServeHTTP)`.
pub async fn cdn_handler(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return serve_no_cache(&state, &method, &uri, &headers, Some(body)).await;
    }

    let base_key = freshness::base_key(method.as_str(), &uri.to_string());
    let key = state.memory.lookup_key(&base_key, &headers);

    if let Some(entry) = state.memory.get(&key) {
        debug!(%key, "memory cache hit");
        return serve_cached_entry(&entry, "HIT", &method, &headers);
    }

    if let Some(disk) = &state.disk {
        if let Some(entry) = disk.get(&key) {
            debug!(%key, "disk cache hit, promoting to memory");
            state.memory.set(&key, entry.clone());
            return serve_cached_entry(&entry, "HIT-DISK", &method, &headers);
        }
    }

    if headers.contains_key(http::header::RANGE) {
        // Never cache partial-object responses; go straight to origin.
        return serve_no_cache(&state, &method, &uri, &headers, Some(body)).await;
    }

    match state.coalescer.try_acquire(&key) {
        AcquireResult::Fetch(guard) => {
            // Re-check under the coalescer lock: another request may have
            // populated the cache between our miss above and acquiring the
            // fetch lock.
            if let Some(entry) = state.memory.get(&key) {
                let response = serve_cached_entry(&entry, "HIT", &method, &headers);
                guard.complete(FetchOutcome {
                    status_code: entry.status_code,
                    headers: entry.headers.clone(),
                    body: entry.body.clone(),
                    cache_status: "HIT",
                });
                return response;
            }

            let stale = state.memory.get_stale(&key);
            match fetch_from_origin(&state, &base_key, &key, &method, &uri, &headers, stale.as_ref()).await {
                Ok(outcome) => {
                    let response =
                        build_response(outcome.status_code, &outcome.headers, outcome.body.clone(), outcome.cache_status, &method, &headers);
                    guard.complete(outcome);
                    response
                }
                Err(err) => {
                    warn!(%key, error = %err, "origin fetch failed");
                    guard.complete_error(err.to_string());
                    err.into_response()
                }
            }
        }
        AcquireResult::Wait(mut receiver) => match receiver.recv().await {
            Ok(Ok(outcome)) => build_response(
                outcome.status_code,
                &outcome.headers,
                outcome.body,
                outcome.cache_status,
                &method,
                &headers,
            ),
            Ok(Err(message)) => EdgeError::BadGateway(message).into_response(),
            Err(_) => EdgeError::BadGateway("coalesced fetch lagged".to_string()).into_response(),
        },
    }
}

async fn fetch_from_origin(
    state: &AppState,
    base_key: &str,
    key: &str,
    method: &Method,
    uri: &axum::http::Uri,
    client_headers: &HeaderMap,
    stale: Option<&CacheEntry>,
) -> Result<FetchOutcome, EdgeError> {
    let upstream = state.dispatcher.choose_upstream(key).to_string();
    let conditional = stale.map(|entry| ConditionalHeaders {
        etag: entry.etag.clone(),
        last_modified: entry.last_modified.clone(),
    });

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let origin_response = state
        .dispatcher
        .fetch(&upstream, method, path_and_query, client_headers, conditional.as_ref(), None)
        .await?;

    if origin_response.is_not_modified() {
        if let Some(stale) = stale {
            let ttl = freshness::compute_ttl(&origin_response.headers);
            let mut entry = stale.clone();
            if ttl > Duration::ZERO {
                entry.expires_at = Instant::now() + ttl;
                if let Some(etag) = origin_response.headers.get(http::header::ETAG) {
                    entry.etag = etag.to_str().ok().map(str::to_string);
                }
                if let Some(lm) = origin_response.headers.get(http::header::LAST_MODIFIED) {
                    entry.last_modified = lm.to_str().ok().map(str::to_string);
                }
                state.memory.set(key, entry.clone());
                if let Some(disk) = &state.disk {
                    disk.set(key, &entry);
                }
            }
            return Ok(FetchOutcome {
                status_code: entry.status_code,
                headers: entry.headers.clone(),
                body: entry.body.clone(),
                cache_status: "REVALIDATED",
            });
        }
    }

    let ttl = freshness::compute_ttl(&origin_response.headers);
    let mut cache_status = "BYPASS";

    if ttl > Duration::ZERO && state.memory.update_vary(base_key, &origin_response.headers) {
        // Recompute the store key after registering Vary: another request
        // may race this one and see a different key momentarily, which is
        // tolerated (see DESIGN.md).
        let store_key = state.memory.lookup_key(base_key, client_headers);
        let entry = CacheEntry {
            body: origin_response.body.clone(),
            headers: origin_response.headers.clone(),
            status_code: origin_response.status_code,
            created_at: Instant::now(),
            expires_at: Instant::now() + ttl,
            etag: header_str(&origin_response.headers, http::header::ETAG),
            last_modified: header_str(&origin_response.headers, http::header::LAST_MODIFIED),
            size_bytes: 0,
        };
        state.memory.set(&store_key, entry.clone());
        if let Some(disk) = &state.disk {
            disk.set(&store_key, &entry);
        }
        cache_status = "MISS";
    }

    Ok(FetchOutcome {
        status_code: origin_response.status_code,
        headers: origin_response.headers,
        body: origin_response.body,
        cache_status,
    })
}

async fn serve_no_cache(
    state: &AppState,
    method: &Method,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: Option<Bytes>,
) -> Response {
    let key = freshness::base_key(method.as_str(), &uri.to_string());
    let upstream = state.dispatcher.choose_upstream(&key).to_string();
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    match state.dispatcher.fetch(&upstream, method, path_and_query, headers, None, body).await {
        Ok(response) => {
            let cache_status = if headers.contains_key(http::header::RANGE) {
                "MISS-RANGE"
            } else {
                "BYPASS"
            };
            build_response(response.status_code, &response.headers, response.body, cache_status, method, headers)
        }
        Err(err) => err.into_response(),
    }
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn serve_cached_entry(entry: &CacheEntry, cache_status: &'static str, method: &Method, request_headers: &HeaderMap) -> Response {
    build_response(
        entry.status_code,
        &entry.headers,
        entry.body.clone(),
        cache_status,
        method,
        request_headers,
    )
}

/// Builds the final response, applying `Accept-Ranges`/`X-Cache` and range
/// slicing per the original `writeResponseWithRange`.
///
/// Headers are assembled into a `HeaderMap` and written wholesale rather
/// than through `Builder::header` (which appends): `Content-Length` and
/// `Content-Range` must *replace* whatever the cached/upstream headers
/// carried, or a satisfied range would leave two conflicting
/// `Content-Length` values on the wire.
fn build_response(
    status_code: u16,
    headers: &HeaderMap,
    body: Bytes,
    cache_status: &'static str,
    method: &Method,
    request_headers: &HeaderMap,
) -> Response {
    let mut response_headers = HeaderMap::with_capacity(headers.len() + 2);
    for (name, value) in headers.iter() {
        response_headers.append(name, value.clone());
    }
    response_headers.insert(http::header::ACCEPT_RANGES, http::HeaderValue::from_static("bytes"));
    response_headers.insert(
        http::header::HeaderName::from_static("x-cache"),
        http::HeaderValue::from_str(cache_status).unwrap(),
    );

    if method == Method::HEAD {
        return respond(status_code, response_headers, Body::empty());
    }

    let range_header = request_headers
        .get(http::header::RANGE)
        .and_then(|v| v.to_str().ok());

    let no_range_path = range_header.is_none() || status_code != 200 || body.is_empty();
    if no_range_path {
        return respond(status_code, response_headers, Body::from(body));
    }

    let raw_range = range_header.unwrap();
    match range::parse_single_byte_range(raw_range, body.len() as u64) {
        Ok(byte_range) => {
            let sliced = range::extract_range(&body, &byte_range);
            response_headers.insert(
                http::header::CONTENT_RANGE,
                http::HeaderValue::from_str(&byte_range.content_range_header(body.len() as u64)).unwrap(),
            );
            response_headers.insert(
                http::header::CONTENT_LENGTH,
                http::HeaderValue::from_str(&sliced.len().to_string()).unwrap(),
            );
            respond(StatusCode::PARTIAL_CONTENT.as_u16(), response_headers, Body::from(sliced))
        }
        Err(()) => {
            response_headers.insert(
                http::header::CONTENT_RANGE,
                http::HeaderValue::from_str(&format!("bytes */{}", body.len())).unwrap(),
            );
            response_headers.remove(http::header::CONTENT_LENGTH);
            respond(StatusCode::RANGE_NOT_SATISFIABLE.as_u16(), response_headers, Body::empty())
        }
    }
}

/// Builds a response from a status code and a pre-assembled header map,
/// writing the headers wholesale so no header is ever duplicated by
/// `Builder::header`'s append semantics.
fn respond(status_code: u16, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::from_u16(status_code).unwrap_or(StatusCode::OK))
        .body(body)
        .unwrap();
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn entry(body: &str) -> CacheEntry {
        CacheEntry {
            body: Bytes::from(body.to_string()),
            headers: HeaderMap::new(),
            status_code: 200,
            created_at: Instant::now(),
            expires_at: Instant::now() + Duration::from_secs(60),
            etag: None,
            last_modified: None,
            size_bytes: 0,
        }
    }

    #[test]
    fn build_response_sets_x_cache_and_accept_ranges() {
        let response = build_response(200, &HeaderMap::new(), Bytes::from("hi"), "HIT", &Method::GET, &HeaderMap::new());
        assert_eq!(response.headers().get("x-cache").unwrap(), "HIT");
        assert_eq!(response.headers().get("accept-ranges").unwrap(), "bytes");
    }

    #[test]
    fn head_request_has_no_body_but_keeps_status() {
        let response = build_response(200, &HeaderMap::new(), Bytes::from("hi"), "HIT", &Method::HEAD, &HeaderMap::new());
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn range_request_serves_206() {
        let mut request_headers = HeaderMap::new();
        request_headers.insert(http::header::RANGE, HeaderValue::from_static("bytes=0-1"));
        let response = build_response(200, &HeaderMap::new(), Bytes::from("hello"), "HIT", &Method::GET, &request_headers);
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    }

    #[test]
    fn range_response_has_single_content_length_matching_the_slice() {
        // Cached headers carry the full body's Content-Length (11); a
        // satisfied range must replace it with the sliced length (5), not
        // append a second, conflicting value.
        let mut cached_headers = HeaderMap::new();
        cached_headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("11"));

        let mut request_headers = HeaderMap::new();
        request_headers.insert(http::header::RANGE, HeaderValue::from_static("bytes=0-4"));

        let response = build_response(200, &cached_headers, Bytes::from("hello world"), "HIT", &Method::GET, &request_headers);
        assert_eq!(response.headers().get_all(http::header::CONTENT_LENGTH).iter().count(), 1);
        assert_eq!(response.headers().get(http::header::CONTENT_LENGTH).unwrap(), "5");
    }

    #[test]
    fn invalid_range_serves_416() {
        let mut request_headers = HeaderMap::new();
        request_headers.insert(http::header::RANGE, HeaderValue::from_static("bytes=99-999"));
        let response = build_response(200, &HeaderMap::new(), Bytes::from("hello"), "HIT", &Method::GET, &request_headers);
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[test]
    fn serve_cached_entry_round_trips_body() {
        let e = entry("cached body");
        let response = serve_cached_entry(&e, "HIT", &Method::GET, &HeaderMap::new());
        assert_eq!(response.status(), StatusCode::OK);
    }
}
