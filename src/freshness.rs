//! HTTP freshness engine: `Cache-Control`/`Expires`/`Age` parsing, TTL
//! computation, and `Vary`-aware cache-key construction.

use http::HeaderMap;
use std::collections::HashMap;
use std::time::Duration;

/// Parsed `Cache-Control` directives relevant to freshness computation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheControlDirectives {
    pub no_store: bool,
    pub no_cache: bool,
    pub max_age: Option<i64>,
    pub s_maxage: Option<i64>,
}

/// Splits a `Cache-Control` value on unquoted, unescaped commas.
///
/// Directive values may be quoted strings containing commas (e.g.
/// `no-cache="Set-Cookie"`); those commas must not split the list. A
/// backslash inside a quoted string escapes the following character.
fn split_directives(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '\\' if in_quotes => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' if !in_quotes => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn unquote(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        trimmed.to_string()
    }
}

/// Parses every `Cache-Control` header value present (there may be more than
/// one occurrence). Duplicate `max-age`/`s-maxage` directives keep the
/// **minimum** value seen, matching the original edge binary.
pub fn parse_cache_control(values: impl Iterator<Item = String>) -> CacheControlDirectives {
    let mut directives = CacheControlDirectives::default();

    for raw in values {
        for part in split_directives(&raw) {
            let (name, value) = match part.split_once('=') {
                Some((n, v)) => (n.trim().to_ascii_lowercase(), Some(unquote(v))),
                None => (part.trim().to_ascii_lowercase(), None),
            };

            match name.as_str() {
                "no-store" => directives.no_store = true,
                "no-cache" => directives.no_cache = true,
                "max-age" => {
                    if let Some(seconds) = value.and_then(|v| v.parse::<i64>().ok()).filter(|&s| s >= 0) {
                        directives.max_age = Some(match directives.max_age {
                            Some(current) if current <= seconds => current,
                            _ => seconds,
                        });
                    }
                }
                "s-maxage" => {
                    if let Some(seconds) = value.and_then(|v| v.parse::<i64>().ok()).filter(|&s| s >= 0) {
                        directives.s_maxage = Some(match directives.s_maxage {
                            Some(current) if current <= seconds => current,
                            _ => seconds,
                        });
                    }
                }
                _ => {}
            }
        }
    }

    directives
}

fn parse_age_header(headers: &HeaderMap) -> i64 {
    headers
        .get(http::header::AGE)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|&v| v >= 0)
        .unwrap_or(0)
}

/// Computes the freshness lifetime of a response as a TTL, per spec.md §4.1:
/// `no-store`/`no-cache` force zero; otherwise `s-maxage` wins over
/// `max-age`, falling back to `Expires - Date` (or `Expires - now` if no
/// `Date` header is present); the `Age` header is then subtracted; the
/// result floors at zero.
pub fn compute_ttl(headers: &HeaderMap) -> Duration {
    let cache_control_values = headers
        .get_all(http::header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string));
    let directives = parse_cache_control(cache_control_values);

    if directives.no_store || directives.no_cache {
        return Duration::ZERO;
    }

    let mut freshness_seconds = if let Some(s) = directives.s_maxage {
        s
    } else if let Some(m) = directives.max_age {
        m
    } else {
        let now = headers
            .get(http::header::DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .unwrap_or_else(std::time::SystemTime::now);

        headers
            .get(http::header::EXPIRES)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .map(|expires| {
                expires
                    .duration_since(now)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    };

    if freshness_seconds <= 0 {
        return Duration::ZERO;
    }

    freshness_seconds -= parse_age_header(headers);
    if freshness_seconds <= 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(freshness_seconds as u64)
    }
}

/// Parses every `Vary` header value present. Returns `None` if any value
/// contains `*` (the response is then never cacheable). Names are
/// lowercased, trimmed, and de-duplicated preserving first-seen order.
pub fn parse_vary_headers(headers: &HeaderMap) -> Option<Vec<String>> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();

    for value in headers.get_all(http::header::VARY).iter() {
        let Ok(value) = value.to_str() else { continue };
        for part in value.split(',') {
            let name = part.trim().to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            if name == "*" {
                return None;
            }
            if seen.insert(name.clone()) {
                result.push(name);
            }
        }
    }

    Some(result)
}

/// The Vary-independent base key: `METHOD:uri`.
pub fn base_key(method: &str, uri: &str) -> String {
    format!("{method}:{uri}")
}

/// Appends Vary-selected request header values, in registration order, to a
/// base key: `base|name=value` per registered header.
pub fn full_key(base_key: &str, vary_headers: &[String], request_headers: &HeaderMap) -> String {
    let mut key = base_key.to_string();
    for header_name in vary_headers {
        let value = request_headers
            .get(header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim();
        key.push('|');
        key.push_str(header_name);
        key.push('=');
        key.push_str(value);
    }
    key
}

/// Mirrors `full_key` but reads request-header values from a plain map,
/// useful when only a subset of headers (e.g. from a stub) is available.
pub fn full_key_from_map(base_key: &str, vary_headers: &[String], values: &HashMap<String, String>) -> String {
    let mut key = base_key.to_string();
    for header_name in vary_headers {
        let value = values.get(header_name).map(String::as_str).unwrap_or("").trim();
        key.push('|');
        key.push_str(header_name);
        key.push('=');
        key.push_str(value);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn no_store_forces_zero_ttl() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        assert_eq!(compute_ttl(&headers), Duration::ZERO);
    }

    #[test]
    fn max_age_sets_ttl() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        assert_eq!(compute_ttl(&headers), Duration::from_secs(60));
    }

    #[test]
    fn s_maxage_wins_over_max_age() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("max-age=60, s-maxage=120"),
        );
        assert_eq!(compute_ttl(&headers), Duration::from_secs(120));
    }

    #[test]
    fn age_is_subtracted() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        headers.insert(http::header::AGE, HeaderValue::from_static("45"));
        assert_eq!(compute_ttl(&headers), Duration::from_secs(15));
    }

    #[test]
    fn duplicate_max_age_keeps_minimum() {
        let directives = parse_cache_control(
            vec!["max-age=100".to_string(), "max-age=10".to_string()].into_iter(),
        );
        assert_eq!(directives.max_age, Some(10));
    }

    #[test]
    fn quoted_value_with_comma_is_not_split() {
        let parts = split_directives(r#"no-cache="Set-Cookie, X-Foo", max-age=10"#);
        assert_eq!(parts, vec![r#"no-cache="Set-Cookie, X-Foo""#, "max-age=10"]);
    }

    #[test]
    fn vary_star_disables_caching() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::VARY, HeaderValue::from_static("Accept-Encoding, *"));
        assert_eq!(parse_vary_headers(&headers), None);
    }

    #[test]
    fn vary_dedupes_preserving_order() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::VARY, HeaderValue::from_static("Accept-Encoding"));
        headers.append(http::header::VARY, HeaderValue::from_static("accept-encoding, Accept-Language"));
        assert_eq!(
            parse_vary_headers(&headers),
            Some(vec!["accept-encoding".to_string(), "accept-language".to_string()])
        );
    }

    #[test]
    fn full_key_appends_vary_selectors_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let key = full_key("GET:/x", &["accept-encoding".to_string()], &headers);
        assert_eq!(key, "GET:/x|accept-encoding=gzip");
    }
}
