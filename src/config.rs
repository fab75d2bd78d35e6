//! Environment-variable configuration.
//!
//! There is no file-based config layer here: every setting comes from an
//! environment variable, parsed once at startup into `EdgeConfig`.

use std::time::Duration;

/// Env var names and defaults, reproduced from the original edge binary.
pub const ENV_LISTEN_ADDR: &str = "EDGE_LISTEN_ADDR";
pub const ENV_ORIGIN_URL: &str = "ORIGIN_URL";
pub const ENV_ORIGINS: &str = "ORIGINS";
pub const ENV_SHIELD_URL: &str = "SHIELD_URL";
pub const ENV_HASH_REPLICAS: &str = "HASH_REPLICAS";
pub const ENV_MAX_MEMORY_BYTES: &str = "EDGE_MAX_MEMORY_BYTES";
pub const ENV_DISK_CACHE_DIR: &str = "EDGE_DISK_CACHE_DIR";
pub const ENV_DISK_CACHE_MAX_BYTES: &str = "EDGE_DISK_CACHE_MAX_BYTES";
pub const ENV_UPSTREAM_TIMEOUT_SEC: &str = "UPSTREAM_TIMEOUT_SEC";
pub const ENV_UPSTREAM_INSECURE_TLS: &str = "UPSTREAM_INSECURE_TLS";
pub const ENV_TLS_CERT_FILE: &str = "EDGE_TLS_CERT_FILE";
pub const ENV_TLS_KEY_FILE: &str = "EDGE_TLS_KEY_FILE";
pub const ENV_EVICTION_POLICY: &str = "EDGE_EVICTION_POLICY";

const DEFAULT_LISTEN_ADDR: &str = ":8080";
const DEFAULT_ORIGIN_URL: &str = "http://localhost:8081";
const DEFAULT_HASH_REPLICAS: usize = 100;
const DEFAULT_MAX_MEMORY_BYTES: u64 = 128 * 1024 * 1024;
const DEFAULT_DISK_CACHE_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_UPSTREAM_TIMEOUT_SEC: u64 = 10;

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub listen_addr: String,
    pub origin_url: String,
    pub origins: Vec<String>,
    pub shield_url: Option<String>,
    pub hash_replicas: usize,
    pub max_memory_bytes: u64,
    pub disk_cache_dir: Option<String>,
    pub disk_cache_max_bytes: u64,
    pub upstream_timeout: Duration,
    pub upstream_insecure_tls: bool,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    pub eviction_policy_lfu: bool,
}

impl EdgeConfig {
    /// Loads configuration from the process environment, falling back to
    /// the documented defaults for anything absent or unparseable.
    pub fn load_from_env() -> Self {
        Self {
            listen_addr: get_env(ENV_LISTEN_ADDR, DEFAULT_LISTEN_ADDR),
            origin_url: get_env(ENV_ORIGIN_URL, DEFAULT_ORIGIN_URL),
            origins: split_csv(&get_env(ENV_ORIGINS, "")),
            shield_url: non_empty(get_env(ENV_SHIELD_URL, "")),
            hash_replicas: get_env_usize(ENV_HASH_REPLICAS, DEFAULT_HASH_REPLICAS),
            max_memory_bytes: get_env_u64(ENV_MAX_MEMORY_BYTES, DEFAULT_MAX_MEMORY_BYTES),
            disk_cache_dir: non_empty(get_env(ENV_DISK_CACHE_DIR, "")),
            disk_cache_max_bytes: get_env_u64(
                ENV_DISK_CACHE_MAX_BYTES,
                DEFAULT_DISK_CACHE_MAX_BYTES,
            ),
            upstream_timeout: Duration::from_secs(get_env_u64(
                ENV_UPSTREAM_TIMEOUT_SEC,
                DEFAULT_UPSTREAM_TIMEOUT_SEC,
            )),
            upstream_insecure_tls: get_env_bool(ENV_UPSTREAM_INSECURE_TLS, false),
            tls_cert_file: non_empty(get_env(ENV_TLS_CERT_FILE, "")),
            tls_key_file: non_empty(get_env(ENV_TLS_KEY_FILE, "")),
            eviction_policy_lfu: get_env(ENV_EVICTION_POLICY, "").eq_ignore_ascii_case("lfu"),
        }
    }

    /// `true` if exactly one of the TLS cert/key env vars is set — the
    /// operator almost certainly meant to enable TLS and forgot the other.
    pub fn has_mismatched_tls_env(&self) -> bool {
        self.tls_cert_file.is_some() != self.tls_key_file.is_some()
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_file.is_some() && self.tls_key_file.is_some()
    }
}

fn get_env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn get_env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => {
            let lower = raw.trim().to_ascii_lowercase();
            match lower.as_str() {
                "1" | "true" | "yes" | "y" | "on" => true,
                "0" | "false" | "no" | "n" | "off" => false,
                _ => default,
            }
        }
        Err(_) => default,
    }
}

/// Trims each comma-separated part, drops empties, returns `vec![]` if
/// everything was empty.
fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_csv_trims_and_drops_empties() {
        assert_eq!(
            split_csv(" http://a , http://b ,, "),
            vec!["http://a".to_string(), "http://b".to_string()]
        );
        assert_eq!(split_csv(""), Vec::<String>::new());
        assert_eq!(split_csv(" , , "), Vec::<String>::new());
    }

    #[test]
    fn bool_parsing_recognizes_truthy_and_falsy_tokens() {
        std::env::set_var("EDGE_CACHE_TEST_BOOL", "YES");
        assert!(get_env_bool("EDGE_CACHE_TEST_BOOL", false));
        std::env::set_var("EDGE_CACHE_TEST_BOOL", "off");
        assert!(!get_env_bool("EDGE_CACHE_TEST_BOOL", true));
        std::env::set_var("EDGE_CACHE_TEST_BOOL", "not-a-bool");
        assert!(get_env_bool("EDGE_CACHE_TEST_BOOL", true));
        std::env::remove_var("EDGE_CACHE_TEST_BOOL");
    }

    #[test]
    fn mismatched_tls_env_detection() {
        let mut cfg = EdgeConfig::load_from_env();
        cfg.tls_cert_file = Some("cert.pem".to_string());
        cfg.tls_key_file = None;
        assert!(cfg.has_mismatched_tls_env());
        assert!(!cfg.tls_enabled());
    }
}
