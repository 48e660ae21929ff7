//! Loads and validates the JSON configuration document that describes the
//! parent domain, upstream table, identity provider, cookie secret, and TLS
//! certificate source.

mod validate;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

pub use validate::validate;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "Domain")]
    pub domain: String,

    #[serde(rename = "Upstreams")]
    pub upstreams: HashMap<String, UpstreamSpec>,

    #[serde(rename = "Auth")]
    pub auth: AutherConfig,

    #[serde(rename = "Cookie", default)]
    pub cookie: CookieConfig,

    #[serde(rename = "TLS")]
    pub tls: Option<TlsConfig>,

    #[serde(rename = "Acme")]
    pub acme: Option<AcmeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSpec {
    #[serde(rename = "URL")]
    pub url: Option<String>,

    #[serde(rename = "WebSocket")]
    pub websocket: Option<String>,

    #[serde(rename = "Auth", default)]
    pub auth: bool,

    #[serde(rename = "HealthCheck")]
    pub health_check: Option<String>,

    #[serde(rename = "Headers", default)]
    pub headers: HashMap<String, Vec<String>>,
}

impl UpstreamSpec {
    /// `health_check` defaults to `url` when not set explicitly.
    pub fn health_check_url(&self) -> Option<&str> {
        self.health_check
            .as_deref()
            .or(self.url.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutherConfig {
    #[serde(rename = "Type")]
    pub auther_type: String,

    #[serde(rename = "Config", default)]
    pub config: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CookieConfig {
    #[serde(rename = "Name")]
    pub name: Option<String>,

    #[serde(rename = "Secret")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(rename = "CertFile")]
    pub cert_file: String,

    #[serde(rename = "CertKey")]
    pub cert_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeConfig {
    #[serde(rename = "Email")]
    pub email: String,

    #[serde(rename = "Staging", default)]
    pub staging: bool,

    #[serde(rename = "CacheDir", default = "default_acme_cache_dir")]
    pub cache_dir: String,
}

fn default_acme_cache_dir() -> String {
    "./acme-cache".to_string()
}

/// Reads and parses the JSON configuration document at `path`.
pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config =
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

/// `_s<random int>`, matching the source's `sessionID()` helper. Only used
/// when `Cookie.Name` is absent from the configuration file.
pub fn default_cookie_name() -> String {
    let n: u64 = rand::thread_rng().gen();
    format!("_s{n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let raw = r#"{
            "Domain": "example.com",
            "Upstreams": {
                "svc": { "URL": "http://127.0.0.1:8080", "Auth": true }
            },
            "Auth": { "Type": "mock", "Config": { "User": "user" } },
            "Cookie": { "Name": "_s1", "Secret": "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e" },
            "TLS": { "CertFile": "cert.pem", "CertKey": "key.pem" }
        }"#;

        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.domain, "example.com");
        assert_eq!(config.upstreams.len(), 1);
        assert!(config.upstreams["svc"].auth);
        assert_eq!(
            config.upstreams["svc"].health_check_url(),
            Some("http://127.0.0.1:8080")
        );
    }

    #[test]
    fn default_cookie_name_has_expected_prefix() {
        assert!(default_cookie_name().starts_with("_s"));
    }
}
