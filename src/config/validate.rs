use anyhow::{bail, Result};

use super::Config;

/// Structural checks that don't require touching the filesystem or network —
/// malformed secrets, missing cert files, and unknown auther types surface
/// later when the collaborators that actually need those values are built,
/// but a domain with no upstreams or an upstream with neither proxy target
/// configured is caught here, up front.
pub fn validate(config: &Config) -> Result<()> {
    if config.domain.is_empty() {
        bail!("Domain cannot be empty");
    }

    if config.upstreams.is_empty() {
        bail!("Upstreams must configure at least one upstream");
    }

    for (name, spec) in &config.upstreams {
        if spec.url.is_none() && spec.websocket.is_none() {
            bail!("upstream {name:?} must configure at least one of URL or WebSocket");
        }
    }

    if config.auther_type_is_empty() {
        bail!("Auth.Type cannot be empty");
    }

    if config.tls.is_none() && config.acme.is_none() {
        bail!("either TLS or Acme must be configured");
    }

    Ok(())
}

impl Config {
    fn auther_type_is_empty(&self) -> bool {
        self.auth.auther_type.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::config::{AutherConfig, CookieConfig, UpstreamSpec};

    fn base_config() -> Config {
        let mut upstreams = HashMap::new();
        upstreams.insert(
            "svc".to_string(),
            UpstreamSpec {
                url: Some("http://127.0.0.1:8080".to_string()),
                websocket: None,
                auth: true,
                health_check: None,
                headers: HashMap::new(),
            },
        );

        Config {
            domain: "example.com".to_string(),
            upstreams,
            auth: AutherConfig {
                auther_type: "mock".to_string(),
                config: json!({}),
            },
            cookie: CookieConfig::default(),
            tls: Some(crate::config::TlsConfig {
                cert_file: "cert.pem".to_string(),
                cert_key: "key.pem".to_string(),
            }),
            acme: None,
        }
    }

    #[test]
    fn accepts_well_formed_config() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn rejects_upstream_with_no_proxy_target() {
        let mut config = base_config();
        config
            .upstreams
            .get_mut("svc")
            .unwrap()
            .url = None;

        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("must configure at least one of"));
    }

    #[test]
    fn rejects_missing_tls_and_acme() {
        let mut config = base_config();
        config.tls = None;

        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("TLS or Acme"));
    }
}
