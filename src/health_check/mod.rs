//! Concurrent fan-out health probing plus a certificate-validity check,
//! aggregated into a single JSON report.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;
use time::OffsetDateTime;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::UpstreamSpec;
use crate::proxy_server::cert_store::CertStore;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CERT_EXPIRES_SOON: Duration = Duration::from_secs(72 * 60 * 60);

static HEALTH_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(PROBE_TIMEOUT)
        .build()
        .expect("reqwest client builds with static configuration")
});

#[derive(Debug, Serialize)]
pub struct UpstreamHealth {
    pub response: String,
    pub latency_ms: u128,
}

#[derive(Debug, Serialize)]
pub struct CertHealth {
    pub ok: bool,
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_at: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub upstreams: HashMap<String, UpstreamHealth>,
    pub cert: CertHealth,
}

impl HealthReport {
    pub fn all_ok(&self) -> bool {
        self.cert.ok
            && self
                .upstreams
                .values()
                .all(|status| status.response.starts_with("200"))
    }
}

async fn probe_one(name: String, url: String) -> (String, UpstreamHealth) {
    let start = Instant::now();
    let response = HEALTH_CLIENT.get(&url).send().await;
    let latency_ms = start.elapsed().as_millis();

    let status = match response {
        Ok(resp) => UpstreamHealth {
            response: resp.status().to_string(),
            latency_ms,
        },
        Err(err) => UpstreamHealth {
            response: err.to_string(),
            latency_ms,
        },
    };

    (name, status)
}

/// Fans out a probe to every configured upstream concurrently and computes
/// certificate validity against `now`. There is no streaming: the report is
/// produced once every probe has returned, bounded by the 5-second client
/// timeout per probe.
pub async fn check(
    upstreams: &HashMap<String, UpstreamSpec>,
    cert_store: &CertStore,
    now: OffsetDateTime,
) -> HealthReport {
    let probes = upstreams.iter().filter_map(|(name, spec)| {
        spec.health_check_url()
            .map(|url| probe_one(name.clone(), url.to_string()))
    });

    let results = futures_util_join_all(probes).await;
    let upstreams = results.into_iter().collect();

    let cert = cert_validity(cert_store, now).await;

    HealthReport { upstreams, cert }
}

/// Minimal stand-in for `futures::future::join_all` so the crate doesn't
/// need the full `futures` dependency for one call site.
async fn futures_util_join_all<F: std::future::Future>(
    iter: impl Iterator<Item = F>,
) -> Vec<F::Output> {
    let handles: Vec<_> = iter.collect();
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await);
    }
    results
}

async fn cert_validity(cert_store: &CertStore, now: OffsetDateTime) -> CertHealth {
    let Some(bundle) = cert_store.current().await else {
        return CertHealth {
            ok: false,
            expires_at: None,
            error: Some("no certificate loaded".to_string()),
            expires_in: None,
            valid_at: None,
        };
    };

    let der = match bundle.leaf.to_der() {
        Ok(der) => der,
        Err(err) => {
            return CertHealth {
                ok: false,
                expires_at: None,
                error: Some(err.to_string()),
                expires_in: None,
                valid_at: None,
            }
        }
    };

    let cert = match X509Certificate::from_der(&der) {
        Ok((_, cert)) => cert,
        Err(err) => {
            return CertHealth {
                ok: false,
                expires_at: None,
                error: Some(err.to_string()),
                expires_in: None,
                valid_at: None,
            }
        }
    };

    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();
    let now_ts = now.unix_timestamp();

    let expires_at = Some(not_after);
    let expires_in = Some(not_after - now_ts);

    if now_ts < not_before {
        return CertHealth {
            ok: false,
            expires_at,
            error: Some("not yet valid".to_string()),
            expires_in,
            valid_at: Some(not_before),
        };
    }

    if now_ts >= not_after {
        return CertHealth {
            ok: false,
            expires_at,
            error: Some("expired".to_string()),
            expires_in,
            valid_at: None,
        };
    }

    if now_ts >= not_after - CERT_EXPIRES_SOON.as_secs() as i64 {
        return CertHealth {
            ok: false,
            expires_at,
            error: Some("expires soon".to_string()),
            expires_in,
            valid_at: None,
        };
    }

    CertHealth {
        ok: true,
        expires_at,
        error: None,
        expires_in,
        valid_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_ok_reflects_cert_and_upstream_status() {
        let mut upstreams = HashMap::new();
        upstreams.insert(
            "svc".to_string(),
            UpstreamHealth {
                response: "200 OK".to_string(),
                latency_ms: 12,
            },
        );

        let healthy = HealthReport {
            upstreams,
            cert: CertHealth {
                ok: true,
                expires_at: Some(0),
                error: None,
                expires_in: None,
                valid_at: None,
            },
        };
        assert!(healthy.all_ok());
    }
}
