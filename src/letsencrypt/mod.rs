//! Automatic certificate issuance via the ACME HTTP-01 challenge, and the
//! small in-memory challenge store the port-80 listener reads from to answer
//! `/.well-known/acme-challenge/<token>` requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use acme_v2::persist::FilePersist;
use acme_v2::{Directory, DirectoryUrl};
use anyhow::{Context, Result};
use async_trait::async_trait;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use pingora::server::{ListenFds, ShutdownWatch};
use pingora::services::Service;
use tokio::sync::RwLock;
use tokio::time;

use crate::config::AcmeConfig;
use crate::proxy_server::cert_store::{CertBundle, CertStore};

/// How many days before expiry a renewal is attempted.
const RENEW_WITHIN_DAYS: i64 = 30;
const RENEW_CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Token -> proof pairs for outstanding HTTP-01 challenges, shared between
/// the ACME service (writer) and the plaintext-HTTP listener (reader).
#[derive(Clone, Default)]
pub struct ChallengeStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, proof: String) {
        self.inner.write().await.insert(token, proof);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }
}

fn parse_bundle(domain: &str, cert_pem: &str, key_pem: &str) -> Result<CertBundle> {
    let end = "-----END CERTIFICATE-----";
    let split = cert_pem
        .split_inclusive(end)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    let leaf_pem = split
        .first()
        .with_context(|| format!("certificate for {domain} is empty"))?;
    let leaf = X509::from_pem(leaf_pem.as_bytes())?;
    let chain = split[1..]
        .iter()
        .map(|pem| X509::from_pem(pem.as_bytes()).map_err(anyhow::Error::from))
        .collect::<Result<Vec<_>>>()?;
    let key: PKey<Private> = PKey::private_key_from_pem(key_pem.as_bytes())?;

    Ok(CertBundle { leaf, key, chain })
}

/// Background service that obtains and renews the certificate for the
/// configured domain (and its `oauth.`/`health.` siblings, which the
/// registered order must also cover since every host shares one leaf cert).
pub struct AcmeService {
    domain: String,
    config: AcmeConfig,
    cert_store: CertStore,
    challenges: ChallengeStore,
}

impl AcmeService {
    pub fn new(
        domain: String,
        config: AcmeConfig,
        cert_store: CertStore,
        challenges: ChallengeStore,
    ) -> Self {
        Self {
            domain,
            config,
            cert_store,
            challenges,
        }
    }

    fn directory_url(&self) -> DirectoryUrl {
        if self.config.staging {
            DirectoryUrl::LetsEncryptStaging
        } else {
            DirectoryUrl::LetsEncrypt
        }
    }

    async fn handle_http01_challenge(&self, order: &mut acme_v2::order::NewOrder<FilePersist>) -> Result<()> {
        for auth in order.authorizations()? {
            let challenge = auth.http_challenge();
            tracing::info!(domain = auth.domain_name(), "starting HTTP-01 challenge");

            self.challenges
                .set(
                    challenge.http_token().to_string(),
                    challenge.http_proof().to_string(),
                )
                .await;

            challenge.validate(5000)?;
        }
        Ok(())
    }

    async fn issue_or_renew(&self) -> Result<()> {
        let persist_dir = std::path::Path::new(&self.config.cache_dir).join(if self.config.staging {
            "staging"
        } else {
            "production"
        });
        tokio::fs::create_dir_all(&persist_dir)
            .await
            .with_context(|| format!("creating ACME persistence dir {}", persist_dir.display()))?;

        let persist = FilePersist::new(persist_dir);
        let directory = Directory::from_url(persist, self.directory_url())
            .context("connecting to ACME directory")?;
        let account = directory
            .account(&self.config.email)
            .context("registering or loading ACME account")?;

        if let Ok(Some(cert)) = account.certificate(&self.domain) {
            if cert.valid_days_left() > RENEW_WITHIN_DAYS {
                let bundle = parse_bundle(&self.domain, cert.certificate(), cert.private_key())?;
                self.cert_store.set(bundle).await;
                return Ok(());
            }
        }

        let mut order = account
            .new_order(&self.domain, &[])
            .with_context(|| format!("creating ACME order for {}", self.domain))?;

        let csr = loop {
            if let Some(csr) = order.confirm_validations() {
                break csr;
            }
            self.handle_http01_challenge(&mut order).await?;
            order.refresh().unwrap_or_default();
        };

        let pkey = acme_v2::create_p384_key();
        let order_cert = csr
            .finalize_pkey(pkey, 5000)
            .context("finalizing ACME order")?;
        let cert = order_cert
            .download_and_save_cert()
            .context("downloading issued certificate")?;

        let bundle = parse_bundle(&self.domain, cert.certificate(), cert.private_key())?;
        self.cert_store.set(bundle).await;
        tracing::info!(domain = %self.domain, "installed certificate from ACME");
        Ok(())
    }
}

#[async_trait]
impl Service for AcmeService {
    async fn start_service(
        &mut self,
        _fds: Option<ListenFds>,
        mut shutdown: ShutdownWatch,
        _listeners_per_fd: usize,
    ) {
        if let Err(err) = self.issue_or_renew().await {
            tracing::error!(%err, "initial certificate issuance failed");
        }

        let mut interval = time::interval(RENEW_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.issue_or_renew().await {
                        tracing::error!(%err, "certificate renewal check failed");
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "acme_service"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

/// Loads a static certificate/key pair from disk once at startup, for
/// deployments that provide their own certificate instead of ACME.
pub async fn load_static_bundle(cert_file: &str, key_file: &str) -> Result<CertBundle> {
    let cert_pem = tokio::fs::read_to_string(cert_file)
        .await
        .with_context(|| format!("reading certificate file {cert_file}"))?;
    let key_pem = tokio::fs::read_to_string(key_file)
        .await
        .with_context(|| format!("reading key file {key_file}"))?;
    parse_bundle(cert_file, &cert_pem, &key_pem)
}
