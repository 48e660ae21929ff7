use std::sync::Arc;

use async_trait::async_trait;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use pingora::listeners::TlsAccept;
use pingora::tls::ext;
use pingora::tls::ssl::SslRef;
use tokio::sync::RwLock;

/// The certificate/key pair currently served to clients. A single pair
/// covers every host under the parent domain (`oauth.<domain>`,
/// `health.<domain>`, and each upstream subdomain all share one
/// certificate), so unlike a multi-tenant proxy there is no per-SNI lookup
/// — only a single slot that the bootstrapper fills at startup and the ACME
/// renewal loop replaces in place.
#[derive(Clone)]
pub struct CertBundle {
    pub leaf: X509,
    pub key: PKey<Private>,
    pub chain: Vec<X509>,
}

#[derive(Clone)]
pub struct CertStore {
    current: Arc<RwLock<Option<CertBundle>>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn set(&self, bundle: CertBundle) {
        *self.current.write().await = Some(bundle);
    }

    pub async fn current(&self) -> Option<CertBundle> {
        self.current.read().await.clone()
    }
}

impl Default for CertStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TlsAccept for CertStore {
    async fn certificate_callback(&self, ssl: &mut SslRef) {
        let Some(bundle) = self.current().await else {
            tracing::error!("TLS handshake attempted before a certificate was loaded");
            return;
        };

        if let Err(err) = ext::ssl_use_private_key(ssl, &bundle.key) {
            tracing::error!(%err, "failed to install TLS private key");
            return;
        }
        if let Err(err) = ext::ssl_use_certificate(ssl, &bundle.leaf) {
            tracing::error!(%err, "failed to install TLS leaf certificate");
            return;
        }
        for cert in &bundle.chain {
            if let Err(err) = ext::ssl_add_chain_cert(ssl, cert) {
                tracing::error!(%err, "failed to install TLS chain certificate");
            }
        }
    }
}
