//! Builds the immutable, startup-fixed table of per-subdomain upstreams:
//! HTTP and/or WebSocket targets plus precompiled header templates.

use std::collections::HashMap;

use anyhow::{Context, Result};
use pingora::upstreams::peer::HttpPeer;
use url::Url;

use crate::config::UpstreamSpec;

use super::header_template::HeaderTemplate;

/// A single upstream's runtime state, built once from its [`UpstreamSpec`]
/// and never mutated after startup — the set of upstream subdomains is
/// fixed for the life of the process.
pub struct Upstream {
    pub http_target: Option<PeerTarget>,
    pub ws_target: Option<PeerTarget>,
    pub auth: bool,
    pub health_check_url: Option<String>,
    pub header_templates: HashMap<String, Vec<HeaderTemplate>>,
}

/// The host/port/TLS triple an `HttpPeer` is built from per request. Kept
/// as data rather than a preconstructed `HttpPeer` because Pingora peers
/// aren't `Sync`-shareable the way a plain host string is.
#[derive(Debug, Clone)]
pub struct PeerTarget {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub sni: String,
}

impl PeerTarget {
    fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("parsing upstream URL {raw:?}"))?;
        let use_tls = url.scheme() == "https" || url.scheme() == "wss";
        let host = url
            .host_str()
            .with_context(|| format!("upstream URL {raw:?} has no host"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .with_context(|| format!("upstream URL {raw:?} has no resolvable port"))?;
        Ok(Self {
            sni: host.clone(),
            host,
            port,
            use_tls,
        })
    }

    /// Upstreams are reached over a trusted network; the proxy's only trust
    /// boundary is the client-facing TLS listener, so peer verification is
    /// deliberately disabled here.
    pub fn to_peer(&self) -> HttpPeer {
        let addr = format!("{}:{}", self.host, self.port);
        let mut peer = HttpPeer::new(addr, self.use_tls, self.sni.clone());
        peer.options.verify_cert = false;
        peer.options.verify_hostname = false;
        peer
    }
}

impl Upstream {
    fn from_spec(spec: &UpstreamSpec) -> Result<Self> {
        let http_target = spec.url.as_deref().map(PeerTarget::from_url).transpose()?;
        let ws_target = spec
            .websocket
            .as_deref()
            .map(PeerTarget::from_url)
            .transpose()?;

        let header_templates = spec
            .headers
            .iter()
            .map(|(name, templates)| {
                (
                    name.clone(),
                    templates
                        .iter()
                        .map(HeaderTemplate::compile)
                        .collect::<Vec<_>>(),
                )
            })
            .collect();

        Ok(Self {
            http_target,
            ws_target,
            auth: spec.auth,
            health_check_url: spec.health_check_url().map(str::to_string),
            header_templates,
        })
    }
}

/// The full, immutable subdomain → upstream map, built once at startup.
pub struct UpstreamTable {
    upstreams: HashMap<String, Upstream>,
}

impl UpstreamTable {
    pub fn build(specs: &HashMap<String, UpstreamSpec>) -> Result<Self> {
        let upstreams = specs
            .iter()
            .map(|(name, spec)| Upstream::from_spec(spec).map(|upstream| (name.clone(), upstream)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self { upstreams })
    }

    pub fn get(&self, subdomain: &str) -> Option<&Upstream> {
        self.upstreams.get(subdomain)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Upstream)> {
        self.upstreams.iter()
    }
}
