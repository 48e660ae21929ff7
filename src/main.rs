use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pingora::listeners::tls::TlsSettings;
use pingora::proxy::http_proxy_service;
use pingora::server::{configuration::Opt as PingoraOpt, Server};

mod auth;
mod config;
mod cookies;
mod crypto;
mod health_check;
mod letsencrypt;
mod logger;
mod oauth_flow;
mod proxy_server;

use auth::AutherKind;
use cookies::CookieStore;
use crypto::SealedBox;
use letsencrypt::ChallengeStore;
use proxy_server::cert_store::CertStore;
use proxy_server::http_redirect::HttpRedirect;
use proxy_server::https_proxy::Router;
use proxy_server::upstream_table::UpstreamTable;

/// An authenticating reverse proxy with pluggable OAuth2 providers and
/// automatic HTTPS.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// Path to the JSON configuration document.
    #[arg(long, default_value = "/etc/portcullis/config.json")]
    config: PathBuf,

    /// Address the plaintext redirect/ACME-challenge listener binds to.
    #[arg(long, default_value = "0.0.0.0:80")]
    http_addr: String,

    /// Address the TLS-terminating listener binds to.
    #[arg(long, default_value = "0.0.0.0:443")]
    https_addr: String,

    /// Emit structured JSON logs instead of the compact text format.
    #[arg(long)]
    json_logs: bool,

    /// Run pingora as a background daemon.
    #[arg(long)]
    daemon: bool,
}

/// A cookie secret wasn't configured: generate one and warn loudly, since
/// every restart will invalidate existing sessions until an operator pins
/// one in the configuration file.
fn ephemeral_cookie_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    let secret = hex::encode(bytes);
    tracing::warn!(
        "no Cookie.Secret configured; using a freshly generated one for this process only. \
         existing sessions and in-flight logins will not survive a restart. set Cookie.Secret \
         in the configuration to avoid this: \"{secret}\""
    );
    secret
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    logger::init(opt.json_logs);

    let runtime = tokio::runtime::Runtime::new()?;
    let config = runtime.block_on(config::load(&opt.config))?;
    config::validate(&config)?;

    let cookie_secret = config
        .cookie
        .secret
        .clone()
        .unwrap_or_else(ephemeral_cookie_secret);
    let cookie_name = config
        .cookie
        .name
        .clone()
        .unwrap_or_else(config::default_cookie_name);

    let clock = Arc::new(crypto::SystemClock);
    let sealed_box = SealedBox::new(&cookie_secret, clock)?;
    let cookie_store = CookieStore::new(cookie_name, config.domain.clone(), sealed_box)?;

    let auther = AutherKind::from_config(&config.auth.auther_type, config.auth.config.clone())?;
    let upstreams = UpstreamTable::build(&config.upstreams)?;
    let cert_store = CertStore::new();

    let challenges = config.acme.as_ref().map(|_| ChallengeStore::new());

    let mut server = Server::new(Some(PingoraOpt {
        daemon: opt.daemon,
        upgrade: false,
        conf: None,
        nocapture: false,
        test: false,
    }))?;
    server.bootstrap();

    if let Some(acme) = &config.acme {
        let service = letsencrypt::AcmeService::new(
            config.domain.clone(),
            acme.clone(),
            cert_store.clone(),
            challenges.clone().expect("challenge store set alongside acme config"),
        );
        server.add_service(service);
    } else if let Some(tls) = &config.tls {
        let bundle = runtime.block_on(letsencrypt::load_static_bundle(&tls.cert_file, &tls.cert_key))?;
        runtime.block_on(cert_store.set(bundle));
    }

    let router = Router {
        domain: config.domain.clone(),
        cookie_store,
        auther,
        upstreams,
        cert_store: cert_store.clone(),
        config: config.clone(),
    };
    let mut https_service = http_proxy_service(&server.configuration, router);

    let mut tls_settings = TlsSettings::with_callbacks(Box::new(cert_store))
        .map_err(|err| anyhow::anyhow!("building TLS settings: {err}"))?;
    tls_settings.enable_h2();
    tls_settings.set_min_proto_version(Some(pingora::tls::ssl::SslVersion::TLS1_2))?;
    https_service.add_tls_with_settings(&opt.https_addr, None, tls_settings);

    let https_port: u16 = opt
        .https_addr
        .rsplit(':')
        .next()
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("--https-addr {:?} has no parseable port", opt.https_addr))?;

    let http_redirect = HttpRedirect {
        challenges,
        https_port,
    };
    let mut http_service = http_proxy_service(&server.configuration, http_redirect);
    http_service.add_tcp(&opt.http_addr);

    server.add_service(https_service);
    server.add_service(http_service);

    tracing::info!(
        https_addr = %opt.https_addr,
        http_addr = %opt.http_addr,
        domain = %config.domain,
        "starting portcullis"
    );

    server.run_forever();
}
