//! The HTTPS load balancer: host-based dispatch to the OAuth control plane,
//! the health endpoint, or a configured upstream, with per-upstream auth
//! gating and header templating applied on the way out.

use std::time::Instant;

use async_trait::async_trait;
use http::header::{CONNECTION, UPGRADE};
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::proxy::{ProxyHttp, Session};
use pingora::upstreams::peer::HttpPeer;

use crate::auth::AutherKind;
use crate::config::Config;
use crate::cookies::{CookieStore, Session as AuthSession};
use crate::health_check;
use crate::oauth_flow::{self, MiddlewareOutcome};

use super::cert_store::CertStore;
use super::oauth_routes;
use super::router::{self, HostKind};
use super::upstream_table::UpstreamTable;

pub struct Router {
    pub domain: String,
    pub cookie_store: CookieStore,
    pub auther: AutherKind,
    pub upstreams: UpstreamTable,
    pub cert_store: CertStore,
    pub config: Config,
}

#[derive(Default)]
pub struct RouterContext {
    host: String,
    host_kind: Option<HostKind>,
    use_websocket: bool,
    session: AuthSession,
    request_start: Option<Instant>,
}

/// A request asks to be upgraded when it carries `Connection: Upgrade` and
/// `Upgrade: websocket`.
fn wants_websocket(header: &RequestHeader) -> bool {
    let has_upgrade_token = header
        .headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));

    let is_websocket = header
        .headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    has_upgrade_token && is_websocket
}

async fn write_rendered(
    session: &mut Session,
    header: ResponseHeader,
    body: Vec<u8>,
) -> pingora::Result<()> {
    session
        .write_response_header(Box::new(header), body.is_empty())
        .await?;
    if !body.is_empty() {
        session
            .write_response_body(Some(bytes::Bytes::from(body)), true)
            .await?;
    }
    Ok(())
}

/// The EdgeOS compatibility fixup: some WebSocket upstreams reject the
/// otherwise-equivalent `Sec-Websocket-*` spelling HTTP/2 front ends and some
/// clients send, and only accept the canonical `Sec-WebSocket-*` casing.
/// Returns the corrected name if `name` needs fixing.
fn canonicalize_websocket_header_name(name: &str) -> Option<String> {
    if !name.to_ascii_lowercase().contains("websocket") {
        return None;
    }

    let mut fixed = String::with_capacity(name.len());
    for (i, part) in name.split('-').enumerate() {
        if i > 0 {
            fixed.push('-');
        }
        if part.eq_ignore_ascii_case("websocket") {
            fixed.push_str("WebSocket");
            continue;
        }
        let mut chars = part.chars();
        match chars.next() {
            Some(first) => {
                fixed.extend(first.to_uppercase());
                fixed.push_str(&chars.as_str().to_ascii_lowercase());
            }
            None => {}
        }
    }
    Some(fixed)
}

async fn respond_status(session: &mut Session, status: u16) -> pingora::Result<()> {
    let header = ResponseHeader::build(status, Some(0))
        .map_err(|_| pingora::Error::new(pingora::ErrorType::HTTPStatus(status)))?;
    session.write_response_header(Box::new(header), true).await?;
    Ok(())
}

#[async_trait]
impl ProxyHttp for Router {
    type CTX = RouterContext;

    fn new_ctx(&self) -> Self::CTX {
        RouterContext::default()
    }

    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<bool> {
        ctx.request_start = Some(Instant::now());

        let raw_host = session
            .get_header(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let host = router::strip_port(raw_host).to_string();
        ctx.host = host.clone();

        // This `ProxyHttp` is only ever bound to the TLS-terminating
        // listener (see `main.rs`); the plain port-80 listener runs a
        // separate, simpler service that only redirects or answers ACME
        // challenges, so every request reaching here is over TLS.
        let is_tls = true;

        let kind = router::classify(&host, &self.domain);
        ctx.host_kind = Some(kind.clone());

        match kind {
            HostKind::Oauth => {
                let request = session.req_header().clone();
                let rendered = match request.uri.path() {
                    "/authorized" => {
                        oauth_routes::authorized(&self.cookie_store, &self.auther, &request)
                            .await
                    }
                    "/auth" => oauth_routes::auth_probe(&self.cookie_store, &request),
                    "/session" => oauth_routes::session(&self.cookie_store, &request),
                    "/signin" => oauth_routes::signin(&self.cookie_store, &self.auther, &request, is_tls),
                    _ => {
                        respond_status(session, 404).await?;
                        return Ok(true);
                    }
                };

                match rendered {
                    Ok(rendered) => write_rendered(session, rendered.header, rendered.body).await?,
                    Err(err) => {
                        tracing::error!(%err, "oauth control-plane handler failed");
                        respond_status(session, 500).await?;
                    }
                }
                return Ok(true);
            }
            HostKind::Health => {
                let now = time::OffsetDateTime::now_utc();
                let report = health_check::check(&self.config.upstreams, &self.cert_store, now).await;
                let status = if report.all_ok() { 200 } else { 503 };
                let body = serde_json::to_vec_pretty(&report)
                    .unwrap_or_else(|_| b"{}".to_vec());

                let mut header = ResponseHeader::build(status, Some(1)).map_err(|_| {
                    pingora::Error::new(pingora::ErrorType::HTTPStatus(500))
                })?;
                header
                    .insert_header(http::header::CONTENT_TYPE, "application/json")
                    .ok();
                header
                    .insert_header(http::header::CONTENT_LENGTH, body.len())
                    .ok();
                write_rendered(session, header, body).await?;
                return Ok(true);
            }
            HostKind::Upstream(name) => {
                let Some(upstream) = self.upstreams.get(&name) else {
                    respond_status(session, 404).await?;
                    return Ok(true);
                };

                // Decoded once per request and reused for both the auth
                // gate below and the header-templating pass in
                // `upstream_request_filter` — opening the session cookie is
                // a crypto operation, not something to repeat per call.
                ctx.session = self.cookie_store.get_session(session.req_header());

                if upstream.auth {
                    let request = session.req_header().clone();
                    match oauth_flow::redirect_to_login(
                        &self.cookie_store,
                        &self.auther,
                        &request,
                        &ctx.session,
                        is_tls,
                    ) {
                        Ok(MiddlewareOutcome::Authorized) => {}
                        Ok(MiddlewareOutcome::Redirect(response)) => {
                            write_rendered(session, *response, Vec::new()).await?;
                            return Ok(true);
                        }
                        Err(err) => {
                            tracing::error!(%err, "auth gate failed");
                            respond_status(session, 500).await?;
                            return Ok(true);
                        }
                    }
                }

                ctx.use_websocket = wants_websocket(session.req_header()) && upstream.ws_target.is_some();
                Ok(false)
            }
            HostKind::Unknown => {
                respond_status(session, 404).await?;
                Ok(true)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<Box<HttpPeer>> {
        let HostKind::Upstream(name) = ctx.host_kind.clone().unwrap_or(HostKind::Unknown) else {
            return Err(pingora::Error::new(pingora::ErrorType::HTTPStatus(404)));
        };
        let Some(upstream) = self.upstreams.get(&name) else {
            return Err(pingora::Error::new(pingora::ErrorType::HTTPStatus(404)));
        };

        let target = if ctx.use_websocket {
            upstream.ws_target.as_ref().or(upstream.http_target.as_ref())
        } else {
            upstream.http_target.as_ref().or(upstream.ws_target.as_ref())
        };

        let Some(target) = target else {
            return Err(pingora::Error::new(pingora::ErrorType::HTTPStatus(502)));
        };

        Ok(Box::new(target.to_peer()))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()> {
        let HostKind::Upstream(name) = ctx.host_kind.clone().unwrap_or(HostKind::Unknown) else {
            return Ok(());
        };
        let Some(upstream) = self.upstreams.get(&name) else {
            return Ok(());
        };

        if ctx.use_websocket {
            let renames: Vec<(String, String)> = upstream_request
                .headers
                .keys()
                .filter_map(|existing| {
                    canonicalize_websocket_header_name(existing.as_str())
                        .map(|fixed| (existing.as_str().to_string(), fixed))
                })
                .collect();

            for (old_name, new_name) in renames {
                let values: Vec<_> = upstream_request
                    .headers
                    .get_all(old_name.as_str())
                    .iter()
                    .cloned()
                    .collect();
                upstream_request.remove_header(old_name.as_str());
                for value in values {
                    upstream_request.append_header(new_name.clone(), value).ok();
                }
            }
        }

        for (header_name, templates) in &upstream.header_templates {
            upstream_request.remove_header(header_name.as_str());
            for template in templates {
                upstream_request
                    .append_header(header_name.clone(), template.render(&ctx.session))
                    .ok();
            }
        }

        Ok(())
    }

    async fn logging(&self, session: &mut Session, _e: Option<&pingora::Error>, ctx: &mut Self::CTX) {
        let duration_ms = ctx
            .request_start
            .map(|start| start.elapsed().as_millis())
            .unwrap_or_default();

        let status_code = session
            .response_written()
            .map(|resp| resp.status.as_u16())
            .unwrap_or_default();

        tracing::info!(
            method = %session.req_header().method,
            path = session.req_header().uri.path(),
            host = %ctx.host,
            status_code,
            duration_ms,
            access_log = true
        );
    }
}
