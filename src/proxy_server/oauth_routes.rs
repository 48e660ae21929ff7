//! Handlers for the `oauth.<domain>` host: the OAuth callback, the
//! authorization probe used by upstreams for sub-request auth, the current
//! session as JSON, and the authenticated sign-in landing page.

use std::collections::HashMap;

use anyhow::Result;
use pingora::http::{RequestHeader, ResponseHeader};

use crate::auth::Auther;
use crate::cookies::CookieStore;
use crate::oauth_flow::{self, MiddlewareOutcome};

pub struct RenderedResponse {
    pub header: ResponseHeader,
    pub body: Vec<u8>,
}

fn query_params(request: &RequestHeader) -> HashMap<String, String> {
    request
        .uri
        .query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

/// `oauth.<domain>/authorized` — the OAuth callback.
pub async fn authorized(
    cookie_store: &CookieStore,
    auther: &dyn Auther,
    request: &RequestHeader,
) -> Result<RenderedResponse> {
    let query = query_params(request);
    let result = oauth_flow::handle_callback(cookie_store, auther, request, &query).await?;
    let body = result.body.unwrap_or_default().into_bytes();
    Ok(RenderedResponse {
        header: result.response,
        body,
    })
}

/// `oauth.<domain>/auth` — 204 if authorized, 401 otherwise. Used by
/// upstreams that want to delegate authentication to a sub-request.
pub fn auth_probe(cookie_store: &CookieStore, request: &RequestHeader) -> Result<RenderedResponse> {
    let status = if cookie_store.is_authorized(request) {
        204
    } else {
        401
    };
    let header = ResponseHeader::build(status, Some(0))?;
    Ok(RenderedResponse {
        header,
        body: Vec::new(),
    })
}

/// `oauth.<domain>/session` — the current session as JSON.
pub fn session(cookie_store: &CookieStore, request: &RequestHeader) -> Result<RenderedResponse> {
    let session = cookie_store.get_session(request);
    let body = serde_json::to_vec(&session)?;

    let mut header = ResponseHeader::build(200, Some(1))?;
    header.insert_header(http::header::CONTENT_TYPE, "application/json")?;
    header.insert_header(http::header::CONTENT_LENGTH, body.len())?;
    Ok(RenderedResponse { header, body })
}

/// `oauth.<domain>/signin?rd=<target>` — requires auth; on success shows a
/// confirmation page linking to `rd`.
pub fn signin(
    cookie_store: &CookieStore,
    auther: &dyn Auther,
    request: &RequestHeader,
    is_tls: bool,
) -> Result<RenderedResponse> {
    let session = cookie_store.get_session(request);
    match oauth_flow::redirect_to_login(cookie_store, auther, request, &session, is_tls)? {
        MiddlewareOutcome::Redirect(header) => Ok(RenderedResponse {
            header: *header,
            body: Vec::new(),
        }),
        MiddlewareOutcome::Authorized => {
            let target = query_params(request)
                .get("rd")
                .cloned()
                .unwrap_or_else(|| "/".to_string());

            let body = format!(
                "<html><body>Signed in. <a href=\"{target}\">Continue</a></body></html>"
            )
            .into_bytes();

            let mut header = ResponseHeader::build(200, Some(1))?;
            header.insert_header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")?;
            header.insert_header(http::header::CONTENT_LENGTH, body.len())?;
            Ok(RenderedResponse { header, body })
        }
    }
}
