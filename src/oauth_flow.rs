//! The state machine that correlates an unauthenticated request with its
//! eventual OAuth callback: redirect-to-login, redeem state, verify with
//! the provider, commit a session.

use anyhow::Result;
use pingora::http::{RequestHeader, ResponseHeader};
use url::Url;

use crate::auth::Auther;
use crate::cookies::{CookieStore, CookieStoreError, Session};

pub const ERR_MISSING_CODE: &str = "Missing authorization code.";
pub const ERR_UNAUTHORIZED: &str = "Unauthorized.";

/// The outcome of running a request through [`redirect_to_login`]: either
/// the request is already authorized and should proceed unmodified, or a
/// redirect response the caller must write verbatim (and then stop
/// processing, without invoking the wrapped handler).
pub enum MiddlewareOutcome {
    Authorized,
    Redirect(Box<ResponseHeader>),
}

/// Outcome of the `/authorized` callback handler. `response` already carries
/// the status and headers the caller should write; `body` is the (short,
/// human-readable) response body, if any.
pub struct CallbackResult {
    pub response: ResponseHeader,
    pub body: Option<String>,
}

/// Reconstructs the absolute URL for `request` the way the original
/// `absoluteURL` helper does: scheme is derived from whether the connection
/// is TLS, host and request-target are taken verbatim from the request.
pub fn absolute_url(request: &RequestHeader, is_tls: bool) -> String {
    let scheme = if is_tls { "https" } else { "http" };
    let host = request
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let request_uri = request
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{scheme}://{host}{request_uri}")
}

/// The middleware half of the state machine. If the request is already
/// authorized, the caller should invoke the wrapped handler unmodified.
/// Otherwise a `302` to the provider's authorize URL is written to
/// `response`, binding the current absolute URL as the post-login redirect
/// target.
///
/// `session` is the caller's already-decoded session for this request —
/// opening the session cookie is a crypto operation the caller is expected
/// to have memoized once per request, not an operation this function repeats.
pub fn redirect_to_login(
    cookie_store: &CookieStore,
    auther: &dyn Auther,
    request: &RequestHeader,
    session: &Session,
    is_tls: bool,
) -> Result<MiddlewareOutcome> {
    if session.is_authorized() {
        return Ok(MiddlewareOutcome::Authorized);
    }

    let mut response = ResponseHeader::build_no_case(http::StatusCode::FOUND, Some(2))?;

    let redirect_target = absolute_url(request, is_tls);
    let state = cookie_store.create_state(&mut response, &redirect_target)?;
    let auth_code_url = build_auth_code_url(auther.oauth_config(), &state)?;

    response.insert_header(http::header::LOCATION, auth_code_url)?;
    Ok(MiddlewareOutcome::Redirect(Box::new(response)))
}

/// Builds the provider's authorization-code URL with `state` and
/// `access_type=offline`, mirroring `oauth2.Config.AuthCodeURL`.
fn build_auth_code_url(config: &crate::auth::OAuthConfig, state: &str) -> Result<String> {
    let mut url = Url::parse(&config.auth_url)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("client_id", &config.client_id);
        query.append_pair("response_type", "code");
        query.append_pair("state", state);
        query.append_pair("access_type", "offline");
        if !config.scopes.is_empty() {
            query.append_pair("scope", &config.scopes.join(" "));
        }
        if let Some(redirect_url) = &config.redirect_url {
            query.append_pair("redirect_uri", redirect_url);
        }
    }
    Ok(url.to_string())
}

/// The callback half of the state machine, run on `oauth.<domain>/authorized`.
///
/// Order matters: `redeem_state` must succeed before anything else runs — a
/// failed redeem is an immediate 500, and the state cookie (already
/// destroyed by `redeem_state` regardless of outcome) is never reissued.
pub async fn handle_callback(
    cookie_store: &CookieStore,
    auther: &dyn Auther,
    request: &RequestHeader,
    query: &std::collections::HashMap<String, String>,
) -> Result<CallbackResult> {
    let state_param = query.get("state").cloned().unwrap_or_default();

    let mut response = ResponseHeader::build(302, Some(2))?;
    let redirect_url = match cookie_store.redeem_state(request, &mut response, &state_param) {
        Ok(url) => url,
        Err(CookieStoreError::InvalidState) => {
            let mut err_response = ResponseHeader::build(500, Some(1))?;
            err_response.append_header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")?;
            return Ok(CallbackResult {
                response: err_response,
                body: Some("invalid state".to_string()),
            });
        }
        Err(other) => return Err(other.into()),
    };

    if cookie_store.is_authorized(request) {
        response.insert_header(http::header::LOCATION, redirect_url)?;
        return Ok(CallbackResult {
            response,
            body: None,
        });
    }

    let code = match query.get("code") {
        Some(code) if !code.is_empty() => code,
        _ => {
            let mut err_response = ResponseHeader::build(400, Some(1))?;
            err_response.append_header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")?;
            return Ok(CallbackResult {
                response: err_response,
                body: Some(ERR_MISSING_CODE.to_string()),
            });
        }
    };

    let user = match auther.auth(code).await {
        Ok(user) => user,
        Err(_) => {
            let mut err_response = ResponseHeader::build(401, Some(1))?;
            err_response.append_header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")?;
            return Ok(CallbackResult {
                response: err_response,
                body: Some(ERR_UNAUTHORIZED.to_string()),
            });
        }
    };

    if let Err(err) = cookie_store.authorize(&mut response, &user) {
        tracing::error!(error = %err, "failed to seal session after successful provider auth");
        let mut err_response = ResponseHeader::build(500, Some(1))?;
        err_response.append_header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")?;
        return Ok(CallbackResult {
            response: err_response,
            body: Some(ERR_UNAUTHORIZED.to_string()),
        });
    }

    response.insert_header(http::header::LOCATION, redirect_url)?;
    Ok(CallbackResult {
        response,
        body: None,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use pingora::http::RequestHeader;

    use super::*;
    use crate::auth::MockAuther;
    use crate::crypto::{FixedClock, SealedBox};

    fn cookie_store(clock: FixedClock) -> CookieStore {
        let sealed_box = SealedBox::new(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e",
            Arc::new(clock),
        )
        .unwrap();
        CookieStore::new("_s", "example.com", sealed_box).unwrap()
    }

    fn mock_auther(user: &str) -> MockAuther {
        serde_json::from_value(serde_json::json!({
            "ClientID": "id",
            "ClientSecret": "secret",
            "User": user,
        }))
        .unwrap()
    }

    #[test]
    fn unauthenticated_request_redirects_with_state_key_sized_param() {
        let store = cookie_store(FixedClock::new(1000));
        let auther = mock_auther("user");
        let mut request = RequestHeader::build("GET", b"/", None).unwrap();
        request
            .insert_header(http::header::HOST, "svc.example.com")
            .unwrap();

        let session = store.get_session(&request);
        let outcome = redirect_to_login(&store, &auther, &request, &session, true).unwrap();

        let response = match outcome {
            MiddlewareOutcome::Redirect(response) => response,
            MiddlewareOutcome::Authorized => panic!("expected a redirect"),
        };
        assert_eq!(response.status.as_u16(), 302);

        let location = response
            .headers
            .get(http::header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        let url = Url::parse(location).unwrap();
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.to_string())
            .unwrap();
        assert_eq!(state.len(), crate::crypto::state_key_len());

        assert!(response
            .headers
            .get(http::header::SET_COOKIE)
            .is_some());
    }

    #[test]
    fn authorized_request_is_not_redirected() {
        let store = cookie_store(FixedClock::new(1000));
        let auther = mock_auther("user");
        let mut seal_response = ResponseHeader::build(200, None).unwrap();
        store.authorize(&mut seal_response, "user").unwrap();
        let set_cookie = seal_response
            .headers
            .get(http::header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let value = set_cookie.split_once('=').unwrap().1.split(';').next().unwrap();

        let mut request = RequestHeader::build("GET", b"/", None).unwrap();
        request
            .append_header(http::header::COOKIE, format!("_s={value}"))
            .unwrap();

        let session = store.get_session(&request);
        let outcome = redirect_to_login(&store, &auther, &request, &session, true).unwrap();
        assert!(matches!(outcome, MiddlewareOutcome::Authorized));
    }

    #[tokio::test]
    async fn callback_without_state_is_rejected() {
        let store = cookie_store(FixedClock::new(1000));
        let auther = mock_auther("user");
        let request = RequestHeader::build("GET", b"/authorized", None).unwrap();
        let query = HashMap::new();

        let result = handle_callback(&store, &auther, &request, &query)
            .await
            .unwrap();

        assert_eq!(result.response.status.as_u16(), 500);
        assert_eq!(result.body.as_deref(), Some("invalid state"));
    }

    #[tokio::test]
    async fn callback_missing_code_is_bad_request() {
        let store = cookie_store(FixedClock::new(1000));
        let auther = mock_auther("user");

        let mut login_response = ResponseHeader::build(200, None).unwrap();
        let state = store
            .create_state(&mut login_response, "https://svc.example.com/")
            .unwrap();
        let set_cookie = login_response
            .headers
            .get(http::header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let value = set_cookie.split_once('=').unwrap().1.split(';').next().unwrap();

        let mut request = RequestHeader::build("GET", b"/authorized", None).unwrap();
        request
            .append_header(http::header::COOKIE, format!("{state}={value}"))
            .unwrap();

        let mut query = HashMap::new();
        query.insert("state".to_string(), state);

        let result = handle_callback(&store, &auther, &request, &query)
            .await
            .unwrap();
        assert_eq!(result.response.status.as_u16(), 400);
        assert_eq!(result.body.as_deref(), Some(ERR_MISSING_CODE));
    }

    #[tokio::test]
    async fn happy_path_redeems_state_and_authorizes() {
        let store = cookie_store(FixedClock::new(1000));
        let auther = mock_auther("user");

        let mut login_response = ResponseHeader::build(200, None).unwrap();
        let state = store
            .create_state(&mut login_response, "https://svc.example.com/")
            .unwrap();
        let set_cookie = login_response
            .headers
            .get(http::header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let value = set_cookie.split_once('=').unwrap().1.split(';').next().unwrap();

        let mut request = RequestHeader::build("GET", b"/authorized", None).unwrap();
        request
            .append_header(http::header::COOKIE, format!("{state}={value}"))
            .unwrap();

        let mut query = HashMap::new();
        query.insert("state".to_string(), state);
        query.insert("code".to_string(), "42".to_string());

        let result = handle_callback(&store, &auther, &request, &query)
            .await
            .unwrap();

        assert_eq!(result.response.status.as_u16(), 302);
        let location = result
            .response
            .headers
            .get(http::header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(location, "https://svc.example.com/");
        assert!(result
            .response
            .headers
            .get(http::header::SET_COOKIE)
            .is_some());
    }
}
