//! Translates the domain objects [`Session`] and [`OAuthState`] into and out
//! of encrypted cookies on a request/response pair. Every cookie the proxy
//! writes or reads passes through here — nothing touches `SealedBox`
//! directly.

mod oauth_state;
mod session;

pub use oauth_state::OAuthState;
pub use session::Session;

use std::time::Duration;

use anyhow::{bail, Result};
use cookie::{time::OffsetDateTime, Cookie};
use pingora::http::{RequestHeader, ResponseHeader};
use thiserror::Error;

use crate::crypto::{state_key_len, SealedBox};

const SESSION_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const STATE_AGE: Duration = Duration::from_secs(5 * 60);
const MAX_REDIRECT_URL_LEN: usize = 2000;

#[derive(Debug, Error)]
pub enum CookieStoreError {
    #[error("redirectURL is too long")]
    RedirectUrlTooLong,
    #[error("invalid state")]
    InvalidState,
}

/// Reads and writes the session and OAuth-state cookies for a single
/// configured cookie domain/name pair.
pub struct CookieStore {
    name: String,
    domain: String,
    sealed_box: SealedBox,
}

impl CookieStore {
    pub fn new(name: impl Into<String>, domain: impl Into<String>, sealed_box: SealedBox) -> Result<Self> {
        let name = name.into();
        let domain = domain.into();
        if name.is_empty() {
            bail!("cookie name cannot be empty");
        }
        if domain.is_empty() {
            bail!("cookie domain cannot be empty");
        }
        Ok(Self {
            name,
            domain,
            sealed_box,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up the session cookie and opens it. Missing or invalid cookies
    /// yield a zero-value `Session`, never an error — callers distinguish
    /// "no session" from "malformed session" only through
    /// [`Session::is_authorized`].
    ///
    /// Callers are expected to memoize the result per request (the router
    /// context carries an `Option<Session>` slot for exactly this) since
    /// opening a cookie is a crypto operation best done once per request.
    pub fn get_session(&self, headers: &RequestHeader) -> Session {
        cookie_value(headers, &self.name)
            .and_then(|value| self.sealed_box.open::<Session>(&value))
            .unwrap_or_default()
    }

    pub fn is_authorized(&self, headers: &RequestHeader) -> bool {
        self.get_session(headers).is_authorized()
    }

    /// Seals a fresh, authorized session for `user` and writes it as the
    /// session cookie on `response`.
    pub fn authorize(&self, response: &mut ResponseHeader, user: &str) -> Result<()> {
        let expires_at = self
            .sealed_box
            .clock()
            .now()
            .checked_add(i64::try_from(SESSION_AGE.as_secs())?)
            .ok_or_else(|| anyhow::anyhow!("session expiry overflow"))?;

        let session = Session {
            user: user.to_string(),
            authorized: true,
            expires_at,
        };

        let value = self.sealed_box.seal(&session, SESSION_AGE)?;
        self.set_cookie(response, self.name.clone(), value, SESSION_AGE)?;
        Ok(())
    }

    /// Seals `redirect_url` into an `OAuthState`, splits the sealed string at
    /// the nonce's encoded length, writes the remainder as a cookie named
    /// after the prefix, and returns the prefix for use as the `state` query
    /// parameter. The split is what makes the `state` parameter alone
    /// useless without its companion cookie.
    pub fn create_state(
        &self,
        response: &mut ResponseHeader,
        redirect_url: &str,
    ) -> Result<String, CookieStoreError> {
        if redirect_url.len() > MAX_REDIRECT_URL_LEN {
            return Err(CookieStoreError::RedirectUrlTooLong);
        }

        let state = self
            .sealed_box
            .seal(
                &OAuthState {
                    redirect_url: redirect_url.to_string(),
                },
                STATE_AGE,
            )
            .map_err(|_| CookieStoreError::RedirectUrlTooLong)?;

        let key_len = state_key_len();
        let (state_key, cookie_value) = state.split_at(key_len);

        self.set_cookie(
            response,
            state_key.to_string(),
            cookie_value.to_string(),
            STATE_AGE,
        )
        .map_err(|_| CookieStoreError::RedirectUrlTooLong)?;

        Ok(state_key.to_string())
    }

    /// Loads the companion cookie for `state_key`, reassembles the sealed
    /// string, and opens it as an `OAuthState`. Succeeds at most once per
    /// `state_key`: the cookie is deleted on the response regardless of
    /// outcome, so a retried call finds nothing to reassemble.
    pub fn redeem_state(
        &self,
        request: &RequestHeader,
        response: &mut ResponseHeader,
        state_key: &str,
    ) -> Result<String, CookieStoreError> {
        let cookie_value =
            cookie_value(request, state_key).ok_or(CookieStoreError::InvalidState)?;

        let sealed = format!("{state_key}{cookie_value}");
        let opened: Option<OAuthState> = self.sealed_box.open(&sealed);

        // The companion cookie is single-use regardless of outcome: a
        // tampered or expired state must not linger on the client any more
        // than a successfully redeemed one does.
        self.delete_cookie(response, state_key)
            .map_err(|_| CookieStoreError::InvalidState)?;

        let state = opened.ok_or(CookieStoreError::InvalidState)?;
        Ok(state.redirect_url)
    }

    fn set_cookie(
        &self,
        response: &mut ResponseHeader,
        name: String,
        value: String,
        max_age: Duration,
    ) -> Result<()> {
        let expires = OffsetDateTime::from_unix_timestamp(
            self.sealed_box.clock().now() + i64::try_from(max_age.as_secs())?,
        )?;

        let built = Cookie::build((name, value))
            .domain(self.domain.clone())
            .path("/")
            .secure(true)
            .http_only(true)
            .max_age(cookie::time::Duration::seconds(i64::try_from(
                max_age.as_secs(),
            )?))
            .expires(expires)
            .build();

        response.append_header(http::header::SET_COOKIE, built.to_string())?;
        Ok(())
    }

    fn delete_cookie(&self, response: &mut ResponseHeader, name: &str) -> Result<()> {
        let built = Cookie::build((name.to_string(), ""))
            .domain(self.domain.clone())
            .path("/")
            .secure(true)
            .http_only(true)
            .max_age(cookie::time::Duration::seconds(-1))
            .expires(OffsetDateTime::UNIX_EPOCH)
            .build();

        response.append_header(http::header::SET_COOKIE, built.to_string())?;
        Ok(())
    }
}

/// Extracts one cookie's value from the `Cookie` request header(s) by name.
fn cookie_value(headers: &RequestHeader, name: &str) -> Option<String> {
    headers
        .headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse_encoded)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pingora::http::RequestHeader;

    use super::*;
    use crate::crypto::FixedClock;

    fn store(clock: FixedClock) -> CookieStore {
        let sealed_box = SealedBox::new(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e",
            Arc::new(clock),
        )
        .unwrap();
        CookieStore::new("_s", "example.com", sealed_box).unwrap()
    }

    fn set_cookie_values(response: &ResponseHeader) -> Vec<String> {
        response
            .headers
            .get_all(http::header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    fn request_with_cookie(name: &str, value: &str) -> RequestHeader {
        let mut req = RequestHeader::build("GET", b"/", None).unwrap();
        req.append_header(http::header::COOKIE, format!("{name}={value}"))
            .unwrap();
        req
    }

    #[test]
    fn missing_session_cookie_is_unauthorized_zero_value() {
        let clock = FixedClock::new(1000);
        let store = store(clock);
        let req = RequestHeader::build("GET", b"/", None).unwrap();

        let session = store.get_session(&req);
        assert_eq!(session, Session::default());
        assert!(!store.is_authorized(&req));
    }

    #[test]
    fn authorize_then_get_session_round_trips() {
        let clock = FixedClock::new(1000);
        let store = store(clock);
        let mut response = ResponseHeader::build(200, None).unwrap();

        store.authorize(&mut response, "octocat").unwrap();
        let set_cookie = set_cookie_values(&response).remove(0);
        let value = set_cookie.split_once('=').unwrap().1.split(';').next().unwrap();

        let req = request_with_cookie("_s", value);
        let session = store.get_session(&req);

        assert!(session.is_authorized());
        assert_eq!(session.user, "octocat");
    }

    #[test]
    fn create_state_then_redeem_state_round_trips() {
        let clock = FixedClock::new(1000);
        let store = store(clock);
        let mut response = ResponseHeader::build(302, None).unwrap();

        let state_key = store
            .create_state(&mut response, "https://svc.example.com/")
            .unwrap();
        let set_cookie = set_cookie_values(&response).remove(0);
        let value = set_cookie.split_once('=').unwrap().1.split(';').next().unwrap();
        assert_eq!(set_cookie.split_once('=').unwrap().0, state_key);

        let req = request_with_cookie(&state_key, value);
        let mut redeem_response = ResponseHeader::build(302, None).unwrap();
        let redirect_url = store
            .redeem_state(&req, &mut redeem_response, &state_key)
            .unwrap();

        assert_eq!(redirect_url, "https://svc.example.com/");
    }

    #[test]
    fn redeem_state_fails_second_time() {
        let clock = FixedClock::new(1000);
        let store = store(clock);
        let mut response = ResponseHeader::build(302, None).unwrap();

        let state_key = store
            .create_state(&mut response, "https://svc.example.com/")
            .unwrap();
        let set_cookie = set_cookie_values(&response).remove(0);
        let value = set_cookie.split_once('=').unwrap().1.split(';').next().unwrap();

        let req = request_with_cookie(&state_key, value);
        let mut r1 = ResponseHeader::build(302, None).unwrap();
        store.redeem_state(&req, &mut r1, &state_key).unwrap();

        // Second attempt presents the same (now stale, from the caller's
        // perspective already-deleted) cookie value again and must fail —
        // the cookie store itself is pure and doesn't track consumption, so
        // this models the client no longer holding a valid cookie after the
        // first redeem's deleting Set-Cookie took effect.
        let second_req = RequestHeader::build("GET", b"/", None).unwrap();
        let mut r2 = ResponseHeader::build(302, None).unwrap();
        let result = store.redeem_state(&second_req, &mut r2, &state_key);
        assert!(matches!(result, Err(CookieStoreError::InvalidState)));
    }

    #[test]
    fn tampered_state_cookie_is_rejected() {
        let clock = FixedClock::new(1000);
        let store = store(clock);
        let mut response = ResponseHeader::build(302, None).unwrap();

        let state_key = store
            .create_state(&mut response, "https://svc.example.com/")
            .unwrap();
        let set_cookie = set_cookie_values(&response).remove(0);
        let mut value = set_cookie
            .split_once('=')
            .unwrap()
            .1
            .split(';')
            .next()
            .unwrap()
            .to_string();
        let last = value.len() - 1;
        value.replace_range(last..last + 1, "!");

        let req = request_with_cookie(&state_key, &value);
        let mut redeem_response = ResponseHeader::build(302, None).unwrap();
        let result = store.redeem_state(&req, &mut redeem_response, &state_key);

        assert!(matches!(result, Err(CookieStoreError::InvalidState)));
        let cleared = set_cookie_values(&redeem_response).remove(0);
        assert!(cleared.starts_with(&format!("{state_key}=")));
        assert!(cleared.contains("Max-Age=-1"));
    }

    #[test]
    fn redirect_url_over_limit_is_rejected() {
        let clock = FixedClock::new(1000);
        let store = store(clock);
        let mut response = ResponseHeader::build(302, None).unwrap();
        let too_long = "a".repeat(MAX_REDIRECT_URL_LEN + 1);

        let result = store.create_state(&mut response, &too_long);
        assert!(matches!(result, Err(CookieStoreError::RedirectUrlTooLong)));
    }
}
