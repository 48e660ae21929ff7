//! The plaintext port-80 service: answers ACME HTTP-01 challenges and
//! redirects everything else to HTTPS. Never proxies to an upstream.

use async_trait::async_trait;
use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
    uri::Scheme,
    StatusCode, Uri,
};
use pingora::http::ResponseHeader;
use pingora::proxy::{ProxyHttp, Session};
use pingora::upstreams::peer::HttpPeer;

use crate::letsencrypt::ChallengeStore;
use super::router;

pub struct HttpRedirect {
    pub challenges: Option<ChallengeStore>,
    /// Port of the TLS-terminating listener, appended to the inbound host
    /// when building the redirect target.
    pub https_port: u16,
}

fn get_host(session: &Session) -> &str {
    if let Some(host) = session.get_header(http::header::HOST) {
        return host.to_str().unwrap_or("");
    }
    session.req_header().uri.host().unwrap_or("")
}

#[async_trait]
impl ProxyHttp for HttpRedirect {
    type CTX = ();

    fn new_ctx(&self) -> Self::CTX {}

    async fn request_filter(
        &self,
        session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> pingora::Result<bool> {
        let current_uri = session.req_header().uri.clone();
        let host = get_host(session).to_string();

        if host.is_empty() {
            return Err(pingora::Error::new(pingora::ErrorType::HTTPStatus(400)));
        }

        if let Some(token) = current_uri
            .path()
            .strip_prefix("/.well-known/acme-challenge/")
        {
            let Some(challenges) = &self.challenges else {
                return Err(pingora::Error::new(pingora::ErrorType::HTTPStatus(404)));
            };

            let Some(proof) = challenges.get(token).await else {
                return Err(pingora::Error::new(pingora::ErrorType::HTTPStatus(404)));
            };

            let body = bytes::Bytes::from(proof);
            let mut headers = ResponseHeader::build_no_case(StatusCode::OK, Some(2))?;
            headers.append_header(CONTENT_TYPE, "text/plain")?;
            headers.append_header(CONTENT_LENGTH, body.len())?;

            session.write_response_header(Box::new(headers), false).await?;
            session.write_response_body(Some(body), true).await?;
            return Ok(true);
        }

        let authority = format!("{}:{}", router::strip_port(&host), self.https_port);
        let new_uri = Uri::builder()
            .scheme(Scheme::HTTPS)
            .authority(authority)
            .path_and_query(
                current_uri
                    .path_and_query()
                    .cloned()
                    .unwrap_or_else(|| http::uri::PathAndQuery::from_static("/")),
            )
            .build()
            .map_err(|_| pingora::Error::new(pingora::ErrorType::HTTPStatus(400)))?;

        let mut headers = ResponseHeader::build_no_case(StatusCode::MOVED_PERMANENTLY, Some(1))?;
        headers.append_header(LOCATION, new_uri.to_string())?;
        headers.append_header(CONTENT_TYPE, "text/plain")?;
        headers.append_header(CONTENT_LENGTH, 0)?;

        session.write_response_header(Box::new(headers), false).await?;
        session
            .write_response_body(Some(bytes::Bytes::from_static(b"")), true)
            .await?;
        Ok(true)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> pingora::Result<Box<HttpPeer>> {
        Err(pingora::Error::new(pingora::ErrorType::HTTPStatus(404)))
    }
}
