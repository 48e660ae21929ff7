use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{http_client, Auther, OAuthConfig};

/// Authorizes by exchanging the code for a token, decoding the `id_token`
/// claim set **without verifying its signature** (safe here only because
/// the token was just received directly from Google over TLS), and
/// checking `email_verified` plus a configured regex against the email.
pub struct GoogleRegexAuther {
    config: OAuthConfig,
    email_regex: Regex,
}

/// The subset of a Google OAuth client-credentials document (the same
/// `client_secret.json` shape Google's console produces) this provider
/// needs.
#[derive(Debug, Deserialize)]
struct CredentialsDoc {
    #[serde(alias = "web", alias = "installed")]
    credentials: GoogleCredentials,
}

#[derive(Debug, Deserialize)]
struct GoogleCredentials {
    client_id: String,
    client_secret: String,
    auth_uri: String,
    token_uri: String,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

impl GoogleRegexAuther {
    /// Builds a provider from the raw `{"Credentials": ..., "EmailRegex": ...}`
    /// configuration blob. Not a `Deserialize` impl, like its Go
    /// counterpart's custom `UnmarshalJSON` — the credentials document and
    /// the regex both need fallible construction beyond what derive offers.
    pub fn from_value(value: Value) -> Result<Self> {
        #[derive(Debug, Deserialize)]
        struct Raw {
            #[serde(rename = "Credentials")]
            credentials: Value,
            #[serde(rename = "EmailRegex")]
            email_regex: String,
        }

        let raw: Raw = serde_json::from_value(value).context("parsing gmail-regex config")?;
        let doc: CredentialsDoc =
            serde_json::from_value(raw.credentials).context("parsing google credentials document")?;
        let email_regex = Regex::new(&raw.email_regex).context("compiling EmailRegex")?;

        Ok(Self {
            config: OAuthConfig {
                client_id: doc.credentials.client_id,
                client_secret: doc.credentials.client_secret,
                scopes: vec!["openid".to_string(), "email".to_string()],
                auth_url: doc.credentials.auth_uri,
                token_url: doc.credentials.token_uri,
                redirect_url: doc.credentials.redirect_uris.into_iter().next(),
            },
            email_regex,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
}

#[derive(Debug, Serialize)]
struct TokenExchangeRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
    grant_type: &'a str,
    redirect_uri: &'a str,
}

#[derive(Debug, Deserialize)]
struct GoogleIdToken {
    email: String,
    email_verified: bool,
}

/// Decodes the claim set of a JWS without verifying its signature.
fn decode_jws(payload: &str) -> Result<GoogleIdToken> {
    let parts: Vec<&str> = payload.split('.').collect();
    if parts.len() < 2 {
        bail!("jws: invalid token received");
    }

    let decoded = base64_decode_tolerant(parts[1])?;
    serde_json::from_slice(&decoded).context("decoding id_token claim set")
}

/// Base64url-decodes `s`, tolerating a missing `=` padding by re-appending
/// 1-3 characters as needed.
fn base64_decode_tolerant(s: &str) -> Result<Vec<u8>> {
    let mut padded = s.to_string();
    match padded.len() % 4 {
        1 => padded.push_str("==="),
        2 => padded.push_str("=="),
        3 => padded.push('='),
        _ => {}
    }
    URL_SAFE
        .decode(padded)
        .context("base64url-decoding jws segment")
}

#[async_trait]
impl Auther for GoogleRegexAuther {
    fn oauth_config(&self) -> &OAuthConfig {
        &self.config
    }

    async fn auth(&self, code: &str) -> Result<String> {
        let redirect_uri = self.config.redirect_url.as_deref().unwrap_or_default();

        let token: TokenResponse = http_client()
            .post(&self.config.token_url)
            .form(&TokenExchangeRequest {
                client_id: &self.config.client_id,
                client_secret: &self.config.client_secret,
                code,
                grant_type: "authorization_code",
                redirect_uri,
            })
            .send()
            .await
            .context("exchanging code for token")?
            .error_for_status()
            .context("google token endpoint returned an error")?
            .json()
            .await
            .context("decoding token response")?;

        let id_token = decode_jws(&token.id_token)?;

        if id_token.email_verified && self.email_regex.is_match(&id_token.email) {
            Ok(id_token.email)
        } else {
            bail!("unauthorized")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerant_base64_decodes_unpadded_input() {
        let encoded = URL_SAFE_NO_PAD_STR;
        let decoded = base64_decode_tolerant(encoded).unwrap();
        assert_eq!(decoded, b"hello world");
    }

    const URL_SAFE_NO_PAD_STR: &str = "aGVsbG8gd29ybGQ";

    #[test]
    fn decode_jws_rejects_malformed_token() {
        let err = decode_jws("not-a-jws").unwrap_err();
        assert!(err.to_string().contains("invalid token"));
    }
}
