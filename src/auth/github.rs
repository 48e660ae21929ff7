use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{http_client, Auther, OAuthConfig};

const GITHUB_AUTH_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";

/// Authorizes by exchanging the code for a token, fetching the
/// authenticated user, and checking that `org_id` appears in their
/// organization memberships.
#[derive(Debug, Deserialize)]
pub struct GithubOrgAuther {
    #[serde(rename = "ClientID")]
    client_id: String,
    #[serde(rename = "ClientSecret")]
    client_secret: String,
    #[serde(rename = "OrgID")]
    org_id: i64,

    #[serde(skip)]
    oauth_config: OnceCell<OAuthConfig>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GithubOrg {
    id: i64,
}

#[derive(Debug, Serialize)]
struct TokenExchangeRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
}

impl GithubOrgAuther {
    fn config(&self) -> &OAuthConfig {
        self.oauth_config.get_or_init(|| OAuthConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            scopes: vec!["user:email".to_string(), "read:org".to_string()],
            auth_url: GITHUB_AUTH_URL.to_string(),
            token_url: GITHUB_TOKEN_URL.to_string(),
            redirect_url: None,
        })
    }
}

#[async_trait]
impl Auther for GithubOrgAuther {
    fn oauth_config(&self) -> &OAuthConfig {
        self.config()
    }

    async fn auth(&self, code: &str) -> Result<String> {
        let token: AccessTokenResponse = http_client()
            .post(GITHUB_TOKEN_URL)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&TokenExchangeRequest {
                client_id: &self.client_id,
                client_secret: &self.client_secret,
                code,
            })
            .send()
            .await
            .context("exchanging code for access token")?
            .error_for_status()
            .context("github token endpoint returned an error")?
            .json()
            .await
            .context("decoding access token response")?;

        let user: GithubUser = http_client()
            .get("https://api.github.com/user")
            .bearer_auth(&token.access_token)
            .header(reqwest::header::USER_AGENT, "portcullis")
            .send()
            .await
            .context("fetching authenticated user")?
            .error_for_status()
            .context("github user endpoint returned an error")?
            .json()
            .await
            .context("decoding user response")?;

        let orgs: Vec<GithubOrg> = http_client()
            .get("https://api.github.com/user/orgs")
            .bearer_auth(&token.access_token)
            .header(reqwest::header::USER_AGENT, "portcullis")
            .send()
            .await
            .context("fetching organization memberships")?
            .error_for_status()
            .context("github orgs endpoint returned an error")?
            .json()
            .await
            .context("decoding orgs response")?;

        if orgs.iter().any(|org| org.id == self.org_id) {
            Ok(user.login)
        } else {
            bail!("unauthorized")
        }
    }
}
