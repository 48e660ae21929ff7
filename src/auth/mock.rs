use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{Auther, OAuthConfig};

/// Returns a configured user string, or fails with a configured error
/// message. Exists only so tests can drive the OAuth state machine without
/// a real provider.
#[derive(Debug, Deserialize)]
pub struct MockAuther {
    #[serde(rename = "ClientID")]
    client_id: String,
    #[serde(rename = "ClientSecret")]
    client_secret: String,
    #[serde(rename = "User")]
    user: String,
    #[serde(rename = "Err", default)]
    err: String,

    #[serde(skip)]
    oauth_config: once_cell::sync::OnceCell<OAuthConfig>,
}

impl MockAuther {
    fn config(&self) -> &OAuthConfig {
        self.oauth_config.get_or_init(|| OAuthConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            scopes: Vec::new(),
            auth_url: "https://mock/auth".to_string(),
            token_url: "https://mock/token".to_string(),
            redirect_url: None,
        })
    }
}

#[async_trait]
impl Auther for MockAuther {
    fn oauth_config(&self) -> &OAuthConfig {
        self.config()
    }

    async fn auth(&self, _code: &str) -> Result<String> {
        if !self.err.is_empty() {
            bail!(self.err.clone());
        }
        Ok(self.user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_configured_user() {
        let auther: MockAuther = serde_json::from_value(serde_json::json!({
            "ClientID": "id",
            "ClientSecret": "secret",
            "User": "octocat",
        }))
        .unwrap();

        assert_eq!(auther.auth("code").await.unwrap(), "octocat");
    }

    #[tokio::test]
    async fn returns_configured_error() {
        let auther: MockAuther = serde_json::from_value(serde_json::json!({
            "ClientID": "id",
            "ClientSecret": "secret",
            "User": "octocat",
            "Err": "nope",
        }))
        .unwrap();

        let err = auther.auth("code").await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }
}
