use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;

use super::{Credential, IdentityProvider};
use crate::core::config::IdentityConfig;
use crate::core::error::AuthError;
use crate::core::terminal::{self, GuideSection};

const OOB_REDIRECT: &str = "urn:ietf:wg:oauth:2.0:oob";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Google OAuth2 installed-app flow: the user opens the consent URL and
/// pastes back the authorization code.
pub struct GoogleIdentityProvider {
    http: reqwest::Client,
    config: IdentityConfig,
    client_id: String,
    client_secret: String,
}

impl GoogleIdentityProvider {
    pub fn from_config(config: &IdentityConfig) -> Result<Self, AuthError> {
        let client_id = config.client_id().ok_or_else(|| {
            AuthError::NotConfigured("set identity.client_id or GRASSBOT_CLIENT_ID".to_string())
        })?;
        let client_secret = config.client_secret().ok_or_else(|| {
            AuthError::NotConfigured(
                "set identity.client_secret or GRASSBOT_CLIENT_SECRET".to_string(),
            )
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            config: config.clone(),
            client_id,
            client_secret,
        })
    }

    async fn token_request(&self, params: &[(&str, String)]) -> Result<TokenResponse, String> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| format!("HTTP request failed: {}", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("Failed to read response body: {}", e))?;

        if !status.is_success() {
            return Err(format!("token endpoint returned HTTP {}: {}", status, body));
        }

        parse_token_response(&body)
    }
}

pub fn generate_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

pub fn build_auth_url(
    config: &IdentityConfig,
    client_id: &str,
    state: &str,
    login_hint: &str,
) -> String {
    let scopes = config.scopes.join(" ");
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&login_hint={}&access_type=offline&prompt=consent",
        config.auth_url,
        urlencoding::encode(client_id),
        urlencoding::encode(OOB_REDIRECT),
        urlencoding::encode(&scopes),
        state,
        urlencoding::encode(login_hint)
    )
}

fn parse_token_response(body: &str) -> Result<TokenResponse, String> {
    let token: TokenResponse = serde_json::from_str(body)
        .map_err(|e| format!("Failed to parse token response: {}", e))?;

    if let Some(error) = token.error {
        let desc = token.error_description.unwrap_or_default();
        return Err(format!("OAuth error: {} - {}", error, desc));
    }
    Ok(token)
}

fn into_credential(
    token: TokenResponse,
    previous_refresh: Option<&str>,
    requested_scopes: &[String],
    now: DateTime<Utc>,
) -> Result<Credential, String> {
    let access_token = token
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| "No access_token in response".to_string())?;

    let scopes = match token.scope {
        Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
        None => requested_scopes.to_vec(),
    };

    Ok(Credential {
        access_token,
        // Google omits the refresh token on refresh responses.
        refresh_token: token
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string)),
        token_type: token.token_type.unwrap_or_else(|| "Bearer".to_string()),
        expires_at: token.expires_in.map(|secs| now + Duration::seconds(secs)),
        scopes,
    })
}

#[async_trait]
impl IdentityProvider for GoogleIdentityProvider {
    async fn authorize_interactive(
        &self,
        account: &str,
        scopes: &[String],
    ) -> Result<Credential, AuthError> {
        let state = generate_state();
        let mut config = self.config.clone();
        config.scopes = scopes.to_vec();
        let auth_url = build_auth_url(&config, &self.client_id, &state, account);

        terminal::print_step(&format!("Authorizing {}", account));
        GuideSection::new(&format!("Google sign-in · {}", account))
            .numbered(1, "Open this URL in your browser:")
            .blank()
            .text(&terminal::link(&auth_url))
            .blank()
            .numbered(2, "Grant access and paste the code shown below.")
            .open();

        let code = tokio::task::spawn_blocking(|| {
            inquire::Text::new("Paste authorization code:")
                .with_help_message("The code shown after granting access")
                .prompt()
        })
        .await
        .map_err(|e| AuthError::Interactive(e.to_string()))?
        .map_err(|e| AuthError::Interactive(e.to_string()))?;
        terminal::guide_bar();
        terminal::close_section();

        let code = code.trim().to_string();
        if code.is_empty() {
            return Err(AuthError::Interactive(
                "authorization code cannot be empty".to_string(),
            ));
        }

        let params = [
            ("code", code),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
            ("redirect_uri", OOB_REDIRECT.to_string()),
            ("grant_type", "authorization_code".to_string()),
        ];
        let token = self
            .token_request(&params)
            .await
            .map_err(AuthError::Interactive)?;
        into_credential(token, None, scopes, Utc::now()).map_err(AuthError::Interactive)
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError> {
        let refresh_token = credential
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::Refresh("credential has no refresh token".to_string()))?;

        let params = [
            ("refresh_token", refresh_token.clone()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
            ("grant_type", "refresh_token".to_string()),
        ];
        let token = self
            .token_request(&params)
            .await
            .map_err(AuthError::Refresh)?;
        into_credential(
            token,
            Some(refresh_token.as_str()),
            &credential.scopes,
            Utc::now(),
        )
        .map_err(AuthError::Refresh)
    }
}
