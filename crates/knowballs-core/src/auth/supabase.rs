use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::types::{Session, User};

use super::{AuthBackend, AuthError, Credentials, EmailOtpType, SignUpOptions};

/// GoTrue REST client, reached through the project URL and its public (anon) key.
#[derive(Debug, Clone)]
pub struct SupabaseAuthBackend {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseAuthBackend {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self {
            client: Client::new(),
            base_url,
            anon_key: anon_key.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.base_url)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(self.endpoint(path))
            .header("apikey", &self.anon_key)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value, AuthError> {
        let response = builder
            .send()
            .await
            .context("auth service request failed")?;
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        let body = response
            .json::<Value>()
            .await
            .unwrap_or(Value::Null);

        if status.is_success() {
            return Ok(body);
        }

        if status.is_server_error() {
            warn!(%status, "auth service returned server error");
            return Err(AuthError::Service(anyhow::anyhow!(
                "auth service returned {status}"
            )));
        }

        let message = extract_error_message(&body)
            .unwrap_or_else(|| format!("auth request failed with status {}", status.as_u16()));
        debug!(%status, %message, "auth service rejected request");

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            && message.to_ascii_lowercase().contains("expired")
        {
            return Err(AuthError::Expired);
        }

        Err(AuthError::Rejected(message))
    }

    async fn token_grant(&self, grant_type: &str, body: Value) -> Result<Session, AuthError> {
        let builder = self
            .post("token")
            .query(&[("grant_type", grant_type)])
            .json(&body);
        let payload = self.send(builder).await?;
        parse_session(&payload).ok_or_else(|| {
            AuthError::Service(anyhow::anyhow!(
                "auth service returned no session for {grant_type} grant"
            ))
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[async_trait]
impl AuthBackend for SupabaseAuthBackend {
    async fn get_user(&self, access_token: &str) -> Result<User, AuthError> {
        let builder = self
            .client
            .get(self.endpoint("user"))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token);
        let payload = self.send(builder).await?;
        serde_json::from_value::<User>(payload)
            .context("auth service returned an unrecognized user payload")
            .map_err(AuthError::from)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError> {
        self.token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
    }

    async fn sign_in_with_password(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        self.token_grant(
            "password",
            json!({
                "email": credentials.email,
                "password": credentials.password,
            }),
        )
        .await
    }

    async fn sign_up(
        &self,
        credentials: &Credentials,
        options: &SignUpOptions,
    ) -> Result<Option<Session>, AuthError> {
        let mut body = json!({
            "email": credentials.email,
            "password": credentials.password,
        });
        if let Some(verifier) = &options.code_verifier {
            // "plain" keeps the challenge equal to the verifier stored in the cookie.
            body["code_challenge"] = json!(verifier);
            body["code_challenge_method"] = json!("plain");
        }

        let builder = self
            .post("signup")
            .query(&[("redirect_to", options.email_redirect_to.as_str())])
            .json(&body);
        let payload = self.send(builder).await?;
        Ok(parse_session(&payload))
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        let builder = self.post("logout").bearer_auth(access_token);
        self.send(builder).await?;
        Ok(())
    }

    async fn exchange_code_for_session(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<Session, AuthError> {
        self.token_grant(
            "pkce",
            json!({
                "auth_code": code,
                "code_verifier": code_verifier.unwrap_or_default(),
            }),
        )
        .await
    }

    async fn verify_otp(
        &self,
        token_hash: &str,
        otp_type: EmailOtpType,
    ) -> Result<Session, AuthError> {
        let builder = self.post("verify").json(&json!({
            "type": otp_type.as_str(),
            "token_hash": token_hash,
        }));
        let payload = self.send(builder).await?;
        parse_session(&payload).ok_or_else(|| {
            AuthError::Service(anyhow::anyhow!("otp verification returned no session"))
        })
    }
}

fn parse_session(payload: &Value) -> Option<Session> {
    payload.get("access_token")?;
    let token = serde_json::from_value::<TokenResponse>(payload.clone()).ok()?;
    let expires_at = session_expiry(token.expires_at, token.expires_in, Utc::now());
    Some(Session {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_at,
    })
}

fn session_expiry(
    expires_at: Option<i64>,
    expires_in: Option<i64>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if let Some(at) = expires_at.and_then(|seconds| DateTime::from_timestamp(seconds, 0)) {
        return at;
    }
    now + Duration::seconds(expires_in.unwrap_or(3600))
}

fn extract_error_message(body: &Value) -> Option<String> {
    ["msg", "error_description", "message", "error"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::{extract_error_message, parse_session, session_expiry};

    #[test]
    fn prefers_absolute_expiry_over_relative() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let absolute = session_expiry(Some(1_735_693_200), Some(60), now);
        assert_eq!(absolute.timestamp(), 1_735_693_200);

        let relative = session_expiry(None, Some(60), now);
        assert_eq!(relative, now + Duration::seconds(60));
    }

    #[test]
    fn signup_without_session_parses_as_none() {
        let pending = json!({ "id": "u1", "email": "a@b.c", "confirmation_sent_at": "2025-01-01T00:00:00Z" });
        assert!(parse_session(&pending).is_none());

        let issued = json!({
            "access_token": "at",
            "refresh_token": "rt",
            "expires_in": 3600,
            "token_type": "bearer"
        });
        let session = parse_session(&issued).expect("session");
        assert_eq!(session.access_token, "at");
        assert_eq!(session.refresh_token, "rt");
    }

    #[test]
    fn reads_each_gotrue_error_shape() {
        assert_eq!(
            extract_error_message(&json!({ "code": 400, "msg": "Invalid login credentials" })),
            Some("Invalid login credentials".to_owned())
        );
        assert_eq!(
            extract_error_message(&json!({ "error": "invalid_grant", "error_description": "Invalid Refresh Token" })),
            Some("Invalid Refresh Token".to_owned())
        );
        assert_eq!(extract_error_message(&json!({})), None);
    }
}
