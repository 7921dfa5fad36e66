use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{Session, User};

use super::{AuthBackend, AuthError, Credentials, EmailOtpType, SignUpOptions};

#[derive(Debug, Clone)]
struct MockAccount {
    user: User,
    password: String,
}

#[derive(Debug, Clone)]
struct AccessGrant {
    user_id: String,
    expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MockAuthState {
    accounts: HashMap<String, MockAccount>,
    access_tokens: HashMap<String, AccessGrant>,
    refresh_tokens: HashMap<String, String>,
    auth_codes: HashMap<String, (String, Option<String>)>,
    otp_hashes: HashMap<String, String>,
}

/// In-process stand-in for the auth service, used for local runs and tests.
#[derive(Debug, Clone)]
pub struct MockAuthBackend {
    state: Arc<RwLock<MockAuthState>>,
    session_ttl: Duration,
}

impl Default for MockAuthBackend {
    fn default() -> Self {
        Self::new(Duration::hours(1))
    }
}

impl MockAuthBackend {
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(MockAuthState::default())),
            session_ttl,
        }
    }

    /// Creates a confirmed account.
    pub async fn seed_user(&self, email: &str, password: &str) -> User {
        let mut user = new_user(email);
        user.email_confirmed_at = Some(Utc::now());
        self.state.write().await.accounts.insert(
            email.to_owned(),
            MockAccount {
                user: user.clone(),
                password: password.to_owned(),
            },
        );
        user
    }

    pub async fn issue_session(&self, email: &str) -> Option<Session> {
        let mut state = self.state.write().await;
        let user_id = state.accounts.get(email)?.user.id.clone();
        Some(self.mint_session(&mut state, &user_id))
    }

    /// Marks an access token as already expired so the next lookup needs a refresh.
    pub async fn expire_access_token(&self, access_token: &str) {
        if let Some(grant) = self.state.write().await.access_tokens.get_mut(access_token) {
            grant.expires_at = Utc::now() - Duration::seconds(1);
        }
    }

    pub async fn revoke_refresh_token(&self, refresh_token: &str) {
        self.state.write().await.refresh_tokens.remove(refresh_token);
    }

    pub async fn issue_auth_code(&self, email: &str, code_verifier: Option<&str>) -> Option<String> {
        let mut state = self.state.write().await;
        let user_id = state.accounts.get(email)?.user.id.clone();
        let code = Uuid::new_v4().simple().to_string();
        state
            .auth_codes
            .insert(code.clone(), (user_id, code_verifier.map(str::to_owned)));
        Some(code)
    }

    pub async fn issue_otp_hash(&self, email: &str) -> Option<String> {
        let mut state = self.state.write().await;
        let user_id = state.accounts.get(email)?.user.id.clone();
        let hash = Uuid::new_v4().simple().to_string();
        state.otp_hashes.insert(hash.clone(), user_id);
        Some(hash)
    }

    pub async fn active_access_tokens(&self) -> usize {
        self.state.read().await.access_tokens.len()
    }

    fn mint_session(&self, state: &mut MockAuthState, user_id: &str) -> Session {
        let access_token = format!("at-{}", Uuid::new_v4().simple());
        let refresh_token = format!("rt-{}", Uuid::new_v4().simple());
        let expires_at = Utc::now() + self.session_ttl;

        state.access_tokens.insert(
            access_token.clone(),
            AccessGrant {
                user_id: user_id.to_owned(),
                expires_at,
            },
        );
        state
            .refresh_tokens
            .insert(refresh_token.clone(), user_id.to_owned());
        if let Some(account) = state
            .accounts
            .values_mut()
            .find(|account| account.user.id == user_id)
        {
            account.user.last_sign_in_at = Some(Utc::now());
        }

        Session {
            access_token,
            refresh_token,
            expires_at,
        }
    }

    fn confirm_and_mint(&self, state: &mut MockAuthState, user_id: &str) -> Session {
        if let Some(account) = state
            .accounts
            .values_mut()
            .find(|account| account.user.id == user_id)
        {
            if account.user.email_confirmed_at.is_none() {
                account.user.email_confirmed_at = Some(Utc::now());
                account.user.updated_at = Some(Utc::now());
            }
        }
        self.mint_session(state, user_id)
    }
}

fn new_user(email: &str) -> User {
    User {
        id: Uuid::new_v4().to_string(),
        email: Some(email.to_owned()),
        email_confirmed_at: None,
        created_at: Utc::now(),
        updated_at: Some(Utc::now()),
        last_sign_in_at: None,
        user_metadata: json!({}),
    }
}

#[async_trait]
impl AuthBackend for MockAuthBackend {
    async fn get_user(&self, access_token: &str) -> Result<User, AuthError> {
        let state = self.state.read().await;
        let grant = state
            .access_tokens
            .get(access_token)
            .ok_or_else(|| AuthError::Rejected("invalid JWT".to_owned()))?;
        if grant.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }

        state
            .accounts
            .values()
            .find(|account| account.user.id == grant.user_id)
            .map(|account| account.user.clone())
            .ok_or_else(|| AuthError::Rejected("User not found".to_owned()))
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let mut state = self.state.write().await;
        let user_id = state
            .refresh_tokens
            .remove(refresh_token)
            .ok_or_else(|| AuthError::Rejected("Invalid Refresh Token".to_owned()))?;
        Ok(self.mint_session(&mut state, &user_id))
    }

    async fn sign_in_with_password(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get(&credentials.email)
            .filter(|account| account.password == credentials.password)
            .ok_or_else(|| AuthError::Rejected("Invalid login credentials".to_owned()))?;
        if !account.user.email_confirmed() {
            return Err(AuthError::Rejected("Email not confirmed".to_owned()));
        }
        let user_id = account.user.id.clone();
        Ok(self.mint_session(&mut state, &user_id))
    }

    async fn sign_up(
        &self,
        credentials: &Credentials,
        options: &SignUpOptions,
    ) -> Result<Option<Session>, AuthError> {
        let mut state = self.state.write().await;
        if state.accounts.contains_key(&credentials.email) {
            return Err(AuthError::Rejected("User already registered".to_owned()));
        }
        if credentials.password.len() < 6 {
            return Err(AuthError::Rejected(
                "Password should be at least 6 characters.".to_owned(),
            ));
        }

        let user = new_user(&credentials.email);
        let user_id = user.id.clone();
        state.accounts.insert(
            credentials.email.clone(),
            MockAccount {
                user,
                password: credentials.password.clone(),
            },
        );
        // Confirmation link material, as the real service would email it.
        let code = Uuid::new_v4().simple().to_string();
        state
            .auth_codes
            .insert(code, (user_id, options.code_verifier.clone()));
        Ok(None)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        let mut state = self.state.write().await;
        let grant = state
            .access_tokens
            .remove(access_token)
            .ok_or_else(|| AuthError::Rejected("invalid JWT".to_owned()))?;
        state
            .refresh_tokens
            .retain(|_, user_id| *user_id != grant.user_id);
        Ok(())
    }

    async fn exchange_code_for_session(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<Session, AuthError> {
        let mut state = self.state.write().await;
        let (user_id, expected_verifier) = state
            .auth_codes
            .remove(code)
            .ok_or_else(|| AuthError::Rejected("invalid flow state, no valid flow state found".to_owned()))?;
        if let Some(expected) = expected_verifier {
            if code_verifier != Some(expected.as_str()) {
                return Err(AuthError::Rejected("code challenge does not match previously saved code verifier".to_owned()));
            }
        }
        Ok(self.confirm_and_mint(&mut state, &user_id))
    }

    async fn verify_otp(
        &self,
        token_hash: &str,
        _otp_type: EmailOtpType,
    ) -> Result<Session, AuthError> {
        let mut state = self.state.write().await;
        let user_id = state
            .otp_hashes
            .remove(token_hash)
            .ok_or_else(|| AuthError::Rejected("Token has expired or is invalid".to_owned()))?;
        Ok(self.confirm_and_mint(&mut state, &user_id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::auth::{AuthBackend, AuthError, Credentials, SignUpOptions};

    use super::MockAuthBackend;

    fn credentials(email: &str, password: &str) -> Credentials {
        Credentials {
            email: email.to_owned(),
            password: password.to_owned(),
        }
    }

    #[tokio::test]
    async fn refresh_rotates_tokens_once() {
        let auth = MockAuthBackend::default();
        auth.seed_user("fan@example.com", "hunter22").await;
        let session = auth
            .sign_in_with_password(&credentials("fan@example.com", "hunter22"))
            .await
            .expect("sign in");

        let rotated = auth
            .refresh_session(&session.refresh_token)
            .await
            .expect("refresh");
        assert_ne!(rotated.access_token, session.access_token);

        let reused = auth.refresh_session(&session.refresh_token).await;
        assert!(matches!(reused, Err(AuthError::Rejected(_))));
    }

    #[tokio::test]
    async fn expired_tokens_report_expiry() {
        let auth = MockAuthBackend::new(Duration::seconds(-5));
        auth.seed_user("fan@example.com", "hunter22").await;
        let session = auth.issue_session("fan@example.com").await.expect("session");

        let result = auth.get_user(&session.access_token).await;
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn signup_requires_confirmation_before_login() {
        let auth = MockAuthBackend::default();
        let options = SignUpOptions {
            email_redirect_to: "http://localhost:3000/auth/callback".to_owned(),
            code_verifier: None,
        };
        let session = auth
            .sign_up(&credentials("new@example.com", "hunter22"), &options)
            .await
            .expect("sign up");
        assert!(session.is_none());

        let login = auth
            .sign_in_with_password(&credentials("new@example.com", "hunter22"))
            .await;
        assert!(matches!(login, Err(AuthError::Rejected(message)) if message == "Email not confirmed"));

        let hash = auth.issue_otp_hash("new@example.com").await.expect("otp");
        let confirmed = auth
            .verify_otp(&hash, crate::auth::EmailOtpType::Signup)
            .await
            .expect("verify");
        let user = auth.get_user(&confirmed.access_token).await.expect("user");
        assert!(user.email_confirmed());
    }

    #[tokio::test]
    async fn code_exchange_checks_verifier() {
        let auth = MockAuthBackend::default();
        auth.seed_user("fan@example.com", "hunter22").await;
        let code = auth
            .issue_auth_code("fan@example.com", Some("verifier-1"))
            .await
            .expect("code");

        let wrong = auth.exchange_code_for_session(&code, Some("other")).await;
        assert!(matches!(wrong, Err(AuthError::Rejected(_))));
    }
}
