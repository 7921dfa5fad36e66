mod mock;
mod supabase;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Session, User};

pub use mock::MockAuthBackend;
pub use supabase::SupabaseAuthBackend;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The service refused the request; the message is safe to show the user.
    #[error("{0}")]
    Rejected(String),
    #[error("session expired")]
    Expired,
    #[error("auth service error: {0}")]
    Service(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SignUpOptions {
    pub email_redirect_to: String,
    /// Verifier for the PKCE code the confirmation link will carry.
    pub code_verifier: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailOtpType {
    Signup,
    Invite,
    MagicLink,
    Recovery,
    EmailChange,
    Email,
}

impl EmailOtpType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "signup" => Some(Self::Signup),
            "invite" => Some(Self::Invite),
            "magiclink" => Some(Self::MagicLink),
            "recovery" => Some(Self::Recovery),
            "email_change" => Some(Self::EmailChange),
            "email" => Some(Self::Email),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signup => "signup",
            Self::Invite => "invite",
            Self::MagicLink => "magiclink",
            Self::Recovery => "recovery",
            Self::EmailChange => "email_change",
            Self::Email => "email",
        }
    }
}

/// The managed auth service: credential storage, session issue and validation.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn get_user(&self, access_token: &str) -> Result<User, AuthError>;

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError>;

    async fn sign_in_with_password(&self, credentials: &Credentials) -> Result<Session, AuthError>;

    /// Returns a session only when the service does not require email confirmation.
    async fn sign_up(
        &self,
        credentials: &Credentials,
        options: &SignUpOptions,
    ) -> Result<Option<Session>, AuthError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError>;

    async fn exchange_code_for_session(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<Session, AuthError>;

    async fn verify_otp(&self, token_hash: &str, otp_type: EmailOtpType)
    -> Result<Session, AuthError>;
}
