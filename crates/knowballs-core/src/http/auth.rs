use axum::{
    Form, Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    auth::{AuthError, Credentials, EmailOtpType, SignUpOptions},
    session::SessionContext,
    types::UserPublicView,
};

use super::AppState;

const MISSING_CREDENTIALS: &str = "Email and password are required";
const UNEXPECTED_FAILURE: &str = "An unexpected error occurred";

#[derive(Debug, Default, Deserialize)]
pub struct CredentialsForm {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

impl CredentialsForm {
    fn into_credentials(self) -> Option<Credentials> {
        if self.email.is_empty() || self.password.is_empty() {
            return None;
        }
        Some(Credentials {
            email: self.email,
            password: self.password,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmParams {
    token_hash: Option<String>,
    #[serde(rename = "type")]
    otp_type: Option<String>,
    next: Option<String>,
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<CredentialsForm>,
) -> Response {
    let Some(credentials) = form.into_credentials() else {
        return redirect_with_error("/login", MISSING_CREDENTIALS).into_response();
    };

    match state.auth.sign_in_with_password(&credentials).await {
        Ok(session) => {
            let mut sessions = state.sessions(jar, SessionContext::Api);
            sessions.store(&session);
            info!("user signed in");
            (sessions.into_jar(), Redirect::to("/")).into_response()
        }
        Err(error) => redirect_with_error("/login", &user_message(error, "sign-in")).into_response(),
    }
}

pub async fn signup(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<CredentialsForm>,
) -> Response {
    let Some(credentials) = form.into_credentials() else {
        return redirect_with_error("/signup", MISSING_CREDENTIALS).into_response();
    };

    let code_verifier = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    let options = SignUpOptions {
        email_redirect_to: format!("{}/auth/callback", state.site_url),
        code_verifier: Some(code_verifier.clone()),
    };

    match state.auth.sign_up(&credentials, &options).await {
        Ok(session) => {
            let mut sessions = state.sessions(jar, SessionContext::Api);
            sessions.store_code_verifier(&code_verifier);
            if let Some(session) = session {
                sessions.store(&session);
            }
            info!("user signed up; awaiting email confirmation");
            (sessions.into_jar(), Redirect::to("/check-email")).into_response()
        }
        Err(error) => redirect_with_error("/signup", &user_message(error, "sign-up")).into_response(),
    }
}

pub async fn signout(State(state): State<AppState>, jar: CookieJar) -> Response {
    let mut sessions = state.sessions(jar, SessionContext::Api);
    if let Some(access_token) = sessions.access_token() {
        match state.auth.sign_out(&access_token).await {
            Ok(()) => info!("user signed out"),
            Err(error) => warn!(?error, "auth service sign-out failed; clearing cookies anyway"),
        }
    }
    sessions.clear();
    (sessions.into_jar(), Redirect::to("/login")).into_response()
}

pub async fn check(State(state): State<AppState>, jar: CookieJar) -> Response {
    let mut sessions = state.sessions(jar, SessionContext::Api);
    if sessions.access_token().is_none() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "authenticated": false, "message": "No active session found" })),
        )
            .into_response();
    }

    let (status, body) = match sessions.authenticate(state.auth.as_ref()).await {
        Ok(Some(user)) => (
            StatusCode::OK,
            json!({ "authenticated": true, "user": UserPublicView::from(&user) }),
        ),
        Ok(None) => (
            StatusCode::UNAUTHORIZED,
            json!({ "authenticated": false, "error": "Invalid or expired session" }),
        ),
        Err(error) => {
            error!(?error, "authentication check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "authenticated": false,
                    "error": "Internal server error during authentication check",
                }),
            )
        }
    };
    (sessions.into_jar(), (status, Json(body))).into_response()
}

pub async fn callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Some(code) = params.code.filter(|code| !code.is_empty()) else {
        debug!("auth callback without code");
        return Redirect::temporary("/").into_response();
    };

    let mut sessions = state.sessions(jar, SessionContext::Api);
    let code_verifier = sessions.code_verifier();
    let target = match state
        .auth
        .exchange_code_for_session(&code, code_verifier.as_deref())
        .await
    {
        Ok(session) => {
            sessions.store(&session);
            sessions.clear_code_verifier();
            info!("auth code exchanged for session");
            safe_next(params.next.as_deref())
        }
        Err(error) => {
            warn!(?error, "auth code exchange failed");
            "/error".to_owned()
        }
    };
    (sessions.into_jar(), Redirect::temporary(&target)).into_response()
}

pub async fn confirm(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(params): Query<ConfirmParams>,
) -> Response {
    let token_hash = params.token_hash.filter(|hash| !hash.is_empty());
    let otp_type = params.otp_type.as_deref().and_then(EmailOtpType::parse);
    let (Some(token_hash), Some(otp_type)) = (token_hash, otp_type) else {
        debug!("email confirmation without usable token");
        return Redirect::temporary("/error").into_response();
    };

    let mut sessions = state.sessions(jar, SessionContext::Api);
    let target = match state.auth.verify_otp(&token_hash, otp_type).await {
        Ok(session) => {
            sessions.store(&session);
            info!(otp_type = otp_type.as_str(), "email token verified");
            safe_next(params.next.as_deref())
        }
        Err(error) => {
            warn!(?error, otp_type = otp_type.as_str(), "email token verification failed");
            "/error".to_owned()
        }
    };
    (sessions.into_jar(), Redirect::temporary(&target)).into_response()
}

fn user_message(error: AuthError, action: &str) -> String {
    match error {
        AuthError::Rejected(message) => {
            debug!(%message, action, "auth service rejected request");
            message
        }
        AuthError::Expired => error.to_string(),
        AuthError::Service(source) => {
            error!(error = ?source, action, "auth service call failed");
            UNEXPECTED_FAILURE.to_owned()
        }
    }
}

fn redirect_with_error(path: &str, message: &str) -> Redirect {
    Redirect::to(&format!("{path}?error={}", urlencoding::encode(message)))
}

/// Same-site absolute paths only; anything else lands on the home page.
fn safe_next(next: Option<&str>) -> String {
    match next {
        Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => {
            path.to_owned()
        }
        _ => "/".to_owned(),
    }
}
