mod auth;
mod history;
mod pages;
mod proxy;

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use axum_extra::extract::cookie::CookieJar;
use tower_http::trace::TraceLayer;

use crate::{
    auth::{AuthBackend, AuthError},
    error::ApiError,
    gate::{RouteRules, auth_gate},
    history::HistoryService,
    proxy::InferenceProxy,
    session::{SessionContext, SessionPolicy, SessionStore},
    types::User,
};

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<dyn AuthBackend>,
    pub history: HistoryService,
    pub proxy: Arc<InferenceProxy>,
    pub session_policy: SessionPolicy,
    pub routes: RouteRules,
    /// Public origin, without a trailing slash.
    pub site_url: String,
}

impl AppState {
    pub fn sessions(&self, jar: CookieJar, context: SessionContext) -> SessionStore {
        SessionStore::new(jar, context, self.session_policy)
    }
}

pub fn router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/profile", get(pages::profile))
        .route("/profile/{*rest}", get(pages::profile))
        .route("/login", get(pages::login))
        .route("/signup", get(pages::signup))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_gate));

    Router::new()
        .route("/", get(pages::index))
        .route("/health", get(health))
        .route("/check-email", get(pages::check_email))
        .route("/error", get(pages::error))
        .route("/api/auth/check", get(auth::check))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/signup", post(auth::signup))
        .route("/api/auth/signout", post(auth::signout))
        .route("/auth/callback", get(auth::callback))
        .route("/auth/confirm", get(auth::confirm))
        .route("/api/history", get(history::list))
        .route("/api/history/save", post(history::save))
        .route("/api/history/delete", delete(history::delete))
        .route("/api/proxy", get(proxy::describe).post(proxy::forward))
        .merge(gated)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Session check for JSON routes. The returned jar carries any rotated
/// cookies and has to go back out with the response.
async fn authenticated_user(
    state: &AppState,
    jar: CookieJar,
) -> (CookieJar, Result<User, ApiError>) {
    let mut sessions = state.sessions(jar, SessionContext::Api);
    let user = match sessions.authenticate(state.auth.as_ref()).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(ApiError::Unauthorized),
        Err(AuthError::Service(source)) => Err(ApiError::Unexpected(
            source.context("session validation failed"),
        )),
        Err(_) => Err(ApiError::Unauthorized),
    };
    (sessions.into_jar(), user)
}
