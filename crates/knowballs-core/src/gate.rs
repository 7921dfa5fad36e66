use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;
use tracing::debug;

use crate::{http::AppState, session::SessionContext, types::User};

/// Path prefixes that need a session, and prefixes only meaningful without one.
#[derive(Debug, Clone)]
pub struct RouteRules {
    pub protected: Vec<&'static str>,
    pub guest_only: Vec<&'static str>,
}

impl Default for RouteRules {
    fn default() -> Self {
        Self {
            protected: vec!["/profile"],
            guest_only: vec!["/login", "/signup"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Continue,
    RedirectToLogin,
    RedirectToHome,
}

impl RouteRules {
    pub fn decide(&self, path: &str, authenticated: bool) -> GateDecision {
        if !authenticated && self.protected.iter().any(|prefix| under(path, prefix)) {
            return GateDecision::RedirectToLogin;
        }
        if authenticated && self.guest_only.iter().any(|prefix| under(path, prefix)) {
            return GateDecision::RedirectToHome;
        }
        GateDecision::Continue
    }
}

fn under(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// The session-validated user, placed in request extensions by [`auth_gate`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Option<User>);

/// Validates (and if needed rotates) the session before the wrapped routes run.
pub async fn auth_gate(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let mut sessions = state.sessions(jar, SessionContext::Middleware);
    let user = sessions.resolve_user(state.auth.as_ref()).await;
    let jar = sessions.into_jar();

    let path = request.uri().path().to_owned();
    let decision = state.routes.decide(&path, user.is_some());
    debug!(%path, authenticated = user.is_some(), ?decision, "auth gate");

    match decision {
        GateDecision::RedirectToLogin => (jar, Redirect::temporary("/login")).into_response(),
        GateDecision::RedirectToHome => (jar, Redirect::temporary("/")).into_response(),
        GateDecision::Continue => {
            request.extensions_mut().insert(CurrentUser(user));
            let response = next.run(request).await;
            (jar, response).into_response()
        }
    }
}
