use axum::{
    Extension, Json,
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;

use crate::{gate::CurrentUser, session::SessionContext, types::UserPublicView};

use super::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    error: Option<String>,
}

pub async fn index(State(state): State<AppState>, jar: CookieJar) -> String {
    let mut sessions = state.sessions(jar, SessionContext::Page);
    match sessions.resolve_user(state.auth.as_ref()).await {
        Some(user) => format!(
            "Knowballs API\nSigned in as {}",
            user.email.as_deref().unwrap_or(&user.id)
        ),
        None => "Knowballs API".to_owned(),
    }
}

pub async fn profile(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Response {
    match user {
        Some(user) => Json(UserPublicView::from(&user)).into_response(),
        None => Redirect::temporary("/login").into_response(),
    }
}

pub async fn login(Query(params): Query<PageParams>) -> String {
    with_error("Log in to Knowballs", params.error)
}

pub async fn signup(Query(params): Query<PageParams>) -> String {
    with_error("Create a Knowballs account", params.error)
}

pub async fn check_email() -> &'static str {
    "Check your email to confirm your account, then log in."
}

pub async fn error() -> &'static str {
    "Sorry, something went wrong."
}

fn with_error(title: &str, error: Option<String>) -> String {
    match error.filter(|error| !error.is_empty()) {
        Some(error) => format!("{title}\n\nError: {error}"),
        None => title.to_owned(),
    }
}
