use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    response::IntoResponse,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    error::ApiError,
    history::{HistoryError, HistoryParams, HistoryQuery, SaveHistoryRequest, ValidatedSave},
    types::{HistoryListResponse, User},
};

use super::{AppState, authenticated_user};

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    id: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let (jar, user) = authenticated_user(&state, jar).await;
    (jar, list_page(&state, user, HistoryQuery::from(params)).await)
}

async fn list_page(
    state: &AppState,
    user: Result<User, ApiError>,
    query: HistoryQuery,
) -> Result<Json<HistoryListResponse>, ApiError> {
    let user = user?;
    let (data, pagination) = state.history.list(&user, &query).await?;
    Ok(Json(HistoryListResponse {
        success: true,
        data,
        pagination,
    }))
}

pub async fn save(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Bytes,
) -> impl IntoResponse {
    // The body is checked before the session so a bad request never reaches the store.
    let save = match SaveHistoryRequest::from_slice(&body).and_then(SaveHistoryRequest::validate) {
        Ok(save) => save,
        Err(error) => return (jar, Err::<Json<Value>, _>(ApiError::from(error))),
    };
    let (jar, user) = authenticated_user(&state, jar).await;
    (jar, save_item(&state, user, save).await)
}

async fn save_item(
    state: &AppState,
    user: Result<User, ApiError>,
    save: ValidatedSave,
) -> Result<Json<Value>, ApiError> {
    let user = user?;
    let item = state.history.save(&user, save).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Question history saved successfully",
        "data": [item],
    })))
}

pub async fn delete(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(params): Query<DeleteParams>,
) -> impl IntoResponse {
    let (jar, user) = authenticated_user(&state, jar).await;
    (jar, delete_item(&state, user, params.id.as_deref()).await)
}

async fn delete_item(
    state: &AppState,
    user: Result<User, ApiError>,
    id: Option<&str>,
) -> Result<Json<Value>, ApiError> {
    let user = user?;
    let id = id.ok_or(HistoryError::MissingId)?;
    state.history.delete(&user, id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Question history item deleted successfully",
    })))
}
