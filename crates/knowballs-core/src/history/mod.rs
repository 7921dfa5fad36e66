mod in_memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    error::ApiError,
    types::{HistoryItem, HistoryPage, NewHistoryItem, Pagination, QueryMode, User},
};

pub use in_memory::InMemoryHistoryStore;
pub use postgres::PostgresHistoryStore;

pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub page: u32,
    pub limit: u32,
    pub search: Option<String>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
            search: None,
        }
    }
}

impl HistoryQuery {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

/// Raw query-string parameters of `GET /api/history`.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub query: Option<String>,
}

impl From<HistoryParams> for HistoryQuery {
    fn from(params: HistoryParams) -> Self {
        let page = parse_positive(params.page.as_deref()).unwrap_or(1);
        let limit = parse_positive(params.limit.as_deref())
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .min(MAX_PAGE_LIMIT);
        let search = params
            .query
            .map(|query| query.trim().to_owned())
            .filter(|query| !query.is_empty());
        Self {
            page,
            limit,
            search,
        }
    }
}

fn parse_positive(raw: Option<&str>) -> Option<u32> {
    raw?.trim().parse::<i64>().ok().map(|value| value.clamp(1, i64::from(u32::MAX)) as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotOwner,
    Missing,
}

/// Row-level persistence for question history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Items owned by `user_id`, newest first (ties broken by id), with the
    /// filtered total.
    async fn list(&self, user_id: &str, query: &HistoryQuery) -> anyhow::Result<HistoryPage>;

    async fn insert(&self, item: NewHistoryItem) -> anyhow::Result<HistoryItem>;

    /// Deletes `id` only if `user_id` owns it, as a single operation.
    async fn delete_owned(&self, user_id: &str, id: i64) -> anyhow::Result<DeleteOutcome>;
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Missing required fields")]
    MissingFields,
    #[error("Invalid request body")]
    InvalidBody,
    #[error("Missing required parameter: id")]
    MissingId,
    #[error("Invalid mode: {0}")]
    InvalidMode(String),
    #[error("Unauthorized: You do not have permission to delete this item")]
    Forbidden,
    #[error("Question history item not found")]
    NotFound,
    #[error("history store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl From<HistoryError> for ApiError {
    fn from(error: HistoryError) -> Self {
        match error {
            HistoryError::MissingFields
            | HistoryError::InvalidBody
            | HistoryError::MissingId
            | HistoryError::InvalidMode(_) => ApiError::Validation(error.to_string()),
            HistoryError::Forbidden => ApiError::Forbidden(error.to_string()),
            HistoryError::NotFound => ApiError::NotFound(error.to_string()),
            HistoryError::Store(source) => ApiError::Unexpected(source),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SaveHistoryRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

/// A save request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedSave {
    prompt: String,
    answer: String,
    mode: QueryMode,
}

impl SaveHistoryRequest {
    /// Parses a raw body. Content type is not checked.
    pub fn from_slice(body: &[u8]) -> Result<Self, HistoryError> {
        serde_json::from_slice(body).map_err(|_| HistoryError::InvalidBody)
    }

    pub fn validate(self) -> Result<ValidatedSave, HistoryError> {
        let prompt = self.prompt.filter(|prompt| !prompt.is_empty());
        let answer = self.answer.filter(|answer| !answer.is_empty());
        let (Some(prompt), Some(answer)) = (prompt, answer) else {
            return Err(HistoryError::MissingFields);
        };
        let mode = match self.mode.as_deref() {
            None | Some("") => QueryMode::Answer,
            Some(raw) => {
                QueryMode::parse(raw).ok_or_else(|| HistoryError::InvalidMode(raw.to_owned()))?
            }
        };
        Ok(ValidatedSave {
            prompt,
            answer,
            mode,
        })
    }
}

/// User-scoped history operations. Every call takes the session-authenticated
/// user; ids supplied by clients are never trusted for ownership.
#[derive(Clone)]
pub struct HistoryService {
    store: Arc<dyn HistoryStore>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    pub async fn list(
        &self,
        user: &User,
        query: &HistoryQuery,
    ) -> Result<(Vec<HistoryItem>, Pagination), HistoryError> {
        let page = self
            .store
            .list(&user.id, query)
            .await
            .map_err(|error| error.context("failed to fetch question history"))?;
        let pagination = Pagination::new(page.total, query.page, query.limit);
        Ok((page.items, pagination))
    }

    pub async fn save(&self, user: &User, save: ValidatedSave) -> Result<HistoryItem, HistoryError> {
        let item = self
            .store
            .insert(NewHistoryItem {
                user_id: user.id.clone(),
                prompt: save.prompt,
                answer: save.answer,
                mode: save.mode,
            })
            .await
            .map_err(|error| error.context("failed to save question history"))?;
        info!(user_id = %user.id, item_id = item.id, mode = %item.mode, "question history saved");
        Ok(item)
    }

    pub async fn delete(&self, user: &User, id: &str) -> Result<(), HistoryError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(HistoryError::MissingId);
        }
        let Ok(id) = id.parse::<i64>() else {
            return Err(HistoryError::NotFound);
        };

        let outcome = self
            .store
            .delete_owned(&user.id, id)
            .await
            .map_err(|error| error.context("failed to delete question history item"))?;
        match outcome {
            DeleteOutcome::Deleted => {
                info!(user_id = %user.id, item_id = id, "question history item deleted");
                Ok(())
            }
            DeleteOutcome::NotOwner => {
                warn!(user_id = %user.id, item_id = id, "refused delete of foreign history item");
                Err(HistoryError::Forbidden)
            }
            DeleteOutcome::Missing => Err(HistoryError::NotFound),
        }
    }
}
