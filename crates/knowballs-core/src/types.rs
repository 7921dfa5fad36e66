use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    #[default]
    Answer,
    Visualizer,
}

impl QueryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryMode::Answer => "answer",
            QueryMode::Visualizer => "visualizer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "answer" => Some(QueryMode::Answer),
            "visualizer" => Some(QueryMode::Visualizer),
            _ => None,
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user as reported by the auth service. Never mutated locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sign_in_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_metadata: Value,
}

impl User {
    pub fn email_confirmed(&self) -> bool {
        self.email_confirmed_at.is_some()
    }
}

/// What `/api/auth/check` exposes about a user. Carries no credential material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPublicView {
    pub id: String,
    pub email: Option<String>,
    pub email_confirmed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_sign_in: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_metadata: Value,
}

impl From<&User> for UserPublicView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            email_confirmed: user.email_confirmed(),
            created_at: user.created_at,
            updated_at: user.updated_at,
            last_sign_in: user.last_sign_in_at,
            user_metadata: user.user_metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryItem {
    pub id: i64,
    pub user_id: String,
    pub prompt: String,
    pub answer: String,
    pub mode: QueryMode,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewHistoryItem {
    pub user_id: String,
    pub prompt: String,
    pub answer: String,
    pub mode: QueryMode,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub items: Vec<HistoryItem>,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pagination {
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub pages: u32,
}

impl Pagination {
    pub fn new(total: u64, page: u32, limit: u32) -> Self {
        let limit = limit.max(1);
        let pages = total.div_ceil(u64::from(limit));
        Self {
            total,
            page,
            limit,
            pages: u32::try_from(pages).unwrap_or(u32::MAX),
        }
    }

    pub fn has_more(&self) -> bool {
        self.page < self.pages
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryListResponse {
    pub success: bool,
    pub data: Vec<HistoryItem>,
    pub pagination: Pagination,
}
