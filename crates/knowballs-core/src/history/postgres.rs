use async_trait::async_trait;
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::types::{HistoryItem, HistoryPage, NewHistoryItem, QueryMode};

use super::{DeleteOutcome, HistoryQuery, HistoryStore};

type HistoryRow = (i64, String, String, String, String, chrono::DateTime<chrono::Utc>);

#[derive(Debug, Clone)]
pub struct PostgresHistoryStore {
    pool: PgPool,
}

impl PostgresHistoryStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    async fn list(&self, user_id: &str, query: &HistoryQuery) -> anyhow::Result<HistoryPage> {
        let pattern = query
            .search
            .as_deref()
            .map(|search| format!("%{}%", escape_like(search)));
        let limit = i64::from(query.limit);
        let offset = i64::try_from(query.offset())?;

        let (total,) = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*)::bigint
             FROM question_history
             WHERE user_id = $1
               AND ($2::text IS NULL OR prompt ILIKE $2 ESCAPE '\\')",
        )
        .bind(user_id)
        .bind(pattern.as_deref())
        .fetch_one(&self.pool)
        .await?;

        let items = sqlx::query_as::<_, HistoryRow>(
            "SELECT id, user_id, prompt, answer, mode, created_at
             FROM question_history
             WHERE user_id = $1
               AND ($2::text IS NULL OR prompt ILIKE $2 ESCAPE '\\')
             ORDER BY created_at DESC, id DESC
             LIMIT $3 OFFSET $4",
        )
        .bind(user_id)
        .bind(pattern.as_deref())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(history_item)
        .collect::<Vec<_>>();

        Ok(HistoryPage {
            items,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    async fn insert(&self, item: NewHistoryItem) -> anyhow::Result<HistoryItem> {
        let row = sqlx::query_as::<_, HistoryRow>(
            "INSERT INTO question_history (user_id, prompt, answer, mode, created_at)
             VALUES ($1, $2, $3, $4, NOW())
             RETURNING id, user_id, prompt, answer, mode, created_at",
        )
        .bind(item.user_id)
        .bind(item.prompt)
        .bind(item.answer)
        .bind(item.mode.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(history_item(row))
    }

    async fn delete_owned(&self, user_id: &str, id: i64) -> anyhow::Result<DeleteOutcome> {
        // One statement: the owner lookup and the guarded delete see the same snapshot.
        let (owner, deleted) = sqlx::query_as::<_, (Option<String>, i64)>(
            "WITH target AS (
                 SELECT id, user_id FROM question_history WHERE id = $1
             ),
             removed AS (
                 DELETE FROM question_history q
                 USING target
                 WHERE q.id = target.id AND target.user_id = $2
                 RETURNING q.id
             )
             SELECT (SELECT user_id FROM target), (SELECT COUNT(*)::bigint FROM removed)",
        )
        .bind(id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(match owner {
            None => DeleteOutcome::Missing,
            Some(_) if deleted > 0 => DeleteOutcome::Deleted,
            Some(owner) if owner != user_id => DeleteOutcome::NotOwner,
            Some(_) => DeleteOutcome::Missing,
        })
    }
}

fn history_item(
    (id, user_id, prompt, answer, mode, created_at): HistoryRow,
) -> HistoryItem {
    HistoryItem {
        id,
        user_id,
        prompt,
        answer,
        mode: QueryMode::parse(&mode).unwrap_or_default(),
        created_at,
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for character in raw.chars() {
        if matches!(character, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(character);
    }
    escaped
}
