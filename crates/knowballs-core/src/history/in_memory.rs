use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::types::{HistoryItem, HistoryPage, NewHistoryItem};

use super::{DeleteOutcome, HistoryQuery, HistoryStore};

#[derive(Debug)]
pub struct InMemoryHistoryStore {
    items: Arc<RwLock<Vec<HistoryItem>>>,
    next_id: AtomicI64,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self {
            items: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn list(&self, user_id: &str, query: &HistoryQuery) -> anyhow::Result<HistoryPage> {
        let needle = query.search.as_ref().map(|search| search.to_lowercase());
        let mut matches = self
            .items
            .read()
            .await
            .iter()
            .filter(|item| item.user_id == user_id)
            .filter(|item| {
                needle
                    .as_ref()
                    .is_none_or(|needle| item.prompt.to_lowercase().contains(needle))
            })
            .cloned()
            .collect::<Vec<_>>();

        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = matches.len() as u64;
        let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
        let items = matches
            .into_iter()
            .skip(offset)
            .take(query.limit as usize)
            .collect();

        Ok(HistoryPage { items, total })
    }

    async fn insert(&self, item: NewHistoryItem) -> anyhow::Result<HistoryItem> {
        let record = HistoryItem {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            user_id: item.user_id,
            prompt: item.prompt,
            answer: item.answer,
            mode: item.mode,
            created_at: Utc::now(),
        };
        self.items.write().await.push(record.clone());
        Ok(record)
    }

    async fn delete_owned(&self, user_id: &str, id: i64) -> anyhow::Result<DeleteOutcome> {
        let mut items = self.items.write().await;
        let Some(index) = items.iter().position(|item| item.id == id) else {
            return Ok(DeleteOutcome::Missing);
        };
        if items[index].user_id != user_id {
            return Ok(DeleteOutcome::NotOwner);
        }
        items.remove(index);
        Ok(DeleteOutcome::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        history::{DeleteOutcome, HistoryQuery, HistoryStore},
        types::{NewHistoryItem, QueryMode},
    };

    use super::InMemoryHistoryStore;

    fn new_item(user_id: &str, prompt: &str) -> NewHistoryItem {
        NewHistoryItem {
            user_id: user_id.to_owned(),
            prompt: prompt.to_owned(),
            answer: "answer".to_owned(),
            mode: QueryMode::Visualizer,
        }
    }

    #[tokio::test]
    async fn users_never_see_each_others_items() {
        let store = InMemoryHistoryStore::default();
        store.insert(new_item("a", "first")).await.expect("insert");
        store.insert(new_item("b", "second")).await.expect("insert");

        let page = store.list("a", &HistoryQuery::default()).await.expect("list");
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].prompt, "first");
    }

    #[tokio::test]
    async fn delete_reports_each_outcome() {
        let store = InMemoryHistoryStore::default();
        let item = store.insert(new_item("a", "first")).await.expect("insert");

        assert_eq!(
            store.delete_owned("b", item.id).await.expect("delete"),
            DeleteOutcome::NotOwner
        );
        assert_eq!(
            store.delete_owned("a", item.id).await.expect("delete"),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            store.delete_owned("a", item.id).await.expect("delete"),
            DeleteOutcome::Missing
        );
    }
}
