use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use tracing::{debug, warn};

use crate::{history::DEFAULT_PAGE_LIMIT, types::HistoryItem};

use super::{
    api::HistoryBackend,
    bus::{EventBus, Subscription, ViewEvent},
};

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryListState {
    pub items: Vec<HistoryItem>,
    pub page: u32,
    pub has_more: bool,
    pub search: Option<String>,
    /// Highlighted entry, if the main view is showing one.
    pub active_item: Option<i64>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl Default for HistoryListState {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            page: 1,
            has_more: false,
            search: None,
            active_item: None,
            is_loading: false,
            error: None,
        }
    }
}

struct ListInner {
    backend: Arc<dyn HistoryBackend>,
    limit: u32,
    state: Mutex<HistoryListState>,
    generation: AtomicU64,
}

/// Sidebar list of past questions, loaded page by page.
#[derive(Clone)]
pub struct HistoryList {
    inner: Arc<ListInner>,
}

impl HistoryList {
    pub fn new(backend: Arc<dyn HistoryBackend>) -> Self {
        Self::with_limit(backend, DEFAULT_PAGE_LIMIT)
    }

    pub fn with_limit(backend: Arc<dyn HistoryBackend>, limit: u32) -> Self {
        Self {
            inner: Arc::new(ListInner {
                backend,
                limit: limit.max(1),
                state: Mutex::new(HistoryListState::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> HistoryListState {
        self.lock_state().clone()
    }

    /// Reloads from page one. A signed-out user gets an empty list.
    pub async fn refresh(&self, search: Option<&str>) -> anyhow::Result<()> {
        let search = search
            .map(str::trim)
            .filter(|search| !search.is_empty())
            .map(str::to_owned);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.lock_state();
            state.search = search.clone();
            state.is_loading = true;
            state.error = None;
        }

        let result = self
            .inner
            .backend
            .list_history(1, self.inner.limit, search.as_deref())
            .await;

        let mut state = self.lock_state();
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            debug!("dropping stale history page");
            return Ok(());
        }
        state.is_loading = false;
        match result {
            Ok(Some(response)) => {
                state.items = response.data;
                state.page = response.pagination.page;
                state.has_more = response.pagination.has_more();
                Ok(())
            }
            Ok(None) => {
                state.items.clear();
                state.page = 1;
                state.has_more = false;
                Ok(())
            }
            Err(error) => {
                warn!(?error, "failed to load question history");
                state.error = Some("Failed to load history".to_owned());
                Err(error)
            }
        }
    }

    /// Appends the next page. Returns false when there was nothing to load.
    pub async fn load_more(&self) -> anyhow::Result<bool> {
        let (page, search, generation) = {
            let mut state = self.lock_state();
            if !state.has_more || state.is_loading {
                return Ok(false);
            }
            state.is_loading = true;
            (
                state.page + 1,
                state.search.clone(),
                self.inner.generation.load(Ordering::SeqCst),
            )
        };

        let result = self
            .inner
            .backend
            .list_history(page, self.inner.limit, search.as_deref())
            .await;

        let mut state = self.lock_state();
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return Ok(false);
        }
        state.is_loading = false;
        match result {
            Ok(Some(response)) => {
                let appended = !response.data.is_empty();
                state.items.extend(response.data);
                state.page = response.pagination.page;
                state.has_more = response.pagination.has_more();
                Ok(appended)
            }
            Ok(None) => {
                state.has_more = false;
                Ok(false)
            }
            Err(error) => {
                warn!(?error, page, "failed to load more question history");
                Err(error)
            }
        }
    }

    /// Highlights `id` and asks the main view to show it.
    pub fn select(&self, id: i64, bus: &EventBus<ViewEvent>) -> bool {
        let event = {
            let mut state = self.lock_state();
            let Some(item) = state.items.iter().find(|item| item.id == id) else {
                return false;
            };
            let event = ViewEvent::LoadHistoryQuestion {
                prompt: item.prompt.clone(),
                answer: item.answer.clone(),
                mode: item.mode,
            };
            state.active_item = Some(id);
            event
        };
        bus.publish(&event);
        true
    }

    /// Deletes `id`, then re-fetches the loaded pages so later pages start
    /// at the right offset.
    pub async fn delete(&self, id: i64) -> anyhow::Result<()> {
        self.inner.backend.delete_history(id).await?;
        {
            let mut state = self.lock_state();
            state.items.retain(|item| item.id != id);
            if state.active_item == Some(id) {
                state.active_item = None;
            }
        }
        if let Err(error) = self.reload_loaded_pages().await {
            warn!(?error, "failed to reload question history after delete");
        }
        Ok(())
    }

    async fn reload_loaded_pages(&self) -> anyhow::Result<()> {
        let (loaded, search, generation) = {
            let mut state = self.lock_state();
            state.is_loading = true;
            (
                state.page,
                state.search.clone(),
                self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1,
            )
        };

        let mut items = Vec::new();
        let mut last = None;
        let mut result = Ok(());
        for page in 1..=loaded {
            match self
                .inner
                .backend
                .list_history(page, self.inner.limit, search.as_deref())
                .await
            {
                Ok(Some(response)) => {
                    let done = !response.pagination.has_more();
                    items.extend(response.data);
                    last = Some(response.pagination);
                    if done {
                        break;
                    }
                }
                Ok(None) => {
                    last = None;
                    items.clear();
                    break;
                }
                Err(error) => {
                    result = Err(error);
                    break;
                }
            }
        }

        let mut state = self.lock_state();
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return result;
        }
        state.is_loading = false;
        if result.is_ok() {
            state.page = last.as_ref().map_or(1, |pagination| pagination.page);
            state.has_more = last.as_ref().is_some_and(|pagination| pagination.has_more());
            state.items = items;
        }
        result
    }

    pub fn clear_active(&self) {
        self.lock_state().active_item = None;
    }

    /// Drops the highlight whenever the main content is reset.
    pub fn attach(&self, bus: &EventBus<ViewEvent>) -> Subscription {
        let list = self.clone();
        bus.subscribe(move |event| {
            if matches!(event, ViewEvent::ResetMainContent) {
                list.clear_active();
            }
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, HistoryListState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
