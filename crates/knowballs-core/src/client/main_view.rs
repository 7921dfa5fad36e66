use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::{
    inference::{LessonData, QueryOutcome},
    types::QueryMode,
};

use super::{
    api::{QueryBackend, SessionProbe},
    bus::{EventBus, Subscription, ViewEvent},
};

pub const QUERY_FAILED_MESSAGE: &str = "Sorry, something went wrong while answering your question.";

#[derive(Debug, Clone, PartialEq)]
pub struct MainViewState {
    pub mode: QueryMode,
    pub prompt: Option<String>,
    pub answer: Option<String>,
    pub tool_used: Option<String>,
    pub data: LessonData,
    pub is_loading: bool,
    /// Set when a search was attempted without a session.
    pub auth_required: bool,
    pub error: Option<String>,
}

impl MainViewState {
    fn initial(mode: QueryMode) -> Self {
        Self {
            mode,
            prompt: None,
            answer: None,
            tool_used: None,
            data: LessonData::default(),
            is_loading: false,
            auth_required: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Blank prompt; nothing was sent.
    Ignored,
    Unauthenticated,
    /// Something newer replaced this search.
    Superseded,
    Displayed,
    Failed,
}

struct ViewInner {
    backend: Arc<dyn QueryBackend>,
    initial_mode: QueryMode,
    state: Mutex<MainViewState>,
    generation: AtomicU64,
    in_flight: Mutex<Option<AbortHandle>>,
}

/// View model of the main question/answer panel. At most one query is in
/// flight; starting another aborts it.
#[derive(Clone)]
pub struct MainView {
    inner: Arc<ViewInner>,
}

impl MainView {
    pub fn new(backend: Arc<dyn QueryBackend>, initial_mode: QueryMode) -> Self {
        Self {
            inner: Arc::new(ViewInner {
                backend,
                initial_mode,
                state: Mutex::new(MainViewState::initial(initial_mode)),
                generation: AtomicU64::new(0),
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> MainViewState {
        self.lock_state().clone()
    }

    pub async fn search(&self, prompt: &str, mode: QueryMode) -> SearchOutcome {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return SearchOutcome::Ignored;
        }

        // Claimed before the session check so anything newer wins.
        let generation = self.supersede();
        let probe = self.inner.backend.check_session().await;
        if !self.is_current(generation) {
            return SearchOutcome::Superseded;
        }

        match probe {
            Ok(SessionProbe::Unauthenticated) => {
                let mut state = self.lock_state();
                if !self.is_current(generation) {
                    return SearchOutcome::Superseded;
                }
                state.auth_required = true;
                state.is_loading = false;
                return SearchOutcome::Unauthenticated;
            }
            Ok(SessionProbe::Authenticated) => {}
            Err(error) => debug!(?error, "auth probe failed; continuing as signed in"),
        }

        {
            let mut state = self.lock_state();
            if !self.is_current(generation) {
                return SearchOutcome::Superseded;
            }
            *state = MainViewState {
                mode,
                prompt: Some(prompt.to_owned()),
                is_loading: true,
                ..MainViewState::initial(mode)
            };
        }

        let backend = self.inner.backend.clone();
        let owned_prompt = prompt.to_owned();
        let task = tokio::spawn(async move { backend.query(&owned_prompt, mode).await });
        self.track(generation, task.abort_handle());

        let result = match task.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_cancelled() => return SearchOutcome::Superseded,
            Err(join_error) => Err(anyhow::Error::new(join_error)),
        };

        let mut state = self.lock_state();
        if !self.is_current(generation) {
            return SearchOutcome::Superseded;
        }
        self.clear_in_flight(generation);

        match result {
            Ok(payload) => {
                let outcome = QueryOutcome::decode(&payload);
                state.answer = Some(outcome.answer.clone());
                state.tool_used = Some(outcome.tool_used);
                state.data = outcome.data;
                state.is_loading = false;
                drop(state);

                if outcome.answered {
                    self.save_in_background(prompt.to_owned(), outcome.answer, mode);
                }
                SearchOutcome::Displayed
            }
            Err(error) => {
                warn!(?error, "query failed");
                state.is_loading = false;
                state.error = Some(QUERY_FAILED_MESSAGE.to_owned());
                SearchOutcome::Failed
            }
        }
    }

    pub fn load_history(&self, prompt: &str, answer: &str, mode: QueryMode) {
        self.supersede();
        let mut state = self.lock_state();
        *state = MainViewState {
            prompt: Some(prompt.to_owned()),
            answer: Some(answer.to_owned()),
            data: LessonData {
                content: Vec::new(),
                combined_markdown: Some(answer.to_owned()),
            },
            ..MainViewState::initial(mode)
        };
    }

    pub fn reset(&self) {
        self.supersede();
        *self.lock_state() = MainViewState::initial(self.inner.initial_mode);
    }

    pub fn attach(&self, bus: &EventBus<ViewEvent>) -> Subscription {
        let view = self.clone();
        bus.subscribe(move |event| match event {
            ViewEvent::LoadHistoryQuestion {
                prompt,
                answer,
                mode,
            } => view.load_history(prompt, answer, *mode),
            ViewEvent::ResetMainContent => view.reset(),
        })
    }

    fn save_in_background(&self, prompt: String, answer: String, mode: QueryMode) {
        let backend = self.inner.backend.clone();
        tokio::spawn(async move {
            if let Err(error) = backend.save_history(&prompt, &answer, mode).await {
                warn!(?error, "failed to save question history");
            }
        });
    }

    /// Invalidates whatever is running and returns the new generation.
    fn supersede(&self) -> u64 {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = previous {
            debug!("aborting in-flight query");
            handle.abort();
        }
        generation
    }

    fn track(&self, generation: u64, handle: AbortHandle) {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_current(generation) {
            *in_flight = Some(handle);
        } else {
            handle.abort();
        }
    }

    fn clear_in_flight(&self, generation: u64) {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_current(generation) {
            *in_flight = None;
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MainViewState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use tokio::sync::{Notify, mpsc};

    use crate::{
        client::{
            api::{QueryBackend, SessionProbe},
            bus::{EventBus, ViewEvent},
        },
        inference::FALLBACK_ANSWER,
        types::QueryMode,
    };

    use super::{MainView, SearchOutcome};

    struct FakeBackend {
        probe: anyhow::Result<SessionProbe>,
        /// The next session check blocks until `check_release` fires.
        hold_next_check: AtomicBool,
        check_entered: Notify,
        check_release: Notify,
        /// Queries for this prompt block until released.
        slow_prompt: Option<&'static str>,
        release: Notify,
        saves: mpsc::UnboundedSender<(String, String, QueryMode)>,
        fail_saves: bool,
    }

    impl FakeBackend {
        fn new(
            probe: anyhow::Result<SessionProbe>,
        ) -> (Self, mpsc::UnboundedReceiver<(String, String, QueryMode)>) {
            let (saves, received) = mpsc::unbounded_channel();
            (
                Self {
                    probe,
                    hold_next_check: AtomicBool::new(false),
                    check_entered: Notify::new(),
                    check_release: Notify::new(),
                    slow_prompt: None,
                    release: Notify::new(),
                    saves,
                    fail_saves: false,
                },
                received,
            )
        }
    }

    #[async_trait]
    impl QueryBackend for FakeBackend {
        async fn check_session(&self) -> anyhow::Result<SessionProbe> {
            if self.hold_next_check.swap(false, Ordering::SeqCst) {
                self.check_entered.notify_one();
                self.check_release.notified().await;
            }
            match &self.probe {
                Ok(probe) => Ok(*probe),
                Err(error) => Err(anyhow::anyhow!("{error}")),
            }
        }

        async fn query(&self, prompt: &str, mode: QueryMode) -> anyhow::Result<Value> {
            if self.slow_prompt == Some(prompt) {
                self.release.notified().await;
            }
            if prompt == "broken" {
                anyhow::bail!("upstream unavailable");
            }
            if prompt == "empty" {
                return Ok(json!({}));
            }
            Ok(json!({
                "answer": format!("{prompt} ({mode})"),
                "tool_used": "stats",
                "tool_result": { "data": { "content": [{ "type": "markdown", "content": "md" }] } }
            }))
        }

        async fn save_history(
            &self,
            prompt: &str,
            answer: &str,
            mode: QueryMode,
        ) -> anyhow::Result<()> {
            let _ = self
                .saves
                .send((prompt.to_owned(), answer.to_owned(), mode));
            if self.fail_saves {
                anyhow::bail!("history store down");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_search_displays_and_saves() {
        let (backend, mut saves) = FakeBackend::new(Ok(SessionProbe::Authenticated));
        let view = MainView::new(Arc::new(backend), QueryMode::Answer);

        let outcome = view.search("  Who won?  ", QueryMode::Visualizer).await;
        assert_eq!(outcome, SearchOutcome::Displayed);

        let state = view.state();
        assert_eq!(state.prompt.as_deref(), Some("Who won?"));
        assert_eq!(state.answer.as_deref(), Some("Who won? (visualizer)"));
        assert_eq!(state.tool_used.as_deref(), Some("stats"));
        assert_eq!(state.data.content.len(), 1);
        assert!(!state.is_loading);

        let saved = tokio::time::timeout(Duration::from_secs(1), saves.recv())
            .await
            .expect("save in time")
            .expect("save");
        assert_eq!(
            saved,
            (
                "Who won?".to_owned(),
                "Who won? (visualizer)".to_owned(),
                QueryMode::Visualizer
            )
        );
    }

    #[tokio::test]
    async fn blank_prompt_is_ignored() {
        let (backend, _saves) = FakeBackend::new(Ok(SessionProbe::Authenticated));
        let view = MainView::new(Arc::new(backend), QueryMode::Answer);
        assert_eq!(view.search("   ", QueryMode::Answer).await, SearchOutcome::Ignored);
        assert!(view.state().prompt.is_none());
    }

    #[tokio::test]
    async fn unauthenticated_search_never_queries() {
        let (backend, _saves) = FakeBackend::new(Ok(SessionProbe::Unauthenticated));
        let view = MainView::new(Arc::new(backend), QueryMode::Answer);

        assert_eq!(
            view.search("Who won?", QueryMode::Answer).await,
            SearchOutcome::Unauthenticated
        );
        let state = view.state();
        assert!(state.auth_required);
        assert!(!state.is_loading);
        assert!(state.answer.is_none());
    }

    #[tokio::test]
    async fn failed_probe_counts_as_signed_in() {
        let (backend, _saves) = FakeBackend::new(Err(anyhow::anyhow!("network down")));
        let view = MainView::new(Arc::new(backend), QueryMode::Answer);
        assert_eq!(
            view.search("Who won?", QueryMode::Answer).await,
            SearchOutcome::Displayed
        );
    }

    #[tokio::test]
    async fn second_search_supersedes_the_first() {
        let (mut backend, mut saves) = FakeBackend::new(Ok(SessionProbe::Authenticated));
        backend.slow_prompt = Some("first");
        let backend = Arc::new(backend);
        let view = MainView::new(backend.clone(), QueryMode::Answer);

        let first_view = view.clone();
        let first = tokio::spawn(async move { first_view.search("first", QueryMode::Answer).await });
        while !view.state().is_loading {
            tokio::task::yield_now().await;
        }

        let second = view.search("second", QueryMode::Answer).await;
        backend.release.notify_waiters();

        assert_eq!(second, SearchOutcome::Displayed);
        assert_eq!(first.await.expect("join"), SearchOutcome::Superseded);
        assert_eq!(view.state().answer.as_deref(), Some("second (answer)"));

        let saved = saves.recv().await.expect("save");
        assert_eq!(saved.0, "second");
        assert!(saves.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_answer_falls_back_without_saving() {
        let (backend, mut saves) = FakeBackend::new(Ok(SessionProbe::Authenticated));
        let view = MainView::new(Arc::new(backend), QueryMode::Answer);

        assert_eq!(view.search("empty", QueryMode::Answer).await, SearchOutcome::Displayed);
        let state = view.state();
        assert_eq!(state.answer.as_deref(), Some(FALLBACK_ANSWER));
        assert_eq!(state.tool_used.as_deref(), Some("unknown"));
        assert!(state.data.content.is_empty());

        tokio::task::yield_now().await;
        assert!(saves.try_recv().is_err());
    }

    #[tokio::test]
    async fn query_failure_is_shown_and_save_failure_is_swallowed() {
        let (mut backend, mut saves) = FakeBackend::new(Ok(SessionProbe::Authenticated));
        backend.fail_saves = true;
        let view = MainView::new(Arc::new(backend), QueryMode::Answer);

        assert_eq!(view.search("broken", QueryMode::Answer).await, SearchOutcome::Failed);
        assert!(view.state().error.is_some());
        assert!(!view.state().is_loading);

        assert_eq!(view.search("fine", QueryMode::Answer).await, SearchOutcome::Displayed);
        saves.recv().await.expect("save attempted");
        assert_eq!(view.state().answer.as_deref(), Some("fine (answer)"));
    }

    #[tokio::test]
    async fn bus_events_drive_the_view() {
        let (backend, _saves) = FakeBackend::new(Ok(SessionProbe::Authenticated));
        let view = MainView::new(Arc::new(backend), QueryMode::Visualizer);
        let bus = EventBus::new();
        let _subscription = view.attach(&bus);

        bus.publish(&ViewEvent::LoadHistoryQuestion {
            prompt: "Who won?".into(),
            answer: "## Chicago".into(),
            mode: QueryMode::Answer,
        });
        let state = view.state();
        assert_eq!(state.answer.as_deref(), Some("## Chicago"));
        assert_eq!(state.data.combined_markdown.as_deref(), Some("## Chicago"));
        assert_eq!(state.mode, QueryMode::Answer);

        bus.publish(&ViewEvent::ResetMainContent);
        let state = view.state();
        assert!(state.answer.is_none());
        assert_eq!(state.mode, QueryMode::Visualizer);
    }

    #[tokio::test]
    async fn reset_cancels_in_flight_query() {
        let (mut backend, _saves) = FakeBackend::new(Ok(SessionProbe::Authenticated));
        backend.slow_prompt = Some("slow");
        let view = MainView::new(Arc::new(backend), QueryMode::Answer);

        let pending_view = view.clone();
        let pending = tokio::spawn(async move { pending_view.search("slow", QueryMode::Answer).await });
        while !view.state().is_loading {
            tokio::task::yield_now().await;
        }
        view.reset();

        assert_eq!(pending.await.expect("join"), SearchOutcome::Superseded);
        assert!(view.state().prompt.is_none());
        assert!(!view.state().is_loading);
    }

    #[tokio::test]
    async fn newer_search_wins_over_one_still_checking_the_session() {
        let (backend, mut saves) = FakeBackend::new(Ok(SessionProbe::Authenticated));
        backend.hold_next_check.store(true, Ordering::SeqCst);
        let backend = Arc::new(backend);
        let view = MainView::new(backend.clone(), QueryMode::Answer);

        let first_view = view.clone();
        let first = tokio::spawn(async move { first_view.search("first", QueryMode::Answer).await });
        backend.check_entered.notified().await;

        assert_eq!(
            view.search("second", QueryMode::Answer).await,
            SearchOutcome::Displayed
        );
        backend.check_release.notify_one();

        assert_eq!(first.await.expect("join"), SearchOutcome::Superseded);
        let state = view.state();
        assert_eq!(state.prompt.as_deref(), Some("second"));
        assert_eq!(state.answer.as_deref(), Some("second (answer)"));

        let saved = saves.recv().await.expect("save");
        assert_eq!(saved.0, "second");
        tokio::task::yield_now().await;
        assert!(saves.try_recv().is_err());
    }

    #[tokio::test]
    async fn reset_during_session_check_stays_reset() {
        let (backend, _saves) = FakeBackend::new(Ok(SessionProbe::Authenticated));
        backend.hold_next_check.store(true, Ordering::SeqCst);
        let backend = Arc::new(backend);
        let view = MainView::new(backend.clone(), QueryMode::Answer);

        let pending_view = view.clone();
        let pending = tokio::spawn(async move { pending_view.search("late", QueryMode::Answer).await });
        backend.check_entered.notified().await;
        view.reset();
        backend.check_release.notify_one();

        assert_eq!(pending.await.expect("join"), SearchOutcome::Superseded);
        let state = view.state();
        assert!(state.prompt.is_none());
        assert!(state.answer.is_none());
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn history_load_during_session_check_is_kept() {
        let (backend, _saves) = FakeBackend::new(Ok(SessionProbe::Unauthenticated));
        backend.hold_next_check.store(true, Ordering::SeqCst);
        let backend = Arc::new(backend);
        let view = MainView::new(backend.clone(), QueryMode::Answer);

        let pending_view = view.clone();
        let pending = tokio::spawn(async move { pending_view.search("late", QueryMode::Answer).await });
        backend.check_entered.notified().await;
        view.load_history("Who won?", "Chicago", QueryMode::Visualizer);
        backend.check_release.notify_one();

        assert_eq!(pending.await.expect("join"), SearchOutcome::Superseded);
        let state = view.state();
        assert_eq!(state.answer.as_deref(), Some("Chicago"));
        assert!(!state.auth_required);
    }
}
