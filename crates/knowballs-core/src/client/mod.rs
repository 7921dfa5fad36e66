pub mod api;
pub mod bus;
pub mod history_list;
pub mod main_view;
pub mod reset;
pub mod store;

use std::sync::Arc;

use tracing::debug;

use crate::types::QueryMode;

pub use api::{ApiClient, HistoryBackend, QueryBackend, SessionProbe};
pub use bus::{EventBus, Subscription, ViewEvent};
pub use history_list::{HistoryList, HistoryListState};
pub use main_view::{MainView, MainViewState, SearchOutcome};
pub use reset::{ComponentId, ResetGuard, ResetRegistry};
pub use store::{UiAction, UiState, UiStore};

pub const MAIN_VIEW: ComponentId = ComponentId("main-content");

pub struct ClientContext {
    pub bus: EventBus<ViewEvent>,
    pub store: UiStore,
    pub resets: ResetRegistry,
    pub main_view: MainView,
    pub history: HistoryList,
    _subscriptions: Vec<Subscription>,
    _main_reset: ResetGuard,
}

impl ClientContext {
    pub fn new<B>(backend: Arc<B>, initial_mode: QueryMode) -> Self
    where
        B: QueryBackend + HistoryBackend + 'static,
    {
        let bus = EventBus::new();
        let resets = ResetRegistry::default();
        let main_view = MainView::new(backend.clone(), initial_mode);
        let history = HistoryList::new(backend);

        let subscriptions = vec![main_view.attach(&bus), history.attach(&bus)];
        let view = main_view.clone();
        let main_reset = resets.register(MAIN_VIEW, move || view.reset());

        Self {
            bus,
            store: UiStore::default(),
            resets,
            main_view,
            history,
            _subscriptions: subscriptions,
            _main_reset: main_reset,
        }
    }

    /// The sidebar's "new question" action.
    pub fn new_question(&self) {
        let reset = self.resets.reset_all();
        let reached = self.bus.publish(&ViewEvent::ResetMainContent);
        debug!(reset, reached, "new question");
        self.store.dispatch(UiAction::NewQuestion);
    }

    pub fn select_history_item(&self, id: i64) -> bool {
        let selected = self.history.select(id, &self.bus);
        if selected && self.store.state().is_mobile {
            self.store.dispatch(UiAction::SetSidebarOpen(false));
        }
        selected
    }
}
