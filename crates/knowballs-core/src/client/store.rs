use std::sync::{Arc, Mutex, PoisonError};

use super::bus::{EventBus, Subscription};

pub const HOME_ITEM: &str = "Home";

/// Layout state shared by the sidebar and the main panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiState {
    pub sidebar_open: bool,
    pub active_item: String,
    pub is_mobile: bool,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            sidebar_open: true,
            active_item: HOME_ITEM.to_owned(),
            is_mobile: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiAction {
    ToggleSidebar,
    SetSidebarOpen(bool),
    SetActiveItem(String),
    /// Mobile layouts start with the sidebar closed, desktop with it open.
    ViewportChanged { is_mobile: bool },
    NewQuestion,
}

pub fn reduce(state: &UiState, action: UiAction) -> UiState {
    let mut next = state.clone();
    match action {
        UiAction::ToggleSidebar => next.sidebar_open = !state.sidebar_open,
        UiAction::SetSidebarOpen(open) => next.sidebar_open = open,
        UiAction::SetActiveItem(item) => next.active_item = item,
        UiAction::ViewportChanged { is_mobile } => {
            next.is_mobile = is_mobile;
            next.sidebar_open = !is_mobile;
        }
        UiAction::NewQuestion => {
            next.active_item = HOME_ITEM.to_owned();
            if state.is_mobile {
                next.sidebar_open = false;
            }
        }
    }
    next
}

/// Owns [`UiState`]; every change goes through [`reduce`].
#[derive(Clone, Default)]
pub struct UiStore {
    state: Arc<Mutex<UiState>>,
    changes: EventBus<UiState>,
}

impl UiStore {
    pub fn new(initial: UiState) -> Self {
        Self {
            state: Arc::new(Mutex::new(initial)),
            changes: EventBus::new(),
        }
    }

    pub fn state(&self) -> UiState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies `action` and notifies subscribers if the state changed.
    pub fn dispatch(&self, action: UiAction) -> UiState {
        let (next, changed) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let next = reduce(&state, action);
            let changed = next != *state;
            *state = next.clone();
            (next, changed)
        };
        if changed {
            self.changes.publish(&next);
        }
        next
    }

    pub fn subscribe(&self, listener: impl Fn(&UiState) + Send + Sync + 'static) -> Subscription {
        self.changes.subscribe(listener)
    }
}
