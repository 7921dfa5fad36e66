use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId(pub &'static str);

type ResetCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registrations {
    next_token: u64,
    callbacks: HashMap<ComponentId, (u64, ResetCallback)>,
}

/// Parent-owned set of reset callbacks, one per component.
#[derive(Clone, Default)]
pub struct ResetRegistry {
    inner: Arc<Mutex<Registrations>>,
}

impl ResetRegistry {
    /// Registers `callback` for `id`, replacing any earlier one. The callback
    /// is removed when the guard drops, unless it was already replaced.
    #[must_use = "dropping the guard unregisters the callback"]
    pub fn register(
        &self,
        id: ComponentId,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> ResetGuard {
        let mut registrations = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let token = registrations.next_token;
        registrations.next_token += 1;
        registrations
            .callbacks
            .insert(id, (token, Arc::new(callback)));
        ResetGuard {
            registry: self.clone(),
            id,
            token,
        }
    }

    /// Runs every registered callback; returns how many ran.
    pub fn reset_all(&self) -> usize {
        let callbacks = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .values()
            .map(|(_, callback)| callback.clone())
            .collect::<Vec<_>>();
        debug!(count = callbacks.len(), "resetting registered components");
        for callback in &callbacks {
            callback();
        }
        callbacks.len()
    }

    pub fn is_registered(&self, id: ComponentId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .contains_key(&id)
    }
}

pub struct ResetGuard {
    registry: ResetRegistry,
    id: ComponentId,
    token: u64,
}

impl Drop for ResetGuard {
    fn drop(&mut self) {
        let mut registrations = self
            .registry
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if registrations
            .callbacks
            .get(&self.id)
            .is_some_and(|(token, _)| *token == self.token)
        {
            registrations.callbacks.remove(&self.id);
        }
    }
}
