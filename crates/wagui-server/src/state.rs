use std::sync::{Mutex, PoisonError};
use wag_core::SessionState;

/// Holder for the single current session state shared by handlers.
#[derive(Default)]
pub struct SessionStateHolder {
    inner: Mutex<SessionState>,
}

impl SessionStateHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> SessionState {
        self.lock().clone()
    }

    pub fn replace(&self, state: SessionState) -> SessionState {
        let mut current = self.lock();
        *current = state;
        current.clone()
    }

    /// Applies `f` in place and returns the resulting snapshot.
    pub fn update(&self, f: impl FnOnce(&mut SessionState)) -> SessionState {
        let mut current = self.lock();
        f(&mut current);
        current.clone()
    }

    pub fn reset(&self) -> SessionState {
        self.replace(SessionState::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
