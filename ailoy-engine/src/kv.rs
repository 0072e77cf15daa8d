//! Accounting wrapper over the paged KV-state builtins.

use crate::backend::{KvBackend, KvConfig};
use crate::error::EngineError;

/// The single logical sequence a decode engine runs.
pub const SEQUENCE_ID: i64 = 0;

/// The paged KV cache owned by one decode engine.
///
/// Wraps the runtime's KV builtins with the invariants the engine relies
/// on: sequence 0 always exists, forward scopes always close, and the
/// effective window honors sliding-window configuration.
pub struct PagedKvCache {
    inner: Box<dyn KvBackend>,
    config: KvConfig,
}

impl PagedKvCache {
    /// Wrap a freshly created KV backend and add sequence 0.
    pub fn new(mut inner: Box<dyn KvBackend>, config: KvConfig) -> Self {
        inner.add_sequence(SEQUENCE_ID);
        Self { inner, config }
    }

    /// Tokens per page.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// The longest sequence this cache accepts: the sliding window when
    /// one is configured, else the context window.
    pub fn max_total_sequence_length(&self) -> usize {
        self.config
            .sliding_window_size
            .unwrap_or(self.config.context_window_size)
    }

    /// Remove every sequence and start a fresh sequence 0.
    pub fn clear(&mut self) {
        self.inner.clear();
        self.inner.add_sequence(SEQUENCE_ID);
    }

    /// Drop the last `count` committed tokens.
    pub fn popn(&mut self, count: usize) {
        if count > 0 {
            self.inner.popn(SEQUENCE_ID, count);
        }
    }

    /// Pages still free.
    pub fn available_pages(&self) -> usize {
        self.inner.available_pages()
    }

    /// Committed length of sequence 0.
    pub fn total_sequence_length(&self) -> usize {
        self.inner.total_sequence_length(SEQUENCE_ID)
    }

    /// Run `f` inside a forward scope of `length` positions.
    ///
    /// `end_forward` runs on every exit path, error or panic, so a failed
    /// kernel never leaves the scope open.
    pub fn forward<R>(
        &mut self,
        length: usize,
        f: impl FnOnce(&mut dyn KvBackend) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        struct Scope<'a>(&'a mut dyn KvBackend);
        impl Drop for Scope<'_> {
            fn drop(&mut self) {
                self.0.end_forward();
            }
        }

        self.inner.begin_forward(SEQUENCE_ID, length);
        let mut scope = Scope(self.inner.as_mut());
        f(&mut *scope.0)
    }
}

impl std::fmt::Debug for PagedKvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedKvCache")
            .field("config", &self.config)
            .field("total_sequence_length", &self.total_sequence_length())
            .field("available_pages", &self.available_pages())
            .finish()
    }
}
