//! Category → ordered candidate channels.
//!
//! The resolver only filters by breaker state. Budget is checked later by
//! the [`Router`](super::Router), one candidate at a time, because a
//! reservation should only happen for the channel actually attempted.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::config::store::ConfigStore;

use super::breaker::CircuitBreaker;
use super::task::{Category, ChannelId};

/// Expands a category into its currently usable fallback chain.
#[derive(Debug, Clone)]
pub struct FallbackResolver {
    store: Arc<ConfigStore>,
    breaker: Arc<CircuitBreaker>,
}

impl FallbackResolver {
    /// Create a resolver over `store`'s chains, filtered by `breaker`.
    pub fn new(store: Arc<ConfigStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { store, breaker }
    }

    /// The configured chain for `category` with circuit-open channels removed.
    ///
    /// `None` if the category is not configured. An empty list means every
    /// channel in the chain is open.
    pub fn resolve(&self, category: &Category) -> Option<Vec<ChannelId>> {
        self.resolve_at(category, Instant::now())
    }

    /// As [`FallbackResolver::resolve`], evaluated at `now`.
    pub fn resolve_at(&self, category: &Category, now: Instant) -> Option<Vec<ChannelId>> {
        let chain = self.store.chain(category)?;
        let candidates: Vec<ChannelId> = chain
            .iter()
            .filter(|id| !self.breaker.is_open_at(id, now))
            .cloned()
            .collect();
        debug!(
            category = %category,
            configured = chain.len(),
            candidates = candidates.len(),
            "fallback chain resolved"
        );
        Some(candidates)
    }
}
