//! Per-token identity cache with single-flight refresh.
//!
//! Each token maps to a slot that is either a ready entry or an in-flight
//! refresh. The in-flight refresh is a [`Shared`] future: the first caller
//! creates it, later callers clone and await it, and whichever caller polls it
//! to completion writes the result back. The lock is never held across an
//! await point.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;

use super::{Identity, ValidationError};
use crate::observability::metrics;

type RefreshResult = Result<Identity, ValidationError>;
type RefreshFuture = Shared<BoxFuture<'static, RefreshResult>>;

/// A validated identity and the instant it stops being served from cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub identity: Identity,
    /// `min(token expiry, stored_at + max_age)`.
    pub expires_at: DateTime<Utc>,
}

enum Slot {
    Ready(CacheEntry),
    Refreshing {
        /// Distinguishes this refresh from a later one for the same token.
        generation: u64,
        refresh: RefreshFuture,
    },
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<String, Slot>,
    next_generation: u64,
}

enum Lookup {
    Hit(Identity),
    Join(RefreshFuture),
    Miss,
}

/// Token cache shared by every request.
pub struct TokenCache {
    state: Arc<Mutex<CacheState>>,
    max_age: Duration,
    max_entries: usize,
}

impl TokenCache {
    pub fn new(max_age: Duration, max_entries: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            max_age,
            max_entries,
        }
    }

    /// Return the cached identity for `token`, or resolve it with `refresh`.
    ///
    /// `refresh` is only invoked when no fresh entry exists and no other
    /// caller is already refreshing this token.
    pub async fn get_or_refresh<F>(&self, token: &str, refresh: F) -> RefreshResult
    where
        F: FnOnce() -> BoxFuture<'static, RefreshResult>,
    {
        let shared = {
            let mut state = self.state.lock();
            let now = Utc::now();

            let lookup = match state.slots.get(token) {
                Some(Slot::Ready(entry)) if now < entry.expires_at => {
                    Lookup::Hit(entry.identity.clone())
                }
                Some(Slot::Refreshing { refresh, .. }) => Lookup::Join(refresh.clone()),
                // Expired entries fall through and are replaced below.
                _ => Lookup::Miss,
            };

            match lookup {
                Lookup::Hit(identity) => {
                    metrics::record_token_cache("hit");
                    return Ok(identity);
                }
                Lookup::Join(shared) => {
                    metrics::record_token_cache("shared");
                    shared
                }
                Lookup::Miss => {
                    metrics::record_token_cache("miss");
                    if state.slots.len() >= self.max_entries && !state.slots.contains_key(token) {
                        sweep(&mut state, now, self.max_entries);
                    }

                    let generation = state.next_generation;
                    state.next_generation = state.next_generation.wrapping_add(1);

                    let shared = store_on_completion(
                        self.state.clone(),
                        token.to_string(),
                        generation,
                        self.max_age,
                        refresh(),
                    )
                    .boxed()
                    .shared();

                    state.slots.insert(
                        token.to_string(),
                        Slot::Refreshing {
                            generation,
                            refresh: shared.clone(),
                        },
                    );
                    shared
                }
            }
        };

        shared.await
    }

    /// Ready entry for `token`, if any (expired or not).
    pub fn peek(&self, token: &str) -> Option<CacheEntry> {
        match self.state.lock().slots.get(token) {
            Some(Slot::Ready(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Number of slots (ready and refreshing).
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Await the refresh, then publish its outcome if this refresh still owns the slot.
async fn store_on_completion(
    state: Arc<Mutex<CacheState>>,
    token: String,
    generation: u64,
    max_age: Duration,
    fetch: BoxFuture<'static, RefreshResult>,
) -> RefreshResult {
    let result = fetch.await;

    let mut state = state.lock();
    let owns_slot = matches!(
        state.slots.get(&token),
        Some(Slot::Refreshing { generation: g, .. }) if *g == generation
    );
    if !owns_slot {
        return result;
    }

    match &result {
        Ok(identity) => {
            let now = Utc::now();
            let cap = chrono::Duration::from_std(max_age)
                .ok()
                .and_then(|age| now.checked_add_signed(age))
                .unwrap_or(identity.expires_at);
            let entry = CacheEntry {
                identity: identity.clone(),
                expires_at: identity.expires_at.min(cap),
            };
            state.slots.insert(token, Slot::Ready(entry));
        }
        Err(_) => {
            // Failures are not cached; the next caller starts a new refresh.
            state.slots.remove(&token);
        }
    }

    result
}

/// Drop expired entries; if still full, drop the half closest to expiry.
fn sweep(state: &mut CacheState, now: DateTime<Utc>, max_entries: usize) {
    let before = state.slots.len();
    state.slots.retain(|_, slot| match slot {
        Slot::Ready(entry) => now < entry.expires_at,
        Slot::Refreshing { .. } => true,
    });

    if state.slots.len() >= max_entries {
        let mut ready: Vec<(String, DateTime<Utc>)> = state
            .slots
            .iter()
            .filter_map(|(token, slot)| match slot {
                Slot::Ready(entry) => Some((token.clone(), entry.expires_at)),
                Slot::Refreshing { .. } => None,
            })
            .collect();
        ready.sort_by_key(|(_, expires_at)| *expires_at);
        let drop_count = ready.len().div_ceil(2);
        for (token, _) in ready.into_iter().take(drop_count) {
            state.slots.remove(&token);
        }
    }

    tracing::debug!(
        before,
        after = state.slots.len(),
        "Swept token cache"
    );
}
