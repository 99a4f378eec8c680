//! Pending OpenID logins, keyed by the OAuth2 `state` parameter.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::crypto::random_token;
use crate::openid::OpenIdError;
use crate::user::RegInfo;

/// Random bytes behind a `state`.
pub const STATE_LENGTH: usize = 48;
/// Shortest delay between two sweeps.
const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
struct PendingAuth {
    created_at: Instant,
    provider: String,
    redirect_uri: String,
    data: RegInfo,
}

/// Concurrent TTL-bounded map of pending logins.
#[derive(Debug)]
pub struct StateCache {
    ttl: Duration,
    states: DashMap<String, PendingAuth>,
}

impl StateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            states: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Remember a login attempt at `provider` and return its fresh `state`.
    pub fn begin(
        &self,
        provider: impl Into<String>,
        redirect_uri: impl Into<String>,
        data: RegInfo,
    ) -> String {
        let state = random_token(STATE_LENGTH);
        self.states.insert(
            state.clone(),
            PendingAuth {
                created_at: Instant::now(),
                provider: provider.into(),
                redirect_uri: redirect_uri.into(),
                data,
            },
        );
        state
    }

    /// Find the login attempt behind `state`, begun at `provider`.
    ///
    /// The entry stays until swept, it is useless once its TTL elapsed.
    pub fn resolve(&self, state: &str, provider: &str) -> Result<(String, RegInfo), OpenIdError> {
        let pending = self.states.get(state).ok_or(OpenIdError::BadState)?;
        if pending.provider != provider || pending.created_at.elapsed() > self.ttl {
            return Err(OpenIdError::BadState);
        }
        Ok((pending.redirect_uri.clone(), pending.data.clone()))
    }

    /// Drop every expired entry, return how many were dropped.
    pub fn sweep(&self) -> usize {
        let before = self.states.len();
        self.states
            .retain(|_, pending| pending.created_at.elapsed() <= self.ttl);
        before.saturating_sub(self.states.len())
    }

    /// Sweep every TTL, at most once a second, until `shutdown` flips or its
    /// sender is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = cache.ttl.max(MIN_SWEEP_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = cache.sweep();
                        tracing::debug!(evicted, remaining = cache.len(), "openid states swept");
                    },
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("openid state sweeper stopped");
        })
    }
}
