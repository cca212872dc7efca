//! Shared pool of proxies lent to concurrent checks.
//!
//! Every mutation of a proxy's status or use count goes through the pool's
//! inner mutex: [`ProxyPool::checkout`] hands out a [`ProxyLease`], and
//! [`ProxyLease::checkin`] records the use and applies the ban policy.
//! Whether a proxy may be held by several checks at once is decided once,
//! at construction, by the [`BorrowMode`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::BotStatus;
use crate::proxy::{Proxy, WorkingStatus};
use crate::traits::ProxySource;

/// How long a check waits before retrying a reload when every source came
/// back empty.
const RELOAD_BACKOFF: Duration = Duration::from_secs(5);

/// What checkout does when no proxy can be lent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoValidProxyBehaviour {
    /// Lift bans older than the ban time.
    #[default]
    Unban,
    /// Fetch the sources again.
    Reload,
    /// Report exhaustion to the caller.
    DoNothing,
}

/// Ban policy and refresh settings for a [`ProxyPool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolOptions {
    pub shuffle_on_load: bool,
    pub no_valid_proxy_behaviour: NoValidProxyBehaviour,
    /// Seconds a ban lasts before the proxy may be lifted. Zero means bans
    /// expire immediately.
    pub ban_time_secs: u64,
    /// Zero means unlimited.
    pub max_uses_per_proxy: u32,
    pub never_ban: bool,
    /// Lend the same proxy to several checks at once.
    pub concurrent_use: bool,
    /// Zero disables periodic reloads.
    pub periodic_reload_interval_secs: u64,
    /// Statuses that ban the proxy they were observed through.
    pub ban_statuses: Vec<BotStatus>,
}

impl Default for ProxyPoolOptions {
    fn default() -> Self {
        Self {
            shuffle_on_load: true,
            no_valid_proxy_behaviour: NoValidProxyBehaviour::Unban,
            ban_time_secs: 240,
            max_uses_per_proxy: 0,
            never_ban: false,
            concurrent_use: false,
            periodic_reload_interval_secs: 0,
            ban_statuses: vec![BotStatus::Ban, BotStatus::Error],
        }
    }
}

impl ProxyPoolOptions {
    pub fn ban_time(&self) -> Duration {
        Duration::from_secs(self.ban_time_secs)
    }

    pub fn periodic_reload_interval(&self) -> Option<Duration> {
        (self.periodic_reload_interval_secs > 0)
            .then(|| Duration::from_secs(self.periodic_reload_interval_secs))
    }
}

/// Borrowing strategy, fixed for the lifetime of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BorrowMode {
    /// A proxy is held by at most one check at a time.
    Exclusive,
    /// A proxy may be held by any number of checks.
    Shared,
}

impl BorrowMode {
    fn admits(self, holders: u32) -> bool {
        match self {
            BorrowMode::Exclusive => holders == 0,
            BorrowMode::Shared => true,
        }
    }
}

/// Point-in-time counts, as exposed to control layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProxyPoolStats {
    pub total: usize,
    pub working: usize,
    pub banned: usize,
    pub untested: usize,
    /// Proxies currently lent to at least one check.
    pub held: usize,
}

#[derive(Debug, Clone)]
struct ProxyEntry {
    proxy: Proxy,
    status: WorkingStatus,
    uses: u32,
    holders: u32,
    banned_at: Option<Instant>,
    last_used: Option<DateTime<Utc>>,
}

impl ProxyEntry {
    fn new(proxy: Proxy) -> Self {
        Self {
            proxy,
            status: WorkingStatus::Untested,
            uses: 0,
            holders: 0,
            banned_at: None,
            last_used: None,
        }
    }

    fn is_banned(&self) -> bool {
        self.status == WorkingStatus::Banned
    }

    /// Outstanding holds count against the limit so concurrent use cannot
    /// overshoot it.
    fn within_limit(&self, max_uses: u32) -> bool {
        max_uses == 0 || self.uses + self.holders < max_uses
    }

    fn ban_expired(&self, ban_time: Duration) -> bool {
        self.is_banned() && self.banned_at.is_none_or(|at| at.elapsed() >= ban_time)
    }

    fn ban(&mut self) -> bool {
        if self.is_banned() {
            return false;
        }
        self.status = WorkingStatus::Banned;
        self.banned_at = Some(Instant::now());
        true
    }

    fn unban(&mut self) {
        self.status = WorkingStatus::Working;
        self.uses = 0;
        self.banned_at = None;
    }
}

enum Lend {
    Granted(Proxy),
    /// Nothing lendable now, but held proxies will come back.
    Busy,
    Exhausted,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<ProxyEntry>,
    index: HashMap<Proxy, usize>,
    cursor: usize,
    last_reload: Option<Instant>,
}

impl PoolState {
    fn entry_mut(&mut self, proxy: &Proxy) -> Option<&mut ProxyEntry> {
        let i = *self.index.get(proxy)?;
        self.entries.get_mut(i)
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.proxy.clone(), i))
            .collect();
    }

    /// Round-robin from the cursor over proxies the mode and limits admit.
    fn try_lend(&mut self, mode: BorrowMode, max_uses: u32) -> Lend {
        let len = self.entries.len();
        let mut busy = false;
        for offset in 0..len {
            let i = (self.cursor + offset) % len;
            let entry = &mut self.entries[i];
            if entry.is_banned() {
                continue;
            }
            if !entry.within_limit(max_uses) || !mode.admits(entry.holders) {
                busy |= entry.holders > 0;
                continue;
            }
            entry.holders += 1;
            self.cursor = (i + 1) % len;
            return Lend::Granted(entry.proxy.clone());
        }
        if busy { Lend::Busy } else { Lend::Exhausted }
    }

    fn next_ban_expiry(&self, ban_time: Duration) -> Option<Instant> {
        self.entries
            .iter()
            .filter(|e| e.is_banned())
            .filter_map(|e| e.banned_at)
            .min()
            .map(|at| at + ban_time)
    }
}

/// Rotating collection of proxies with ban, unban and reload policies.
pub struct ProxyPool {
    options: ProxyPoolOptions,
    mode: BorrowMode,
    sources: Vec<Arc<dyn ProxySource>>,
    state: Mutex<PoolState>,
    /// Serializes fetches; waiters that arrive during a reload reuse its result.
    reload_lock: tokio::sync::Mutex<()>,
    reloads: AtomicU64,
    available: Notify,
}

impl ProxyPool {
    pub fn new(options: ProxyPoolOptions, sources: Vec<Arc<dyn ProxySource>>) -> Self {
        let mode = if options.concurrent_use {
            BorrowMode::Shared
        } else {
            BorrowMode::Exclusive
        };
        Self {
            options,
            mode,
            sources,
            state: Mutex::new(PoolState::default()),
            reload_lock: tokio::sync::Mutex::new(()),
            reloads: AtomicU64::new(0),
            available: Notify::new(),
        }
    }

    pub fn options(&self) -> &ProxyPoolOptions {
        &self.options
    }

    pub fn mode(&self) -> BorrowMode {
        self.mode
    }

    /// Number of completed reloads.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Acquires the state lock, recovering from poison if necessary.
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy pool mutex");
            poisoned.into_inner()
        })
    }

    /// Borrow a proxy.
    ///
    /// Waits while every usable proxy is held by other checks. When none is
    /// usable at all, applies [`NoValidProxyBehaviour`] once and returns
    /// [`AppError::NoProxyAvailable`] if that did not help.
    pub async fn checkout(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<ProxyLease, AppError> {
        self.reload_if_due().await;

        let mut reloaded = false;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let lend = self
                .lock_state()
                .try_lend(self.mode, self.options.max_uses_per_proxy);
            match lend {
                Lend::Granted(proxy) => {
                    return Ok(ProxyLease {
                        pool: Arc::clone(self),
                        proxy,
                        returned: false,
                    });
                }
                Lend::Busy => {
                    tokio::select! {
                        () = notified.as_mut() => continue,
                        () = cancel.cancelled() => return Err(AppError::Cancelled),
                    }
                }
                Lend::Exhausted => {}
            }

            match self.options.no_valid_proxy_behaviour {
                NoValidProxyBehaviour::Unban if self.unban_expired() > 0 => {}
                NoValidProxyBehaviour::Reload if !reloaded => {
                    reloaded = true;
                    if let Err(e) = self.reload_reviving().await {
                        tracing::warn!(error = %e, "Reload on exhaustion failed");
                    }
                }
                _ => return Err(AppError::NoProxyAvailable),
            }
        }
    }

    /// Record one use of `proxy` with the status the check produced.
    /// Returns true if this check-in banned the proxy.
    fn checkin(&self, proxy: &Proxy, status: &BotStatus) -> bool {
        let options = &self.options;
        let banned = {
            let mut state = self.lock_state();
            let Some(entry) = state.entry_mut(proxy) else {
                tracing::debug!(%proxy, "Checked-in proxy is no longer in the pool");
                return false;
            };

            entry.holders = entry.holders.saturating_sub(1);
            entry.uses += 1;
            entry.last_used = Some(Utc::now());
            if entry.status == WorkingStatus::Untested {
                entry.status = WorkingStatus::Working;
            }

            let reason = if !options.never_ban && options.ban_statuses.contains(status) {
                Some("status")
            } else if options.max_uses_per_proxy > 0 && entry.uses >= options.max_uses_per_proxy {
                Some("max uses reached")
            } else {
                None
            };

            match reason {
                Some(reason) if entry.ban() => {
                    tracing::debug!(%proxy, %status, reason, uses = entry.uses, "Proxy banned");
                    true
                }
                _ => false,
            }
        };
        self.available.notify_waiters();
        banned
    }

    /// Drop a hold without recording a use.
    fn release(&self, proxy: &Proxy) {
        if let Some(entry) = self.lock_state().entry_mut(proxy) {
            entry.holders = entry.holders.saturating_sub(1);
        }
        self.available.notify_waiters();
    }

    /// Ban a proxy explicitly. Returns false if it was unknown or already banned.
    pub fn ban(&self, proxy: &Proxy) -> bool {
        self.lock_state()
            .entry_mut(proxy)
            .is_some_and(ProxyEntry::ban)
    }

    /// Return proxies whose ban is older than the ban time to working status.
    pub fn unban_expired(&self) -> usize {
        let ban_time = self.options.ban_time();
        let lifted = {
            let mut state = self.lock_state();
            let mut lifted = 0;
            for entry in state.entries.iter_mut().filter(|e| e.ban_expired(ban_time)) {
                entry.unban();
                lifted += 1;
            }
            lifted
        };
        if lifted > 0 {
            tracing::debug!(lifted, "Expired proxy bans lifted");
            self.available.notify_waiters();
        }
        lifted
    }

    /// Lift every ban regardless of age.
    pub fn unban_all(&self) -> usize {
        let lifted = {
            let mut state = self.lock_state();
            let mut lifted = 0;
            for entry in state.entries.iter_mut().filter(|e| e.is_banned()) {
                entry.unban();
                lifted += 1;
            }
            lifted
        };
        self.available.notify_waiters();
        lifted
    }

    /// Delete a proxy from the pool. Outstanding leases on it are ignored at check-in.
    pub fn remove(&self, proxy: &Proxy) -> bool {
        let removed = {
            let mut state = self.lock_state();
            let Some(i) = state.index.get(proxy).copied() else {
                return false;
            };
            state.entries.remove(i);
            state.rebuild_index();
            let len = state.entries.len();
            state.cursor = if len == 0 { 0 } else { state.cursor % len };
            true
        };
        self.available.notify_waiters();
        removed
    }

    /// Replace the working set with a fresh fetch from every source.
    ///
    /// Proxies that reappear keep their status and use count, except that
    /// bans older than the ban time are lifted. If every source fails the
    /// current set is kept. Callers that queued behind an in-progress reload
    /// reuse its result instead of fetching again. Returns the pool size.
    pub async fn reload(&self) -> Result<usize, AppError> {
        self.refresh(false).await
    }

    /// Reload because nothing can be lent. Every proxy that comes back from
    /// the sources is working again with a fresh use count.
    async fn reload_reviving(&self) -> Result<usize, AppError> {
        self.refresh(true).await
    }

    async fn refresh(&self, revive: bool) -> Result<usize, AppError> {
        let seen = self.reloads.load(Ordering::SeqCst);
        let _guard = self.reload_lock.lock().await;
        if self.reloads.load(Ordering::SeqCst) != seen {
            if revive {
                self.unban_all();
            }
            return Ok(self.len());
        }

        let results = join_all(self.sources.iter().map(|source| async move {
            (source.name(), source.fetch().await)
        }))
        .await;

        let mut fetched = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(proxies) => fetched.extend(proxies),
                Err(e) => {
                    tracing::warn!(source = %name, error = %e, "Proxy source failed");
                    failures.push(name);
                }
            }
        }

        if !self.sources.is_empty() && failures.len() == self.sources.len() {
            self.lock_state().last_reload = Some(Instant::now());
            self.reloads.fetch_add(1, Ordering::SeqCst);
            return Err(AppError::ProxySourceError {
                source_name: failures.join(", "),
                message: "every proxy source failed, keeping the current set".into(),
            });
        }

        let mut unique = HashSet::new();
        fetched.retain(|proxy| unique.insert(proxy.clone()));
        if self.options.shuffle_on_load {
            fetched.shuffle(&mut rand::thread_rng());
        }

        let ban_time = self.options.ban_time();
        let loaded = {
            let mut state = self.lock_state();
            let entries: Vec<ProxyEntry> = fetched
                .into_iter()
                .map(|proxy| {
                    let mut entry = match state.entry_mut(&proxy) {
                        Some(existing) => existing.clone(),
                        None => ProxyEntry::new(proxy),
                    };
                    if (revive && entry.is_banned()) || entry.ban_expired(ban_time) {
                        entry.unban();
                    }
                    entry
                })
                .collect();
            let dropped = state
                .entries
                .iter()
                .filter(|e| !unique.contains(&e.proxy))
                .count();

            state.entries = entries;
            state.rebuild_index();
            state.cursor = 0;
            state.last_reload = Some(Instant::now());

            tracing::info!(
                loaded = state.entries.len(),
                dropped,
                failed_sources = failures.len(),
                "Proxy pool reloaded"
            );
            state.entries.len()
        };

        self.reloads.fetch_add(1, Ordering::SeqCst);
        self.available.notify_waiters();
        Ok(loaded)
    }

    async fn reload_if_due(&self) {
        let Some(interval) = self.options.periodic_reload_interval() else {
            return;
        };
        let due = self
            .lock_state()
            .last_reload
            .is_none_or(|at| at.elapsed() >= interval);
        if due && let Err(e) = self.reload().await {
            tracing::warn!(error = %e, "Periodic proxy reload failed");
        }
    }

    /// Wait until checkout has a reason to be retried: a proxy exists that is
    /// not banned, the pool changed, or (in `Unban` mode) the oldest ban
    /// expires. Returns immediately if a non-banned proxy exists.
    pub async fn wait_available(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        let notified = self.available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let wake_at = {
            let state = self.lock_state();
            if state.entries.iter().any(|e| !e.is_banned()) {
                return Ok(());
            }
            match self.options.no_valid_proxy_behaviour {
                NoValidProxyBehaviour::Unban => state.next_ban_expiry(self.options.ban_time()),
                NoValidProxyBehaviour::Reload => Some(Instant::now() + RELOAD_BACKOFF),
                NoValidProxyBehaviour::DoNothing => None,
            }
        };

        let timer = async move {
            match wake_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = notified => Ok(()),
            () = timer => Ok(()),
            () = cancel.cancelled() => Err(AppError::Cancelled),
        }
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let state = self.lock_state();
        let mut stats = ProxyPoolStats {
            total: state.entries.len(),
            ..ProxyPoolStats::default()
        };
        for entry in &state.entries {
            match entry.status {
                WorkingStatus::Untested => stats.untested += 1,
                WorkingStatus::Working => stats.working += 1,
                WorkingStatus::Banned => stats.banned += 1,
            }
            if entry.holders > 0 {
                stats.held += 1;
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status and use count of a proxy, if it is in the pool.
    pub fn proxy_state(&self, proxy: &Proxy) -> Option<(WorkingStatus, u32)> {
        self.lock_state()
            .entry_mut(proxy)
            .map(|e| (e.status, e.uses))
    }
}

/// A borrowed proxy. Check it in with the observed status; dropping the
/// lease instead releases the hold without counting a use.
pub struct ProxyLease {
    pool: Arc<ProxyPool>,
    proxy: Proxy,
    returned: bool,
}

impl ProxyLease {
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Returns true if this check-in banned the proxy.
    pub fn checkin(mut self, status: &BotStatus) -> bool {
        self.returned = true;
        self.pool.checkin(&self.proxy, status)
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        if !self.returned {
            self.pool.release(&self.proxy);
        }
    }
}

impl std::fmt::Debug for ProxyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyLease")
            .field("proxy", &self.proxy.to_string())
            .finish()
    }
}
