//! Live index of the account metadata files in one vault's config directory.
//!
//! The cache keeps two views of the same account set: an ordered-by-URL
//! sequence for deterministic iteration and a per-address map for collision
//! detection. A directory watcher keeps it current where the platform
//! supports notifications; otherwise reloads are pulled by callers under a
//! throttle. Both paths converge on the same scanning routine.

mod file_cache;
mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::account::{Account, Address, WalletUrl};
use crate::config::AccountMetadata;
use crate::error::CacheError;

use file_cache::FileCache;
use watcher::WatcherState;

/// Minimum amount of time between cache reloads. This limit applies when the
/// platform does not support change notifications; it also bounds how often
/// we retry creating a watcher for a directory that does not exist yet.
pub const MIN_RELOAD_INTERVAL: Duration = Duration::from_secs(2);

/// Receives cache membership changes. Arrivals from the very first scan are
/// flagged so the initial directory load is not reported as churn.
pub trait ChangeListener: Send + Sync + 'static {
    fn account_arrived(&self, account: &Account, initial: bool);
    fn account_dropped(&self, account: &Account);
}

/// Schedules an indefinite unlock for an account. Must not block: unlocking
/// happens after the arrival has been reported and never delays scanning.
pub trait Unlocker: Send + Sync + 'static {
    fn unlock_indefinitely(&self, account: &Account);
}

struct CacheState {
    all: Vec<Account>,
    by_addr: HashMap<Address, Vec<Account>>,
    files: FileCache,
    last_reload: Option<Instant>,
    scanned_once: bool,
}

/// The account cache for one vault's config directory.
pub struct AccountCache {
    vault_url: String,
    dir: PathBuf,
    state: Mutex<CacheState>,
    listener: Arc<dyn ChangeListener>,
    unlocker: Arc<dyn Unlocker>,
    to_unlock: Vec<Address>,
    reload_notify: Notify,
    watcher: WatcherState,
    watcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl AccountCache {
    pub fn new(
        vault_url: String,
        dir: PathBuf,
        listener: Arc<dyn ChangeListener>,
        unlocker: Arc<dyn Unlocker>,
        to_unlock: Vec<Address>,
    ) -> Self {
        Self {
            vault_url,
            dir,
            state: Mutex::new(CacheState {
                all: Vec::new(),
                by_addr: HashMap::new(),
                files: FileCache::default(),
                last_reload: None,
                scanned_once: false,
            }),
            listener,
            unlocker,
            to_unlock,
            reload_notify: Notify::new(),
            watcher: WatcherState::default(),
            watcher_task: Mutex::new(None),
        }
    }

    /// Perform the initial load and start the watcher.
    pub fn start(self: &Arc<Self>) {
        self.scan_accounts();
        self.lock_state().last_reload = Some(Instant::now());
        watcher::try_start(self);
    }

    /// Stop the watcher. The cache contents stay readable.
    pub fn close(&self) {
        if let Some(task) = self.watcher_task.lock().expect("cache lock poisoned").take() {
            task.abort();
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Notified (coalesced) after every scan that changed the cache.
    pub fn reload_notify(&self) -> &Notify {
        &self.reload_notify
    }

    /// A copy of all cached accounts, URL-sorted.
    pub fn accounts(self: &Arc<Self>) -> Vec<Account> {
        self.maybe_reload();
        self.lock_state().all.clone()
    }

    pub fn has_address(self: &Arc<Self>, address: Address) -> bool {
        self.maybe_reload();
        self.lock_state()
            .by_addr
            .get(&address)
            .is_some_and(|accounts| !accounts.is_empty())
    }

    /// Locate the unique cached account matching the given specifier.
    ///
    /// A nonzero address restricts the candidates to that address. A URL
    /// path without a separator is resolved against the cache directory; an
    /// exact URL match wins outright. Otherwise zero candidates is
    /// `NoMatch`, one is returned, and several is `Ambiguous` with every
    /// candidate listed in URL order.
    pub fn find(self: &Arc<Self>, target: &Account) -> Result<Account, CacheError> {
        self.maybe_reload();
        let state = self.lock_state();

        let matches: &[Account] = if !target.address.is_zero() {
            state
                .by_addr
                .get(&target.address)
                .map(Vec::as_slice)
                .unwrap_or_default()
        } else {
            &state.all
        };

        if !target.url.path.is_empty() {
            // If only the basename is given, complete the path against the
            // cache directory.
            let path = if target.url.path.contains('/') {
                target.url.path.clone()
            } else {
                self.dir.join(&target.url.path).to_string_lossy().into_owned()
            };

            for candidate in matches {
                if candidate.url.path == path
                    && (target.url.vault.is_empty() || candidate.url.vault == target.url.vault)
                {
                    return Ok(candidate.clone());
                }
            }
            if target.address.is_zero() {
                return Err(CacheError::NoMatch);
            }
        }

        match matches.len() {
            0 => Err(CacheError::NoMatch),
            1 => Ok(matches[0].clone()),
            _ => {
                let mut listed = matches.to_vec();
                listed.sort();
                Err(CacheError::Ambiguous {
                    address: target.address,
                    matches: listed,
                })
            }
        }
    }

    /// Reload on demand when no watcher is keeping the cache current, at
    /// most once per `MIN_RELOAD_INTERVAL`.
    pub fn maybe_reload(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if self.watcher.is_running() {
                return;
            }
            if let Some(last) = state.last_reload {
                if last.elapsed() < MIN_RELOAD_INTERVAL {
                    return;
                }
            }
            state.last_reload = Some(Instant::now());
        }
        watcher::try_start(self);
        self.scan_accounts();
    }

    /// Diff the directory and fold the changes into both views, reporting
    /// membership changes to the listener and handing auto-unlock candidates
    /// to the unlock manager.
    pub fn scan_accounts(&self) {
        let diff = match self.lock_state().files.scan(&self.dir) {
            Ok(diff) => diff,
            Err(e) => {
                debug!(dir = %self.dir.display(), error = %e, "failed to reload account config directory");
                return;
            }
        };

        let initial = {
            let mut state = self.lock_state();
            let initial = !state.scanned_once;
            state.scanned_once = true;
            initial
        };

        if diff.is_empty() {
            return;
        }
        let start = Instant::now();

        for path in &diff.creates {
            if let Some(account) = self.read_account(path) {
                self.add(account.clone());
                self.listener.account_arrived(&account, initial);
                self.unlock_if_configured(&account);
            }
        }
        for path in &diff.deletes {
            if let Some(removed) = self.delete_by_file(path) {
                self.listener.account_dropped(&removed);
            }
        }
        for path in &diff.updates {
            let removed = self.delete_by_file(path);
            if let Some(account) = self.read_account(path) {
                self.add(account.clone());
                if removed.as_ref() != Some(&account) {
                    if let Some(removed) = removed {
                        self.listener.account_dropped(&removed);
                    }
                    self.listener.account_arrived(&account, initial);
                }
                self.unlock_if_configured(&account);
            } else if let Some(removed) = removed {
                self.listener.account_dropped(&removed);
            }
        }

        self.reload_notify.notify_one();
        trace!(elapsed = ?start.elapsed(), "handled account config changes");
    }

    fn read_account(&self, path: &Path) -> Option<Account> {
        let decoded = match AccountMetadata::load(path) {
            Ok(decoded) => decoded,
            Err(e) => {
                trace!(path = %path.display(), error = %e, "failed to open account config file");
                return None;
            }
        };
        let metadata = match decoded {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "failed to decode account config file");
                return None;
            }
        };
        if let Err(e) = metadata.validate() {
            debug!(path = %path.display(), error = %e, "invalid account config file");
            return None;
        }
        match metadata.to_account(&self.vault_url, path) {
            Ok(account) => Some(account),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "unusable account config file");
                None
            }
        }
    }

    fn add(&self, account: Account) {
        let mut state = self.lock_state();
        match state.all.binary_search(&account) {
            Ok(_) => {} // already present
            Err(i) => {
                state.all.insert(i, account.clone());
                state.by_addr.entry(account.address).or_default().push(account);
            }
        }
    }

    fn delete_by_file(&self, path: &Path) -> Option<Account> {
        let mut state = self.lock_state();
        let path = path.to_string_lossy();
        let i = state
            .all
            .iter()
            .position(|a| a.url.path.as_str() == path.as_ref())?;
        let removed = state.all.remove(i);

        if let Some(by_addr) = state.by_addr.get_mut(&removed.address) {
            by_addr.retain(|a| a != &removed);
            if by_addr.is_empty() {
                state.by_addr.remove(&removed.address);
            }
        }
        Some(removed)
    }

    fn unlock_if_configured(&self, account: &Account) {
        if self.to_unlock.contains(&account.address) {
            self.unlocker.unlock_indefinitely(account);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().expect("cache lock poisoned")
    }

    fn watcher_state(&self) -> &WatcherState {
        &self.watcher
    }

    fn store_watcher_task(&self, task: JoinHandle<()>) {
        *self.watcher_task.lock().expect("cache lock poisoned") = Some(task);
    }

    /// The wallet URL an account in this cache's directory would have.
    pub fn url_for(&self, path: &Path) -> WalletUrl {
        WalletUrl::new(&self.vault_url, path)
    }
}

impl Drop for AccountCache {
    fn drop(&mut self) {
        self.close();
    }
}
