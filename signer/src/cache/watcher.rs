//! Directory watcher feeding the cache's scan routine.
//!
//! Where the platform supports native change notifications the watcher keeps
//! the cache current without polling; when it cannot run (unsupported
//! platform, directory not yet created) the cache falls back to throttled
//! on-demand reloads and periodically retries starting the watcher.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tracing::debug;

use super::AccountCache;

/// Quiet period after a burst of filesystem events before rescanning.
const DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Default)]
pub(super) struct WatcherState {
    running: AtomicBool,
    starting: AtomicBool,
}

impl WatcherState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Try to start the watcher task for the cache's directory. No-op when it is
/// already running or being started.
pub(super) fn try_start(cache: &Arc<AccountCache>) {
    // Without a runtime (synchronous callers during tests) the throttled
    // reload path is the only one available.
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };

    let state = cache.watcher_state();
    if state.is_running() || state.starting.swap(true, Ordering::SeqCst) {
        return;
    }

    let task_cache = Arc::clone(cache);
    let task = handle.spawn(async move {
        run(task_cache).await;
    });
    cache.store_watcher_task(task);
}

async fn run(cache: Arc<AccountCache>) {
    let state = cache.watcher_state();
    let dir: PathBuf = cache.dir().to_path_buf();

    let (tx, mut rx) = mpsc::channel::<()>(1);
    let mut watcher = match notify::recommended_watcher(
        move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    // Coalesced: a pending pulse already means "rescan"
                    let _ = tx.try_send(());
                }
            }
        },
    ) {
        Ok(watcher) => watcher,
        Err(e) => {
            debug!(error = %e, "filesystem notifications unavailable, relying on reload throttle");
            state.starting.store(false, Ordering::SeqCst);
            return;
        }
    };

    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        debug!(dir = %dir.display(), error = %e, "unable to watch account config directory");
        state.starting.store(false, Ordering::SeqCst);
        return;
    }

    state.running.store(true, Ordering::SeqCst);
    state.starting.store(false, Ordering::SeqCst);
    debug!(dir = %dir.display(), "watching account config directory");

    // The sender lives inside the watcher, which stays alive for the whole
    // loop; the task ends by abort when the cache closes.
    while rx.recv().await.is_some() {
        tokio::time::sleep(DEBOUNCE).await;
        while rx.try_recv().is_ok() {}
        cache.scan_accounts();
    }

    state.running.store(false, Ordering::SeqCst);
}
