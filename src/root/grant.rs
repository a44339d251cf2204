//! Root-grant cache
//!
//! Asking the root broker whether we are granted is not free, and some brokers
//! show a toast per request. Answers are kept for a short TTL so bursts of
//! availability checks (listing every installer entry, say) cost one probe.

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const ROOT_GRANT_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct GrantState {
    granted: bool,
    checked_at: Instant,
}

/// `{granted, last_checked_at}` behind a mutex, refreshed at most once per TTL.
#[derive(Debug)]
pub struct RootGrantCache {
    ttl: Duration,
    state: Mutex<Option<GrantState>>,
    // Serialises probes so concurrent callers with a stale entry probe once.
    probe: Mutex<()>,
}

impl Default for RootGrantCache {
    fn default() -> Self {
        Self::new(ROOT_GRANT_TTL)
    }
}

impl RootGrantCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(None),
            probe: Mutex::new(()),
        }
    }

    /// Cached answer if it is still fresh.
    pub fn cached(&self) -> Option<bool> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .filter(|s| s.checked_at.elapsed() < self.ttl)
            .map(|s| s.granted)
    }

    /// Fresh cached answer, or run `probe` and remember its result.
    pub fn get_or_probe(&self, probe: impl FnOnce() -> bool) -> bool {
        if let Some(granted) = self.cached() {
            return granted;
        }

        let _probing = self.probe.lock().unwrap_or_else(|e| e.into_inner());
        // Another caller may have refreshed while we waited.
        if let Some(granted) = self.cached() {
            return granted;
        }

        let granted = probe();
        self.store(granted);
        granted
    }

    pub fn store(&self, granted: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = Some(GrantState {
            granted,
            checked_at: Instant::now(),
        });
    }

    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.take();
    }
}
