//! Dangerous-action limiter — sliding windows, denial tripwire, concurrency
//! caps, and the global dangerous-slot governor.
//!
//! State is keyed by session key, falling back to client id, device id, and
//! finally the command name. Permits are RAII: dropping one releases the
//! slot on every exit path, panics included.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::KernelError;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Sliding-window size.
    pub window: Duration,
    /// Max attempts per window before rate limiting.
    pub max_attempts: u32,
    /// Denials per window that trip the block.
    pub max_denials: u32,
    /// How long a tripped key stays blocked (absolute wall time).
    pub block_duration: Duration,
    /// Per-key concurrent dangerous operations.
    pub per_key_concurrency: u32,
    /// Global concurrent dangerous slots.
    pub global_slots: usize,
    /// Max tracked keys before LRU eviction.
    pub max_tracked_keys: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig {
            window: Duration::from_secs(60),
            max_attempts: 20,
            max_denials: 5,
            block_duration: Duration::from_secs(300),
            per_key_concurrency: 2,
            global_slots: 8,
            max_tracked_keys: 5000,
        }
    }
}

/// Preferred rate-limit key: session key, then client id, then device id,
/// then the command itself.
pub fn rate_limit_key(
    session_key: Option<&str>,
    client_id: Option<&str>,
    device_id: Option<&str>,
    command: &str,
) -> String {
    session_key
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| client_id.filter(|s| !s.is_empty()).map(str::to_string))
        .or_else(|| device_id.filter(|s| !s.is_empty()).map(str::to_string))
        .unwrap_or_else(|| format!("command:{command}"))
}

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct KeyState {
    window_start_ms: i64,
    attempts: u32,
    denials: u32,
    blocked_until_ms: i64,
    concurrent: u32,
    last_seen_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Attempts exhausted the window budget.
    RateLimited,
    /// The denial tripwire fired; blocked until an absolute deadline.
    Blocked,
}

impl Admission {
    pub fn token(&self) -> &'static str {
        match self {
            Admission::Allowed => "ALLOWED",
            Admission::RateLimited => "RATE_LIMITED",
            Admission::Blocked => "BLOCKED",
        }
    }
}

pub struct ActionLimiter {
    cfg: LimiterConfig,
    keys: Arc<Mutex<HashMap<String, KeyState>>>,
    global: Arc<Semaphore>,
}

impl ActionLimiter {
    pub fn new(cfg: LimiterConfig) -> Self {
        let global = Arc::new(Semaphore::new(cfg.global_slots));
        ActionLimiter {
            cfg,
            keys: Arc::new(Mutex::new(HashMap::new())),
            global,
        }
    }

    /// Admit one attempt for `key` at `now_ms`.
    pub fn check_and_consume(&self, key: &str, now_ms: i64) -> Admission {
        let mut keys = self.keys.lock().expect("limiter lock poisoned");
        self.evict_if_needed(&mut keys, key, now_ms);
        let state = keys.entry(key.to_string()).or_default();
        roll_window(state, &self.cfg, now_ms);
        state.last_seen_ms = now_ms;

        if state.blocked_until_ms > now_ms {
            return Admission::Blocked;
        }
        if state.attempts >= self.cfg.max_attempts {
            // The over-budget attempt itself counts as a denial.
            state.denials += 1;
            maybe_trip(state, &self.cfg, now_ms);
            return Admission::RateLimited;
        }
        state.attempts += 1;
        Admission::Allowed
    }

    /// Record a policy denial for `key`; enough of them trip the block.
    pub fn note_denial(&self, key: &str, now_ms: i64) {
        let mut keys = self.keys.lock().expect("limiter lock poisoned");
        let state = keys.entry(key.to_string()).or_default();
        roll_window(state, &self.cfg, now_ms);
        state.last_seen_ms = now_ms;
        state.denials += 1;
        maybe_trip(state, &self.cfg, now_ms);
    }

    /// Sustained success relaxes the tripwire.
    pub fn note_success(&self, key: &str, now_ms: i64) {
        let mut keys = self.keys.lock().expect("limiter lock poisoned");
        let state = keys.entry(key.to_string()).or_default();
        roll_window(state, &self.cfg, now_ms);
        state.last_seen_ms = now_ms;
        state.denials = state.denials.saturating_sub(1);
    }

    /// Take a per-key concurrency slot. The permit releases on drop.
    pub fn acquire_concurrency(&self, key: &str) -> Result<ConcurrencyPermit, KernelError> {
        let mut keys = self.keys.lock().expect("limiter lock poisoned");
        let state = keys.entry(key.to_string()).or_default();
        if state.concurrent >= self.cfg.per_key_concurrency {
            return Err(KernelError::resource("TOO_MANY_CONCURRENT"));
        }
        state.concurrent += 1;
        Ok(ConcurrencyPermit {
            keys: Arc::clone(&self.keys),
            key: key.to_string(),
        })
    }

    /// Take one global dangerous slot. The permit releases on drop.
    pub fn acquire_dangerous_slot(&self) -> Result<OwnedSemaphorePermit, KernelError> {
        match Arc::clone(&self.global).try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => {
                Err(KernelError::resource("dangerous_slots_exhausted"))
            }
            Err(TryAcquireError::Closed) => Err(KernelError::resource("limiter_closed")),
        }
    }

    /// Global slots currently available, for status surfaces.
    pub fn available_dangerous_slots(&self) -> usize {
        self.global.available_permits()
    }

    /// Tracked-key count, for status surfaces.
    pub fn tracked_keys(&self) -> usize {
        self.keys.lock().expect("limiter lock poisoned").len()
    }

    fn evict_if_needed(&self, keys: &mut HashMap<String, KeyState>, incoming: &str, _now: i64) {
        if keys.contains_key(incoming) || keys.len() < self.cfg.max_tracked_keys {
            return;
        }
        // Evict the least recently seen key that holds no concurrency slot.
        if let Some(victim) = keys
            .iter()
            .filter(|(_, s)| s.concurrent == 0)
            .min_by_key(|(_, s)| s.last_seen_ms)
            .map(|(k, _)| k.clone())
        {
            keys.remove(&victim);
        }
    }
}

/// Window boundary resets attempts AND denials together. The block deadline
/// is untouched: it is absolute wall time.
fn roll_window(state: &mut KeyState, cfg: &LimiterConfig, now_ms: i64) {
    if now_ms - state.window_start_ms >= cfg.window.as_millis() as i64 {
        state.window_start_ms = now_ms;
        state.attempts = 0;
        state.denials = 0;
    }
}

fn maybe_trip(state: &mut KeyState, cfg: &LimiterConfig, now_ms: i64) {
    if state.denials >= cfg.max_denials {
        state.blocked_until_ms = now_ms + cfg.block_duration.as_millis() as i64;
    }
}

/// RAII per-key concurrency slot.
pub struct ConcurrencyPermit {
    keys: Arc<Mutex<HashMap<String, KeyState>>>,
    key: String,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if let Ok(mut keys) = self.keys.lock() {
            if let Some(state) = keys.get_mut(&self.key) {
                state.concurrent = state.concurrent.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> ActionLimiter {
        ActionLimiter::new(LimiterConfig::default())
    }

    const T0: i64 = 1_000_000;

    #[test]
    fn key_preference_order() {
        assert_eq!(rate_limit_key(Some("s"), Some("c"), Some("d"), "x"), "s");
        assert_eq!(rate_limit_key(None, Some("c"), Some("d"), "x"), "c");
        assert_eq!(rate_limit_key(None, None, Some("d"), "x"), "d");
        assert_eq!(rate_limit_key(None, None, None, "x"), "command:x");
        assert_eq!(rate_limit_key(Some(""), None, None, "x"), "command:x");
    }

    #[test]
    fn attempts_exhaust_the_window() {
        let l = limiter();
        for _ in 0..20 {
            assert_eq!(l.check_and_consume("k", T0), Admission::Allowed);
        }
        assert_eq!(l.check_and_consume("k", T0), Admission::RateLimited);
    }

    #[test]
    fn window_boundary_resets_attempts_and_denials() {
        let l = limiter();
        for _ in 0..20 {
            l.check_and_consume("k", T0);
        }
        assert_eq!(l.check_and_consume("k", T0), Admission::RateLimited);
        // One window later the budget is fresh and prior denials are gone.
        let later = T0 + 60_000;
        assert_eq!(l.check_and_consume("k", later), Admission::Allowed);
        for _ in 0..4 {
            l.note_denial("k", later);
        }
        // 4 denials in this window + the rate-limit denial from the previous
        // window must NOT trip (prior-window denials do not carry over).
        assert_eq!(l.check_and_consume("k", later), Admission::Allowed);
    }

    #[test]
    fn tripwire_blocks_after_max_denials() {
        let l = limiter();
        for _ in 0..5 {
            l.note_denial("k", T0);
        }
        assert_eq!(l.check_and_consume("k", T0), Admission::Blocked);
        // Block end is absolute: still blocked just before, free right after.
        assert_eq!(l.check_and_consume("k", T0 + 299_999), Admission::Blocked);
        assert_eq!(l.check_and_consume("k", T0 + 300_001), Admission::Allowed);
    }

    #[test]
    fn success_relaxes_the_tripwire() {
        let l = limiter();
        for _ in 0..4 {
            l.note_denial("k", T0);
        }
        l.note_success("k", T0);
        l.note_denial("k", T0);
        // 4 - 1 + 1 = 4 denials: below the tripwire.
        assert_eq!(l.check_and_consume("k", T0), Admission::Allowed);
    }

    #[test]
    fn per_key_concurrency_cap() {
        let l = limiter();
        let p1 = l.acquire_concurrency("k").unwrap();
        let _p2 = l.acquire_concurrency("k").unwrap();
        assert!(l.acquire_concurrency("k").is_err());
        // Other keys are unaffected.
        let _other = l.acquire_concurrency("j").unwrap();
        drop(p1);
        assert!(l.acquire_concurrency("k").is_ok());
    }

    #[test]
    fn global_slots_are_bounded_and_released() {
        let l = ActionLimiter::new(LimiterConfig {
            global_slots: 2,
            ..Default::default()
        });
        let s1 = l.acquire_dangerous_slot().unwrap();
        let _s2 = l.acquire_dangerous_slot().unwrap();
        assert!(l.acquire_dangerous_slot().is_err());
        drop(s1);
        assert!(l.acquire_dangerous_slot().is_ok());
    }

    #[test]
    fn lru_eviction_caps_tracked_keys() {
        let l = ActionLimiter::new(LimiterConfig {
            max_tracked_keys: 3,
            ..Default::default()
        });
        l.check_and_consume("a", T0);
        l.check_and_consume("b", T0 + 1);
        l.check_and_consume("c", T0 + 2);
        l.check_and_consume("d", T0 + 3);
        assert_eq!(l.tracked_keys(), 3);
        // "a" was least recently seen and had no live permits.
        let keys = l.keys.lock().unwrap();
        assert!(!keys.contains_key("a"));
        assert!(keys.contains_key("d"));
    }
}
