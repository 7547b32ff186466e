use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};
use voxgate_config::AdmissionSettings;

/// Counter bucket shared by every connection task.
pub const GLOBAL_KEY: &str = "global";

/// Fallback bucket when neither an identity nor an origin is known.
pub const UNKNOWN_KEY: &str = "unknown";

/// Sentinel key that bypasses counting entirely; callers wanting
/// public-endpoint behavior check against this key.
pub const PUBLIC_KEY: &str = "public";

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

impl Decision {
    fn allowed(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_secs: 0,
        }
    }
}

/// Resolution order for the admission key: authenticated identity, then
/// request origin, then the shared unknown bucket.
pub fn resolve_key(identity: Option<&str>, origin: Option<&str>) -> String {
    identity
        .or(origin)
        .unwrap_or(UNKNOWN_KEY)
        .to_string()
}

struct Window {
    count: u32,
    started: Instant,
}

/// Fixed-window counter: a window opens with count 0 on first use of a
/// key and is replaced wholesale once it has elapsed. Not a sliding
/// window or token bucket, so up to 2x the nominal rate can pass across
/// a window boundary. That is the documented admission contract.
pub struct FixedWindowLimiter {
    windows: DashMap<String, Window>,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window,
        }
    }

    pub fn check(&self, key: &str, limit: u32) -> Decision {
        if key == PUBLIC_KEY {
            return Decision::allowed(limit);
        }

        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            count: 0,
            started: now,
        });

        // A check racing the sweep re-creates the key above; an elapsed
        // window is replaced here, never decremented.
        if now.duration_since(entry.started) >= self.window {
            entry.count = 0;
            entry.started = now;
        }

        if entry.count < limit {
            entry.count += 1;
            Decision::allowed(limit - entry.count)
        } else {
            let elapsed = now.duration_since(entry.started);
            let retry_after_secs = self
                .window
                .saturating_sub(elapsed)
                .as_secs()
                .clamp(1, self.window.as_secs().max(1));
            Decision {
                allowed: false,
                remaining: 0,
                retry_after_secs,
            }
        }
    }

    /// Drops windows that have fully elapsed. Keys still in use are
    /// recreated by the next `check`, so a racing sweep can never reject.
    pub fn sweep(&self) {
        let window = self.window;
        let before = self.windows.len();
        self.windows
            .retain(|_, w| w.started.elapsed() < window);
        let removed = before - self.windows.len();
        if removed > 0 {
            debug!(removed, "swept stale admission windows");
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

/// Admission policy: a unit of work is admitted only when both its own
/// key and the global key have budget in the current window.
pub struct AdmissionController {
    limiter: FixedWindowLimiter,
    settings: AdmissionSettings,
}

impl AdmissionController {
    pub fn new(settings: AdmissionSettings) -> Self {
        Self {
            limiter: FixedWindowLimiter::new(Duration::from_secs(settings.window_secs)),
            settings,
        }
    }

    pub fn admit(
        &self,
        identity: Option<&str>,
        origin: Option<&str>,
        plan: Option<&str>,
    ) -> Decision {
        let key = resolve_key(identity, origin);
        let limit = self.settings.limit_for_plan(plan.unwrap_or("free"));

        let own = self.limiter.check(&key, limit);
        if !own.allowed {
            return own;
        }
        let global = self.limiter.check(GLOBAL_KEY, self.settings.global_limit);
        if !global.allowed {
            return global;
        }
        own
    }

    pub fn sweep(&self) {
        self.limiter.sweep();
    }

    pub fn tracked_keys(&self) -> usize {
        self.limiter.tracked_keys()
    }

    /// Periodic stale-window sweep, stopped deterministically through the
    /// shutdown channel so no timer outlives a test or a process exit.
    pub async fn run_sweeper(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(every);
        info!(every_secs = every.as_secs(), "admission sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(),
                _ = shutdown.changed() => break,
            }
        }
        info!("admission sweeper stopped");
    }
}
