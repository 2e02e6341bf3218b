//! Per-IP throttle for application registration.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Window over which `/createApp` registrations are counted.
pub const CREATE_APP_WINDOW: Duration = Duration::from_secs(60);

/// Counts recent registrations per client address within a sliding
/// [`CREATE_APP_WINDOW`].
///
/// Addresses whose registrations have all aged out are forgotten on the next
/// check, so the map only ever holds addresses seen in the last minute.
#[derive(Debug)]
pub struct CreateAppLimiter {
    per_window: u32,
    window: Duration,
    recent: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl CreateAppLimiter {
    /// `per_minute == 0` disables the limit.
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_window: per_minute,
            window: CREATE_APP_WINDOW,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Record a registration attempt from `ip` at `now`.
    ///
    /// Returns `Err(retry_after)` when `ip` already registered `per_minute`
    /// applications inside the window; the refused attempt is not counted.
    pub fn check(&self, ip: IpAddr, now: Instant) -> Result<(), Duration> {
        if self.per_window == 0 {
            return Ok(());
        }

        let mut recent = self.recent.lock();
        recent.retain(|_, stamps| {
            while stamps
                .front()
                .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
            {
                stamps.pop_front();
            }
            !stamps.is_empty()
        });

        let stamps = recent.entry(ip).or_default();
        if stamps.len() >= self.per_window as usize {
            let oldest = stamps.front().copied().unwrap_or(now);
            return Err(self
                .window
                .saturating_sub(now.saturating_duration_since(oldest)));
        }
        stamps.push_back(now);
        Ok(())
    }

    /// Number of addresses with a registration still inside the window.
    pub fn tracked(&self) -> usize {
        self.recent.lock().len()
    }
}

/// Whole seconds a client should wait, rounded up so it never retries early.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}
