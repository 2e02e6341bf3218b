use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Raises the pending flag from any task. Cheap to clone; every clone
/// addresses the same flag.
#[derive(Debug, Clone, Default)]
pub struct SignalHandle {
    pending: Arc<AtomicBool>,
}

impl SignalHandle {
    /// Record that a client wants a poll. Repeated calls before the next
    /// cycle collapse into one.
    pub fn notify(&self) {
        self.pending.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

/// Debounce state owned by the engine: the shared pending flag plus the
/// start time of the last cycle, which only the engine touches.
#[derive(Debug)]
pub struct PendingSignal {
    signal: SignalHandle,
    last_fired_at: Option<Instant>,
    cooldown: Duration,
}

impl PendingSignal {
    pub fn new(cooldown: Duration) -> Self {
        Self::with_handle(SignalHandle::default(), cooldown)
    }

    pub fn with_handle(signal: SignalHandle, cooldown: Duration) -> Self {
        Self {
            signal,
            last_fired_at: None,
            cooldown,
        }
    }

    pub fn handle(&self) -> SignalHandle {
        self.signal.clone()
    }

    pub fn last_fired_at(&self) -> Option<Instant> {
        self.last_fired_at
    }

    fn cooled_down(&self, now: Instant) -> bool {
        self.last_fired_at
            .map_or(true, |last| now.saturating_duration_since(last) > self.cooldown)
    }

    /// Pending → Processing. When the cooldown has elapsed and a signal is
    /// pending, clears the flag, stamps `now` and returns true.
    ///
    /// The flag is cleared before the caller starts any async work, so a
    /// signal that lands mid-cycle re-arms the next tick instead of being lost.
    pub fn try_fire(&mut self, now: Instant) -> bool {
        if !self.cooled_down(now) || !self.signal.take() {
            return false;
        }
        self.last_fired_at = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_millis(2000);

    #[test]
    fn idle_never_fires() {
        let mut state = PendingSignal::new(COOLDOWN);
        assert!(!state.try_fire(Instant::now()));
        assert!(state.last_fired_at().is_none());
    }

    #[test]
    fn first_signal_fires_immediately() {
        let mut state = PendingSignal::new(COOLDOWN);
        let now = Instant::now();
        state.handle().notify();

        assert!(state.try_fire(now));
        assert_eq!(state.last_fired_at(), Some(now));
        assert!(!state.handle().is_pending());
    }

    #[test]
    fn burst_within_cooldown_collapses_into_one_cycle() {
        let mut state = PendingSignal::new(COOLDOWN);
        let handle = state.handle();
        let t0 = Instant::now();

        handle.notify();
        handle.notify();
        assert!(state.try_fire(t0));

        // A second signal 500ms later stays pending until the cooldown passes.
        handle.notify();
        assert!(!state.try_fire(t0 + Duration::from_millis(500)));
        assert!(!state.try_fire(t0 + Duration::from_millis(1500)));
        assert!(!state.try_fire(t0 + COOLDOWN));
        assert!(handle.is_pending());

        assert!(state.try_fire(t0 + Duration::from_millis(2001)));
        assert!(!handle.is_pending());
    }

    #[test]
    fn cooldown_alone_does_not_fire() {
        let mut state = PendingSignal::new(COOLDOWN);
        let t0 = Instant::now();
        state.handle().notify();
        assert!(state.try_fire(t0));
        assert!(!state.try_fire(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn cooldown_counts_from_cycle_start() {
        let mut state = PendingSignal::new(COOLDOWN);
        let handle = state.handle();
        let t0 = Instant::now();
        handle.notify();
        assert!(state.try_fire(t0));

        // However long the cycle took, eligibility depends only on t0.
        handle.notify();
        assert!(state.try_fire(t0 + Duration::from_millis(2500)));
        assert_eq!(state.last_fired_at(), Some(t0 + Duration::from_millis(2500)));
    }

    #[test]
    fn handles_share_one_flag() {
        let state = PendingSignal::new(COOLDOWN);
        let a = state.handle();
        let b = a.clone();
        b.notify();
        assert!(a.is_pending());
    }
}
