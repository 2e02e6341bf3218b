//! Correlation engine: the debounced poll loop that turns source comments
//! into delivered tokens.
//!
//! One cycle fetches every visible comment, hands the ones not already being
//! deleted to a detached cleanup task, parses and deduplicates the new ones,
//! then resolves, mints and delivers one token per correlation id. Deletion
//! runs with bounded concurrency and only feeds back through the deletion
//! ledger, which keeps a consumed comment from being issued twice.

pub mod debounce;
mod ledger;
pub mod parse;
pub mod policy;

pub use debounce::{PendingSignal, SignalHandle};
pub use parse::{ParseError, ParsedCorrelation};
pub use policy::{ResolveError, SigningGrant, SigningPolicy};

use crate::config::EngineConfig;
use crate::gateway::hub::RealtimeGateway;
use crate::source::{MessageSource, RawMessage};
use ledger::DeletionLedger;
use crate::token::{self, Claims, IssuedToken};
use futures_util::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Engine timing and concurrency limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub tick_interval: Duration,
    pub cooldown: Duration,
    pub max_concurrent_deletes: usize,
    pub max_concurrent_issues: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            cooldown: Duration::from_millis(config.cooldown_ms),
            max_concurrent_deletes: config.max_concurrent_deletes.max(1),
            max_concurrent_issues: config.max_concurrent_issues.max(1),
        }
    }
}

/// Outcome of the detached deletion task for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
}

/// What one batch cycle did.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub fetched: usize,
    /// Fetched messages held back from issuance because an earlier cycle
    /// already consumed them.
    pub already_consumed: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub issued: Vec<IssuedToken>,
    pub fetch_failed: bool,
    /// Handle to the detached cleanup task. Dropping it does not cancel the
    /// deletions.
    pub cleanup: Option<JoinHandle<CleanupReport>>,
}

/// A parsed comment that survived deduplication.
#[derive(Debug, Clone)]
struct Candidate {
    message: RawMessage,
    parsed: ParsedCorrelation,
}

pub struct CorrelationEngine {
    source: Arc<dyn MessageSource>,
    policy: Arc<SigningPolicy>,
    gateway: Arc<dyn RealtimeGateway>,
    debounce: PendingSignal,
    settings: EngineSettings,
    ledger: Arc<DeletionLedger>,
}

impl CorrelationEngine {
    pub fn new(
        source: Arc<dyn MessageSource>,
        policy: Arc<SigningPolicy>,
        gateway: Arc<dyn RealtimeGateway>,
        settings: EngineSettings,
    ) -> Self {
        Self::with_signal(source, policy, gateway, settings, SignalHandle::default())
    }

    /// Build an engine that listens on an existing signal handle, so the
    /// gateway can be wired before the engine exists.
    pub fn with_signal(
        source: Arc<dyn MessageSource>,
        policy: Arc<SigningPolicy>,
        gateway: Arc<dyn RealtimeGateway>,
        settings: EngineSettings,
        signal: SignalHandle,
    ) -> Self {
        Self {
            source,
            policy,
            gateway,
            debounce: PendingSignal::with_handle(signal, settings.cooldown),
            settings,
            ledger: Arc::new(DeletionLedger::default()),
        }
    }

    /// Handle clients use to request a poll.
    pub fn signal_handle(&self) -> SignalHandle {
        self.debounce.handle()
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Tick forever. Each tick runs at most one cycle and awaits it, so a
    /// cycle that outlives the interval simply swallows the missed ticks.
    pub async fn run(mut self) {
        let mut interval = time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            source = self.source.name(),
            mode = self.policy.mode().as_str(),
            tick_ms = u64::try_from(self.settings.tick_interval.as_millis()).unwrap_or(u64::MAX),
            cooldown_ms = u64::try_from(self.settings.cooldown.as_millis()).unwrap_or(u64::MAX),
            "Correlation engine started"
        );

        loop {
            let now = interval.tick().await;
            self.tick(now).await;
        }
    }

    /// One scheduler tick: fire a cycle if a signal is pending and the
    /// cooldown since the last cycle start has elapsed.
    pub async fn tick(&mut self, now: Instant) -> Option<BatchReport> {
        if !self.debounce.try_fire(now) {
            return None;
        }
        Some(self.run_cycle().await)
    }

    /// Fetch, clean up, parse, deduplicate, then issue and deliver.
    pub async fn run_cycle(&self) -> BatchReport {
        let mut report = BatchReport::default();

        let messages = match self.source.fetch_all().await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(source = self.source.name(), "Failed to fetch messages: {e:#}");
                report.fetch_failed = true;
                return report;
            }
        };
        report.fetched = messages.len();
        if messages.is_empty() {
            tracing::debug!("No messages on source");
        }

        let admitted = self.ledger.admit(messages);
        report.already_consumed = admitted.already_consumed;
        if !admitted.to_delete.is_empty() {
            report.cleanup = Some(self.spawn_cleanup(admitted.to_delete));
        }
        if admitted.fresh.is_empty() {
            return report;
        }

        let mut parsed = Vec::with_capacity(admitted.fresh.len());
        for message in admitted.fresh {
            match self.policy.parse(&message.raw_text) {
                Ok(correlation) => {
                    if correlation.has_ambiguous_key() {
                        tracing::warn!(
                            message_id = %message.id,
                            "Message text has more than one ':'; splitting on the first"
                        );
                    }
                    parsed.push(Candidate {
                        message,
                        parsed: correlation,
                    });
                }
                Err(e) => {
                    report.malformed += 1;
                    tracing::error!(message_id = %message.id, "Malformed message: {e}");
                }
            }
        }

        let (candidates, duplicates) = dedup_first_seen(parsed);
        report.duplicates = duplicates;
        if duplicates > 0 {
            tracing::debug!(duplicates, "Dropped duplicate correlation ids");
        }

        let outcomes: Vec<Option<IssuedToken>> = stream::iter(candidates)
            .map(|candidate| self.issue_and_deliver(candidate))
            .buffer_unordered(self.settings.max_concurrent_issues)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Some(token) => report.issued.push(token),
                None => report.rejected += 1,
            }
        }

        tracing::info!(
            fetched = report.fetched,
            already_consumed = report.already_consumed,
            issued = report.issued.len(),
            malformed = report.malformed,
            duplicates = report.duplicates,
            rejected = report.rejected,
            "Batch cycle complete"
        );
        report
    }

    /// Delete `ids` on a detached task. Failures are logged and counted; the
    /// task itself never retries, a later fetch that still sees the message
    /// schedules it again.
    fn spawn_cleanup(&self, ids: Vec<String>) -> JoinHandle<CleanupReport> {
        let source = Arc::clone(&self.source);
        let ledger = Arc::clone(&self.ledger);
        let limit = self.settings.max_concurrent_deletes;

        tokio::spawn(async move {
            let results: Vec<bool> = stream::iter(ids)
                .map(|id| {
                    let source = Arc::clone(&source);
                    let ledger = Arc::clone(&ledger);
                    async move {
                        let deleted = match source.delete(&id).await {
                            Ok(()) => {
                                tracing::debug!(message_id = %id, "Deleted consumed message");
                                true
                            }
                            Err(e) => {
                                tracing::error!(message_id = %id, "Failed to delete message: {e:#}");
                                false
                            }
                        };
                        ledger.finish(&id, deleted);
                        deleted
                    }
                })
                .buffer_unordered(limit)
                .collect()
                .await;

            let deleted = results.iter().filter(|ok| **ok).count();
            CleanupReport {
                deleted,
                failed: results.len() - deleted,
            }
        })
    }

    async fn issue_and_deliver(&self, candidate: Candidate) -> Option<IssuedToken> {
        let Candidate { message, parsed } = candidate;

        let grant = match self.policy.resolve(parsed.application_key.as_deref()).await {
            Ok(grant) => grant,
            Err(e) => {
                tracing::error!(
                    message_id = %message.id,
                    correlation_id = %parsed.correlation_id,
                    "Cannot sign token: {e}"
                );
                return None;
            }
        };

        let claims = Claims::from(&message);
        let signed_value = match token::mint(&claims, &grant.secret, grant.ttl) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(message_id = %message.id, "Failed to mint token: {e:#}");
                return None;
            }
        };

        let issued = IssuedToken {
            signed_value,
            correlation_id: parsed.correlation_id,
            poster_id: message.poster_id,
            poster_handle: message.poster_handle,
            display_name: message.display_name,
            expires_in_seconds: grant.ttl.as_secs(),
        };

        match self.gateway.deliver(&issued).await {
            Ok(true) => {
                tracing::info!(
                    correlation_id = %issued.correlation_id,
                    username = %issued.poster_handle,
                    "Token delivered"
                );
            }
            Ok(false) => {
                tracing::debug!(
                    correlation_id = %issued.correlation_id,
                    "No connected client for correlation id"
                );
            }
            Err(e) => {
                tracing::warn!(
                    correlation_id = %issued.correlation_id,
                    "Token delivery failed: {e:#}"
                );
            }
        }
        Some(issued)
    }
}

/// Keep the first candidate per correlation id, in fetch order. Returns the
/// survivors and how many were dropped.
fn dedup_first_seen(candidates: Vec<Candidate>) -> (Vec<Candidate>, usize) {
    let total = candidates.len();
    let mut seen = HashSet::with_capacity(total);
    let kept: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| seen.insert(c.parsed.correlation_id.clone()))
        .collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, correlation_id: &str, key: &str) -> Candidate {
        Candidate {
            message: RawMessage {
                id: id.into(),
                raw_text: format!("{correlation_id}:{key}"),
                poster_id: None,
                poster_handle: format!("user{id}"),
                display_name: String::new(),
            },
            parsed: ParsedCorrelation {
                correlation_id: correlation_id.into(),
                application_key: Some(key.into()),
            },
        }
    }

    #[test]
    fn dedup_keeps_first_in_fetch_order() {
        let (kept, dropped) = dedup_first_seen(vec![
            candidate("1", "abc", "key1"),
            candidate("2", "xyz", "key1"),
            candidate("3", "abc", "key2"),
            candidate("4", "abc", "key3"),
        ]);
        assert_eq!(dropped, 2);
        let ids: Vec<&str> = kept.iter().map(|c| c.message.id.as_str()).collect();
        assert_eq!(ids, ["1", "2"]);
        assert_eq!(kept[0].parsed.application_key.as_deref(), Some("key1"));
    }

    #[test]
    fn dedup_of_empty_batch_is_empty() {
        let (kept, dropped) = dedup_first_seen(Vec::new());
        assert!(kept.is_empty());
        assert_eq!(dropped, 0);
    }

    #[test]
    fn settings_clamp_zero_limits() {
        let settings = EngineSettings::from(&EngineConfig {
            tick_interval_ms: 0,
            cooldown_ms: 0,
            max_concurrent_deletes: 0,
            max_concurrent_issues: 0,
        });
        assert_eq!(settings.tick_interval, Duration::from_millis(1));
        assert_eq!(settings.max_concurrent_deletes, 1);
        assert_eq!(settings.max_concurrent_issues, 1);
    }

    #[test]
    fn default_settings_follow_config_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.tick_interval, Duration::from_secs(1));
        assert_eq!(settings.cooldown, Duration::from_secs(2));
    }
}
