//! Per-server poll loop
//!
//! Each tick fetches the server's sessions, normalizes them, reconciles the
//! lifecycle, evaluates rules for new and state-changed sessions and records
//! any violations.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::cache::ActiveSessionCache;
use crate::config::{Config, ServerConfig};
use crate::detection::{RuleEngine, RuleParams};
use crate::events::EventBus;
use crate::input::{ClientError, MediaServerClient};
use crate::lifecycle::{LifecycleEngine, ReconcileOutcome};
use crate::models::{CoreEvent, Rule, RuleType, ServerStatus, Session, Violation};
use crate::normalizer::{Normalizer, RawSession};
use crate::persistence::{PersistenceError, SessionStore};
use crate::violations::ViolationRecorder;

/// Result of processing one poll
#[derive(Debug, Default)]
pub struct TickReport {
    pub snapshots: usize,
    pub outcome: ReconcileOutcome,
    pub violations: Vec<Violation>,
}

/// Everything downstream of the HTTP fetch, shared by all workers
pub struct SessionPipeline {
    normalizer: Normalizer,
    lifecycle: LifecycleEngine,
    rules: RuleEngine,
    recorder: ViolationRecorder,
    store: Arc<dyn SessionStore>,
    cache: Arc<ActiveSessionCache>,
    history_window: ChronoDuration,
}

impl SessionPipeline {
    pub fn new(
        normalizer: Normalizer,
        lifecycle: LifecycleEngine,
        recorder: ViolationRecorder,
        store: Arc<dyn SessionStore>,
        cache: Arc<ActiveSessionCache>,
        history_window_hours: i64,
    ) -> Self {
        SessionPipeline {
            normalizer,
            lifecycle,
            rules: RuleEngine::new(),
            recorder,
            store,
            cache,
            history_window: ChronoDuration::hours(history_window_hours),
        }
    }

    pub fn lifecycle(&self) -> &LifecycleEngine {
        &self.lifecycle
    }

    /// normalize → reconcile → evaluate → record
    pub fn process(&self, server_id: &str, raws: &[RawSession], now: DateTime<Utc>) -> TickReport {
        let snapshots = self.normalizer.normalize_all(server_id, raws, now);
        let outcome = self.lifecycle.reconcile(server_id, &snapshots, now);

        let mut violations = Vec::new();
        let to_evaluate: Vec<&Session> = outcome.sessions_to_evaluate().collect();
        if !to_evaluate.is_empty() {
            match self.store.get_active_rules() {
                Ok(rules) if !rules.is_empty() => {
                    let lookback = self.lookback(&rules);
                    for session in to_evaluate {
                        let pool = match self.recent_sessions(session, lookback) {
                            Ok(pool) => pool,
                            Err(e) => {
                                log::error!("Failed to load history for {}: {}", session.server_user_id, e);
                                continue;
                            }
                        };
                        let results = self.rules.evaluate(session, &rules, &pool);
                        violations.extend(self.recorder.record_all(session, results, now));
                    }
                }
                Ok(_) => {}
                Err(e) => log::error!("Failed to load rules: {}", e),
            }
        }

        TickReport {
            snapshots: snapshots.len(),
            outcome,
            violations,
        }
    }

    /// The history window, widened to the longest active device velocity window
    fn lookback(&self, rules: &[Rule]) -> ChronoDuration {
        rules
            .iter()
            .filter(|r| r.is_active && r.rule_type == RuleType::DeviceVelocity)
            .filter_map(|r| match RuleParams::from_rule(r) {
                Ok(RuleParams::DeviceVelocity(p)) => {
                    ChronoDuration::try_milliseconds((p.window_hours * 3_600_000.0).ceil() as i64)
                }
                _ => None,
            })
            .fold(self.history_window, std::cmp::max)
    }

    /// The account's active sessions plus stored ones from the lookback window
    ///
    /// Cached entries win over stored copies of the same session.
    fn recent_sessions(&self, session: &Session, lookback: ChronoDuration) -> Result<Vec<Session>, PersistenceError> {
        let since = session
            .started_at
            .checked_sub_signed(lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut by_id: HashMap<_, Session> = self
            .store
            .get_account_sessions_since(&session.server_user_id, since)?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        for active in self.cache.get_by_account(&session.server_user_id) {
            by_id.insert(active.id, active);
        }

        let mut pool: Vec<Session> = by_id.into_values().collect();
        pool.sort_by_key(|s| s.started_at);
        Ok(pool)
    }
}

/// Poll loop for a single server
pub struct PollWorker {
    server: ServerConfig,
    client: MediaServerClient,
    pipeline: Arc<SessionPipeline>,
    events: EventBus,
    poll_interval: Duration,
    tick_timeout: Duration,
    down_after_failures: u32,
    consecutive_failures: u32,
    status: ServerStatus,
}

impl PollWorker {
    pub fn new(
        server: ServerConfig,
        config: &Config,
        pipeline: Arc<SessionPipeline>,
        events: EventBus,
    ) -> Result<Self, ClientError> {
        let client = MediaServerClient::from_config(&server, config.tick_timeout())?;
        Ok(PollWorker {
            server,
            client,
            pipeline,
            events,
            poll_interval: config.poll_interval(),
            tick_timeout: config.tick_timeout(),
            down_after_failures: config.poller.down_after_failures.max(1),
            consecutive_failures: 0,
            status: ServerStatus::Up,
        })
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    /// Poll until `shutdown` flips to true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "Polling {} ({:?}) every {}s",
            self.server.id,
            self.server.kind,
            self.poll_interval.as_secs()
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Poller for {} stopped", self.server.id);
    }

    /// Run one poll
    pub async fn tick(&mut self) -> Option<TickReport> {
        let fetched = timeout(self.tick_timeout, self.client.fetch_sessions()).await;
        let raws = match fetched {
            Ok(Ok(raws)) => raws,
            Ok(Err(e)) => {
                self.record_failure(&e.to_string());
                return None;
            }
            Err(_) => {
                self.record_failure("tick timed out");
                return None;
            }
        };

        self.record_success();
        let report = self.pipeline.process(&self.server.id, &raws, Utc::now());
        log::debug!(
            "Tick {}: {} snapshots, {} started, {} stopped, {} violations",
            self.server.id,
            report.snapshots,
            report.outcome.started.len(),
            report.outcome.stopped.len(),
            report.violations.len()
        );
        Some(report)
    }

    fn record_failure(&mut self, reason: &str) {
        self.consecutive_failures += 1;
        log::warn!(
            "Poll of {} failed ({} in a row): {}",
            self.server.id,
            self.consecutive_failures,
            reason
        );

        if self.status == ServerStatus::Up && self.consecutive_failures >= self.down_after_failures {
            self.status = ServerStatus::Down;
            log::error!("Server {} is down", self.server.id);
            self.events.publish(CoreEvent::ServerStatusChanged {
                server_id: self.server.id.clone(),
                status: ServerStatus::Down,
            });
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.status == ServerStatus::Down {
            self.status = ServerStatus::Up;
            log::info!("Server {} is back up", self.server.id);
            self.events.publish(CoreEvent::ServerStatusChanged {
                server_id: self.server.id.clone(),
                status: ServerStatus::Up,
            });
        }
    }
}
