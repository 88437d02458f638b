//! Monitoring cycle.
//!
//! One cycle walks every watched target with bounded concurrency:
//!   cursor → quiescence check → pace → detect → dispatch → commit
//! with detect and dispatch sharing the per-target time budget.
//! Targets are independent. A target's cursor is written only after its
//! dispatch attempt finished, and never when detection or the subscriber
//! read failed. Only missing configuration aborts a cycle; everything else
//! is folded into the report's counters.

mod pacer;

pub use pacer::Pacer;

use crate::config::MonitorConfig;
use crate::cursor::{CursorCommit, CursorStore};
use crate::detect::Detector;
use crate::notify::{DispatchReport, Dispatcher, WaveProgress};
use crate::registry::{Registry, Target};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Journal entries older than this are assumed orphaned.
const JOURNAL_STALE_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    NoWatchedTargets,
    ChannelNotConfigured,
    RegistryUnavailable,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CycleState {
    Completed,
    Aborted { reason: AbortReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    #[serde(flatten)]
    pub state: CycleState,
    /// Includes rate-limited targets.
    pub targets_checked: u32,
    pub targets_rate_limited: u32,
    pub targets_failed: u32,
    /// Not started before the cycle deadline.
    pub targets_abandoned: u32,
    pub claims_found: u32,
    pub alerts_delivered: u32,
    pub alerts_failed: u32,
    pub entries_ambiguous: u32,
    pub duration_ms: u64,
}

impl CycleReport {
    fn new(state: CycleState) -> Self {
        Self {
            state,
            targets_checked: 0,
            targets_rate_limited: 0,
            targets_failed: 0,
            targets_abandoned: 0,
            claims_found: 0,
            alerts_delivered: 0,
            alerts_failed: 0,
            entries_ambiguous: 0,
            duration_ms: 0,
        }
    }

    fn aborted(reason: AbortReason, started: Instant) -> Self {
        let mut report = Self::new(CycleState::Aborted { reason });
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    fn fold(&mut self, outcome: TargetOutcome) {
        match outcome {
            TargetOutcome::RateLimited => {
                self.targets_checked += 1;
                self.targets_rate_limited += 1;
            }
            TargetOutcome::Checked {
                claims,
                ambiguous,
                dispatch,
                committed,
            } => {
                self.targets_checked += 1;
                self.claims_found += claims;
                self.entries_ambiguous += ambiguous;
                self.alerts_delivered += dispatch.delivered;
                self.alerts_failed += dispatch.failed;
                if !committed {
                    self.targets_failed += 1;
                }
            }
            TargetOutcome::Failed { ambiguous } => {
                self.targets_failed += 1;
                self.entries_ambiguous += ambiguous;
            }
            TargetOutcome::TimedOut {
                claims,
                ambiguous,
                dispatch,
            } => {
                self.targets_failed += 1;
                self.claims_found += claims;
                self.entries_ambiguous += ambiguous;
                self.alerts_delivered += dispatch.delivered;
                self.alerts_failed += dispatch.failed;
            }
            TargetOutcome::Abandoned => self.targets_abandoned += 1,
        }
    }
}

#[derive(Debug)]
enum TargetOutcome {
    RateLimited,
    Checked {
        claims: u32,
        ambiguous: u32,
        dispatch: DispatchReport,
        committed: bool,
    },
    Failed {
        ambiguous: u32,
    },
    /// Ran out of time mid-dispatch.
    TimedOut {
        claims: u32,
        ambiguous: u32,
        dispatch: DispatchReport,
    },
    Abandoned,
}

pub struct Monitor {
    registry: Registry,
    cursors: CursorStore,
    detector: Detector,
    /// None when no delivery credentials are configured.
    dispatcher: Option<Dispatcher>,
    pacer: Pacer,
    config: MonitorConfig,
    running: Mutex<()>,
}

impl Monitor {
    pub fn new(
        registry: Registry,
        cursors: CursorStore,
        detector: Detector,
        dispatcher: Option<Dispatcher>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            registry,
            cursors,
            detector,
            dispatcher,
            pacer: Pacer::new(config.start_spacing()),
            config,
            running: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run one cycle. A cycle already in progress makes this return an
    /// aborted report immediately instead of starting a second one.
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let Ok(_running) = self.running.try_lock() else {
            debug!("cycle already running");
            return CycleReport::aborted(AbortReason::AlreadyRunning, started);
        };
        let Some(dispatcher) = &self.dispatcher else {
            warn!("no delivery channel configured, cycle aborted");
            return CycleReport::aborted(AbortReason::ChannelNotConfigured, started);
        };

        match self
            .registry
            .reconcile(JOURNAL_STALE_AFTER, chrono::Utc::now().timestamp())
            .await
        {
            Ok(r) if r.replayed > 0 || r.unreadable > 0 => {
                info!(replayed = r.replayed, unreadable = r.unreadable, "registry journal reconciled")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "registry reconcile failed"),
        }

        let targets = match self.registry.all_watched_targets().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "could not list watched targets, cycle aborted");
                return CycleReport::aborted(AbortReason::RegistryUnavailable, started);
            }
        };
        if targets.is_empty() {
            debug!("no watched targets");
            return CycleReport::aborted(AbortReason::NoWatchedTargets, started);
        }

        let deadline = started + self.config.cycle_deadline();
        let total = targets.len();
        let outcomes: Vec<TargetOutcome> = stream::iter(targets)
            .map(|target| self.process_target(target, dispatcher, deadline))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let mut report = CycleReport::new(CycleState::Completed);
        for outcome in outcomes {
            report.fold(outcome);
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            targets = total,
            checked = report.targets_checked,
            rate_limited = report.targets_rate_limited,
            failed = report.targets_failed,
            abandoned = report.targets_abandoned,
            claims = report.claims_found,
            delivered = report.alerts_delivered,
            alerts_failed = report.alerts_failed,
            duration_ms = report.duration_ms,
            "cycle completed"
        );
        report
    }

    async fn process_target(&self, target: Target, dispatcher: &Dispatcher, deadline: Instant) -> TargetOutcome {
        let address = target.address.as_str();
        if Instant::now() >= deadline {
            return TargetOutcome::Abandoned;
        }

        let cursor = match self.cursors.get(address, &target.generation).await {
            Ok(c) => c,
            Err(e) => {
                warn!(target = %address, error = %e, "cursor read failed");
                return TargetOutcome::Failed { ambiguous: 0 };
            }
        };
        if self.cursors.is_quiescent(&cursor, chrono::Utc::now().timestamp()) {
            debug!(target = %address, "polled recently, skipping");
            return TargetOutcome::RateLimited;
        }

        self.pacer.wait().await;
        if Instant::now() >= deadline {
            return TargetOutcome::Abandoned;
        }
        // Detection and delivery share one budget, capped by the cycle deadline.
        let budget_end = (Instant::now() + self.config.target_timeout()).min(deadline);

        let detection = match tokio::time::timeout_at(budget_end, self.detector.detect(address, &cursor)).await {
            Ok(Ok(d)) => d,
            Ok(Err(e)) => {
                warn!(target = %address, error = %e, "detection failed");
                return TargetOutcome::Failed { ambiguous: 0 };
            }
            Err(_) => {
                warn!(target = %address, timeout = ?self.config.target_timeout(), "detection timed out");
                return TargetOutcome::Failed { ambiguous: 0 };
            }
        };
        let polled_at = chrono::Utc::now().timestamp();
        let ambiguous = detection.ambiguous as u32;
        let claims = detection.claims.len() as u32;

        let progress = WaveProgress::new(detection.claims.len());
        let dispatched = tokio::time::timeout_at(
            budget_end,
            dispatcher.dispatch_tracked(&target, &detection.claims, &progress),
        )
        .await;
        let dispatch = match dispatched {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                warn!(target = %address, error = %e, "subscriber lookup failed, cursor left unchanged");
                return TargetOutcome::Failed { ambiguous };
            }
            Err(_) => {
                // Claims whose wave began are marked anyway so no subscriber
                // sees them twice; the watermark and poll time stay put so
                // the rest is picked up next cycle.
                let commit = CursorCommit {
                    watermark: None,
                    notified: detection
                        .claims
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| progress.is_started(*i))
                        .map(|(_, c)| (c.claim_id.clone(), c.occurred_at))
                        .collect(),
                    polled_at: 0,
                };
                let dispatch = progress.report();
                warn!(
                    target = %address,
                    timeout = ?self.config.target_timeout(),
                    claims,
                    started = commit.notified.len(),
                    delivered = dispatch.delivered,
                    "dispatch timed out"
                );
                if !commit.notified.is_empty() {
                    self.commit_current(&target, commit).await;
                }
                return TargetOutcome::TimedOut {
                    claims,
                    ambiguous,
                    dispatch,
                };
            }
        };

        // Every claim had its attempt; mark all of them, delivered or not.
        let commit = CursorCommit {
            watermark: detection.newest_seen,
            notified: detection
                .claims
                .iter()
                .map(|c| (c.claim_id.clone(), c.occurred_at))
                .collect(),
            polled_at,
        };
        let committed = self.commit_current(&target, commit).await;

        if claims > 0 {
            info!(
                target = %address,
                claims,
                delivered = dispatch.delivered,
                failed = dispatch.failed,
                "claims dispatched"
            );
        }
        TargetOutcome::Checked {
            claims,
            ambiguous,
            dispatch,
            committed,
        }
    }

    /// Commit only while `target` is still the live generation. A target
    /// collected (or collected and re-created) mid-check keeps its state;
    /// nothing is written for the stale generation. Returns false only when
    /// the write itself failed.
    async fn commit_current(&self, target: &Target, commit: CursorCommit) -> bool {
        let address = target.address.as_str();
        match self.registry.target_record(address).await {
            Ok(Some(record)) if record.generation == target.generation => {}
            Ok(_) => {
                debug!(target = %address, generation = %target.generation, "target changed mid-check, cursor not committed");
                return true;
            }
            Err(e) => {
                warn!(target = %address, error = %e, "target lookup before commit failed");
                return false;
            }
        }
        match self.cursors.commit(address, &target.generation, commit).await {
            Ok(_) => true,
            Err(e) => {
                warn!(target = %address, error = %e, "cursor commit failed");
                false
            }
        }
    }
}

/// Run cycles forever on a fixed interval. Ticks that would overlap a
/// running cycle are skipped.
pub async fn run_schedule(monitor: Arc<Monitor>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(every_secs = every.as_secs(), "scheduled monitoring enabled");
    loop {
        ticker.tick().await;
        let report = monitor.run_cycle().await;
        if let CycleState::Aborted { reason } = report.state {
            debug!(?reason, "scheduled cycle aborted");
        }
    }
}
