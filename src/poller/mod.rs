//! The poll loop.
//!
//! One cycle runs at a time against the single live capability:
//! fetch → blocking check → extract → dedup decision → alert. Counters,
//! dedup state and the capability are owned here and touched only by
//! this task; the dispatcher's per-recipient fan-out is the only
//! concurrency inside a cycle.
//!
//! Nothing that goes wrong inside a cycle ends the process. Timeouts and
//! connection errors are counted and tolerated. Anything else, panics
//! included, is counted and the capability is replaced before the next
//! cycle.

use crate::backoff::BackoffPolicy;
use crate::blocking::{BlockingDetector, DEGRADED_PAGE_TERMS};
use crate::config::Config;
use crate::dedup::{Decision, DedupRecord};
use crate::diagnostics::DiagnosticsSink;
use crate::extract::{ExtractionResult, Extractor, Offer};
use crate::fetch::{Capability, FetchError};
use crate::notify::{format_alert, format_heartbeat, Dispatcher};
use crate::session::{should_restart, SessionError, SessionManager};
use crate::stats::{CycleStats, HeartbeatClock};
use chrono::{DateTime, Local, NaiveDate, Utc};
use futures::FutureExt;
use rand::Rng;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub const TEST_OFFER_PROBABILITY: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub event_url: String,
    pub fetch_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub heartbeat_interval: Duration,
    pub restart_interval: u64,
    pub rate_limit_threshold: u64,
    /// Sleep after a blocking page instead of the normal backoff.
    pub rate_limit_pause: Duration,
    pub resend_interval: Duration,
    pub snapshot_max_bytes: usize,
    pub test_mode: bool,
    /// Chance per cycle of a synthetic offer while `test_mode` is on.
    pub test_offer_probability: f64,
}

impl PollerSettings {
    pub fn from_config(config: &Config) -> Self {
        let p = &config.polling;
        Self {
            event_url: config.target.event_url.clone(),
            fetch_timeout: config.fetch_timeout(),
            backoff: BackoffPolicy::new(
                Duration::from_secs(p.sleep_min_secs),
                Duration::from_secs(p.sleep_max_secs),
            )
            .with_penalty(
                Duration::from_secs(p.penalty_min_secs),
                Duration::from_secs(p.penalty_max_secs),
            ),
            heartbeat_interval: Duration::from_secs(p.heartbeat_interval_minutes * 60),
            restart_interval: p.restart_interval,
            rate_limit_threshold: p.rate_limit_restart_threshold,
            rate_limit_pause: Duration::from_secs(p.rate_limit_pause_secs),
            resend_interval: Duration::from_secs(p.resend_interval_hours * 3600),
            snapshot_max_bytes: config.storage.snapshot_max_bytes,
            test_mode: p.test_mode,
            test_offer_probability: TEST_OFFER_PROBABILITY,
        }
    }
}

/// Where the poller is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Detecting,
    Extracting,
    Deciding,
    Notifying,
    Sleeping,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Fetching => write!(f, "fetching"),
            Phase::Detecting => write!(f, "detecting"),
            Phase::Extracting => write!(f, "extracting"),
            Phase::Deciding => write!(f, "deciding"),
            Phase::Notifying => write!(f, "notifying"),
            Phase::Sleeping => write!(f, "sleeping"),
        }
    }
}

/// A failure that makes the current capability suspect.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("capability failed while {phase}: {source}")]
    Capability {
        phase: Phase,
        #[source]
        source: FetchError,
    },
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("panicked while {phase}: {message}")]
    Panicked { phase: Phase, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Timeout or connection error; tolerated.
    FetchFailed,
    Blocked,
    /// The page says there are no tickets.
    NoOffers,
    Suppressed,
    Notified(usize),
    /// Nobody received the alert; dedup was left untouched.
    DeliveryFailed,
}

#[derive(Debug)]
pub struct CycleReport {
    /// `None` when the cycle failed and the capability was replaced.
    pub outcome: Option<CycleOutcome>,
    pub delay: Duration,
}

pub struct Poller {
    settings: PollerSettings,
    sessions: SessionManager,
    capability: Option<Box<dyn Capability>>,
    extractor: Arc<dyn Extractor>,
    detector: BlockingDetector,
    degraded_detector: BlockingDetector,
    dispatcher: Dispatcher,
    recipients: Vec<String>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    dedup: DedupRecord,
    stats: CycleStats,
    heartbeat: HeartbeatClock,
    cycles_since_restart: u64,
    phase: Phase,
}

impl Poller {
    pub fn new(
        settings: PollerSettings,
        sessions: SessionManager,
        extractor: Arc<dyn Extractor>,
        dispatcher: Dispatcher,
        recipients: Vec<String>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        let now = Utc::now();
        let detector = BlockingDetector::new(diagnostics.clone(), settings.snapshot_max_bytes);
        let degraded_detector = BlockingDetector::with_terms(
            DEGRADED_PAGE_TERMS.iter().copied(),
            diagnostics.clone(),
            settings.snapshot_max_bytes,
        );
        let heartbeat = HeartbeatClock::new(settings.heartbeat_interval, now);
        Self {
            settings,
            sessions,
            capability: None,
            extractor,
            detector,
            degraded_detector,
            dispatcher,
            recipients,
            diagnostics,
            dedup: DedupRecord::new(),
            stats: CycleStats::new(local_day(now)),
            heartbeat,
            cycles_since_restart: 0,
            phase: Phase::Idle,
        }
    }

    /// Restart the day and heartbeat clocks from `now`.
    pub fn starting_at(mut self, now: DateTime<Utc>) -> Self {
        self.stats = CycleStats::new(local_day(now));
        self.heartbeat = HeartbeatClock::new(self.settings.heartbeat_interval, now);
        self
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn dedup(&self) -> &DedupRecord {
        &self.dedup
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Poll until `shutdown` fires. Shutdown interrupts the sleep between
    /// cycles but never a cycle in flight. The capability is retired (its
    /// session saved) on the way out.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            url = %self.settings.event_url,
            recipients = self.recipients.len(),
            heartbeat_mins = self.settings.heartbeat_interval.as_secs() / 60,
            test_mode = self.settings.test_mode,
            "poller started"
        );

        while !shutdown.is_cancelled() {
            let report = self.tick(Utc::now()).await;

            self.set_phase(Phase::Sleeping);
            info!(secs = report.delay.as_secs(), "sleeping before next check");
            tokio::select! {
                _ = tokio::time::sleep(report.delay) => {}
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                }
            }
            self.set_phase(Phase::Idle);
        }

        self.shutdown().await;
    }

    /// Retire the live capability, if any.
    pub async fn shutdown(&mut self) {
        if let Some(capability) = self.capability.take() {
            self.sessions.retire(capability).await;
        }
        info!(
            tickets = self.stats.tickets_spotted,
            errors = self.stats.error_count,
            "poller stopped"
        );
    }

    /// One full cycle plus day rollover and heartbeat. Returns how long to
    /// sleep before the next one.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> CycleReport {
        let caught = AssertUnwindSafe(self.run_cycle(now)).catch_unwind().await;
        let result = match caught {
            Ok(result) => result,
            Err(panic) => Err(CycleError::Panicked {
                phase: self.phase,
                message: panic_message(panic.as_ref()),
            }),
        };

        let outcome = match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "error during ticket check, restarting capability");
                self.recover().await;
                None
            }
        };

        self.stats.roll_over(local_day(now));
        self.maybe_heartbeat(now).await;

        let delay = match outcome {
            Some(CycleOutcome::Blocked) => self.settings.rate_limit_pause,
            _ => self
                .settings
                .backoff
                .next_delay(self.stats.error_count, self.stats.rate_limit_count),
        };
        CycleReport { outcome, delay }
    }

    async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome, CycleError> {
        self.set_phase(Phase::Fetching);
        let url = self.settings.event_url.clone();
        let timeout = self.settings.fetch_timeout;
        info!(url = %url, "loading event page");

        let fetched = self.capability().await?.fetch(&url, timeout).await;
        let document = match fetched {
            Ok(document) => document,
            Err(e) if e.is_transient() => {
                error!(url = %url, error = %e, "timeout or connection error loading page");
                self.stats.record_error();
                self.diagnostics.write_snapshot(
                    "fetch_error",
                    &e.to_string(),
                    self.settings.snapshot_max_bytes,
                );
                return self.finish(CycleOutcome::FetchFailed).await;
            }
            Err(e) => {
                return Err(CycleError::Capability {
                    phase: Phase::Fetching,
                    source: e,
                })
            }
        };
        debug!(status = document.status, url = %document.url, "page loaded");

        self.set_phase(Phase::Detecting);
        if self.detector.is_blocked(&document.body) {
            self.stats.record_rate_limit();
            warn!(
                rate_limits = self.stats.rate_limit_count,
                pause_secs = self.settings.rate_limit_pause.as_secs(),
                "rate limit detected, pausing"
            );
            return self.finish(CycleOutcome::Blocked).await;
        }

        self.set_phase(Phase::Extracting);
        let mut result = self.extractor.extract(&document);
        if result.no_offers_sentinel {
            info!("no tickets listed for this event");
            self.dedup.clear();
            return self.finish(CycleOutcome::NoOffers).await;
        }
        if result.degraded {
            warn!("no ticket listings found on page");
            let indicators = self.possible_block_terms(&document.body);
            if !indicators.is_empty() {
                warn!(terms = ?indicators, "possible blocking detected");
            }
            self.diagnostics.write_snapshot(
                "no_listings",
                &document.body,
                self.settings.snapshot_max_bytes,
            );
        } else if self.settings.test_mode {
            maybe_inject_test_offer(&mut result, self.settings.test_offer_probability);
        }

        self.set_phase(Phase::Deciding);
        let decision = self
            .dedup
            .decide(&result.offers, self.settings.resend_interval, now);
        let Decision::Notify { count, reason } = decision else {
            if result.offers.is_empty() {
                info!("no tickets with buy button available");
            } else {
                info!(
                    last_sent = ?self.dedup.last_notified_at(),
                    "identical tickets, skipping"
                );
            }
            return self.finish(CycleOutcome::Suppressed).await;
        };
        info!(count, reason = %reason, "tickets to announce");

        self.set_phase(Phase::Notifying);
        let text = format_alert(&result, &self.settings.event_url);
        let report = self.dispatcher.dispatch(&self.recipients, &text).await;
        if report.all_failed() {
            error!(count, "alert not delivered to any recipient");
            self.stats.record_error();
            return self.finish(CycleOutcome::DeliveryFailed).await;
        }

        self.dedup.commit(&result.offers, now);
        self.stats.record_tickets(count);
        self.finish(CycleOutcome::Notified(count)).await
    }

    /// The live capability, acquiring one if the last was retired.
    async fn capability(&mut self) -> Result<&mut Box<dyn Capability>, CycleError> {
        let capability = match self.capability.take() {
            Some(capability) => capability,
            None => {
                let capability = self.sessions.acquire().await?;
                self.cycles_since_restart = 0;
                capability
            }
        };
        Ok(self.capability.insert(capability))
    }

    /// Count the cycle and apply the restart policy.
    async fn finish(&mut self, outcome: CycleOutcome) -> Result<CycleOutcome, CycleError> {
        self.cycles_since_restart += 1;
        if should_restart(
            self.cycles_since_restart,
            self.stats.rate_limit_count,
            self.settings.restart_interval,
            self.settings.rate_limit_threshold,
        ) {
            info!(
                cycles = self.cycles_since_restart,
                rate_limits = self.stats.rate_limit_count,
                "restart policy triggered"
            );
            self.restart_capability().await?;
        }
        Ok(outcome)
    }

    async fn restart_capability(&mut self) -> Result<(), SessionError> {
        let old = self.capability.take();
        self.stats.reset_rate_limits();
        self.cycles_since_restart = 0;
        let fresh = self.sessions.restart(old).await?;
        self.capability = Some(fresh);
        Ok(())
    }

    async fn recover(&mut self) {
        self.stats.record_error();
        if let Err(e) = self.restart_capability().await {
            // Left empty; the next cycle tries again.
            error!(error = %e, "could not acquire a new capability");
        }
        self.set_phase(Phase::Idle);
    }

    async fn maybe_heartbeat(&mut self, now: DateTime<Utc>) {
        if !self.heartbeat.tick(now) {
            return;
        }
        if !self.stats.take_activity() {
            debug!("no activity since last heartbeat, skipping summary");
            return;
        }
        let text = format_heartbeat(&self.stats, now.with_timezone(&Local));
        debug!(recipients = self.recipients.len(), "sending heartbeat");
        self.dispatcher.dispatch(&self.recipients, &text).await;
    }

    /// Challenge-page phrases on a page that came back without listings.
    fn possible_block_terms<'a>(&'a self, body: &str) -> Vec<&'a str> {
        self.degraded_detector.scan(body)
    }

    fn set_phase(&mut self, phase: Phase) {
        trace!(from = %self.phase, to = %phase, "phase");
        self.phase = phase;
    }
}

/// Cancel `shutdown` once `signal` resolves. A signal listener that fails
/// to install is logged and never fires, so the poller keeps running.
pub async fn cancel_on_signal<F>(shutdown: CancellationToken, signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("shutting down...");
            shutdown.cancel();
        }
        Err(e) => {
            warn!(error = %e, "could not listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

fn local_day(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

fn maybe_inject_test_offer(result: &mut ExtractionResult, probability: f64) {
    let mut rng = rand::rng();
    if !rng.random_bool(probability.clamp(0.0, 1.0)) {
        return;
    }
    let offer = Offer::new(
        format!("£{}", rng.random_range(20..=100)),
        rng.random_range(1..=4).to_string(),
        "General Admission",
    );
    info!(price = %offer.price, quantity = %offer.quantity, "test mode: injecting synthetic offer");
    result.offers.push(offer);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
