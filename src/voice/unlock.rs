//! Autoplay unlock negotiation
//!
//! Output starts `locked` unless the context is already running. Attempts
//! run a fixed list of strategies in priority order and are rate limited to
//! one per interval; calls inside the window are skipped, not queued. Once
//! unlocked the negotiator never locks again.

use std::num::NonZeroU32;
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Serialize;

use super::{AudioOutput, OutputContextState};

/// One way of getting the runtime to allow output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockStrategy {
    /// Resume a suspended output context
    ResumeContext,
    /// Play a near-silent sound; starting counts as proof
    ProbeSound,
    /// Assume output is allowed outside restricted runtimes
    DesktopFallback,
}

/// Result of re-reading the output context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recheck {
    Unchanged,
    /// The context turned out to be running; now unlocked
    Unlocked,
    /// Unlocked earlier but the runtime suspended the context again
    ResumeNeeded,
}

type Limiter<C> = RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Tracks unlock state and paces unlock attempts
pub struct UnlockNegotiator<C: Clock = DefaultClock> {
    unlocked: bool,
    restricted: bool,
    attempt_count: u32,
    last_attempt_at: Option<DateTime<Utc>>,
    in_flight: bool,
    limiter: Limiter<C>,
}

impl UnlockNegotiator {
    /// Create a locked negotiator on the real clock
    #[must_use]
    pub fn new(interval: Duration, restricted: bool) -> Self {
        Self::with_clock(interval, restricted, DefaultClock::default())
    }
}

impl<C: Clock> UnlockNegotiator<C> {
    /// Create a locked negotiator on `clock`
    #[must_use]
    pub fn with_clock(interval: Duration, restricted: bool, clock: C) -> Self {
        let quota = Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
        Self {
            unlocked: false,
            restricted,
            attempt_count: 0,
            last_attempt_at: None,
            in_flight: false,
            limiter: RateLimiter::direct_with_clock(quota, clock),
        }
    }

    /// Whether output may start
    #[must_use]
    pub const fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Failed attempts so far
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Wall-clock time of the last attempt that ran
    #[must_use]
    pub const fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.last_attempt_at
    }

    /// Whether an attempt is running
    #[must_use]
    pub const fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Derive the starting state from the output context
    ///
    /// A missing context counts as unlocked unless the runtime is restricted.
    pub fn initialize(&mut self, context: OutputContextState) -> bool {
        self.unlocked = match context {
            OutputContextState::Running => true,
            OutputContextState::Suspended => false,
            OutputContextState::Unavailable => !self.restricted,
        };
        tracing::debug!(?context, unlocked = self.unlocked, "initial audio unlock state");
        self.unlocked
    }

    /// Re-read the context before scheduling new output
    pub fn recheck(&mut self, context: OutputContextState) -> Recheck {
        match (self.unlocked, context) {
            (false, OutputContextState::Running) => {
                self.unlocked = true;
                tracing::info!("audio output unlocked by running context");
                Recheck::Unlocked
            }
            (true, OutputContextState::Suspended) => {
                tracing::debug!("output context suspended again, resuming");
                Recheck::ResumeNeeded
            }
            _ => Recheck::Unchanged,
        }
    }

    /// Strategies in priority order for this runtime
    #[must_use]
    pub fn strategies(&self) -> Vec<UnlockStrategy> {
        let mut strategies = vec![UnlockStrategy::ResumeContext, UnlockStrategy::ProbeSound];
        if !self.restricted {
            strategies.push(UnlockStrategy::DesktopFallback);
        }
        strategies
    }

    /// Claim the right to run an attempt
    ///
    /// Returns the strategies to run, or `None` when already unlocked, an
    /// attempt is running, or the previous attempt is inside the window.
    pub fn begin_attempt(&mut self) -> Option<Vec<UnlockStrategy>> {
        if self.unlocked || self.in_flight {
            return None;
        }
        if self.limiter.check().is_err() {
            tracing::debug!("unlock attempt too soon, skipping");
            return None;
        }

        self.in_flight = true;
        self.last_attempt_at = Some(Utc::now());
        tracing::debug!(attempt = self.attempt_count + 1, "unlock attempt started");
        Some(self.strategies())
    }

    /// Record the outcome of the running attempt
    ///
    /// Returns true when this attempt unlocked output.
    pub fn finish_attempt(&mut self, outcome: Option<UnlockStrategy>) -> bool {
        self.in_flight = false;
        if self.unlocked {
            return false;
        }

        if let Some(strategy) = outcome {
            self.unlocked = true;
            tracing::info!(?strategy, attempts = self.attempt_count, "audio output unlocked");
            true
        } else {
            self.attempt_count += 1;
            tracing::warn!(attempts = self.attempt_count, "audio unlock attempt failed");
            false
        }
    }
}

/// Run `strategies` in order against `output`, stopping at the first success
pub async fn run_strategies(
    output: &dyn AudioOutput,
    strategies: &[UnlockStrategy],
) -> Option<UnlockStrategy> {
    for &strategy in strategies {
        let ok = match strategy {
            UnlockStrategy::ResumeContext => match output.context_state() {
                OutputContextState::Running => true,
                OutputContextState::Suspended => output.resume_context().await,
                OutputContextState::Unavailable => false,
            },
            UnlockStrategy::ProbeSound => output.play_probe().await,
            UnlockStrategy::DesktopFallback => true,
        };

        tracing::trace!(?strategy, ok, "unlock strategy tried");
        if ok {
            return Some(strategy);
        }
    }
    None
}
