//! Heartbeat ping/pong liveness monitoring

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::protocol::OutboundFrame;

/// Outcome of one heartbeat tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatTick {
    /// Ping to put on the wire
    pub ping: OutboundFrame,
    /// Set when no pong arrived within the staleness window
    pub stale_for: Option<Duration>,
}

/// Periodic liveness probe state
///
/// Timing lives outside: [`spawn_ticker`] drives [`Heartbeat::on_tick`]
/// through the owner, and every tick carries the run id it was started
/// with so ticks from a stopped run are ignored.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    stale_after: Duration,
    run: u64,
    active: bool,
    started_at: Option<Instant>,
    last_ping_sent_at: Option<Instant>,
    last_pong_received_at: Option<Instant>,
    ticker: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Create a stopped monitor
    #[must_use]
    pub const fn new(interval: Duration, stale_after: Duration) -> Self {
        Self {
            interval,
            stale_after,
            run: 0,
            active: false,
            started_at: None,
            last_ping_sent_at: None,
            last_pong_received_at: None,
            ticker: None,
        }
    }

    /// Ping interval
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the monitor is running
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// When the last ping went out
    #[must_use]
    pub const fn last_ping_sent_at(&self) -> Option<Instant> {
        self.last_ping_sent_at
    }

    /// When the last pong came back
    #[must_use]
    pub const fn last_pong_received_at(&self) -> Option<Instant> {
        self.last_pong_received_at
    }

    /// Begin a fresh run and return its id
    ///
    /// Staleness is measured from `now` until the first pong arrives.
    pub fn start(&mut self, now: Instant) -> u64 {
        self.stop();
        self.active = true;
        self.started_at = Some(now);
        tracing::debug!(run = self.run, interval_ms = self.interval.as_millis(), "heartbeat started");
        self.run
    }

    /// Keep the timer task so [`Heartbeat::stop`] can cancel it
    pub fn attach_ticker(&mut self, run: u64, ticker: JoinHandle<()>) {
        if self.active && run == self.run {
            if let Some(old) = self.ticker.replace(ticker) {
                old.abort();
            }
        } else {
            ticker.abort();
        }
    }

    /// Cancel the timer and clear all timestamps
    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if self.active {
            tracing::debug!(run = self.run, "heartbeat stopped");
        }
        self.active = false;
        self.run += 1;
        self.started_at = None;
        self.last_ping_sent_at = None;
        self.last_pong_received_at = None;
    }

    /// Handle a timer firing for `run`
    ///
    /// Returns `None` when the tick belongs to a stopped run.
    pub fn on_tick(&mut self, run: u64, now: Instant) -> Option<HeartbeatTick> {
        if !self.active || run != self.run {
            return None;
        }

        self.last_ping_sent_at = Some(now);
        let reference = self.last_pong_received_at.or(self.started_at)?;
        let silent_for = now.saturating_duration_since(reference);
        let stale_for = (silent_for > self.stale_after).then_some(silent_for);

        Some(HeartbeatTick {
            ping: OutboundFrame::ping(chrono::Utc::now().timestamp_millis()),
            stale_for,
        })
    }

    /// Record a pong; returns false if the monitor is not running
    pub fn on_pong(&mut self, now: Instant) -> bool {
        if !self.active {
            return false;
        }
        self.last_pong_received_at = Some(now);
        true
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

/// Call `on_tick` every `period`, first after one full period
///
/// The task ends as soon as `on_tick` returns false.
pub fn spawn_ticker<F>(period: Duration, mut on_tick: F) -> JoinHandle<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !on_tick() {
                break;
            }
        }
    })
}
