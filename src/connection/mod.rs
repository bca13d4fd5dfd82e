//! Duplex channel ownership and connection state machine
//!
//! [`Connection`] is the only holder of the live transport link. Every link is
//! stamped with a generation number; events from an older generation are
//! rejected so a late close or frame from a torn-down socket cannot touch the
//! current one.

mod heartbeat;
mod transport;

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use heartbeat::{Heartbeat, HeartbeatTick, spawn_ticker};
pub use transport::{LinkEvent, Transport, TransportLink, WebSocketTransport};

use crate::protocol::OutboundFrame;
use crate::{Error, Result};

/// Lifecycle state of the duplex channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport
    #[default]
    Disconnected,
    /// Transport is being opened
    Connecting,
    /// Open and recently confirmed alive
    Connected,
    /// Open, but no pong within the staleness window
    Degraded,
    /// Transport failed
    Error,
}

impl ConnectionState {
    /// Whether frames may be sent in this state
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Owner of the transport link and its state
#[derive(Debug, Default)]
pub struct Connection {
    state: ConnectionState,
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    pump: Option<JoinHandle<()>>,
    last_send_at: Option<Instant>,
    last_ack_at: Option<Instant>,
}

impl Connection {
    /// Create a disconnected connection
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Generation of the current (or pending) link
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a link is open for sending
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// When a frame was last written
    #[must_use]
    pub const fn last_send_at(&self) -> Option<Instant> {
        self.last_send_at
    }

    /// When the server last proved it was alive (open or pong)
    #[must_use]
    pub const fn last_ack_at(&self) -> Option<Instant> {
        self.last_ack_at
    }

    /// Start a new connection attempt
    ///
    /// Returns the generation the caller must stamp on every event produced
    /// by the new link.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyConnected`] when a link is pending or open;
    /// the state is left unchanged
    pub fn begin_connect(&mut self) -> Result<u64> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Degraded
        ) {
            return Err(Error::AlreadyConnected(self.state));
        }

        self.release_link();
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        tracing::debug!(generation = self.generation, "connection attempt started");
        Ok(self.generation)
    }

    /// Keep the task pumping link events so teardown can stop it
    pub fn attach_pump(&mut self, generation: u64, pump: JoinHandle<()>) {
        if generation == self.generation && self.state == ConnectionState::Connecting {
            self.pump = Some(pump);
        } else {
            pump.abort();
        }
    }

    /// The link for `generation` finished its handshake
    ///
    /// Returns false (and drops the link) if the attempt was superseded.
    pub fn opened(&mut self, generation: u64, outgoing: mpsc::UnboundedSender<String>) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            tracing::debug!(generation, current = self.generation, "ignoring stale open");
            return false;
        }

        self.outgoing = Some(outgoing);
        self.state = ConnectionState::Connected;
        self.last_ack_at = Some(Instant::now());
        true
    }

    /// The link for `generation` closed
    pub fn closed(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state == ConnectionState::Disconnected {
            return false;
        }

        self.release_link();
        self.state = ConnectionState::Disconnected;
        true
    }

    /// The link for `generation` failed to open or broke
    pub fn failed(&mut self, generation: u64) -> bool {
        if generation != self.generation
            || matches!(
                self.state,
                ConnectionState::Disconnected | ConnectionState::Error
            )
        {
            return false;
        }

        self.release_link();
        self.state = ConnectionState::Error;
        true
    }

    /// Tear down the link on request
    ///
    /// Bumps the generation so events still in flight from the old link are
    /// ignored. Returns false when there was nothing to tear down.
    pub fn disconnect(&mut self) -> bool {
        let had_link = self.outgoing.is_some() || self.pump.is_some();
        if self.state == ConnectionState::Disconnected && !had_link {
            return false;
        }

        self.release_link();
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        true
    }

    /// Link is open but liveness is unconfirmed
    pub fn mark_degraded(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        self.state = ConnectionState::Degraded;
        true
    }

    /// Server answered; restores `Connected` if the link was degraded
    pub fn mark_alive(&mut self) -> bool {
        self.last_ack_at = Some(Instant::now());
        if self.state != ConnectionState::Degraded {
            return false;
        }
        self.state = ConnectionState::Connected;
        true
    }

    /// Write one frame to the link
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless connected or degraded, and
    /// [`Error::Transport`] if the link writer has gone away
    pub fn send(&mut self, frame: &OutboundFrame) -> Result<()> {
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }

        let outgoing = self.outgoing.as_ref().ok_or(Error::NotConnected)?;
        let json = frame.to_json()?;
        let len = json.len();

        outgoing
            .send(json)
            .map_err(|_| Error::Transport("link writer closed".to_string()))?;

        self.last_send_at = Some(Instant::now());
        tracing::trace!(kind = frame.kind(), len, "frame sent");
        Ok(())
    }

    fn release_link(&mut self) {
        // Dropping the sender lets the writer send a close frame and exit
        self.outgoing = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release_link();
    }
}
