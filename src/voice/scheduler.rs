//! Audio message reassembly and playback scheduling
//!
//! Inbound chunks are buffered per message id and released in ascending
//! sequence order, one at a time. Chunks without a sequence number, and
//! chunks sharing one, keep their arrival order. The scheduler never touches
//! an output device: it hands out [`Directive`]s and the owner reports back
//! with [`PlaybackScheduler::chunk_finished`] or
//! [`PlaybackScheduler::requeue`].
//!
//! Every chunk handed out carries a fresh token. Interrupting a message drops
//! its session together with the token it was waiting on, so a completion
//! for an interrupted chunk is rejected instead of advancing a session that
//! no longer exists.

use std::collections::{BTreeMap, VecDeque};

use crate::protocol::{AudioChunk, DEFAULT_MESSAGE_ID};

/// Interrupted message ids remembered by [`PlaybackScheduler::new`]
pub const DEFAULT_INTERRUPTED_MEMORY: usize = 16;

/// Buffer position: sequence number, then arrival order
type Slot = (u32, u64);

/// Buffered chunks of one reply
#[derive(Debug, Clone)]
pub struct AudioMessage {
    id: String,
    chunks: BTreeMap<Slot, AudioChunk>,
    arrivals: u64,
    final_seen: bool,
}

impl AudioMessage {
    fn new(id: String) -> Self {
        Self {
            id,
            chunks: BTreeMap::new(),
            arrivals: 0,
            final_seen: false,
        }
    }

    /// Message id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Chunks waiting to be played
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the final chunk has arrived
    #[must_use]
    pub const fn final_seen(&self) -> bool {
        self.final_seen
    }

    /// Whether a chunk explicitly numbered `sequence` is buffered
    fn holds_numbered(&self, sequence: u32) -> bool {
        self.chunks
            .range((sequence, 0)..=(sequence, u64::MAX))
            .any(|(_, c)| c.sequence.is_some())
    }
}

/// Work the owner must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Play `chunk` and report completion with `token`
    Play { token: u64, chunk: AudioChunk },
    /// Output is locked; try to unlock and re-pump, or report blocked after
    /// the wait for `session` elapses
    AwaitUnlock { session: u64, message_id: String },
    /// Every buffered chunk of the message has been played
    Finished { message_id: String },
}

/// What happened to an admitted chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Buffered for playback
    Buffered,
    /// Buffered, and the previously active message was interrupted
    Replaced(Interrupted),
    /// Dropped: duplicate, already played, or belongs to an interrupted message
    Discarded,
}

/// A session torn down by interruption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interrupted {
    /// Message that was active
    pub message_id: String,
    /// Token of the chunk that was playing, if any
    pub token: Option<u64>,
    /// Chunks discarded without being played
    pub discarded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Not checked yet for this message
    Unchecked,
    /// Waiting for the output to unlock
    Awaiting,
    Open,
}

/// The chunk out for playback, kept until the owner reports back
#[derive(Debug)]
struct InFlight {
    token: u64,
    slot: Slot,
    chunk: AudioChunk,
    /// `next_seq` before this chunk was handed out
    prior_next_seq: u32,
}

#[derive(Debug)]
struct Session {
    id: u64,
    message: AudioMessage,
    next_seq: u32,
    playing: Option<InFlight>,
    gate: Gate,
}

/// The singleton playback session and the message it owns
///
/// Only the active message holds buffered chunks: a chunk for any other id
/// replaces it.
#[derive(Debug)]
pub struct PlaybackScheduler {
    active: Option<Session>,
    interrupted: VecDeque<String>,
    interrupted_memory: usize,
    /// Message drained before its final chunk, and where it stopped
    resume: Option<(String, u32)>,
    next_token: u64,
    next_session: u64,
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackScheduler {
    /// Create an idle scheduler
    #[must_use]
    pub fn new() -> Self {
        Self::with_interrupted_memory(DEFAULT_INTERRUPTED_MEMORY)
    }

    /// Create an idle scheduler remembering `memory` interrupted message ids
    #[must_use]
    pub fn with_interrupted_memory(memory: usize) -> Self {
        Self {
            active: None,
            interrupted: VecDeque::with_capacity(memory),
            interrupted_memory: memory,
            resume: None,
            next_token: 0,
            next_session: 0,
        }
    }

    /// Id of the active message
    #[must_use]
    pub fn active_message_id(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.message.id())
    }

    /// The active message
    #[must_use]
    pub fn active_message(&self) -> Option<&AudioMessage> {
        self.active.as_ref().map(|s| &s.message)
    }

    /// Whether a chunk is out for playback
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.active.as_ref().is_some_and(|s| s.playing.is_some())
    }

    /// Next sequence number the active message will play
    #[must_use]
    pub fn next_sequence(&self) -> Option<u32> {
        self.active.as_ref().map(|s| s.next_seq)
    }

    /// Whether `session` is still waiting for the output to unlock
    #[must_use]
    pub fn is_awaiting_unlock(&self, session: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|s| s.id == session && s.gate == Gate::Awaiting)
    }

    /// Where a new session for `message_id` starts
    fn resume_point(&self, message_id: &str) -> u32 {
        self.resume
            .as_ref()
            .filter(|(id, _)| id == message_id)
            .map_or(0, |(_, seq)| *seq)
    }

    /// Buffer one inbound chunk
    ///
    /// A chunk for a message other than the active one interrupts the active
    /// message first: at most one message is ever audible.
    pub fn admit(&mut self, chunk: AudioChunk) -> Admission {
        if chunk.message_id != DEFAULT_MESSAGE_ID && self.interrupted.contains(&chunk.message_id) {
            tracing::debug!(
                message_id = %chunk.message_id,
                sequence = ?chunk.sequence,
                "dropping chunk of interrupted message"
            );
            return Admission::Discarded;
        }

        let same_message = self
            .active
            .as_ref()
            .map(|s| s.message.id == chunk.message_id);
        let replaced = match same_message {
            Some(false) => self.interrupt(),
            Some(true) | None => None,
        };
        let discarded = || replaced.clone().map_or(Admission::Discarded, Admission::Replaced);

        if self.active.is_none() {
            let next_seq = self.resume_point(&chunk.message_id);
            if chunk.sequence.is_some_and(|seq| seq < next_seq) {
                tracing::debug!(
                    message_id = %chunk.message_id,
                    sequence = ?chunk.sequence,
                    next = next_seq,
                    "dropping chunk that already played"
                );
                return discarded();
            }

            self.next_session += 1;
            self.resume = None;
            tracing::debug!(
                message_id = %chunk.message_id,
                session = self.next_session,
                next_seq,
                "audio message active"
            );
            self.active = Some(Session {
                id: self.next_session,
                message: AudioMessage::new(chunk.message_id.clone()),
                next_seq,
                playing: None,
                gate: Gate::Unchecked,
            });
        }
        let Some(session) = self.active.as_mut() else {
            return discarded();
        };

        if let Some(sequence) = chunk.sequence {
            if sequence < session.next_seq || session.message.holds_numbered(sequence) {
                tracing::debug!(
                    message_id = %chunk.message_id,
                    sequence,
                    next = session.next_seq,
                    "dropping duplicate chunk"
                );
                return discarded();
            }
        }

        let slot = (
            chunk.sequence.unwrap_or(session.next_seq),
            session.message.arrivals,
        );
        session.message.arrivals += 1;
        session.message.final_seen |= chunk.is_final;
        tracing::trace!(
            message_id = %chunk.message_id,
            sequence = ?chunk.sequence,
            is_final = chunk.is_final,
            buffered = session.message.chunks.len() + 1,
            "chunk buffered"
        );
        session.message.chunks.insert(slot, chunk);

        replaced.map_or(Admission::Buffered, Admission::Replaced)
    }

    /// Decide what to do next
    ///
    /// `unlocked` is the output gate; it is consulted only before the first
    /// chunk of each message and after a blocked chunk was put back. Returns
    /// nothing while a chunk is playing or the active message is waiting on
    /// a missing sequence number. A message whose buffer drains is finished
    /// even without its final chunk; later chunks for it start a new session
    /// where the old one stopped.
    pub fn pump(&mut self, unlocked: bool) -> Option<Directive> {
        let session = self.active.as_mut()?;
        if session.playing.is_some() {
            return None;
        }

        match session.gate {
            Gate::Open => {}
            Gate::Unchecked | Gate::Awaiting if unlocked => session.gate = Gate::Open,
            Gate::Unchecked => {
                session.gate = Gate::Awaiting;
                tracing::debug!(message_id = %session.message.id, "output locked, awaiting unlock");
                return Some(Directive::AwaitUnlock {
                    session: session.id,
                    message_id: session.message.id.clone(),
                });
            }
            Gate::Awaiting => return None,
        }

        let Some(&slot) = session.message.chunks.keys().next() else {
            let message_id = session.message.id.clone();
            if !session.message.final_seen && message_id != DEFAULT_MESSAGE_ID {
                self.resume = Some((message_id.clone(), session.next_seq));
            }
            self.active = None;
            tracing::debug!(message_id = %message_id, "audio message finished");
            return Some(Directive::Finished { message_id });
        };
        if slot.0 > session.next_seq {
            // Wait for the missing sequence number
            return None;
        }
        let chunk = session.message.chunks.remove(&slot)?;

        self.next_token += 1;
        let token = self.next_token;
        let prior_next_seq = session.next_seq;
        if let Some(sequence) = chunk.sequence {
            session.next_seq = session.next_seq.max(sequence.saturating_add(1));
        }
        session.playing = Some(InFlight {
            token,
            slot,
            chunk: chunk.clone(),
            prior_next_seq,
        });
        tracing::trace!(
            message_id = %chunk.message_id,
            sequence = ?chunk.sequence,
            token,
            "chunk scheduled"
        );
        Some(Directive::Play { token, chunk })
    }

    /// The chunk played under `token` is done
    ///
    /// Returns false for stale tokens, which must not advance anything.
    pub fn chunk_finished(&mut self, token: u64) -> bool {
        match self.active.as_mut() {
            Some(session) if session.playing.as_ref().is_some_and(|f| f.token == token) => {
                session.playing = None;
                true
            }
            _ => {
                tracing::trace!(token, "ignoring stale chunk completion");
                false
            }
        }
    }

    /// The output refused the chunk played under `token`
    ///
    /// Puts the chunk back at the head of its message and closes the gate
    /// again. Returns the session now waiting for unlock, or `None` for a
    /// stale token.
    pub fn requeue(&mut self, token: u64) -> Option<u64> {
        let Some(session) = self
            .active
            .as_mut()
            .filter(|s| s.playing.as_ref().is_some_and(|f| f.token == token))
        else {
            tracing::trace!(token, "ignoring stale requeue");
            return None;
        };
        let flight = session.playing.take()?;

        tracing::debug!(
            message_id = %session.message.id,
            sequence = ?flight.chunk.sequence,
            "chunk blocked, requeued until unlock"
        );
        session.next_seq = flight.prior_next_seq;
        session.message.chunks.insert(flight.slot, flight.chunk);
        session.gate = Gate::Awaiting;
        Some(session.id)
    }

    /// Cancel the active message and discard its undelivered chunks
    pub fn interrupt(&mut self) -> Option<Interrupted> {
        let session = self.active.take()?;
        let message_id = session.message.id;
        let discarded = session.message.chunks.len();

        if message_id != DEFAULT_MESSAGE_ID && self.interrupted_memory > 0 {
            if self.interrupted.len() >= self.interrupted_memory {
                self.interrupted.pop_front();
            }
            self.interrupted.push_back(message_id.clone());
        }

        tracing::debug!(message_id = %message_id, discarded, "audio message interrupted");

        Some(Interrupted {
            message_id,
            token: session.playing.map(|f| f.token),
            discarded,
        })
    }
}
