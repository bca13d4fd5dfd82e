//! The voice client actor
//!
//! One task owns every piece of session state: the connection, the
//! heartbeat, capture, the playback scheduler and the unlock negotiator.
//! Callers talk to it through [`VoiceClient`]; transports, timers, the
//! detector and playback tasks report back as internal events on a second
//! channel. Nothing is shared, so nothing is locked. Each event carries the
//! generation, run, session or token it was issued under and is dropped if
//! that is no longer current.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

use crate::config::Config;
use crate::connection::{
    Connection, ConnectionState, Heartbeat, LinkEvent, Transport, TransportLink,
    WebSocketTransport, spawn_ticker,
};
use crate::identity::{self, FileStore, KeyValueStore};
use crate::protocol::{AudioChunk, InboundFrame, OutboundFrame, parse_inbound};
use crate::voice::{
    Admission, AudioOutput, CaptureConstraints, CpalMicrophoneProvider, CpalOutput, Directive,
    EnergyVadProvider, Microphone, MicrophoneProvider, PlaybackScheduler, Recheck,
    RecordingTrigger, UnlockNegotiator, UnlockStrategy, Utterance, VadOutcome, VadProvider,
    VadSignal, VadSink, VadThresholds, VoiceActivityDetector, VoiceCapture,
    acquire_with_fallback, run_strategies,
};
use crate::{DeviceError, Error, PlaybackError, Result};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// External capabilities the client drives
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub microphones: Arc<dyn MicrophoneProvider>,
    pub vad: Arc<dyn VadProvider>,
    pub output: Arc<dyn AudioOutput>,
    pub store: Arc<dyn KeyValueStore>,
}

impl Collaborators {
    /// WebSocket transport, cpal devices, energy VAD and the identity file
    #[must_use]
    pub fn native(config: &Config) -> Self {
        let thresholds = VadThresholds {
            positive: config.capture.positive_threshold,
            negative: config.capture.negative_threshold,
            redemption_frames: config.capture.redemption_frames,
        };
        Self {
            transport: Arc::new(WebSocketTransport::new()),
            microphones: Arc::new(CpalMicrophoneProvider::new()),
            vad: Arc::new(EnergyVadProvider::new(thresholds)),
            output: Arc::new(CpalOutput::new()),
            store: Arc::new(FileStore::new(&config.identity.store_path)),
        }
    }
}

/// Notifications published to subscribers
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected {
        reason: Option<String>,
    },
    StatusChanged(ConnectionState),
    /// Every inbound frame, including audio and unparseable ones
    Message(InboundFrame),
    AudioReceived {
        message_id: String,
        sequence: Option<u32>,
        format: String,
        size: usize,
        is_final: bool,
    },
    RecordingStarted {
        recording_id: u64,
        trigger: RecordingTrigger,
    },
    RecordingStopped {
        recording_id: u64,
        size: usize,
        format: String,
    },
    /// Recording cut off without producing an utterance
    RecordingCancelled {
        recording_id: u64,
    },
    VadReady(bool),
    /// A contained failure; the client keeps running
    Error(Arc<Error>),
    UnlockStateChanged {
        unlocked: bool,
        strategy: Option<UnlockStrategy>,
    },
    PlaybackBlocked {
        message_id: String,
        attempts: u32,
    },
}

/// Point-in-time view of the client
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub connection: ConnectionState,
    pub client_id: String,
    pub recording: bool,
    pub listening: bool,
    pub vad_enabled: bool,
    pub vad_ready: bool,
    pub autoplay: bool,
    pub playing: bool,
    pub active_message_id: Option<String>,
    pub unlocked: bool,
    pub unlock_attempts: u32,
    pub last_unlock_attempt: Option<DateTime<Utc>>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Connect(Reply<()>),
    Disconnect(oneshot::Sender<()>),
    SendText(String, Reply<()>),
    SendAudio(Reply<usize>),
    StartRecording(Reply<bool>),
    StopRecording(Reply<bool>),
    ToggleRecording(Reply<bool>),
    ToggleListening(Reply<bool>),
    StopListening(oneshot::Sender<()>),
    SetAutoplay(bool, oneshot::Sender<()>),
    Unlock(oneshot::Sender<bool>),
    StopAllAudio(oneshot::Sender<()>),
    Status(oneshot::Sender<StatusSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

struct CaptureParts {
    microphone: Box<dyn Microphone>,
    detector: Option<Box<dyn VoiceActivityDetector>>,
    vad_error: Option<Error>,
}

enum Internal {
    Opened {
        generation: u64,
        result: Result<mpsc::UnboundedSender<String>>,
    },
    Link {
        generation: u64,
        event: LinkEvent,
    },
    HeartbeatTick {
        run: u64,
    },
    CaptureReady {
        generation: u64,
        result: Result<CaptureParts>,
    },
    Vad {
        generation: u64,
        signal: VadSignal,
    },
    SettleElapsed {
        recording_id: u64,
    },
    ChunkFinished {
        token: u64,
        result: std::result::Result<(), PlaybackError>,
    },
    UnlockFinished {
        outcome: Option<UnlockStrategy>,
    },
    UnlockWaitElapsed {
        session: u64,
    },
}

/// Handle to a running client
#[derive(Clone)]
pub struct VoiceClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl VoiceClient {
    /// Start the client actor
    ///
    /// The returned receiver is subscribed before the actor starts, so it
    /// sees the initial unlock state.
    #[must_use]
    pub fn spawn(
        config: Config,
        collaborators: Collaborators,
    ) -> (Self, broadcast::Receiver<ClientEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, first) = broadcast::channel(EVENT_CAPACITY);

        let actor = Actor::new(config, collaborators, events.clone(), internal_tx);
        tokio::spawn(actor.run(command_rx, internal_rx));

        (
            Self {
                commands: command_tx,
                events,
            },
            first,
        )
    }

    /// Another event receiver
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::ClientClosed)?;
        rx.await.map_err(|_| Error::ClientClosed)
    }

    /// Start connecting; completion is reported through events
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyConnected`] while connecting or connected
    pub async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await?
    }

    /// Close the link; a no-op when already disconnected
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the actor is gone
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Send user text, interrupting any reply being played
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the link is open
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Command::SendText(text, reply)).await?
    }

    /// Send the last finished recording, returning its size in bytes
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRecording`] when nothing is pending and
    /// [`Error::NotConnected`] unless the link is open
    pub async fn send_audio(&self) -> Result<usize> {
        self.request(Command::SendAudio).await?
    }

    /// Start a manual recording; false if one is already running
    ///
    /// # Errors
    ///
    /// Returns error if the microphone is not ready
    pub async fn start_recording(&self) -> Result<bool> {
        self.request(Command::StartRecording).await?
    }

    /// Stop the current recording and keep it for [`VoiceClient::send_audio`]
    ///
    /// # Errors
    ///
    /// Returns error if finishing the recording fails
    pub async fn stop_recording(&self) -> Result<bool> {
        self.request(Command::StopRecording).await?
    }

    /// Start or stop recording; returns whether recording now
    ///
    /// # Errors
    ///
    /// Returns error if the recorder fails
    pub async fn toggle_recording(&self) -> Result<bool> {
        self.request(Command::ToggleRecording).await?
    }

    /// Arm or disarm voice-activity recording; returns whether listening now
    ///
    /// # Errors
    ///
    /// Returns error if voice activity detection is not ready
    pub async fn toggle_listening(&self) -> Result<bool> {
        self.request(Command::ToggleListening).await?
    }

    /// Disarm voice-activity recording
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the actor is gone
    pub async fn stop_listening(&self) -> Result<()> {
        self.request(Command::StopListening).await
    }

    /// Enable or disable automatic playback of inbound audio
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the actor is gone
    pub async fn set_autoplay(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetAutoplay(enabled, reply)).await
    }

    /// Try to unlock audio output; returns whether output is unlocked
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the actor is gone
    pub async fn unlock(&self) -> Result<bool> {
        self.request(Command::Unlock).await
    }

    /// Stop playback and drop every buffered chunk
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the actor is gone
    pub async fn stop_all_audio(&self) -> Result<()> {
        self.request(Command::StopAllAudio).await
    }

    /// Current status
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the actor is gone
    pub async fn status(&self) -> Result<StatusSnapshot> {
        self.request(Command::Status).await
    }

    /// Disconnect, release the microphone and stop the actor
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the actor is already gone
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

struct Actor {
    config: Config,
    collab: Collaborators,
    client_id: String,
    events: broadcast::Sender<ClientEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    connection: Connection,
    heartbeat: Heartbeat,
    capture: VoiceCapture,
    capture_generation: u64,
    capture_pending: bool,
    scheduler: PlaybackScheduler,
    playing: Option<JoinHandle<()>>,
    unlock: UnlockNegotiator,
    unlock_waiters: Vec<oneshot::Sender<bool>>,
    /// Session whose blocked chunk was already retried once
    blocked_retry: Option<u64>,
    autoplay: bool,
}

impl Actor {
    fn new(
        config: Config,
        collab: Collaborators,
        events: broadcast::Sender<ClientEvent>,
        internal: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        let client_id = identity::client_id(collab.store.as_ref()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "identity store unavailable, using a session id");
            identity::generate_client_id()
        });

        Self {
            heartbeat: Heartbeat::new(config.heartbeat.interval, config.heartbeat.stale_after),
            capture: VoiceCapture::new(config.capture.enable_vad),
            unlock: UnlockNegotiator::new(
                config.playback.unlock_interval,
                config.playback.restricted,
            ),
            autoplay: config.playback.autoplay,
            scheduler: PlaybackScheduler::with_interrupted_memory(
                config.playback.interrupted_memory,
            ),
            config,
            collab,
            client_id,
            events,
            internal,
            connection: Connection::new(),
            capture_generation: 0,
            capture_pending: false,
            playing: None,
            unlock_waiters: Vec::new(),
            blocked_retry: None,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let unlocked = self.unlock.initialize(self.collab.output.context_state());
        self.emit(ClientEvent::UnlockStateChanged {
            unlocked,
            strategy: None,
        });
        tracing::debug!(client_id = %self.client_id, "voice client started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = internal.recv() => self.handle_internal(event),
            }
        }

        tracing::debug!("voice client stopped");
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: Error) {
        self.emit(ClientEvent::Error(Arc::new(error)));
    }

    fn emit_status(&self) {
        self.emit(ClientEvent::StatusChanged(self.connection.state()));
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(self.connect());
            }
            Command::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::SendText(text, reply) => {
                let _ = reply.send(self.send_text(text));
            }
            Command::SendAudio(reply) => {
                let _ = reply.send(self.send_audio());
            }
            Command::StartRecording(reply) => {
                let _ = reply.send(self.start_recording(RecordingTrigger::Manual));
            }
            Command::StopRecording(reply) => {
                let _ = reply.send(self.stop_recording().map(|u| u.is_some()));
            }
            Command::ToggleRecording(reply) => {
                let result = if self.capture.is_recording() {
                    self.stop_recording().map(|_| false)
                } else {
                    self.start_recording(RecordingTrigger::Manual)
                        .map(|_| self.capture.is_recording())
                };
                let _ = reply.send(result);
            }
            Command::ToggleListening(reply) => {
                let _ = reply.send(self.toggle_listening());
            }
            Command::StopListening(reply) => {
                self.stop_listening();
                let _ = reply.send(());
            }
            Command::SetAutoplay(enabled, reply) => {
                self.autoplay = enabled;
                if !enabled {
                    self.stop_all_audio();
                }
                tracing::info!(enabled, "autoplay set");
                let _ = reply.send(());
            }
            Command::Unlock(reply) => self.unlock(reply),
            Command::StopAllAudio(reply) => {
                self.stop_all_audio();
                let _ = reply.send(());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown(_) => {}
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Opened { generation, result } => self.on_opened(generation, result),
            Internal::Link { generation, event } => self.on_link(generation, event),
            Internal::HeartbeatTick { run } => self.on_heartbeat(run),
            Internal::CaptureReady { generation, result } => self.on_capture_ready(generation, result),
            Internal::Vad { generation, signal } => {
                if generation == self.capture_generation {
                    self.on_vad(signal);
                }
            }
            Internal::SettleElapsed { recording_id } => self.on_settled(recording_id),
            Internal::ChunkFinished { token, result } => self.on_chunk_finished(token, result),
            Internal::UnlockFinished { outcome } => self.on_unlock_finished(outcome),
            Internal::UnlockWaitElapsed { session } => self.on_unlock_wait_elapsed(session),
        }
    }

    // Connection

    fn connect(&mut self) -> Result<()> {
        let url = identity::endpoint_url(&self.config.server.url, &self.client_id)?;
        let generation = self.connection.begin_connect()?;
        self.emit_status();
        tracing::info!(url = %url, generation, "connecting");

        let transport = Arc::clone(&self.collab.transport);
        let tx = self.internal.clone();
        let pump = tokio::spawn(async move {
            let TransportLink {
                outgoing,
                mut incoming,
            } = match transport.open(&url).await {
                Ok(link) => link,
                Err(e) => {
                    let _ = tx.send(Internal::Opened {
                        generation,
                        result: Err(e),
                    });
                    return;
                }
            };

            if tx
                .send(Internal::Opened {
                    generation,
                    result: Ok(outgoing),
                })
                .is_err()
            {
                return;
            }

            while let Some(event) = incoming.recv().await {
                let terminal = matches!(event, LinkEvent::Closed(_) | LinkEvent::Failed(_));
                if tx.send(Internal::Link { generation, event }).is_err() || terminal {
                    return;
                }
            }
            let _ = tx.send(Internal::Link {
                generation,
                event: LinkEvent::Closed(None),
            });
        });
        self.connection.attach_pump(generation, pump);
        Ok(())
    }

    fn on_opened(&mut self, generation: u64, result: Result<mpsc::UnboundedSender<String>>) {
        match result {
            Ok(outgoing) => {
                if !self.connection.opened(generation, outgoing) {
                    return;
                }
                tracing::info!(generation, "connected");
                self.emit(ClientEvent::Connected);
                self.emit_status();
                self.start_heartbeat();
                self.init_capture();
            }
            Err(e) => {
                if !self.connection.failed(generation) {
                    return;
                }
                tracing::error!(error = %e, "connection failed");
                self.link_down();
                self.emit_error(e);
                self.emit_status();
            }
        }
    }

    fn on_link(&mut self, generation: u64, event: LinkEvent) {
        match event {
            LinkEvent::Frame(raw) => {
                if generation == self.connection.generation() && self.connection.is_open() {
                    self.on_frame(parse_inbound(&raw));
                }
            }
            LinkEvent::Closed(reason) => {
                if !self.connection.closed(generation) {
                    return;
                }
                tracing::info!(reason = ?reason, "disconnected");
                self.link_down();
                self.emit(ClientEvent::Disconnected { reason });
                self.emit_status();
            }
            LinkEvent::Failed(message) => {
                if !self.connection.failed(generation) {
                    return;
                }
                tracing::error!(error = %message, "transport error");
                self.link_down();
                self.emit_error(Error::Transport(message.clone()));
                self.emit(ClientEvent::Disconnected {
                    reason: Some(message),
                });
                self.emit_status();
            }
        }
    }

    fn disconnect(&mut self) {
        if !self.connection.disconnect() {
            return;
        }
        tracing::info!("disconnected by request");
        self.link_down();
        self.emit(ClientEvent::Disconnected { reason: None });
        self.emit_status();
    }

    /// Stop everything that depends on the link
    fn link_down(&mut self) {
        self.heartbeat.stop();
        if let Some(recording_id) = self.capture.interrupt() {
            self.emit(ClientEvent::RecordingCancelled { recording_id });
        }
        self.stop_all_audio();
    }

    fn shutdown(&mut self) {
        self.disconnect();
        self.capture_generation += 1;
        self.capture_pending = false;
        self.capture.teardown();
        for waiter in self.unlock_waiters.drain(..) {
            let _ = waiter.send(false);
        }
    }

    fn on_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Pong => {
                self.heartbeat.on_pong(Instant::now());
                if self.connection.mark_alive() {
                    tracing::info!("link restored");
                    self.emit_status();
                }
            }
            InboundFrame::Audio(chunk) => {
                tracing::debug!(
                    message_id = %chunk.message_id,
                    sequence = ?chunk.sequence,
                    size = chunk.payload.len(),
                    is_final = chunk.is_final,
                    "audio chunk received"
                );
                self.emit(ClientEvent::AudioReceived {
                    message_id: chunk.message_id.clone(),
                    sequence: chunk.sequence,
                    format: chunk.format.clone(),
                    size: chunk.payload.len(),
                    is_final: chunk.is_final,
                });
                self.emit(ClientEvent::Message(InboundFrame::Audio(chunk.clone())));
                if self.autoplay {
                    self.schedule(chunk);
                }
            }
            other => self.emit(ClientEvent::Message(other)),
        }
    }

    // Heartbeat

    fn start_heartbeat(&mut self) {
        if !self.config.heartbeat.enabled {
            return;
        }
        let run = self.heartbeat.start(Instant::now());
        let tx = self.internal.clone();
        let ticker = spawn_ticker(self.heartbeat.interval(), move || {
            tx.send(Internal::HeartbeatTick { run }).is_ok()
        });
        self.heartbeat.attach_ticker(run, ticker);
    }

    fn on_heartbeat(&mut self, run: u64) {
        let Some(tick) = self.heartbeat.on_tick(run, Instant::now()) else {
            return;
        };

        if let Err(e) = self.connection.send(&tick.ping) {
            tracing::warn!(error = %e, "heartbeat ping not sent");
        }

        if let Some(stale_for) = tick.stale_for {
            if self.connection.mark_degraded() {
                let stale_for_ms = u64::try_from(stale_for.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(stale_for_ms, "link degraded");
                self.emit_error(Error::DegradedLink { stale_for_ms });
                self.emit_status();
            }
        }
    }

    // Capture

    fn init_capture(&mut self) {
        if self.capture.is_initialized() || self.capture_pending {
            return;
        }
        self.capture_pending = true;
        self.capture_generation += 1;
        let generation = self.capture_generation;

        let microphones = Arc::clone(&self.collab.microphones);
        let vad = Arc::clone(&self.collab.vad);
        let enable_vad = self.capture.vad_enabled();
        let constraints = CaptureConstraints::preferred(self.config.capture.sample_rate);
        let tx = self.internal.clone();

        tokio::spawn(async move {
            let result: Result<CaptureParts> = async {
                let (microphone, fell_back) =
                    acquire_with_fallback(microphones.as_ref(), &constraints).await?;
                if fell_back {
                    tracing::info!("microphone acquired with minimal constraints");
                }

                let (detector, vad_error) = if enable_vad {
                    let sink_tx = tx.clone();
                    let sink: VadSink = Arc::new(move |signal| {
                        let _ = sink_tx.send(Internal::Vad { generation, signal });
                    });
                    match vad.create(microphone.tap(), sink).await {
                        Ok(detector) => (Some(detector), None),
                        Err(e) => (None, Some(e)),
                    }
                } else {
                    (None, None)
                };

                Ok(CaptureParts {
                    microphone,
                    detector,
                    vad_error,
                })
            }
            .await;

            let _ = tx.send(Internal::CaptureReady { generation, result });
        });
    }

    fn on_capture_ready(&mut self, generation: u64, result: Result<CaptureParts>) {
        if generation != self.capture_generation {
            if let Ok(mut parts) = result {
                if let Some(mut detector) = parts.detector {
                    detector.destroy();
                }
                parts.microphone.release();
            }
            return;
        }
        self.capture_pending = false;

        match result {
            Ok(parts) => {
                if parts.microphone.format() != self.config.capture.format {
                    tracing::debug!(
                        requested = %self.config.capture.format,
                        actual = parts.microphone.format(),
                        "recorder uses a different format"
                    );
                }
                let vad_ready = parts.detector.is_some();
                self.capture.attach(parts.microphone, parts.detector);
                if let Some(e) = parts.vad_error {
                    tracing::warn!(error = %e, "voice activity detection unavailable");
                    self.emit_error(e);
                }
                if self.capture.vad_enabled() {
                    self.emit(ClientEvent::VadReady(vad_ready));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "microphone unavailable");
                self.emit_error(e);
                if self.capture.vad_enabled() {
                    self.emit(ClientEvent::VadReady(false));
                }
            }
        }
    }

    fn toggle_listening(&mut self) -> Result<bool> {
        if !self.capture.vad_ready() {
            return Err(DeviceError::Unavailable(
                "voice activity detection not initialized".to_string(),
            )
            .into());
        }

        let listening = self.capture.toggle_listening();
        if !listening {
            self.stop_voice_recording();
        }
        Ok(listening)
    }

    fn stop_listening(&mut self) {
        self.capture.stop_listening();
        self.stop_voice_recording();
    }

    /// End a voice-triggered recording; it stays pending rather than sent
    fn stop_voice_recording(&mut self) {
        let voice_recording = self
            .capture
            .recording()
            .is_some_and(|r| r.trigger == RecordingTrigger::Voice);
        if voice_recording {
            if let Err(e) = self.stop_recording() {
                tracing::warn!(error = %e, "voice recording did not stop cleanly");
                self.emit_error(e);
            }
        }
    }

    fn on_vad(&mut self, signal: VadSignal) {
        match self.capture.on_vad(signal) {
            Ok(VadOutcome::Ignored) => {}
            Ok(VadOutcome::Started(recording_id)) => {
                self.stop_all_audio();
                self.emit(ClientEvent::RecordingStarted {
                    recording_id,
                    trigger: RecordingTrigger::Voice,
                });
            }
            Ok(VadOutcome::Stopped {
                recording_id,
                size,
                format,
            }) => {
                self.emit(ClientEvent::RecordingStopped {
                    recording_id,
                    size,
                    format,
                });
                self.after(self.config.capture.settle_delay, Internal::SettleElapsed {
                    recording_id,
                });
            }
            Err(e) => {
                tracing::warn!(?signal, error = %e, "voice activity handling failed");
                self.emit_error(e);
            }
        }
    }

    fn on_settled(&mut self, recording_id: u64) {
        let Some(utterance) = self.capture.take_pending(Some(recording_id)) else {
            return;
        };
        if let Err(e) = self.send_utterance(&utterance) {
            tracing::warn!(recording_id, error = %e, "utterance not sent");
            self.emit_error(e);
        }
    }

    fn start_recording(&mut self, trigger: RecordingTrigger) -> Result<bool> {
        let Some(recording_id) = self.capture.start_recording(trigger)? else {
            return Ok(false);
        };
        self.stop_all_audio();
        self.emit(ClientEvent::RecordingStarted {
            recording_id,
            trigger,
        });
        Ok(true)
    }

    fn stop_recording(&mut self) -> Result<Option<Utterance>> {
        let utterance = self.capture.stop_recording()?;
        if let Some(u) = &utterance {
            self.emit(ClientEvent::RecordingStopped {
                recording_id: u.recording_id,
                size: u.payload.len(),
                format: u.format.clone(),
            });
        }
        Ok(utterance)
    }

    // Outbound

    fn send_text(&mut self, text: String) -> Result<()> {
        if !self.connection.is_open() {
            return Err(Error::NotConnected);
        }
        self.stop_all_audio();
        self.connection.send(&OutboundFrame::text(text))?;
        tracing::debug!("text sent");
        Ok(())
    }

    fn send_audio(&mut self) -> Result<usize> {
        if !self.connection.is_open() {
            return Err(Error::NotConnected);
        }
        let utterance = self.capture.take_pending(None).ok_or(Error::NoRecording)?;
        self.stop_all_audio();
        self.send_utterance(&utterance)
    }

    fn send_utterance(&mut self, utterance: &Utterance) -> Result<usize> {
        let frame = OutboundFrame::audio(&utterance.format, &utterance.payload);
        self.connection.send(&frame)?;
        let size = utterance.payload.len();
        tracing::info!(
            recording_id = utterance.recording_id,
            size,
            format = %utterance.format,
            "utterance sent"
        );
        Ok(size)
    }

    // Playback

    fn schedule(&mut self, chunk: AudioChunk) {
        if let Admission::Replaced(interrupted) = self.scheduler.admit(chunk) {
            self.release_output();
            tracing::info!(
                message_id = %interrupted.message_id,
                discarded = interrupted.discarded,
                "audio message replaced"
            );
        }
        self.pump_playback();
    }

    fn pump_playback(&mut self) {
        if self.scheduler.active_message_id().is_some() && !self.scheduler.is_playing() {
            self.recheck_output();
        }

        while let Some(directive) = self.scheduler.pump(self.unlock.is_unlocked()) {
            match directive {
                Directive::Play { token, chunk } => {
                    self.play_chunk(token, chunk);
                    break;
                }
                Directive::AwaitUnlock {
                    session,
                    message_id,
                } => {
                    tracing::debug!(message_id = %message_id, "playback waiting for unlock");
                    self.request_unlock();
                    self.after(self.config.playback.blocked_wait, Internal::UnlockWaitElapsed {
                        session,
                    });
                    break;
                }
                Directive::Finished { message_id } => {
                    self.release_output();
                    tracing::info!(message_id = %message_id, "audio message played");
                }
            }
        }
    }

    fn play_chunk(&mut self, token: u64, chunk: AudioChunk) {
        let output = Arc::clone(&self.collab.output);
        let tx = self.internal.clone();
        let gap = self.config.playback.chunk_gap;
        tracing::debug!(
            message_id = %chunk.message_id,
            sequence = ?chunk.sequence,
            token,
            "playing chunk"
        );

        let task = tokio::spawn(async move {
            let result = output.play(&chunk.payload, &chunk.format).await;
            if result.is_ok() && !gap.is_zero() {
                time::sleep(gap).await;
            }
            let _ = tx.send(Internal::ChunkFinished { token, result });
        });
        if let Some(old) = self.playing.replace(task) {
            old.abort();
        }
    }

    fn on_chunk_finished(&mut self, token: u64, result: std::result::Result<(), PlaybackError>) {
        if result == Err(PlaybackError::Blocked) {
            let Some(session) = self.scheduler.requeue(token) else {
                return;
            };
            self.playing = None;
            tracing::warn!(token, session, "chunk playback blocked, requeued");
            self.request_unlock();
            self.after(self.config.playback.blocked_wait, Internal::UnlockWaitElapsed {
                session,
            });
            return;
        }

        if !self.scheduler.chunk_finished(token) {
            return;
        }
        self.playing = None;

        if let Err(e) = result {
            tracing::warn!(token, error = %e, "chunk playback failed, skipping");
            self.emit_error(e.into());
        }
        self.pump_playback();
    }

    /// Stop the sound in flight; dropping the play future ends it
    fn release_output(&mut self) {
        if let Some(task) = self.playing.take() {
            task.abort();
        }
    }

    fn stop_all_audio(&mut self) {
        if let Some(interrupted) = self.scheduler.interrupt() {
            tracing::info!(
                message_id = %interrupted.message_id,
                discarded = interrupted.discarded,
                "audio interrupted"
            );
        }
        self.release_output();
    }

    // Unlock

    fn recheck_output(&mut self) {
        match self.unlock.recheck(self.collab.output.context_state()) {
            Recheck::Unchanged => {}
            Recheck::Unlocked => self.emit(ClientEvent::UnlockStateChanged {
                unlocked: true,
                strategy: None,
            }),
            Recheck::ResumeNeeded => {
                let output = Arc::clone(&self.collab.output);
                tokio::spawn(async move {
                    if !output.resume_context().await {
                        tracing::warn!("output context did not resume");
                    }
                });
            }
        }
    }

    fn request_unlock(&mut self) -> bool {
        let Some(strategies) = self.unlock.begin_attempt() else {
            return false;
        };
        let output = Arc::clone(&self.collab.output);
        let tx = self.internal.clone();
        tokio::spawn(async move {
            let outcome = run_strategies(output.as_ref(), &strategies).await;
            let _ = tx.send(Internal::UnlockFinished { outcome });
        });
        true
    }

    fn unlock(&mut self, reply: oneshot::Sender<bool>) {
        if self.unlock.is_unlocked() {
            let _ = reply.send(true);
            self.pump_playback();
        } else if self.request_unlock() || self.unlock.in_flight() {
            self.unlock_waiters.push(reply);
        } else {
            let _ = reply.send(false);
        }
    }

    fn on_unlock_finished(&mut self, outcome: Option<UnlockStrategy>) {
        if self.unlock.finish_attempt(outcome) {
            self.emit(ClientEvent::UnlockStateChanged {
                unlocked: true,
                strategy: outcome,
            });
            self.pump_playback();
        }

        let unlocked = self.unlock.is_unlocked();
        for waiter in self.unlock_waiters.drain(..) {
            let _ = waiter.send(unlocked);
        }
    }

    fn on_unlock_wait_elapsed(&mut self, session: u64) {
        if !self.scheduler.is_awaiting_unlock(session) {
            return;
        }
        // Unlocked but refused by the output: retry the chunk once
        if self.unlock.is_unlocked() && self.blocked_retry != Some(session) {
            self.blocked_retry = Some(session);
            self.pump_playback();
            return;
        }
        let Some(message_id) = self.scheduler.active_message_id().map(str::to_string) else {
            return;
        };
        let attempts = self.unlock.attempt_count();
        tracing::warn!(message_id = %message_id, attempts, "playback blocked, user interaction needed");
        self.emit(ClientEvent::PlaybackBlocked {
            message_id,
            attempts,
        });
    }

    // Misc

    /// Deliver `event` to the actor after `delay`
    fn after(&self, delay: Duration, event: Internal) {
        let tx = self.internal.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            connection: self.connection.state(),
            client_id: self.client_id.clone(),
            recording: self.capture.is_recording(),
            listening: self.capture.is_listening(),
            vad_enabled: self.capture.vad_enabled(),
            vad_ready: self.capture.vad_ready(),
            autoplay: self.autoplay,
            playing: self.scheduler.is_playing(),
            active_message_id: self.scheduler.active_message_id().map(str::to_string),
            unlocked: self.unlock.is_unlocked(),
            unlock_attempts: self.unlock.attempt_count(),
            last_unlock_attempt: self.unlock.last_attempt_at(),
        }
    }
}
