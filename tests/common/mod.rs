//! Shared test utilities
//!
//! In-memory stand-ins for every collaborator the client drives, so the
//! whole actor runs without a network or audio hardware.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use url::Url;

use voxlink::connection::{LinkEvent, TransportLink};
use voxlink::voice::{
    AudioOutput, CaptureConstraints, Microphone, MicrophoneProvider, OutputContextState,
    SampleTap, VadProvider, VadSignal, VadSink, VoiceActivityDetector,
};
use voxlink::{
    ClientEvent, Collaborators, Config, DeviceError, Error, MemoryStore, PlaybackError, Result,
    Transport, VoiceClient,
};

/// Server side of one mock link
pub struct ServerEnd {
    sent: mpsc::UnboundedReceiver<String>,
    push: mpsc::UnboundedSender<LinkEvent>,
}

impl ServerEnd {
    pub fn send_json(&self, value: &Value) {
        self.push_event(LinkEvent::Frame(value.to_string()));
    }

    pub fn send_raw(&self, raw: &str) {
        self.push_event(LinkEvent::Frame(raw.to_string()));
    }

    pub fn push_event(&self, event: LinkEvent) {
        self.push.send(event).expect("client link gone");
    }

    /// Audio chunk whose payload is `[tag, chunk_id]`
    pub fn audio(&self, message_id: &str, tag: u8, chunk_id: u8, is_end: bool) {
        let payload = [tag, chunk_id];
        self.send_json(&json!({
            "type": "audio",
            "message_id": message_id,
            "chunk_id": chunk_id,
            "is_end": is_end,
            "format": "mp3",
            "size": payload.len(),
            "data": base64::engine::general_purpose::STANDARD.encode(payload),
        }));
    }

    /// Audio frame the way a streaming server sends it: no `chunk_id`, no
    /// `is_end`. Payload is `[tag, n]`
    pub fn stream_audio(&self, message_id: &str, tag: u8, n: u8) {
        let payload = [tag, n];
        self.send_json(&json!({
            "type": "audio",
            "message_id": message_id,
            "format": "mp3",
            "data": base64::engine::general_purpose::STANDARD.encode(payload),
        }));
    }

    pub fn pong(&self) {
        self.send_json(&json!({ "type": "pong" }));
    }

    /// Next frame the client wrote
    pub async fn next_sent(&mut self) -> Value {
        let raw = tokio::time::timeout(Duration::from_secs(600), self.sent.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("client closed the link");
        serde_json::from_str(&raw).expect("client sent invalid json")
    }

    /// Next frame of `kind`, skipping others
    pub async fn next_of(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.next_sent().await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    /// Frames already written, without waiting
    pub fn drain_sent(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(raw) = self.sent.try_recv() {
            frames.push(serde_json::from_str(&raw).expect("client sent invalid json"));
        }
        frames
    }
}

#[derive(Default)]
pub struct MockTransport {
    servers: Mutex<VecDeque<ServerEnd>>,
    pub opens: AtomicUsize,
    pub urls: Mutex<Vec<Url>>,
    pub refuse: AtomicBool,
}

impl MockTransport {
    pub fn take_server(&self) -> ServerEnd {
        self.servers
            .lock()
            .unwrap()
            .pop_front()
            .expect("no link was opened")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &Url) -> Result<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.clone());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_string()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.servers.lock().unwrap().push_back(ServerEnd {
            sent: out_rx,
            push: in_tx,
        });
        Ok(TransportLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Records what it plays; each chunk takes `chunk_duration`
pub struct MockOutput {
    played: Mutex<Vec<Vec<u8>>>,
    context: Mutex<OutputContextState>,
    pub probe_ok: AtomicBool,
    pub resume_ok: AtomicBool,
    /// Refuse this many upcoming chunks as blocked
    pub block_next: AtomicUsize,
    pub chunk_duration: Duration,
}

impl MockOutput {
    pub fn new(context: OutputContextState) -> Self {
        Self {
            played: Mutex::new(Vec::new()),
            context: Mutex::new(context),
            probe_ok: AtomicBool::new(true),
            resume_ok: AtomicBool::new(false),
            block_next: AtomicUsize::new(0),
            chunk_duration: Duration::from_millis(500),
        }
    }

    /// `(tag, chunk_id)` of every chunk started, in order
    pub fn played(&self) -> Vec<(u8, u8)> {
        self.played
            .lock()
            .unwrap()
            .iter()
            .map(|p| (p[0], p[1]))
            .collect()
    }

    pub fn set_context(&self, state: OutputContextState) {
        *self.context.lock().unwrap() = state;
    }
}

#[async_trait]
impl AudioOutput for MockOutput {
    async fn play(&self, payload: &[u8], _format: &str) -> std::result::Result<(), PlaybackError> {
        if payload.len() < 2 {
            return Err(PlaybackError::Decode("short payload".to_string()));
        }
        if self
            .block_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PlaybackError::Blocked);
        }
        self.played.lock().unwrap().push(payload.to_vec());
        tokio::time::sleep(self.chunk_duration).await;
        Ok(())
    }

    fn context_state(&self) -> OutputContextState {
        *self.context.lock().unwrap()
    }

    async fn resume_context(&self) -> bool {
        let ok = self.resume_ok.load(Ordering::SeqCst);
        if ok {
            self.set_context(OutputContextState::Running);
        }
        ok
    }

    async fn play_probe(&self) -> bool {
        self.probe_ok.load(Ordering::SeqCst)
    }
}

pub const RECORDED: [u8; 4] = [0x52, 0x49, 0x46, 0x46];

pub struct MockMicrophone {
    recording: bool,
    released: Arc<AtomicBool>,
}

impl Microphone for MockMicrophone {
    fn format(&self) -> &str {
        "wav"
    }

    fn tap(&self) -> SampleTap {
        SampleTap::new(16_000)
    }

    fn start_recorder(&mut self) -> Result<()> {
        self.recording = true;
        Ok(())
    }

    fn stop_recorder(&mut self) -> Result<Vec<u8>> {
        self.recording = false;
        Ok(RECORDED.to_vec())
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockMicrophoneProvider {
    /// Reject anything but minimal constraints
    pub picky: AtomicBool,
    pub requests: Mutex<Vec<CaptureConstraints>>,
    pub released: Arc<AtomicBool>,
}

#[async_trait]
impl MicrophoneProvider for MockMicrophoneProvider {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn Microphone>> {
        self.requests.lock().unwrap().push(constraints.clone());
        if self.picky.load(Ordering::SeqCst) && !constraints.is_minimal() {
            return Err(DeviceError::ConstraintsUnsupported("sample rate 48000".to_string()).into());
        }
        Ok(Box::new(MockMicrophone {
            recording: false,
            released: Arc::clone(&self.released),
        }))
    }
}

/// Hands the test the sink so it can fire signals by hand
#[derive(Default)]
pub struct MockVadProvider {
    sink: Mutex<Option<VadSink>>,
    pub running: Arc<AtomicBool>,
}

impl MockVadProvider {
    /// Fire a signal the way a real detector would: only while started
    pub fn fire(&self, signal: VadSignal) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let sink = self.sink.lock().unwrap().clone().expect("vad not created");
        sink(signal);
    }
}

struct MockVad {
    running: Arc<AtomicBool>,
}

impl VoiceActivityDetector for MockVad {
    fn start(&mut self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn pause(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn destroy(&mut self) {
        self.pause();
    }
}

#[async_trait]
impl VadProvider for MockVadProvider {
    async fn create(&self, _tap: SampleTap, sink: VadSink) -> Result<Box<dyn VoiceActivityDetector>> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(Box::new(MockVad {
            running: Arc::clone(&self.running),
        }))
    }
}

/// Defaults with the heartbeat off and a short settle delay
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.heartbeat.enabled = false;
    config.capture.settle_delay = Duration::from_millis(100);
    config
}

pub struct Harness {
    pub client: VoiceClient,
    pub events: broadcast::Receiver<ClientEvent>,
    pub transport: Arc<MockTransport>,
    pub output: Arc<MockOutput>,
    pub microphones: Arc<MockMicrophoneProvider>,
    pub vad: Arc<MockVadProvider>,
}

impl Harness {
    pub fn new(config: Config, output: MockOutput) -> Self {
        Self::with_microphones(config, output, MockMicrophoneProvider::default())
    }

    pub fn with_microphones(
        config: Config,
        output: MockOutput,
        microphones: MockMicrophoneProvider,
    ) -> Self {
        let transport = Arc::new(MockTransport::default());
        let output = Arc::new(output);
        let microphones = Arc::new(microphones);
        let vad = Arc::new(MockVadProvider::default());

        let collaborators = Collaborators {
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
            microphones: Arc::clone(&microphones) as Arc<dyn MicrophoneProvider>,
            vad: Arc::clone(&vad) as Arc<dyn VadProvider>,
            output: Arc::clone(&output) as Arc<dyn AudioOutput>,
            store: Arc::new(MemoryStore::new()),
        };
        let (client, events) = VoiceClient::spawn(config, collaborators);

        Self {
            client,
            events,
            transport,
            output,
            microphones,
            vad,
        }
    }

    /// Connect and return the server end once the client reports it
    pub async fn connect(&mut self) -> ServerEnd {
        self.client.connect().await.expect("connect rejected");
        self.wait_for(|e| matches!(e, ClientEvent::Connected)).await;
        self.transport.take_server()
    }

    pub async fn wait_for<F>(&mut self, pred: F) -> ClientEvent
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        wait_for(&mut self.events, pred).await
    }
}

/// Next event matching `pred`
pub async fn wait_for<F>(events: &mut broadcast::Receiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `cond` until it holds
pub async fn eventually<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(600), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}
