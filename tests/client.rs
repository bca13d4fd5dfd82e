//! End-to-end client behaviour against in-memory collaborators

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use base64::Engine as _;
use serde_json::json;

use voxlink::connection::LinkEvent;
use voxlink::voice::{OutputContextState, RecordingTrigger, UnlockStrategy, VadSignal};
use voxlink::{ClientEvent, ConnectionState, Error, InboundFrame};

mod common;

use common::{Harness, MockMicrophoneProvider, MockOutput, RECORDED, eventually, test_config};

fn running() -> MockOutput {
    MockOutput::new(OutputContextState::Running)
}

#[tokio::test(start_paused = true)]
async fn chunks_play_in_sequence_order() {
    let mut h = Harness::new(test_config(), running());
    let server = h.connect().await;

    server.audio("m1", 1, 2, false);
    server.audio("m1", 1, 0, false);
    server.audio("m1", 1, 1, true);

    let output = Arc::clone(&h.output);
    eventually(|| output.played().len() == 3).await;
    assert_eq!(output.played(), vec![(1, 0), (1, 1), (1, 2)]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let status = h.client.status().await.unwrap();
    assert!(!status.playing);
    assert_eq!(status.active_message_id, None);

    // The finished message made room for the next one
    server.audio("m2", 2, 0, true);
    eventually(|| output.played().len() == 4).await;
    assert_eq!(output.played()[3], (2, 0));
}

#[tokio::test(start_paused = true)]
async fn unnumbered_stream_plays_in_arrival_order() {
    let mut h = Harness::new(test_config(), running());
    let server = h.connect().await;

    for n in 0..4 {
        server.stream_audio("m1", 1, n);
    }

    let output = Arc::clone(&h.output);
    eventually(|| output.played().len() == 4).await;
    assert_eq!(output.played(), vec![(1, 0), (1, 1), (1, 2), (1, 3)]);

    // Drained without an end marker: the message still completes
    tokio::time::sleep(Duration::from_secs(1)).await;
    let status = h.client.status().await.unwrap();
    assert!(!status.playing);
    assert_eq!(status.active_message_id, None);

    // Stragglers of the same reply keep playing
    server.stream_audio("m1", 1, 4);
    eventually(|| output.played().len() == 5).await;
    assert_eq!(output.played()[4], (1, 4));
}

#[tokio::test(start_paused = true)]
async fn blocked_chunk_is_replayed() {
    let mut h = Harness::new(test_config(), running());
    h.output.block_next.store(1, Ordering::SeqCst);
    let server = h.connect().await;

    server.audio("m1", 1, 0, false);
    server.audio("m1", 1, 1, true);

    let output = Arc::clone(&h.output);
    eventually(|| output.played().len() == 2).await;
    assert_eq!(output.played(), vec![(1, 0), (1, 1)]);
}

#[tokio::test(start_paused = true)]
async fn repeatedly_blocked_chunk_waits_for_caller_unlock() {
    let mut h = Harness::new(test_config(), running());
    h.output.block_next.store(2, Ordering::SeqCst);
    let server = h.connect().await;

    server.audio("m1", 1, 0, true);

    let event = h
        .wait_for(|e| matches!(e, ClientEvent::PlaybackBlocked { .. }))
        .await;
    assert!(matches!(
        event,
        ClientEvent::PlaybackBlocked { message_id, .. } if message_id == "m1"
    ));
    assert!(h.output.played().is_empty());
    assert_eq!(
        h.client.status().await.unwrap().active_message_id.as_deref(),
        Some("m1")
    );

    // User gesture
    assert!(h.client.unlock().await.unwrap());
    let output = Arc::clone(&h.output);
    eventually(|| output.played().len() == 1).await;
    assert_eq!(output.played(), vec![(1, 0)]);
}

#[tokio::test(start_paused = true)]
async fn sending_text_interrupts_playback() {
    let mut h = Harness::new(test_config(), running());
    let mut server = h.connect().await;

    server.audio("m1", 1, 0, false);
    server.audio("m1", 1, 1, false);
    server.audio("m1", 1, 2, true);

    let output = Arc::clone(&h.output);
    eventually(|| output.played().len() == 1).await;

    h.client.send_text("wait").await.unwrap();
    let status = h.client.status().await.unwrap();
    assert!(!status.playing);
    assert_eq!(status.active_message_id, None);

    let frame = server.next_of("text").await;
    assert_eq!(frame["data"], "wait");

    // Late chunk of the interrupted reply stays silent
    server.audio("m1", 1, 3, true);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(output.played(), vec![(1, 0)]);
}

#[tokio::test(start_paused = true)]
async fn new_message_replaces_active_one() {
    let mut h = Harness::new(test_config(), running());
    let server = h.connect().await;

    server.audio("m1", 1, 0, false);
    server.audio("m1", 1, 1, false);
    let output = Arc::clone(&h.output);
    eventually(|| output.played().len() == 1).await;

    server.audio("m2", 2, 0, true);
    eventually(|| output.played().len() == 2).await;

    server.audio("m1", 1, 2, true);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(output.played(), vec![(1, 0), (2, 0)]);
}

#[tokio::test(start_paused = true)]
async fn undecodable_chunk_is_skipped() {
    let mut h = Harness::new(test_config(), running());
    let server = h.connect().await;

    server.audio("m1", 1, 0, false);
    server.send_json(&json!({
        "type": "audio",
        "message_id": "m1",
        "chunk_id": 1,
        "format": "mp3",
        "data": base64::engine::general_purpose::STANDARD.encode([9u8]),
    }));
    server.audio("m1", 1, 2, true);

    let event = h
        .wait_for(|e| matches!(e, ClientEvent::Error(err) if matches!(**err, Error::Playback(_))))
        .await;
    assert!(matches!(event, ClientEvent::Error(_)));

    let output = Arc::clone(&h.output);
    eventually(|| output.played().len() == 2).await;
    assert_eq!(output.played(), vec![(1, 0), (1, 2)]);
}

#[tokio::test(start_paused = true)]
async fn second_connect_is_rejected() {
    let mut h = Harness::new(test_config(), running());

    h.client.connect().await.unwrap();
    assert!(matches!(
        h.client.connect().await,
        Err(Error::AlreadyConnected(_))
    ));

    h.wait_for(|e| matches!(e, ClientEvent::Connected)).await;
    assert!(matches!(
        h.client.connect().await,
        Err(Error::AlreadyConnected(ConnectionState::Connected))
    ));
    assert_eq!(h.transport.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_connection_reports_error_and_allows_retry() {
    let mut h = Harness::new(test_config(), running());
    h.transport.refuse.store(true, Ordering::SeqCst);

    h.client.connect().await.unwrap();
    h.wait_for(|e| matches!(e, ClientEvent::Error(err) if matches!(**err, Error::Transport(_))))
        .await;
    assert_eq!(
        h.client.status().await.unwrap().connection,
        ConnectionState::Error
    );

    h.transport.refuse.store(false, Ordering::SeqCst);
    let _server = h.connect().await;
    assert_eq!(h.transport.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_degrades_then_recovers() {
    let mut config = test_config();
    config.heartbeat.enabled = true;
    config.heartbeat.interval = Duration::from_secs(30);
    config.heartbeat.stale_after = Duration::from_secs(60);

    let mut h = Harness::new(config, running());
    let mut server = h.connect().await;

    let ping = server.next_of("ping").await;
    assert!(ping["timestamp"].as_i64().unwrap() > 0);

    h.wait_for(|e| matches!(e, ClientEvent::StatusChanged(ConnectionState::Degraded)))
        .await;
    // Still allowed to send while degraded
    h.client.send_text("anyone there?").await.unwrap();

    server.pong();
    h.wait_for(|e| matches!(e, ClientEvent::StatusChanged(ConnectionState::Connected)))
        .await;
}

#[tokio::test(start_paused = true)]
async fn server_close_tears_down_session() {
    let mut h = Harness::new(test_config(), running());
    let server = h.connect().await;
    h.wait_for(|e| matches!(e, ClientEvent::VadReady(true))).await;
    assert!(h.client.start_recording().await.unwrap());

    server.push_event(LinkEvent::Closed(Some("restart".to_string())));
    h.wait_for(|e| matches!(e, ClientEvent::RecordingCancelled { .. }))
        .await;
    let event = h
        .wait_for(|e| matches!(e, ClientEvent::Disconnected { .. }))
        .await;
    assert!(matches!(
        event,
        ClientEvent::Disconnected { reason: Some(r) } if r == "restart"
    ));

    let status = h.client.status().await.unwrap();
    assert_eq!(status.connection, ConnectionState::Disconnected);
    assert!(!status.recording);
    assert!(matches!(
        h.client.send_text("hello").await,
        Err(Error::NotConnected)
    ));

    // No automatic reconnect, but a manual one works
    assert_eq!(h.transport.opens.load(Ordering::SeqCst), 1);
    let _server = h.connect().await;
}

#[tokio::test(start_paused = true)]
async fn voice_activity_records_and_sends_utterance() {
    let mut h = Harness::new(test_config(), running());
    let mut server = h.connect().await;
    h.wait_for(|e| matches!(e, ClientEvent::VadReady(true))).await;

    // Not listening yet
    h.vad.fire(VadSignal::SpeechStart);
    assert!(h.client.toggle_listening().await.unwrap());

    h.vad.fire(VadSignal::SpeechStart);
    h.wait_for(|e| {
        matches!(
            e,
            ClientEvent::RecordingStarted {
                trigger: RecordingTrigger::Voice,
                ..
            }
        )
    })
    .await;

    h.vad.fire(VadSignal::SpeechEnd);
    h.wait_for(|e| matches!(e, ClientEvent::RecordingStopped { size: 4, .. }))
        .await;

    let frame = server.next_of("audio").await;
    assert_eq!(frame["format"], "wav");
    assert_eq!(frame["size"], 4);
    assert_eq!(
        frame["data"],
        base64::engine::general_purpose::STANDARD.encode(RECORDED)
    );

    // Auto-sent utterances are not left behind for a manual send
    assert!(matches!(h.client.send_audio().await, Err(Error::NoRecording)));
}

#[tokio::test(start_paused = true)]
async fn stop_listening_keeps_partial_utterance_pending() {
    let mut h = Harness::new(test_config(), running());
    let mut server = h.connect().await;
    h.wait_for(|e| matches!(e, ClientEvent::VadReady(true))).await;

    assert!(h.client.toggle_listening().await.unwrap());
    h.vad.fire(VadSignal::SpeechStart);
    h.wait_for(|e| matches!(e, ClientEvent::RecordingStarted { .. }))
        .await;

    h.client.stop_listening().await.unwrap();
    h.wait_for(|e| matches!(e, ClientEvent::RecordingStopped { .. }))
        .await;

    let status = h.client.status().await.unwrap();
    assert!(!status.listening);
    assert!(!status.recording);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(server.drain_sent().is_empty());
    assert_eq!(h.client.send_audio().await.unwrap(), RECORDED.len());
}

#[tokio::test(start_paused = true)]
async fn manual_recording_waits_for_send() {
    let mut h = Harness::new(test_config(), running());
    let mut server = h.connect().await;
    h.wait_for(|e| matches!(e, ClientEvent::VadReady(true))).await;

    assert!(h.client.start_recording().await.unwrap());
    assert!(!h.client.start_recording().await.unwrap());
    assert!(h.client.stop_recording().await.unwrap());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(server.drain_sent().is_empty());

    assert_eq!(h.client.send_audio().await.unwrap(), RECORDED.len());
    assert_eq!(server.next_sent().await["type"], "audio");
    assert!(matches!(h.client.send_audio().await, Err(Error::NoRecording)));
}

#[tokio::test(start_paused = true)]
async fn unsupported_constraints_fall_back_to_minimal() {
    let microphones = MockMicrophoneProvider::default();
    microphones.picky.store(true, Ordering::SeqCst);

    let mut h = Harness::with_microphones(test_config(), running(), microphones);
    let _server = h.connect().await;
    h.wait_for(|e| matches!(e, ClientEvent::VadReady(true))).await;

    let requests = h.microphones.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].is_minimal());
    assert!(requests[1].is_minimal());
}

#[tokio::test(start_paused = true)]
async fn locked_output_reports_blocked_until_unlocked() {
    let mut config = test_config();
    config.playback.restricted = true;
    config.playback.unlock_interval = Duration::from_millis(1);

    let output = MockOutput::new(OutputContextState::Suspended);
    output.probe_ok.store(false, Ordering::SeqCst);

    let mut h = Harness::new(config, output);
    h.wait_for(|e| matches!(e, ClientEvent::UnlockStateChanged { unlocked: false, .. }))
        .await;

    let server = h.connect().await;
    server.audio("m1", 1, 0, true);

    let event = h
        .wait_for(|e| matches!(e, ClientEvent::PlaybackBlocked { .. }))
        .await;
    assert!(matches!(
        event,
        ClientEvent::PlaybackBlocked { message_id, .. } if message_id == "m1"
    ));
    assert!(h.output.played().is_empty());

    // Limiter runs on the wall clock
    h.output.probe_ok.store(true, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(5));
    assert!(h.client.unlock().await.unwrap());

    h.wait_for(|e| {
        matches!(
            e,
            ClientEvent::UnlockStateChanged {
                unlocked: true,
                strategy: Some(UnlockStrategy::ProbeSound),
            }
        )
    })
    .await;

    let output = Arc::clone(&h.output);
    eventually(|| output.played() == vec![(1, 0)]).await;
    assert!(h.client.status().await.unwrap().unlocked);
}

#[tokio::test(start_paused = true)]
async fn unparseable_frames_surface_as_messages() {
    let mut h = Harness::new(test_config(), running());
    let server = h.connect().await;

    server.send_raw("not json at all");
    let event = h
        .wait_for(|e| matches!(e, ClientEvent::Message(InboundFrame::Raw(_))))
        .await;
    assert!(matches!(
        event,
        ClientEvent::Message(InboundFrame::Raw(raw)) if raw == "not json at all"
    ));

    server.send_json(&json!({ "type": "transcript", "text": "hi" }));
    let event = h
        .wait_for(|e| matches!(e, ClientEvent::Message(InboundFrame::Unknown { .. })))
        .await;
    assert!(matches!(
        event,
        ClientEvent::Message(InboundFrame::Unknown { kind, .. }) if kind == "transcript"
    ));

    server.send_json(&json!({ "type": "text", "data": "hello" }));
    h.wait_for(|e| matches!(e, ClientEvent::Message(InboundFrame::Text(t)) if t == "hello"))
        .await;
}

#[tokio::test(start_paused = true)]
async fn disabled_autoplay_only_reports_audio() {
    let mut h = Harness::new(test_config(), running());
    let server = h.connect().await;
    h.client.set_autoplay(false).await.unwrap();

    server.audio("m1", 1, 0, true);
    h.wait_for(|e| matches!(e, ClientEvent::AudioReceived { sequence: Some(0), is_final: true, .. }))
        .await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.output.played().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_url_carries_client_id() {
    let mut h = Harness::new(test_config(), running());
    let _server = h.connect().await;

    let status = h.client.status().await.unwrap();
    let url = h.transport.urls.lock().unwrap()[0].clone();
    let uid = url
        .query_pairs()
        .find(|(k, _)| k == "uid")
        .map(|(_, v)| v.into_owned());
    assert_eq!(uid, Some(status.client_id));
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_microphone() {
    let mut h = Harness::new(test_config(), running());
    let _server = h.connect().await;
    h.wait_for(|e| matches!(e, ClientEvent::VadReady(true))).await;

    h.client.shutdown().await.unwrap();
    assert!(h.microphones.released.load(Ordering::SeqCst));
    assert!(matches!(h.client.status().await, Err(Error::ClientClosed)));
}
