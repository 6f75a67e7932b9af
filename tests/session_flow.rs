//! Full-session scenarios driven through the mock transport and mock audio
//! devices. Ordering-sensitive assertions use a ping/pong fence: the engine
//! processes messages strictly in order, so once the fence's pong is back,
//! everything pushed before it has been dispatched.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use convai_rust::audio::AudioOutput;
use convai_rust::config::SessionConfig;
use convai_rust::engine::{Conversation, Platform};
use convai_rust::events::{Mode, Role, Status};
use convai_rust::interrupt::FADE_GAIN;
use convai_rust::protocol::encode_pcm16;
use convai_rust::testutil::{
    CallbackEvent, MockInputFactory, MockOutputFactory, MockServer, RecordingCallbacks,
    mock_transport,
};

struct Harness {
    conversation: Conversation,
    server: MockServer,
    callbacks: Arc<RecordingCallbacks>,
    input: Arc<MockInputFactory>,
    output: Arc<MockOutputFactory>,
}

fn metadata(output_format: &str) -> Value {
    json!({
        "type": "conversation_initiation_metadata",
        "conversation_initiation_metadata_event": {
            "conversation_id": "conv_test",
            "agent_output_audio_format": output_format,
        }
    })
}

fn audio_frame(event_id: u64, samples: &[i16]) -> Value {
    json!({
        "type": "audio",
        "audio_event": {
            "audio_base_64": encode_pcm16(samples),
            "event_id": event_id,
        }
    })
}

fn interruption_frame(event_id: u64) -> Value {
    json!({
        "type": "interruption",
        "interruption_event": { "event_id": event_id }
    })
}

fn ping_frame(event_id: u64) -> Value {
    json!({
        "type": "ping",
        "ping_event": { "event_id": event_id }
    })
}

async fn start_with_format(output_format: &str) -> Harness {
    let (transport, mut server) = mock_transport();
    server.push_json(metadata(output_format)).await;

    let input = MockInputFactory::new();
    let output = MockOutputFactory::new();
    let callbacks = RecordingCallbacks::new();
    let platform = Platform {
        transport: Arc::new(transport),
        audio_in: input.clone(),
        audio_out: output.clone(),
    };

    let conversation = Conversation::start_with(
        SessionConfig::for_agent("test-agent"),
        callbacks.clone(),
        platform,
    )
    .await
    .expect("session should start");

    // Swallow the init frame so tests only observe their own traffic.
    let init = server.next_sent().await.expect("init frame");
    assert_eq!(init["type"], "conversation_initiation_client_data");

    Harness {
        conversation,
        server,
        callbacks,
        input,
        output,
    }
}

async fn start() -> Harness {
    start_with_format("pcm_16000").await
}

/// Push a ping and drain outbound traffic until its pong comes back,
/// returning everything that was sent in between.
async fn fence(server: &mut MockServer, event_id: u64) -> Vec<Value> {
    server.push_json(ping_frame(event_id)).await;
    let mut collected = Vec::new();
    loop {
        let sent = server.next_sent().await.expect("fence pong never arrived");
        if sent["type"] == "pong" && sent["event_id"] == event_id {
            return collected;
        }
        collected.push(sent);
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn session_start_negotiates_and_connects() {
    let harness = start_with_format("pcm_24000").await;

    assert_eq!(harness.conversation.conversation_id(), "conv_test");
    assert_eq!(harness.conversation.status(), Status::Connected);
    assert_eq!(harness.conversation.mode(), Mode::Listening);
    assert!(harness.conversation.is_recording());

    // Output follows the negotiated rate, input keeps the 16 kHz default.
    assert_eq!(harness.output.created_rate(), 24_000);
    assert_eq!(harness.input.created_rate(), 16_000);

    assert_eq!(
        harness.callbacks.statuses(),
        vec![Status::Connecting, Status::Connected]
    );
    assert_eq!(harness.callbacks.connects(), vec!["conv_test".to_string()]);
}

#[tokio::test]
async fn ping_yields_exactly_one_pong_and_nothing_else() {
    let mut harness = start().await;

    let before_fence = fence(&mut harness.server, 7).await;
    assert!(before_fence.is_empty(), "unexpected traffic: {before_fence:?}");

    // A later fence proves no duplicate pong ever trails behind.
    let trailing = fence(&mut harness.server, 8).await;
    assert!(trailing.is_empty(), "unexpected traffic: {trailing:?}");

    assert!(harness.callbacks.modes().is_empty());
    assert_eq!(
        harness.callbacks.statuses(),
        vec![Status::Connecting, Status::Connected]
    );
    assert!(harness.callbacks.errors().is_empty());
}

#[tokio::test]
async fn transcripts_are_forwarded_verbatim() {
    let mut harness = start().await;

    harness
        .server
        .push_json(json!({
            "type": "agent_response",
            "agent_response_event": { "agent_response": "hello there" }
        }))
        .await;
    harness
        .server
        .push_json(json!({
            "type": "user_transcript",
            "user_transcription_event": { "user_transcript": "hi agent" }
        }))
        .await;
    fence(&mut harness.server, 1).await;

    assert_eq!(
        harness.callbacks.messages(),
        vec![
            ("hello there".to_string(), Role::Ai),
            ("hi agent".to_string(), Role::User),
        ]
    );
    // Transcripts cause no state change.
    assert!(harness.callbacks.modes().is_empty());
}

#[tokio::test]
async fn audio_plays_in_order_and_drives_mode() {
    let harness = start().await;
    let mut server = harness.server;
    let sink = harness.output.output.clone();
    sink.hold_completions();

    server.push_json(audio_frame(1, &[1, 1])).await;
    server.push_json(audio_frame(2, &[2, 2])).await;
    // Both chunks are enqueued once the fence returns.
    fence(&mut server, 9).await;

    wait_until(|| sink.scheduled().len() == 1).await;
    assert_eq!(harness.callbacks.modes(), vec![Mode::Speaking]);
    assert_eq!(harness.conversation.mode(), Mode::Speaking);

    // Completing the first chunk lets the second through, in order.
    sink.release_completions();
    wait_until(|| sink.scheduled().len() == 2).await;
    assert_eq!(sink.scheduled(), vec![vec![1, 1], vec![2, 2]]);

    sink.release_completions();
    wait_until(|| harness.conversation.mode() == Mode::Listening).await;
    // Speaking fired once for two chunks; Listening once on the drained edge.
    assert_eq!(
        harness.callbacks.modes(),
        vec![Mode::Speaking, Mode::Listening]
    );
}

#[tokio::test]
async fn interruption_drops_queued_and_late_audio() {
    let harness = start().await;
    let mut server = harness.server;
    let sink = harness.output.output.clone();
    sink.hold_completions();

    server.push_json(audio_frame(1, &[1, 1])).await;
    wait_until(|| sink.scheduled().len() == 1).await;

    server.push_json(audio_frame(2, &[2, 2])).await;
    server.push_json(interruption_frame(2)).await;
    // Late duplicate of an interrupted chunk.
    server.push_json(audio_frame(2, &[2, 2])).await;
    fence(&mut server, 10).await;

    // Chunk 2 was flushed before reaching the sink and its duplicate was
    // rejected at the barrier; only chunk 1 was ever scheduled.
    assert_eq!(sink.scheduled(), vec![vec![1, 1]]);
    assert!(sink.stop_count() >= 1);
    assert_eq!(sink.gain(), FADE_GAIN);

    wait_until(|| harness.conversation.mode() == Mode::Listening).await;
    assert_eq!(
        harness.callbacks.modes(),
        vec![Mode::Speaking, Mode::Listening]
    );
    assert!(harness.callbacks.errors().is_empty());
}

#[tokio::test]
async fn barrier_holds_against_out_of_order_interruptions() {
    let harness = start().await;
    let mut server = harness.server;
    let sink = harness.output.output.clone();

    server.push_json(interruption_frame(5)).await;
    // Out-of-order and duplicate interruptions are accepted as-is...
    server.push_json(interruption_frame(3)).await;
    server.push_json(interruption_frame(5)).await;
    // ...but the barrier never moves backwards: 4 stays stale.
    server.push_json(audio_frame(4, &[4, 4])).await;
    server.push_json(audio_frame(6, &[6, 6])).await;
    fence(&mut server, 11).await;

    wait_until(|| !sink.scheduled().is_empty()).await;
    assert_eq!(sink.scheduled(), vec![vec![6, 6]]);
    assert!(harness.callbacks.errors().is_empty());
}

#[tokio::test]
async fn captured_frames_upload_only_while_recording() {
    let mut harness = start().await;

    assert!(harness.input.emit_frame(vec![10, -10, 20], 0.5));
    let sent = harness.server.next_sent().await.expect("audio chunk");
    assert_eq!(sent["user_audio_chunk"], encode_pcm16(&[10, -10, 20]));

    // Paused: frames keep arriving but nothing is uploaded.
    harness.conversation.stop_recording();
    assert!(!harness.conversation.is_recording());
    assert!(harness.input.emit_frame(vec![1, 2, 3], 0.5));
    assert!(harness.input.emit_frame(vec![4, 5, 6], 0.5));
    let during_pause = fence(&mut harness.server, 21).await;
    assert!(
        during_pause.is_empty(),
        "paused capture leaked: {during_pause:?}"
    );

    // Resumed: only new frames flow; the paused ones were dropped for good.
    harness.conversation.start_recording();
    assert!(harness.input.emit_frame(vec![7, 8], 0.25));
    let sent = harness.server.next_sent().await.expect("audio chunk");
    assert_eq!(sent["user_audio_chunk"], encode_pcm16(&[7, 8]));

    // The event-driven meter reported the capture level.
    let volumes: Vec<f32> = harness
        .callbacks
        .events()
        .into_iter()
        .filter_map(|e| match e {
            CallbackEvent::Volume(level) => Some(level),
            _ => None,
        })
        .collect();
    assert!(!volumes.is_empty());
    assert!(volumes.iter().all(|v| (0.0..=1.0).contains(v)));
}

#[tokio::test]
async fn end_session_tears_down_in_order() {
    let harness = start().await;

    harness.conversation.end_session().await;

    assert_eq!(harness.conversation.status(), Status::Disconnected);
    assert_eq!(
        harness.callbacks.statuses(),
        vec![
            Status::Connecting,
            Status::Connected,
            Status::Disconnecting,
            Status::Disconnected,
        ]
    );
    assert_eq!(harness.callbacks.disconnect_count(), 1);
    assert_eq!(harness.input.close_count(), 1);
    assert_eq!(harness.output.output.close_count(), 1);
    assert_eq!(harness.server.close_count(), 1);

    // Ending twice is a no-op.
    harness.conversation.end_session().await;
    assert_eq!(harness.callbacks.disconnect_count(), 1);
    assert_eq!(harness.input.close_count(), 1);
}

#[tokio::test]
async fn transport_failure_skips_disconnecting() {
    let harness = start().await;

    harness
        .server
        .push_closed(Some("connection reset".to_string()))
        .await;
    wait_until(|| harness.conversation.status() == Status::Disconnected).await;

    assert_eq!(
        harness.callbacks.statuses(),
        vec![Status::Connecting, Status::Connected, Status::Disconnected]
    );
    assert_eq!(harness.callbacks.disconnect_count(), 1);
    assert!(
        harness
            .callbacks
            .errors()
            .iter()
            .any(|m| m == "transport failure")
    );
    // Devices are released on this path too.
    assert_eq!(harness.input.close_count(), 1);
    assert_eq!(harness.output.output.close_count(), 1);

    // end_session after a transport failure is a no-op.
    harness.conversation.end_session().await;
    assert_eq!(harness.callbacks.disconnect_count(), 1);
}

#[tokio::test]
async fn bad_messages_are_reported_and_dispatch_continues() {
    let mut harness = start().await;

    harness.server.push_text("not json at all".to_string()).await;
    harness
        .server
        .push_json(json!({"type": "telemetry", "payload": {}}))
        .await;
    harness
        .server
        .push_json(json!({
            "type": "audio",
            "audio_event": { "audio_base_64": "!!!", "event_id": 1 }
        }))
        .await;

    // Dispatch survives all three.
    let leaked = fence(&mut harness.server, 31).await;
    assert!(leaked.is_empty());
    assert_eq!(harness.conversation.status(), Status::Connected);
    assert_eq!(harness.callbacks.errors().len(), 3);
}

#[tokio::test]
async fn diagnostic_frames_are_silently_ignored() {
    let mut harness = start().await;

    for kind in [
        "internal_tentative_agent_response",
        "internal_vad_score",
        "internal_turn_probability",
    ] {
        harness.server.push_json(json!({"type": kind})).await;
    }
    fence(&mut harness.server, 41).await;

    assert!(harness.callbacks.errors().is_empty());
    assert!(harness.callbacks.messages().is_empty());
    assert!(harness.callbacks.modes().is_empty());
}

#[tokio::test]
async fn failed_input_acquisition_aborts_and_releases_connection() {
    let (transport, server) = mock_transport();
    server.push_json(metadata("pcm_16000")).await;
    let callbacks = RecordingCallbacks::new();

    let platform = Platform {
        transport: Arc::new(transport),
        audio_in: MockInputFactory::failing(),
        audio_out: MockOutputFactory::new(),
    };
    let result = Conversation::start_with(
        SessionConfig::for_agent("test-agent"),
        callbacks.clone(),
        platform,
    )
    .await;

    assert!(result.is_err());
    assert_eq!(server.close_count(), 1);
    assert_eq!(
        callbacks.statuses(),
        vec![Status::Connecting, Status::Disconnected]
    );
}

#[tokio::test]
async fn failed_output_acquisition_releases_input_and_connection() {
    let (transport, server) = mock_transport();
    server.push_json(metadata("pcm_16000")).await;
    let callbacks = RecordingCallbacks::new();
    let input = MockInputFactory::new();

    let platform = Platform {
        transport: Arc::new(transport),
        audio_in: input.clone(),
        audio_out: MockOutputFactory::failing(),
    };
    let result = Conversation::start_with(
        SessionConfig::for_agent("test-agent"),
        callbacks.clone(),
        platform,
    )
    .await;

    assert!(result.is_err());
    assert_eq!(input.close_count(), 1);
    assert_eq!(server.close_count(), 1);
}

#[tokio::test]
async fn output_volume_is_applied_through_the_engine() {
    let mut harness = start().await;

    harness.conversation.set_output_volume(0.3);
    fence(&mut harness.server, 51).await;

    assert_eq!(harness.conversation.output_volume(), 0.3);
    assert_eq!(harness.output.output.gain(), 0.3);

    // Out-of-range values are clamped.
    harness.conversation.set_output_volume(2.5);
    fence(&mut harness.server, 52).await;
    assert_eq!(harness.conversation.output_volume(), 1.0);
}

#[tokio::test]
async fn failed_pong_send_is_reported_not_retried() {
    let mut harness = start().await;

    harness.server.fail_sends(true);
    harness.server.push_json(ping_frame(61)).await;

    wait_until(|| !harness.callbacks.errors().is_empty()).await;
    assert!(
        harness
            .callbacks
            .errors()
            .iter()
            .any(|m| m == "failed to send outbound message")
    );

    // Still connected; the failure was absorbed.
    assert_eq!(harness.conversation.status(), Status::Connected);
    harness.server.fail_sends(false);
    let clean = fence(&mut harness.server, 62).await;
    assert!(clean.is_empty());
}
