use std::thread;
use std::time::{Duration, Instant};

use approx::assert_abs_diff_eq;
use parley_core::codec;
use parley_core::ipc::events::{PlaybackEvent, PlaybackEventKind, PlaybackStatus};
use parley_core::playback::sink::SinkEvent;
use parley_core::{PlaybackConfig, PlaybackEngine, PlaybackService, RecordingSink};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

const RATE: u32 = 24_000;

fn engine() -> (PlaybackEngine<RecordingSink>, RecordingSink) {
    let sink = RecordingSink::new();
    (
        PlaybackEngine::new(PlaybackConfig::default(), sink.clone()),
        sink,
    )
}

/// A chunk whose samples all carry `tag`, so rendered order is readable.
fn tagged_chunk(tag: f32, len: usize) -> String {
    codec::encode_base64(&vec![tag; len])
}

/// Finish whatever node is playing, the way the sink would.
fn complete_active(engine: &mut PlaybackEngine<RecordingSink>, sink: &RecordingSink) -> bool {
    let id = match sink.state().lock().active() {
        Some(node) => node.id,
        None => return false,
    };
    sink.mark_ended(id);
    engine.on_node_ended(id);
    true
}

fn drain_events(rx: &mut broadcast::Receiver<PlaybackEvent>) -> Vec<PlaybackEventKind> {
    let mut kinds = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => kinds.push(ev.kind),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return kinds,
        }
    }
}

fn recv_event_with_timeout(
    rx: &mut broadcast::Receiver<PlaybackEvent>,
    timeout: Duration,
) -> PlaybackEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for playback event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("playback event channel closed unexpectedly"),
        }
    }
}

#[test]
fn chunks_render_in_enqueue_order_despite_interleaved_completions() {
    let (mut engine, sink) = engine();

    engine.queue_audio(&tagged_chunk(0.1, 480)).expect("A");
    // B arrives before A completes, C after.
    engine.queue_audio(&tagged_chunk(0.2, 480)).expect("B");
    assert!(complete_active(&mut engine, &sink));
    engine.queue_audio(&tagged_chunk(0.3, 480)).expect("C");
    while complete_active(&mut engine, &sink) {}

    let state = sink.state();
    let state = state.lock();
    let tags: Vec<f32> = state.nodes.iter().map(|n| n.samples[0]).collect();
    assert_eq!(tags.len(), 3);
    assert_abs_diff_eq!(tags[0], 0.1, epsilon = 1.0 / 32768.0);
    assert_abs_diff_eq!(tags[1], 0.2, epsilon = 1.0 / 32768.0);
    assert_abs_diff_eq!(tags[2], 0.3, epsilon = 1.0 / 32768.0);
    assert_eq!(state.rendered().len(), 3 * 480);
}

#[test]
fn each_buffer_starts_exactly_where_the_previous_one_ends() {
    let (mut engine, sink) = engine();
    sink.set_now(1.25);

    let lengths = [240usize, 4800, 17, 1200, 24_000];
    for len in lengths {
        engine.queue_audio(&tagged_chunk(0.5, len)).expect("queue");
    }
    assert_eq!(engine.active_start_time(), Some(1.25));
    while complete_active(&mut engine, &sink) {}

    let state = sink.state();
    let state = state.lock();
    assert_eq!(state.nodes.len(), lengths.len());
    assert_eq!(state.nodes[0].start_at, 1.25);
    for pair in state.nodes.windows(2) {
        let prev_end = pair[0].start_at + pair[0].duration_secs(RATE);
        assert_abs_diff_eq!(pair[1].start_at, prev_end, epsilon = 1e-12);
    }
}

#[test]
fn burst_of_fifty_chunks_never_overlaps_nodes() {
    let (mut engine, sink) = engine();

    for i in 0..50 {
        engine
            .queue_audio(&tagged_chunk(i as f32 / 100.0, 240))
            .expect("queue");
        // Complete a node every third chunk to interleave both sides.
        if i % 3 == 2 {
            complete_active(&mut engine, &sink);
        }
        assert!(sink.state().lock().live() <= 1);
    }
    while complete_active(&mut engine, &sink) {}

    let snapshot = engine.diagnostics_snapshot();
    assert_eq!(snapshot.chunks_queued, 50);
    assert_eq!(snapshot.nodes_started, 50);
    assert_eq!(snapshot.nodes_ended, 50);
    assert_eq!(snapshot.max_active_nodes, 1);
    assert_eq!(snapshot.active_nodes, 0);
    assert_eq!(sink.state().lock().max_live, 1);
}

#[test]
fn stop_twice_and_stop_while_idle_are_harmless() {
    let (mut engine, sink) = engine();
    engine.init().expect("init");
    engine.stop().expect("stop while idle");
    assert_eq!(engine.status(), PlaybackStatus::Idle);

    let mut events = engine.subscribe_events();
    engine.queue_audio(&tagged_chunk(0.1, 240)).expect("queue");
    engine.queue_audio(&tagged_chunk(0.2, 240)).expect("queue");
    engine.stop().expect("first stop");
    engine.stop().expect("second stop");

    assert_eq!(engine.status(), PlaybackStatus::Idle);
    assert_eq!(engine.queued(), 0);
    assert_eq!(
        drain_events(&mut events),
        vec![PlaybackEventKind::Started, PlaybackEventKind::Ended]
    );
    let state = sink.state();
    let state = state.lock();
    assert_eq!(state.nodes.len(), 1);
    assert!(state.nodes[0].stopped);
}

#[test]
fn late_completion_after_stop_is_ignored() {
    let (mut engine, sink) = engine();
    let mut events = engine.subscribe_events();
    engine.queue_audio(&tagged_chunk(0.1, 240)).expect("queue");
    engine.stop().expect("stop");
    engine.queue_audio(&tagged_chunk(0.2, 240)).expect("queue again");

    // The halted node's completion races in after the new node started.
    engine.on_node_ended(1);
    assert!(engine.is_playing());
    assert_eq!(sink.state().lock().active().map(|n| n.id), Some(2));
    assert_eq!(
        drain_events(&mut events),
        vec![
            PlaybackEventKind::Started,
            PlaybackEventKind::Ended,
            PlaybackEventKind::Started,
        ]
    );
}

#[test]
fn ten_chunk_burst_fires_one_start_and_one_end() {
    let (mut engine, sink) = engine();
    let mut events = engine.subscribe_events();

    for i in 0..10 {
        engine
            .queue_audio(&tagged_chunk(i as f32 / 20.0, 480))
            .expect("queue");
    }
    assert_eq!(drain_events(&mut events), vec![PlaybackEventKind::Started]);

    while complete_active(&mut engine, &sink) {}
    assert_eq!(drain_events(&mut events), vec![PlaybackEventKind::Ended]);
    assert_eq!(engine.status(), PlaybackStatus::Idle);
}

#[test]
fn malformed_chunk_between_valid_ones_is_skipped() {
    let (mut engine, sink) = engine();

    engine.queue_audio(&tagged_chunk(0.1, 240)).expect("first");
    assert!(engine.queue_audio("not*valid*base64").is_err());
    engine.queue_audio(&tagged_chunk(0.2, 240)).expect("second");
    assert_eq!(engine.status(), PlaybackStatus::Draining);
    assert_eq!(engine.queued(), 1);

    while complete_active(&mut engine, &sink) {}

    let state = sink.state();
    let state = state.lock();
    assert_eq!(state.nodes.len(), 2);
    assert_abs_diff_eq!(state.nodes[0].samples[0], 0.1, epsilon = 1.0 / 32768.0);
    assert_abs_diff_eq!(state.nodes[1].samples[0], 0.2, epsilon = 1.0 / 32768.0);
    assert_eq!(engine.diagnostics_snapshot().chunks_rejected, 1);
}

#[test]
fn service_plays_chunks_queued_from_another_thread() {
    let sink = RecordingSink::new();
    let (sender_tx, sender_rx) = crossbeam_channel::bounded(1);
    let for_loop = sink.clone();
    let service = PlaybackService::spawn(PlaybackConfig::default(), move |events| {
        let _ = sender_tx.send(events);
        for_loop
    })
    .expect("spawn service");
    let sink_events = sender_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("sink event sender");

    let handle = service.handle();
    let mut events = handle.subscribe_events();

    let producer = {
        let handle = handle.clone();
        thread::spawn(move || {
            for i in 0..5 {
                handle
                    .queue_audio(tagged_chunk(0.1 * (i + 1) as f32, 240))
                    .expect("queue from producer thread");
            }
        })
    };

    assert_eq!(
        recv_event_with_timeout(&mut events, Duration::from_secs(2)).kind,
        PlaybackEventKind::Started
    );

    // Play nodes out as the producer keeps queueing. A node marked ended
    // drops out of `active()`, so each one is completed exactly once.
    let mut played = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while played < 5 {
        assert!(Instant::now() < deadline, "timed out draining the queue");
        let active = sink.state().lock().active().map(|n| n.id);
        match active {
            Some(id) => {
                sink.mark_ended(id);
                sink_events.send(SinkEvent::NodeEnded(id)).expect("completion");
                played += 1;
            }
            None => thread::sleep(Duration::from_millis(1)),
        }
    }
    producer.join().expect("producer thread");

    assert_eq!(
        recv_event_with_timeout(&mut events, Duration::from_secs(2)).kind,
        PlaybackEventKind::Ended
    );
    let state = sink.state();
    let tags: Vec<f32> = state.lock().nodes.iter().map(|n| n.samples[0]).collect();
    assert_eq!(tags.len(), 5);
    assert!(tags.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(handle.diagnostics_snapshot().max_active_nodes, 1);
}

#[test]
fn refused_chunks_stay_queued_until_the_sink_accepts() {
    let (mut engine, sink) = engine();
    let mut events = engine.subscribe_events();
    sink.state().lock().refuse_starts = 3;

    for tag in [0.1, 0.2, 0.3] {
        assert!(engine.queue_audio(&tagged_chunk(tag, 240)).is_err());
    }
    assert_eq!(engine.queued(), 3);
    assert_eq!(engine.status(), PlaybackStatus::Idle);
    assert!(drain_events(&mut events).is_empty());

    engine.queue_audio(&tagged_chunk(0.4, 240)).expect("sink accepts again");
    while complete_active(&mut engine, &sink) {}

    let rendered = sink.state().lock().rendered();
    assert_eq!(rendered.len(), 4 * 240);
    for (block, tag) in rendered.chunks(240).zip([0.1, 0.2, 0.3, 0.4]) {
        assert_abs_diff_eq!(block[0], tag, epsilon = 1.0 / 32768.0);
    }
    let stats = engine.diagnostics_snapshot();
    assert_eq!(stats.nodes_refused, 3);
    assert_eq!(stats.nodes_started, 4);
    assert_eq!(
        drain_events(&mut events),
        vec![PlaybackEventKind::Started, PlaybackEventKind::Ended]
    );
}
