use approx::{assert_abs_diff_eq, assert_relative_eq};
use petalmix::math::Vec3;
use petalmix::{
    AudioBuffer, ChannelFormat, EventMask, Offset, PetalMixDeviceDesc, PetalMixError,
    PetalMixEvent, PetalMixWorld, SourceProps, SourceState,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn world() -> PetalMixWorld {
    let _ = env_logger::builder().is_test(true).try_init();
    let world = PetalMixWorld::new(PetalMixDeviceDesc::default()).unwrap();
    world.enable_events(EventMask::ALL);
    world
}

fn tone(frames: usize, freq: f32) -> Arc<AudioBuffer> {
    let samples = (0..frames)
        .map(|i| (i as f32 * freq * std::f32::consts::TAU / 48000.0).sin() * 0.5)
        .collect();
    Arc::new(AudioBuffer::from_f32(ChannelFormat::Mono, 48000, samples).unwrap())
}

fn render(world: &mut PetalMixWorld, frames: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; frames * world.channels()];
    assert_eq!(world.render(&mut out), frames);
    out
}

/// Collects events until `done` is satisfied or a second passes.
fn collect_events(
    world: &PetalMixWorld,
    done: impl Fn(&[PetalMixEvent]) -> bool,
) -> Vec<PetalMixEvent> {
    let deadline = Instant::now() + Duration::from_secs(1);
    let mut events = Vec::new();
    while Instant::now() < deadline {
        events.extend(world.poll_events());
        if done(&events) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    events
}

fn states_of(events: &[PetalMixEvent], id: u64) -> Vec<SourceState> {
    events
        .iter()
        .filter_map(|e| match e {
            PetalMixEvent::SourceStateChanged { source_id, state } if *source_id == id => {
                Some(*state)
            }
            _ => None,
        })
        .collect()
}

#[test]
fn test_streaming_queue_progress() {
    let mut world = world();
    let id = world.create_source(SourceProps::non_spatial()).unwrap();
    let buffers: Vec<_> = (0..3).map(|_| tone(100, 440.0)).collect();
    world.queue_buffers(id, &buffers).unwrap();
    world.play(id).unwrap();

    render(&mut world, 250);

    assert_eq!(world.buffers_processed(id).unwrap(), 2);
    assert_eq!(world.buffers_queued(id).unwrap(), 3);
    assert_eq!(world.offset(id).unwrap().samples, 250);
    assert_eq!(world.state(id).unwrap(), SourceState::Playing);

    let completed = |events: &[PetalMixEvent]| -> u32 {
        events
            .iter()
            .filter_map(|e| match e {
                PetalMixEvent::BufferCompleted { count, .. } => Some(*count),
                _ => None,
            })
            .sum()
    };
    let events = collect_events(&world, |events| completed(events) >= 2);
    assert_eq!(completed(&events), 2);

    let removed = world.unqueue_buffers(id, 2).unwrap();
    assert!(Arc::ptr_eq(&removed[0], &buffers[0]));
    assert!(Arc::ptr_eq(&removed[1], &buffers[1]));
    assert_eq!(world.buffers_queued(id).unwrap(), 1);
    assert_eq!(world.offset(id).unwrap().samples, 50);
    assert!(world.unqueue_buffers(id, 1).is_err());
}

#[test]
fn test_queue_appends_while_playing() {
    let mut world = world();
    let id = world.create_source(SourceProps::non_spatial()).unwrap();
    world.queue_buffers(id, &[tone(200, 440.0)]).unwrap();
    world.play(id).unwrap();
    render(&mut world, 150);
    world.queue_buffers(id, &[tone(200, 440.0)]).unwrap();
    render(&mut world, 150);

    assert_eq!(world.state(id).unwrap(), SourceState::Playing);
    assert_eq!(world.buffers_processed(id).unwrap(), 1);
    assert_eq!(world.offset(id).unwrap().samples, 300);

    render(&mut world, 200);
    assert_eq!(world.state(id).unwrap(), SourceState::Stopped);
    assert_eq!(world.buffers_processed(id).unwrap(), 2);
}

#[test]
fn test_state_events_follow_commands() {
    let mut world = world();
    let id = world.create_source(SourceProps::non_spatial()).unwrap();
    world.set_buffer(id, Some(tone(48000, 440.0))).unwrap();

    world.play(id).unwrap();
    render(&mut world, 256);
    world.pause(id).unwrap();
    render(&mut world, 256);
    world.play(id).unwrap();
    render(&mut world, 256);
    world.stop(id).unwrap();
    render(&mut world, 256);
    world.rewind(id).unwrap();
    render(&mut world, 256);
    assert_eq!(world.state(id).unwrap(), SourceState::Initial);

    let expected = vec![
        SourceState::Playing,
        SourceState::Paused,
        SourceState::Playing,
        SourceState::Stopped,
        SourceState::Initial,
    ];
    let events = collect_events(&world, |events| {
        states_of(events, id.raw()).len() >= expected.len()
    });
    assert_eq!(states_of(&events, id.raw()), expected);
}

#[test]
fn test_unit_pitch_advances_one_sample_per_frame() {
    let mut world = world();
    let id = world.create_source(SourceProps::spatial(Vec3::new(1.0, 0.0, -1.0))).unwrap();
    world.set_buffer(id, Some(tone(48000, 220.0))).unwrap();
    world.play(id).unwrap();

    let mut last = 0;
    for block in 1..=10 {
        render(&mut world, 333);
        let offset = world.offset(id).unwrap();
        assert!(offset.samples >= last);
        assert_eq!(offset.samples, block * 333);
        assert_eq!(offset.fraction, 0);
        last = offset.samples;
    }
}

#[test]
fn test_pitch_scales_playback_rate() {
    let mut world = world();
    let id = world
        .create_source(SourceProps::non_spatial().with_pitch(2.0))
        .unwrap();
    world.set_buffer(id, Some(tone(48000, 220.0))).unwrap();
    world.play(id).unwrap();
    render(&mut world, 256);
    assert_eq!(world.offset(id).unwrap().samples, 512);
}

#[test]
fn test_looping_wraps() {
    let mut world = world();
    let id = world.create_source(SourceProps::non_spatial()).unwrap();
    world.set_buffer(id, Some(tone(100, 440.0))).unwrap();
    world.set_looping(id, true).unwrap();
    world.play(id).unwrap();

    render(&mut world, 1030);
    assert_eq!(world.state(id).unwrap(), SourceState::Playing);
    assert_eq!(world.offset(id).unwrap().samples, 30);

    world.set_looping(id, false).unwrap();
    render(&mut world, 100);
    assert_eq!(world.state(id).unwrap(), SourceState::Stopped);
}

#[test]
fn test_offset_moves_playing_source() {
    let mut world = world();
    let id = world.create_source(SourceProps::non_spatial()).unwrap();
    world.set_buffer(id, Some(tone(48000, 440.0))).unwrap();
    world.set_offset(id, Offset::Samples(1000)).unwrap();
    assert_eq!(world.offset(id).unwrap().samples, 1000);
    world.play(id).unwrap();
    render(&mut world, 100);
    assert_eq!(world.offset(id).unwrap().samples, 1100);

    world.set_offset(id, Offset::Seconds(0.5)).unwrap();
    render(&mut world, 100);
    assert_eq!(world.state(id).unwrap(), SourceState::Playing);
    assert_eq!(world.offset(id).unwrap().samples, 24100);
}

/// One second of constant 1.0.
fn dc() -> Arc<AudioBuffer> {
    Arc::new(AudioBuffer::from_f32(ChannelFormat::Mono, 48000, vec![1.0; 48000]).unwrap())
}

fn channel(out: &[f32], channels: usize, ch: usize) -> Vec<f32> {
    out.chunks(channels).map(|frame| frame[ch]).collect()
}

#[test]
fn test_gain_change_is_ramped() {
    let mut world = world();
    let channels = world.channels();
    let id = world.create_source(SourceProps::non_spatial()).unwrap();
    world.set_buffer(id, Some(dc())).unwrap();
    world.play(id).unwrap();

    let before = render(&mut world, 512);
    world
        .set_props(id, SourceProps::non_spatial().with_gain(0.5))
        .unwrap();
    let ramp = render(&mut world, 512);
    let after = render(&mut world, 512);

    for ch in 0..channels {
        // A fresh start lands on its gains without a ramp.
        let steady = channel(&before, channels, ch);
        let from = steady[0];
        assert!(from.abs() > 0.1);
        for s in &steady {
            assert_abs_diff_eq!(*s, from, epsilon = 1e-6);
        }

        let to = after[ch];
        assert_relative_eq!(to, from * 0.5, max_relative = 1e-5);
        for s in channel(&after, channels, ch) {
            assert_abs_diff_eq!(s, to, epsilon = 1e-6);
        }

        let ramp = channel(&ramp, channels, ch);
        let delta = (to - from) / 512.0;
        assert_abs_diff_eq!(ramp[0], from, epsilon = 1e-6);
        for pair in ramp.windows(2) {
            assert_abs_diff_eq!(pair[1] - pair[0], delta, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(ramp[511], to - delta, epsilon = 1e-5);
    }
}

#[test]
fn test_stop_fades_out_over_64_samples() {
    let mut world = world();
    let channels = world.channels();
    let id = world.create_source(SourceProps::non_spatial()).unwrap();
    world.set_buffer(id, Some(dc())).unwrap();
    world.play(id).unwrap();

    let playing = render(&mut world, 512);
    world.stop(id).unwrap();
    let fade = render(&mut world, 512);

    for ch in 0..channels {
        let from = playing[511 * channels + ch];
        assert!(from.abs() > 0.1);
        let fade = channel(&fade, channels, ch);
        for (i, s) in fade.iter().enumerate().take(64) {
            assert_abs_diff_eq!(*s, from * (1.0 - i as f32 / 64.0), epsilon = 1e-5);
        }
        assert!(fade[64..].iter().all(|s| s.abs() < 1e-6));
    }
}

#[test]
fn test_deferred_updates_land_together() {
    let mut world = world();
    let id = world.create_source(SourceProps::non_spatial()).unwrap();
    world.set_buffer(id, Some(tone(48000, 100.0))).unwrap();
    world.play(id).unwrap();
    render(&mut world, 256);

    world.defer_updates();
    world
        .set_props(id, SourceProps::non_spatial().with_gain(0.0))
        .unwrap();
    render(&mut world, 256);
    let held = render(&mut world, 256);
    assert!(held.iter().any(|s| s.abs() > 1e-3));

    world.process_updates();
    render(&mut world, 256);
    let applied = render(&mut world, 256);
    assert!(applied.iter().all(|s| s.abs() < 1e-4));
}

#[test]
fn test_disconnect_stops_everything() {
    let mut world = world();
    let ids: Vec<_> = (0..3)
        .map(|_| {
            let id = world.create_source(SourceProps::non_spatial()).unwrap();
            world.set_buffer(id, Some(tone(48000, 440.0))).unwrap();
            id
        })
        .collect();
    world.play_batch(&ids).unwrap();
    render(&mut world, 256);

    world.disconnect("unplugged");
    assert!(!world.is_connected());
    let out = render(&mut world, 256);
    assert!(out.iter().all(|s| *s == 0.0));

    for id in &ids {
        assert_eq!(world.state(*id).unwrap(), SourceState::Stopped);
    }
    assert!(matches!(
        world.play(ids[0]),
        Err(PetalMixError::Disconnected(_))
    ));

    let events = collect_events(&world, |events| {
        events
            .iter()
            .any(|e| matches!(e, PetalMixEvent::Disconnected { .. }))
    });
    for id in &ids {
        assert_eq!(
            states_of(&events, id.raw()),
            vec![SourceState::Playing, SourceState::Stopped]
        );
    }
    let disconnects: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PetalMixEvent::Disconnected { message } => Some(message.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(disconnects, vec!["unplugged"]);

    world.disconnect("again");
    render(&mut world, 256);
    let again = collect_events(&world, |_| false);
    assert!(
        again
            .iter()
            .all(|e| !matches!(e, PetalMixEvent::Disconnected { .. }))
    );
}

#[test]
fn test_clock_tracks_rendered_audio() {
    let mut world = world();
    render(&mut world, 48000);
    assert_eq!(world.clock_time(), Duration::from_secs(1));
    render(&mut world, 24000);
    assert_eq!(world.clock_time(), Duration::from_millis(1500));
}

#[test]
fn test_drop_with_full_event_ring() {
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let mut world = PetalMixWorld::new(PetalMixDeviceDesc {
            event_ring_size: 1,
            ..Default::default()
        })
        .unwrap();
        world.enable_events(EventMask::ALL);
        let ids: Vec<_> = (0..24)
            .map(|_| {
                let id = world.create_source(SourceProps::non_spatial()).unwrap();
                world.set_buffer(id, Some(tone(100, 440.0))).unwrap();
                id
            })
            .collect();
        world.play_batch(&ids).unwrap();
        render(&mut world, 256);
        drop(world);
        let _ = done_tx.send(());
    });
    assert!(
        done_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
        "dropping the world hung"
    );
}
