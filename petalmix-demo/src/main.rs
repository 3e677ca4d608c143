use anyhow::Result;
use petalmix::config::{HrtfMode, OutputLayout, StereoEncoding};
use petalmix::math::Vec3;
use petalmix::{
    AudioBuffer, ChannelFormat, DedicatedEffect, EffectSlotProps, EventMask, PetalMixDeviceDesc,
    PetalMixEngine, PetalMixEvent, PetalMixWorld, SourceProps,
};
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--offline") {
        run_offline()
    } else {
        run_device()
    }
}

fn demo_desc() -> PetalMixDeviceDesc {
    PetalMixDeviceDesc {
        sample_rate: 48000,
        output: OutputLayout::Stereo,
        stereo_encoding: StereoEncoding::Hrtf,
        hrtf_mode: HrtfMode::Full,
        ..Default::default()
    }
}

/// A second of a decaying sine, to loop.
fn chirp(sample_rate: u32, freq: f32) -> Result<Arc<AudioBuffer>> {
    let samples = (0..sample_rate as usize)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (TAU * freq * t).sin() * (-4.0 * t).exp() * 0.5
        })
        .collect();
    Ok(Arc::new(AudioBuffer::from_f32(
        ChannelFormat::Mono,
        sample_rate,
        samples,
    )?))
}

fn orbit(angle: f32) -> Vec3 {
    Vec3::new(angle.sin() * 2.0, 0.0, -angle.cos() * 2.0)
}

fn log_events(world: &PetalMixWorld) {
    for event in world.poll_events() {
        match event {
            PetalMixEvent::Disconnected { message } => log::error!("Disconnected: {}", message),
            other => log::info!("Event: {:?}", other),
        }
    }
}

fn setup(world: &mut PetalMixWorld) -> Result<petalmix::SourceId> {
    world.enable_events(EventMask::ALL);
    let reverb = world.create_effect_slot(
        EffectSlotProps {
            gain: 0.3,
            ..Default::default()
        },
        Box::new(DedicatedEffect::default()),
    )?;

    let buffer = chirp(world.sample_rate(), 440.0)?;
    let source = world.create_source(SourceProps::spatial(orbit(0.0)).with_send(0, reverb))?;
    world.set_buffer(source, Some(buffer))?;
    world.set_looping(source, true)?;
    world.play(source)?;
    log::info!("Playing {} on an orbit around the listener", source);
    Ok(source)
}

fn run_device() -> Result<()> {
    let mut world = PetalMixWorld::new(demo_desc())?;
    let source = setup(&mut world)?;

    let mut engine = PetalMixEngine::new(&world)?;
    if let Err(e) = engine.start() {
        log::error!("Audio playback failed: {}", e);
        return Ok(());
    }

    let steps = 200;
    for step in 0..steps {
        let angle = step as f32 / steps as f32 * TAU;
        let props = SourceProps {
            position: orbit(angle),
            ..world.props(source)?
        };
        world.set_props(source, props)?;
        log_events(&world);
        std::thread::sleep(Duration::from_millis(40));
    }

    world.stop(source)?;
    std::thread::sleep(Duration::from_millis(100));
    log_events(&world);
    engine.stop()?;
    log::info!(
        "Done after {} frames ({:?} of audio)",
        engine.frames_processed(),
        world.clock_time()
    );
    Ok(())
}

fn run_offline() -> Result<()> {
    let mut world = PetalMixWorld::new(demo_desc())?;
    let source = setup(&mut world)?;

    let block = 480;
    let mut out = vec![0.0f32; block * world.channels()];
    let mut peak = 0.0f32;
    for step in 0..200 {
        let angle = step as f32 / 200.0 * TAU;
        let props = SourceProps {
            position: orbit(angle),
            ..world.props(source)?
        };
        world.set_props(source, props)?;
        world.render(&mut out);
        peak = out.iter().fold(peak, |p, s| p.max(s.abs()));
        log_events(&world);
    }
    world.stop(source)?;
    world.render(&mut out);
    log_events(&world);

    log::info!(
        "Rendered {:?} offline, peak {:.3}, offset {:?}",
        world.clock_time(),
        peak,
        world.offset(source)?
    );
    Ok(())
}
