//! Output stages after the device decode: distance compensation, limiting,
//! dither and conversion to the output sample type.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::defs::{BUFFER_LINE_SIZE, FloatBufferLine, SPEED_OF_SOUND_METERS_PER_SEC};

/// Longest per-channel compensation delay, in samples.
pub const MAX_DELAY_LENGTH: usize = 1024;

#[derive(Debug, Clone)]
struct CompChannel {
    gain: f32,
    delay: usize,
    history: Vec<f32>,
}

/// Delays and attenuates nearer speakers so every speaker's sound arrives
/// at the listener together and at the same level.
#[derive(Debug, Clone)]
pub struct DistanceComp {
    channels: Vec<CompChannel>,
    temp: Vec<f32>,
}

impl DistanceComp {
    /// Builds compensation for speakers at `distances` meters. Returns
    /// `None` when no distance is positive.
    pub fn new(distances: &[f32], frequency: u32) -> Option<Self> {
        let max = distances.iter().copied().fold(0.0f32, f32::max);
        if !(max > 0.0) {
            return None;
        }

        let channels: Vec<CompChannel> = distances
            .iter()
            .map(|&dist| {
                let dist = dist.clamp(0.0, max);
                let delay = ((max - dist) * frequency as f32 / SPEED_OF_SOUND_METERS_PER_SEC + 0.5)
                    .floor() as usize;
                let delay = delay.min(MAX_DELAY_LENGTH - 1);
                CompChannel {
                    gain: if dist > 0.0 { dist / max } else { 1.0 },
                    delay,
                    history: vec![0.0; delay],
                }
            })
            .collect();

        for (i, chan) in channels.iter().enumerate() {
            log::debug!(
                "Channel {} distance comp: {} samples, {:.4} gain",
                i,
                chan.delay,
                chan.gain
            );
        }
        Some(Self {
            channels,
            temp: vec![0.0; BUFFER_LINE_SIZE + MAX_DELAY_LENGTH],
        })
    }

    pub fn delay(&self, channel: usize) -> Option<usize> {
        self.channels.get(channel).map(|c| c.delay)
    }

    pub fn apply(&mut self, lines: &mut [FloatBufferLine], todo: usize) {
        for (line, chan) in lines.iter_mut().zip(self.channels.iter_mut()) {
            let delay = chan.delay;
            let line = &mut line[..todo];
            if delay == 0 {
                line.iter_mut().for_each(|s| *s *= chan.gain);
                continue;
            }

            let temp = &mut self.temp[..delay + todo];
            temp[..delay].copy_from_slice(&chan.history);
            temp[delay..].copy_from_slice(line);
            chan.history.copy_from_slice(&temp[todo..]);
            for (out, s) in line.iter_mut().zip(temp.iter()) {
                *out = s * chan.gain;
            }
        }
    }
}

/// Peak limiter holding the output under full scale.
///
/// Gain drops immediately to whatever keeps the loudest channel at the
/// threshold and recovers exponentially.
#[derive(Debug, Clone)]
pub struct Limiter {
    threshold: f32,
    release: f32,
    gain: f32,
}

impl Limiter {
    pub const RELEASE_SECONDS: f32 = 0.2;

    pub fn new(frequency: u32) -> Self {
        Self {
            threshold: 1.0,
            release: (-1.0 / (Self::RELEASE_SECONDS * frequency as f32)).exp(),
            gain: 1.0,
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn apply(&mut self, lines: &mut [FloatBufferLine], todo: usize) {
        for i in 0..todo {
            let peak = lines.iter().fold(0.0f32, |peak, line| peak.max(line[i].abs()));
            let target = if peak > self.threshold {
                self.threshold / peak
            } else {
                1.0
            };
            self.gain = if target < self.gain {
                target
            } else {
                target + (self.gain - target) * self.release
            };
            for line in lines.iter_mut() {
                line[i] *= self.gain;
            }
        }
    }
}

/// Triangular-PDF dither at a quantization depth.
#[derive(Debug, Clone)]
pub struct Dither {
    seed: u32,
    scale: f32,
}

impl Dither {
    pub fn new(depth: u32) -> Self {
        Self {
            seed: 22222,
            scale: 2.0f32.powi(depth.clamp(2, 24) as i32 - 1),
        }
    }

    fn next(&mut self) -> u32 {
        self.seed = self.seed.wrapping_mul(96314165).wrapping_add(907633515);
        self.seed
    }

    pub fn apply(&mut self, lines: &mut [FloatBufferLine], todo: usize) {
        let inv_scale = 1.0 / self.scale;
        const INV_RANGE: f32 = 1.0 / u32::MAX as f32;
        for line in lines.iter_mut() {
            for sample in line[..todo].iter_mut() {
                let rng0 = self.next();
                let rng1 = self.next();
                let val = *sample * self.scale + rng0 as f32 * INV_RANGE - rng1 as f32 * INV_RANGE;
                *sample = val.round() * inv_scale;
            }
        }
    }
}

/// An output sample type the mixer can write.
pub trait OutputSample: Copy + Send + 'static {
    const SILENCE: Self;

    fn from_mix(value: f32) -> Self;
}

impl OutputSample for f32 {
    const SILENCE: Self = 0.0;

    fn from_mix(value: f32) -> Self {
        value
    }
}

impl OutputSample for i32 {
    const SILENCE: Self = 0;

    fn from_mix(value: f32) -> Self {
        // Largest f32 below 2^31.
        (value * 2147483648.0).round().clamp(-2147483648.0, 2147483520.0) as i32
    }
}

impl OutputSample for u32 {
    const SILENCE: Self = 1 << 31;

    fn from_mix(value: f32) -> Self {
        (i32::from_mix(value) as u32) ^ (1 << 31)
    }
}

impl OutputSample for i16 {
    const SILENCE: Self = 0;

    fn from_mix(value: f32) -> Self {
        (value * 32768.0).round().clamp(-32768.0, 32767.0) as i16
    }
}

impl OutputSample for u16 {
    const SILENCE: Self = 1 << 15;

    fn from_mix(value: f32) -> Self {
        (i16::from_mix(value) as u16) ^ (1 << 15)
    }
}

impl OutputSample for i8 {
    const SILENCE: Self = 0;

    fn from_mix(value: f32) -> Self {
        (value * 128.0).round().clamp(-128.0, 127.0) as i8
    }
}

impl OutputSample for u8 {
    const SILENCE: Self = 1 << 7;

    fn from_mix(value: f32) -> Self {
        (i8::from_mix(value) as u8) ^ (1 << 7)
    }
}

/// Interleaves `todo` frames of `lines` into `out`, which holds frames of
/// `stride` samples. Extra output channels are silenced.
pub fn write_interleaved<T: OutputSample>(
    lines: &[FloatBufferLine],
    out: &mut [T],
    stride: usize,
    todo: usize,
) {
    for (i, frame) in out.chunks_exact_mut(stride).take(todo).enumerate() {
        for (c, sample) in frame.iter_mut().enumerate() {
            *sample = lines.get(c).map_or(T::SILENCE, |line| T::from_mix(line[i]));
        }
    }
}

/// Device time, advanced by the mixer.
///
/// The sample counter wraps into whole seconds so the nanosecond base stays
/// exact at any rate.
#[derive(Debug)]
pub struct DeviceClock {
    frequency: u64,
    samples_done: AtomicU64,
    base_ns: AtomicU64,
}

impl DeviceClock {
    pub fn new(frequency: u32) -> Self {
        Self {
            frequency: u64::from(frequency.max(1)),
            samples_done: AtomicU64::new(0),
            base_ns: AtomicU64::new(0),
        }
    }

    /// Mixer only.
    pub fn advance(&self, samples: usize) {
        let mut done = self.samples_done.load(Ordering::Relaxed) + samples as u64;
        let seconds = done / self.frequency;
        if seconds > 0 {
            done %= self.frequency;
            self.base_ns
                .fetch_add(seconds * 1_000_000_000, Ordering::Relaxed);
        }
        self.samples_done.store(done, Ordering::Relaxed);
    }

    /// Nanoseconds of audio rendered. Callers wanting a consistent read pair
    /// it with the mix counter.
    pub fn time_ns(&self) -> u64 {
        let base = self.base_ns.load(Ordering::Relaxed);
        let done = self.samples_done.load(Ordering::Relaxed);
        base + done * 1_000_000_000 / self.frequency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::new_buffer_lines;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_distance_comp_delays_nearer_speakers() {
        let mut comp = DistanceComp::new(&[2.0, 1.0], 48000).unwrap();
        // 1 m at 48 kHz is 139.8 samples.
        assert_eq!(comp.delay(0), Some(0));
        assert_eq!(comp.delay(1), Some(140));

        let mut lines = new_buffer_lines(2);
        lines[0][0] = 1.0;
        lines[1][0] = 1.0;
        comp.apply(&mut lines, 256);
        assert_eq!(lines[0][0], 1.0);
        assert_eq!(lines[1][0], 0.0);
        assert_eq!(lines[1][140], 0.5);
    }

    #[test]
    fn test_distance_comp_carries_across_blocks() {
        let mut comp = DistanceComp::new(&[1.0, 0.0], 343).unwrap();
        assert_eq!(comp.delay(1), Some(1));
        let mut lines = new_buffer_lines(2);
        lines[1][3] = 0.25;
        comp.apply(&mut lines, 4);
        assert_eq!(lines[1][3], 0.0);
        lines[1][..4].fill(0.0);
        comp.apply(&mut lines, 4);
        assert_eq!(lines[1][0], 0.25);
        assert!(DistanceComp::new(&[0.0, 0.0], 48000).is_none());
    }

    #[test]
    fn test_limiter_holds_full_scale() {
        let mut limiter = Limiter::new(48000);
        let mut lines = new_buffer_lines(2);
        lines[0][..64].fill(2.0);
        lines[1][..64].fill(0.5);
        limiter.apply(&mut lines, 64);
        assert_abs_diff_eq!(lines[0][0], 1.0);
        assert_abs_diff_eq!(lines[1][0], 0.25);
        assert!(lines[0][..64].iter().all(|s| *s <= 1.0 + 1e-6));

        // Recovers toward unity on quiet input.
        let mut quiet = new_buffer_lines(1);
        quiet[0].fill(0.1);
        limiter.apply(&mut quiet, BUFFER_LINE_SIZE);
        assert!(limiter.gain() > 0.5);
    }

    #[test]
    fn test_dither_quantizes() {
        let mut dither = Dither::new(8);
        let mut lines = new_buffer_lines(1);
        for (i, s) in lines[0].iter_mut().enumerate() {
            *s = (i as f32 / 100.0).sin() * 0.5;
        }
        let original = lines[0];
        dither.apply(&mut lines, BUFFER_LINE_SIZE);
        for (d, o) in lines[0].iter().zip(original.iter()) {
            let steps = d * 128.0;
            assert_abs_diff_eq!(steps, steps.round(), epsilon = 1e-3);
            assert!((d - o).abs() <= 1.5 / 128.0);
        }
    }

    #[test]
    fn test_sample_conversion() {
        assert_eq!(i16::from_mix(1.0), 32767);
        assert_eq!(i16::from_mix(-1.0), -32768);
        assert_eq!(i16::from_mix(0.5), 16384);
        assert_eq!(u16::from_mix(0.0), 32768);
        assert_eq!(u8::from_mix(-1.0), 0);
        assert_eq!(u8::from_mix(2.0), 255);
        assert_eq!(i8::from_mix(0.0), 0);
        assert_eq!(i32::from_mix(-1.0), i32::MIN);
        assert_eq!(i32::from_mix(1.0), 2147483520);
        assert_eq!(u32::from_mix(0.0), 1 << 31);
        assert_eq!(f32::from_mix(0.25), 0.25);
    }

    #[test]
    fn test_interleave_pads_channels() {
        let mut lines = new_buffer_lines(2);
        lines[0][1] = 1.0;
        lines[1][1] = -1.0;
        let mut out = [9i16; 6];
        write_interleaved(&lines, &mut out, 3, 2);
        assert_eq!(out, [0, 0, 0, 32767, -32768, 0]);
    }

    #[test]
    fn test_clock_rolls_into_seconds() {
        let clock = DeviceClock::new(48000);
        clock.advance(24000);
        assert_eq!(clock.time_ns(), 500_000_000);
        clock.advance(48000);
        assert_eq!(clock.time_ns(), 1_500_000_000);
    }
}
