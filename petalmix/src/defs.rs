//! Fixed-point and buffer-size constants shared by the mixer.

/// Fractional bits of the resampler position. Positions are `(int, frac)` pairs
/// where `frac` counts in units of `1 / MIXER_FRAC_ONE` samples.
pub const MIXER_FRAC_BITS: u32 = 16;
pub const MIXER_FRAC_ONE: u32 = 1 << MIXER_FRAC_BITS;
pub const MIXER_FRAC_MASK: u32 = MIXER_FRAC_ONE - 1;

/// Highest pitch multiplier the fixed-point step can express.
pub const MAX_PITCH: u32 = 10;

/// Samples processed per mixing pass, the size of every bus line.
pub const BUFFER_LINE_SIZE: usize = 1024;

/// History kept on each side of the resampler input. Must be even and cover
/// the widest bsinc filter.
pub const MAX_RESAMPLER_PADDING: usize = 48;
pub const MAX_RESAMPLER_EDGE: usize = MAX_RESAMPLER_PADDING / 2;

pub const MAX_OUTPUT_CHANNELS: usize = 16;
pub const MAX_SENDS: usize = 6;

pub const MAX_AMBI_ORDER: usize = 3;
pub const MAX_AMBI_CHANNELS: usize = (MAX_AMBI_ORDER + 1) * (MAX_AMBI_ORDER + 1);
pub const MAX_AMBI_2D_CHANNELS: usize = MAX_AMBI_ORDER * 2 + 1;

pub const GAIN_MIX_MAX: f32 = 1000.0;
pub const GAIN_SILENCE_THRESHOLD: f32 = 0.00001;

pub const SPEED_OF_SOUND_METERS_PER_SEC: f32 = 343.3;
pub const AIR_ABSORB_GAIN_HF: f32 = 0.99426;
pub const REVERB_DECAY_GAIN: f32 = 0.001;

/// Ramp length for a voice fading out after its buffers are released.
pub const FRESH_FADE_SAMPLES: usize = 64;

/// One mixing line of samples.
pub type FloatBufferLine = [f32; BUFFER_LINE_SIZE];

pub fn new_buffer_lines(count: usize) -> Vec<FloatBufferLine> {
    vec![[0.0; BUFFER_LINE_SIZE]; count]
}

/// Converts a pitch multiplier into a fixed-point resampler step.
pub fn pitch_to_step(pitch: f32) -> u32 {
    if !(pitch < MAX_PITCH as f32) {
        return MAX_PITCH << MIXER_FRAC_BITS;
    }
    ((pitch * MIXER_FRAC_ONE as f32).round() as u32).max(1)
}

pub fn ambi_channels_from_order(order: usize) -> usize {
    (order + 1) * (order + 1)
}

pub fn ambi_2d_channels_from_order(order: usize) -> usize {
    order * 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pitch_to_step() {
        assert_eq!(pitch_to_step(1.0), MIXER_FRAC_ONE);
        assert_eq!(pitch_to_step(0.5), MIXER_FRAC_ONE / 2);
        assert_eq!(pitch_to_step(0.0), 1);
        assert_eq!(pitch_to_step(25.0), MAX_PITCH << MIXER_FRAC_BITS);
        assert_eq!(pitch_to_step(f32::INFINITY), MAX_PITCH << MIXER_FRAC_BITS);
    }

    #[test]
    fn test_padding_is_even() {
        assert_eq!(MAX_RESAMPLER_PADDING % 2, 0);
        assert_eq!(ambi_channels_from_order(3), MAX_AMBI_CHANNELS);
        assert_eq!(ambi_2d_channels_from_order(3), MAX_AMBI_2D_CHANNELS);
    }
}
