//! Inner mixing loops shared by voices, effects and the output stage.

use crate::defs::{FloatBufferLine, GAIN_SILENCE_THRESHOLD};

/// Mixes `src` into every line of `out` starting at `out_pos`, stepping each
/// channel's gain linearly from `current` to `target` over `counter` samples.
///
/// `current` is updated to the gain reached at the end of `src`. Once the ramp
/// is done the remaining samples use the target gain, and silent channels are
/// skipped.
pub fn mix_samples(
    src: &[f32],
    out: &mut [FloatBufferLine],
    current: &mut [f32],
    target: &[f32],
    counter: usize,
    out_pos: usize,
) {
    let delta = if counter > 0 { 1.0 / counter as f32 } else { 0.0 };
    let min_len = counter.min(src.len());

    for ((line, cur), tgt) in out.iter_mut().zip(current.iter_mut()).zip(target.iter()) {
        let dst = &mut line[out_pos..out_pos + src.len()];
        let mut gain = *cur;
        let step = (*tgt - gain) * delta;

        let mut pos = 0;
        if !(step.abs() > f32::EPSILON) {
            gain = *tgt;
        } else {
            let mut step_count = 0.0f32;
            while pos < min_len {
                dst[pos] += src[pos] * (gain + step * step_count);
                step_count += 1.0;
                pos += 1;
            }
            if pos == counter {
                gain = *tgt;
            } else {
                gain += step * step_count;
            }
        }
        *cur = gain;

        if !(gain.abs() > GAIN_SILENCE_THRESHOLD) {
            continue;
        }
        for (d, s) in dst[pos..].iter_mut().zip(&src[pos..]) {
            *d += *s * gain;
        }
    }
}

/// Mixes `src` into `out` with fixed per-channel gains.
pub fn mix_constant(src: &[f32], out: &mut [FloatBufferLine], gains: &[f32]) {
    for (line, gain) in out.iter_mut().zip(gains.iter()) {
        if !(gain.abs() > GAIN_SILENCE_THRESHOLD) {
            continue;
        }
        for (d, s) in line.iter_mut().zip(src) {
            *d += *s * gain;
        }
    }
}

/// Accumulates a weighted sum of input lines into a single output line.
pub fn mix_row(out: &mut [f32], gains: &[f32], inputs: &[FloatBufferLine], in_pos: usize) {
    for (input, gain) in inputs.iter().zip(gains.iter()) {
        if !(gain.abs() > GAIN_SILENCE_THRESHOLD) {
            continue;
        }
        let src = &input[in_pos..in_pos + out.len()];
        for (d, s) in out.iter_mut().zip(src) {
            *d += *s * gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::new_buffer_lines;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_ramp_is_linear_and_lands_on_target() {
        let src = [1.0f32; 16];
        let mut out = new_buffer_lines(1);
        let mut current = [0.0f32];
        mix_samples(&src, &mut out, &mut current, &[1.0], 8, 0);

        for i in 0..8 {
            assert_abs_diff_eq!(out[0][i], i as f32 / 8.0, epsilon = 1e-6);
        }
        for i in 8..16 {
            assert_abs_diff_eq!(out[0][i], 1.0);
        }
        assert_eq!(current[0], 1.0);
    }

    #[test]
    fn test_partial_ramp_keeps_progress() {
        let src = [1.0f32; 4];
        let mut out = new_buffer_lines(1);
        let mut current = [0.0f32];
        mix_samples(&src, &mut out, &mut current, &[1.0], 8, 0);
        assert_abs_diff_eq!(current[0], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_silent_target_skips_tail() {
        let src = [1.0f32; 8];
        let mut out = new_buffer_lines(2);
        let mut current = [0.0f32, 0.5];
        mix_samples(&src, &mut out, &mut current, &[0.0, 0.5], 0, 4);
        assert!(out[0].iter().all(|s| *s == 0.0));
        assert_eq!(out[1][3], 0.0);
        assert_eq!(out[1][4], 0.5);
        assert_eq!(out[1][11], 0.5);
    }

    #[test]
    fn test_mix_row_sums_inputs() {
        let mut inputs = new_buffer_lines(2);
        inputs[0][..4].fill(1.0);
        inputs[1][..4].fill(2.0);
        let mut out = [0.0f32; 4];
        mix_row(&mut out, &[0.5, 0.25], &inputs, 0);
        assert!(out.iter().all(|s| *s == 1.0));
    }
}
