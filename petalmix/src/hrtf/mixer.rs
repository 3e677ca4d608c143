//! HRIR convolution into a stereo accumulation buffer.
//!
//! Voices and the ambisonic bed both write into the same `[left, right]`
//! accumulator. Each input sample is multiplied by the whole impulse response
//! and added to the following `ir_size` accumulator frames, so the buffer must
//! extend at least `ir_size` frames past the samples being mixed.

use super::{
    HRIR_LENGTH, HRTF_DIRECT_DELAY, HRTF_HISTORY_LENGTH, HrirArray, HrtfFilter, HrtfStore,
};
use crate::defs::{BUFFER_LINE_SIZE, FloatBufferLine, GAIN_SILENCE_THRESHOLD, MAX_AMBI_CHANNELS};
use crate::filters::BandSplitter;

/// Coefficients and gain ramp for one pass of [`mix_hrtf`].
#[derive(Debug, Clone, Copy)]
pub struct HrtfMixParams<'a> {
    pub coeffs: &'a HrirArray,
    pub delay: [usize; 2],
    pub gain: f32,
    pub gain_step: f32,
}

#[inline]
fn apply_coeffs(values: &mut [[f32; 2]], ir_size: usize, coeffs: &HrirArray, left: f32, right: f32) {
    for (value, coeff) in values[..ir_size].iter_mut().zip(coeffs.iter()) {
        value[0] += coeff[0] * left;
        value[1] += coeff[1] * right;
    }
}

/// Convolves `count` samples with ramping gain.
///
/// `input` starts with `HRTF_HISTORY_LENGTH` samples of history, so the per-ear
/// delay is read backwards from there.
pub fn mix_hrtf(
    input: &[f32],
    accum: &mut [[f32; 2]],
    ir_size: usize,
    params: &HrtfMixParams<'_>,
    count: usize,
) {
    let mut ldelay = HRTF_HISTORY_LENGTH - params.delay[0];
    let mut rdelay = HRTF_HISTORY_LENGTH - params.delay[1];
    let mut stepcount = 0.0f32;
    for i in 0..count {
        let g = params.gain + params.gain_step * stepcount;
        let left = input[ldelay] * g;
        let right = input[rdelay] * g;
        apply_coeffs(&mut accum[i..], ir_size, params.coeffs, left, right);
        ldelay += 1;
        rdelay += 1;
        stepcount += 1.0;
    }
}

/// Cross-fades from `old` to `new` over `count` samples: the old response
/// fades out while the new one fades in from silence.
pub fn mix_hrtf_blend(
    input: &[f32],
    accum: &mut [[f32; 2]],
    ir_size: usize,
    old: &HrtfFilter,
    new: &HrtfMixParams<'_>,
    count: usize,
) {
    let old_step = old.gain / count as f32;
    if old.gain > GAIN_SILENCE_THRESHOLD {
        let mut ldelay = HRTF_HISTORY_LENGTH - old.delay[0];
        let mut rdelay = HRTF_HISTORY_LENGTH - old.delay[1];
        let mut stepcount = count as f32;
        for i in 0..count {
            let g = old_step * stepcount;
            let left = input[ldelay] * g;
            let right = input[rdelay] * g;
            apply_coeffs(&mut accum[i..], ir_size, &old.coeffs, left, right);
            ldelay += 1;
            rdelay += 1;
            stepcount -= 1.0;
        }
    }

    if new.gain_step * count as f32 > GAIN_SILENCE_THRESHOLD {
        let mut ldelay = HRTF_HISTORY_LENGTH + 1 - new.delay[0];
        let mut rdelay = HRTF_HISTORY_LENGTH + 1 - new.delay[1];
        let mut stepcount = 1.0f32;
        for i in 1..count {
            let g = new.gain_step * stepcount;
            let left = input[ldelay] * g;
            let right = input[rdelay] * g;
            apply_coeffs(&mut accum[i..], ir_size, new.coeffs, left, right);
            ldelay += 1;
            rdelay += 1;
            stepcount += 1.0;
        }
    }
}

/// Virtual speaker direction, `(elevation, azimuth)` in radians.
type RigPoint = (f32, f32);

const DEG_35: f32 = 6.154797086e-01;
const DEG_45: f32 = std::f32::consts::FRAC_PI_4;
const DEG_69: f32 = 1.205932499e+00;
const DEG_90: f32 = std::f32::consts::FRAC_PI_2;
const DEG_111: f32 = 1.935660155e+00;
const DEG_135: f32 = DEG_45 * 3.0;
const DEG_180: f32 = std::f32::consts::PI;
const DEG_21: f32 = 3.648638281e-01;

const RIG_POINTS_1O: [RigPoint; 8] = [
    (DEG_35, -DEG_45),
    (DEG_35, -DEG_135),
    (DEG_35, DEG_45),
    (DEG_35, DEG_135),
    (-DEG_35, -DEG_45),
    (-DEG_35, -DEG_135),
    (-DEG_35, DEG_45),
    (-DEG_35, DEG_135),
];

const RIG_POINTS_2O: [RigPoint; 20] = [
    (-DEG_35, -DEG_45),
    (-DEG_35, -DEG_135),
    (DEG_35, -DEG_135),
    (DEG_35, DEG_135),
    (DEG_35, DEG_45),
    (-DEG_35, DEG_45),
    (-DEG_35, DEG_135),
    (DEG_35, -DEG_45),
    (-DEG_69, -DEG_90),
    (DEG_69, DEG_90),
    (-DEG_69, DEG_90),
    (DEG_69, -DEG_90),
    (0.0, -DEG_69),
    (0.0, -DEG_111),
    (0.0, DEG_69),
    (0.0, DEG_111),
    (-DEG_21, DEG_180),
    (DEG_21, DEG_180),
    (DEG_21, 0.0),
    (-DEG_21, 0.0),
];

const A: f32 = 1.25e-01;
const RIG_MATRIX_1O: [[f32; 4]; 8] = [
    [A, A, A, A],
    [A, A, A, -A],
    [A, -A, A, A],
    [A, -A, A, -A],
    [A, A, -A, A],
    [A, A, -A, -A],
    [A, -A, -A, A],
    [A, -A, -A, -A],
];

const W: f32 = 5.0e-02;
const P1: f32 = 3.090169944e-02;
const P2: f32 = 8.090169944e-02;
const Q: f32 = 6.454972244e-02;
const RIG_MATRIX_2O: [[f32; 9]; 20] = [
    [W, W, -W, W, Q, -Q, 0.0, -Q, 0.0],
    [W, W, -W, -W, -Q, -Q, 0.0, Q, 0.0],
    [W, W, W, -W, -Q, Q, 0.0, -Q, 0.0],
    [W, -W, W, -W, Q, -Q, 0.0, -Q, 0.0],
    [W, -W, W, W, -Q, -Q, 0.0, Q, 0.0],
    [W, -W, -W, W, -Q, Q, 0.0, -Q, 0.0],
    [W, -W, -W, -W, Q, Q, 0.0, Q, 0.0],
    [W, W, W, W, Q, Q, 0.0, Q, 0.0],
    [W, P1, -P2, 0.0, 0.0, -Q, 9.045084972e-02, 0.0, -1.232790000e-02],
    [W, -P1, P2, 0.0, 0.0, -Q, 9.045084972e-02, 0.0, -1.232790000e-02],
    [W, -P1, -P2, 0.0, 0.0, Q, 9.045084972e-02, 0.0, -1.232790000e-02],
    [W, P1, P2, 0.0, 0.0, Q, 9.045084972e-02, 0.0, -1.232790000e-02],
    [W, P2, 0.0, P1, Q, 0.0, -5.590169944e-02, 0.0, -7.216878365e-02],
    [W, P2, 0.0, -P1, -Q, 0.0, -5.590169944e-02, 0.0, -7.216878365e-02],
    [W, -P2, 0.0, P1, -Q, 0.0, -5.590169944e-02, 0.0, -7.216878365e-02],
    [W, -P2, 0.0, -P1, Q, 0.0, -5.590169944e-02, 0.0, -7.216878365e-02],
    [W, 0.0, -P1, -P2, 0.0, 0.0, -3.454915028e-02, Q, 8.449668365e-02],
    [W, 0.0, P1, -P2, 0.0, 0.0, -3.454915028e-02, -Q, 8.449668365e-02],
    [W, 0.0, P1, P2, 0.0, 0.0, -3.454915028e-02, Q, 8.449668365e-02],
    [W, 0.0, -P1, P2, 0.0, 0.0, -3.454915028e-02, -Q, 8.449668365e-02],
];

const RIG_HF_GAIN_1O: [f32; 2] = [2.000000000e+00, 1.154700538e+00];
const RIG_HF_GAIN_2O: [f32; 3] = [2.357022604e+00, 1.825741858e+00, 9.428090416e-01];

#[derive(Debug, Clone)]
struct HrtfChannelState {
    delay: [f32; HRTF_DIRECT_DELAY],
    splitter: BandSplitter,
    hf_scale: f32,
    coeffs: Box<HrirArray>,
}

/// Renders an ambisonic bus binaurally through a rig of virtual speakers.
///
/// The rig is folded into one impulse response pair per ambisonic channel, so
/// each channel is convolved once regardless of the speaker count.
#[derive(Debug, Clone)]
pub struct DirectHrtfState {
    ir_size: usize,
    temp: Vec<f32>,
    channels: Vec<HrtfChannelState>,
}

impl DirectHrtfState {
    /// Builds the rig for ambisonic `order` (1 or 2; higher orders use the
    /// second-order rig).
    pub fn new(store: &HrtfStore, order: usize, xover_f0norm: f32) -> Self {
        let (points, hf_gain): (&[RigPoint], &[f32]) = if order >= 2 {
            (&RIG_POINTS_2O, &RIG_HF_GAIN_2O)
        } else {
            (&RIG_POINTS_1O, &RIG_HF_GAIN_1O)
        };
        let count = hf_gain.len() * hf_gain.len();
        let row = |point: usize, chan: usize| -> f32 {
            if order >= 2 {
                RIG_MATRIX_2O[point][chan]
            } else {
                RIG_MATRIX_1O[point][chan]
            }
        };

        let responses: Vec<(HrirArray, [usize; 2])> = points
            .iter()
            .map(|(ev, az)| store.coeffs_for(*ev, *az, 0.0))
            .collect();
        let min_delay = responses
            .iter()
            .flat_map(|(_, d)| d.iter().copied())
            .min()
            .unwrap_or(0);
        let max_delay = responses
            .iter()
            .flat_map(|(_, d)| d.iter().copied())
            .max()
            .unwrap_or(0);
        let ir_size = (store.ir_size() + max_delay - min_delay).min(HRIR_LENGTH);

        let mut channels = Vec::with_capacity(count);
        for chan in 0..count.min(MAX_AMBI_CHANNELS) {
            let chan_order = crate::ambi::ORDER_FROM_CHANNEL[chan];
            let mut coeffs = Box::new([[0.0f32; 2]; HRIR_LENGTH]);
            for (point, (hrir, delays)) in responses.iter().enumerate() {
                let mult = row(point, chan);
                if mult == 0.0 {
                    continue;
                }
                for ear in 0..2 {
                    let offset = delays[ear] - min_delay;
                    for (dst, src) in coeffs[offset..ir_size].iter_mut().zip(hrir.iter()) {
                        dst[ear] += src[ear] * mult;
                    }
                }
            }
            channels.push(HrtfChannelState {
                delay: [0.0; HRTF_DIRECT_DELAY],
                splitter: BandSplitter::new(xover_f0norm),
                hf_scale: hf_gain[chan_order] / hf_gain[0],
                coeffs,
            });
        }

        log::info!(
            "Ambisonic HRTF rig: order {}, {} virtual speakers, {} taps",
            order.min(2),
            points.len(),
            ir_size
        );

        Self {
            ir_size,
            temp: vec![0.0; HRTF_DIRECT_DELAY + BUFFER_LINE_SIZE],
            channels,
        }
    }

    pub fn ir_size(&self) -> usize {
        self.ir_size
    }

    /// Number of ambisonic input channels the rig expects.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Adds the binaural render of `input` plus the existing `left`/`right`
    /// content into `accum`, writes the finished samples back to `left` and
    /// `right`, then shifts the accumulator for the next block.
    ///
    /// `accum` holds `BUFFER_LINE_SIZE + HRIR_LENGTH + HRTF_DIRECT_DELAY`
    /// frames; voice HRTF mixing writes at `HRTF_DIRECT_DELAY` so both paths
    /// stay aligned.
    pub fn mix_direct(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        input: &[FloatBufferLine],
        accum: &mut [[f32; 2]],
        todo: usize,
    ) {
        for i in 0..todo {
            accum[HRTF_DIRECT_DELAY + i][0] += left[i];
            accum[HRTF_DIRECT_DELAY + i][1] += right[i];
        }

        let ir_size = self.ir_size;
        for (line, state) in input.iter().zip(self.channels.iter_mut()) {
            // Reverse the input and run the all-pass backwards, which cancels
            // the forward phase shift of the HF scaling below.
            let temp = &mut self.temp[..HRTF_DIRECT_DELAY + todo];
            for (dst, src) in temp[..todo].iter_mut().zip(line[..todo].iter().rev()) {
                *dst = *src;
            }
            temp[todo..].copy_from_slice(&state.delay);
            state.delay.copy_from_slice(&temp[..HRTF_DIRECT_DELAY]);

            state.splitter.apply_allpass(temp);
            let temp = &mut temp[HRTF_DIRECT_DELAY..];
            temp.reverse();
            state.splitter.process_hf_scale(temp, state.hf_scale);

            for (i, sample) in temp.iter().enumerate() {
                apply_coeffs(&mut accum[i..], ir_size, &state.coeffs, *sample, *sample);
            }
        }

        for i in 0..todo {
            left[i] = accum[i][0];
            right[i] = accum[i][1];
        }

        let keep = HRIR_LENGTH + HRTF_DIRECT_DELAY;
        accum.copy_within(todo..todo + keep, 0);
        accum[keep..keep + todo].fill([0.0; 2]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn impulse_coeffs() -> HrirArray {
        let mut coeffs = [[0.0f32; 2]; HRIR_LENGTH];
        coeffs[0] = [1.0, 0.5];
        coeffs
    }

    #[test]
    fn test_mix_hrtf_applies_delay_and_gain() {
        let coeffs = impulse_coeffs();
        let mut input = vec![0.0f32; HRTF_HISTORY_LENGTH + 16];
        input[HRTF_HISTORY_LENGTH] = 1.0;
        let mut accum = vec![[0.0f32; 2]; 16 + HRIR_LENGTH];
        let params = HrtfMixParams {
            coeffs: &coeffs,
            delay: [0, 3],
            gain: 1.0,
            gain_step: 0.0,
        };
        mix_hrtf(&input, &mut accum, 4, &params, 16);

        assert_abs_diff_eq!(accum[0][0], 1.0);
        assert_abs_diff_eq!(accum[0][1], 0.0);
        assert_abs_diff_eq!(accum[3][1], 0.5);
    }

    #[test]
    fn test_blend_fades_in_new_response() {
        let coeffs = impulse_coeffs();
        let input = vec![1.0f32; HRTF_HISTORY_LENGTH + 8];
        let mut accum = vec![[0.0f32; 2]; 8 + HRIR_LENGTH];
        let old = HrtfFilter::default();
        let params = HrtfMixParams {
            coeffs: &coeffs,
            delay: [0, 0],
            gain: 0.0,
            gain_step: 1.0 / 8.0,
        };
        mix_hrtf_blend(&input, &mut accum, 1, &old, &params, 8);
        assert_abs_diff_eq!(accum[0][0], 0.0);
        for i in 1..8 {
            assert_abs_diff_eq!(accum[i][0], i as f32 / 8.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rig_is_left_right_symmetric() {
        let store = HrtfStore::spherical_head(48000);
        let state = DirectHrtfState::new(&store, 1, 400.0 / 48000.0);
        assert_eq!(state.channel_count(), 4);
        assert!(state.ir_size() <= HRIR_LENGTH);
        // W feeds both ears equally.
        let w = &state.channels[0].coeffs;
        let sum = |ear: usize| w.iter().map(|t| t[ear]).sum::<f32>();
        assert_abs_diff_eq!(sum(0), sum(1), epsilon = 1e-4);
    }

    #[test]
    fn test_mix_direct_passes_through_delayed_output() {
        let store = HrtfStore::spherical_head(48000);
        let mut state = DirectHrtfState::new(&store, 1, 400.0 / 48000.0);
        let input = crate::defs::new_buffer_lines(4);
        let mut accum = vec![[0.0f32; 2]; BUFFER_LINE_SIZE + HRIR_LENGTH + HRTF_DIRECT_DELAY];
        let mut left = vec![0.0f32; 64];
        let mut right = vec![0.0f32; 64];
        left[0] = 1.0;

        state.mix_direct(&mut left, &mut right, &input, &mut accum, 64);
        assert!(left.iter().all(|s| *s == 0.0));

        let mut total = 0.0;
        for _ in 0..8 {
            left.fill(0.0);
            state.mix_direct(&mut left, &mut right, &input, &mut accum, 64);
            total += left.iter().sum::<f32>();
        }
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-6);
    }
}
