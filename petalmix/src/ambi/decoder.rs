use std::f32::consts::FRAC_PI_2;

use super::ORDER_FROM_2D_CHANNEL;
use crate::config::{Channel, OutputLayout};
use crate::defs::{
    BUFFER_LINE_SIZE, FloatBufferLine, MAX_AMBI_ORDER, MAX_OUTPUT_CHANNELS,
    ambi_2d_channels_from_order, new_buffer_lines,
};
use crate::filters::BandSplitter;
use crate::mixer::kernels::mix_constant;

/// A horizontal ambisonic decoder for a speaker layout.
///
/// Coefficient rows are per speaker, in ACN-2D order, and are scaled by the
/// per-order gains when the decoder is built.
#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub order: usize,
    pub channels: &'static [Channel],
    pub hf_order_gain: &'static [f32],
    pub coeffs: &'static [&'static [f32]],
    /// Present for layouts with a dual-band (HF/LF) decode.
    pub lf_order_gain: Option<&'static [f32]>,
}

const MONO: DecoderConfig = DecoderConfig {
    order: 0,
    channels: &[Channel::FrontCenter],
    hf_order_gain: &[1.0],
    coeffs: &[&[1.0]],
    lf_order_gain: None,
};

const STEREO: DecoderConfig = DecoderConfig {
    order: 1,
    channels: &[Channel::FrontLeft, Channel::FrontRight],
    hf_order_gain: &[1.0, 1.0],
    coeffs: &[
        &[5.00000000e-1, 2.88675135e-1, 5.52305643e-2],
        &[5.00000000e-1, -2.88675135e-1, 5.52305643e-2],
    ],
    lf_order_gain: None,
};

const QUAD: DecoderConfig = DecoderConfig {
    order: 2,
    channels: &[
        Channel::BackLeft,
        Channel::FrontLeft,
        Channel::FrontRight,
        Channel::BackRight,
    ],
    hf_order_gain: &[1.15470054, 1.00000000, 5.77350269e-1],
    coeffs: &[
        &[2.50000000e-1, 2.04124145e-1, -2.04124145e-1, -1.29099445e-1, 0.0],
        &[2.50000000e-1, 2.04124145e-1, 2.04124145e-1, 1.29099445e-1, 0.0],
        &[2.50000000e-1, -2.04124145e-1, 2.04124145e-1, -1.29099445e-1, 0.0],
        &[2.50000000e-1, -2.04124145e-1, -2.04124145e-1, 1.29099445e-1, 0.0],
    ],
    lf_order_gain: Some(&[1.0, 1.0, 1.0]),
};

const X51_COEFFS: &[&[f32]] = &[
    &[3.33000782e-1, 1.89084803e-1, -2.00042375e-1, -2.12307769e-2, -1.14579885e-2],
    &[1.88542860e-1, 1.27709292e-1, 1.66295695e-1, 7.30571517e-2, 2.10901184e-2],
    &[1.88542860e-1, -1.27709292e-1, 1.66295695e-1, -7.30571517e-2, 2.10901184e-2],
    &[3.33000782e-1, -1.89084803e-1, -2.00042375e-1, 2.12307769e-2, -1.14579885e-2],
];

const X51: DecoderConfig = DecoderConfig {
    order: 2,
    channels: &[
        Channel::SideLeft,
        Channel::FrontLeft,
        Channel::FrontRight,
        Channel::SideRight,
    ],
    hf_order_gain: &[1.0, 1.0, 1.0],
    coeffs: X51_COEFFS,
    lf_order_gain: None,
};

const X51_REAR: DecoderConfig = DecoderConfig {
    order: 2,
    channels: &[
        Channel::BackLeft,
        Channel::FrontLeft,
        Channel::FrontRight,
        Channel::BackRight,
    ],
    hf_order_gain: &[1.0, 1.0, 1.0],
    coeffs: X51_COEFFS,
    lf_order_gain: None,
};

const X61: DecoderConfig = DecoderConfig {
    order: 2,
    channels: &[
        Channel::SideLeft,
        Channel::FrontLeft,
        Channel::FrontRight,
        Channel::SideRight,
        Channel::BackCenter,
    ],
    hf_order_gain: &[1.0, 1.0, 1.0],
    coeffs: &[
        &[2.04460341e-1, 2.17177926e-1, -4.39996780e-2, -2.60790269e-2, -6.87239792e-2],
        &[1.58923161e-1, 9.21772680e-2, 1.59658796e-1, 6.66278083e-2, 3.84686854e-2],
        &[1.58923161e-1, -9.21772680e-2, 1.59658796e-1, -6.66278083e-2, 3.84686854e-2],
        &[2.04460341e-1, -2.17177926e-1, -4.39996780e-2, 2.60790269e-2, -6.87239792e-2],
        &[2.50001688e-1, 0.0, -2.50000094e-1, 0.0, 6.05133395e-2],
    ],
    lf_order_gain: None,
};

const X71: DecoderConfig = DecoderConfig {
    order: 3,
    channels: &[
        Channel::BackLeft,
        Channel::SideLeft,
        Channel::FrontLeft,
        Channel::FrontRight,
        Channel::SideRight,
        Channel::BackRight,
    ],
    hf_order_gain: &[1.22474487, 1.13151672, 8.66025404e-1, 4.68689571e-1],
    coeffs: &[
        &[1.66666667e-1, 9.62250449e-2, -1.66666667e-1, -1.49071198e-1, 8.60662966e-2, 7.96819073e-2, 0.0],
        &[1.66666667e-1, 1.92450090e-1, 0.0, 0.0, -1.72132593e-1, -7.96819073e-2, 0.0],
        &[1.66666667e-1, 9.62250449e-2, 1.66666667e-1, 1.49071198e-1, 8.60662966e-2, 7.96819073e-2, 0.0],
        &[1.66666667e-1, -9.62250449e-2, 1.66666667e-1, -1.49071198e-1, 8.60662966e-2, -7.96819073e-2, 0.0],
        &[1.66666667e-1, -1.92450090e-1, 0.0, 0.0, -1.72132593e-1, 7.96819073e-2, 0.0],
        &[1.66666667e-1, -9.62250449e-2, -1.66666667e-1, 1.49071198e-1, 8.60662966e-2, -7.96819073e-2, 0.0],
    ],
    lf_order_gain: Some(&[1.0, 1.0, 1.0, 1.0]),
};

/// Built-in decoder for a speaker layout, `None` for raw B-format output.
pub fn builtin_decoder(layout: OutputLayout) -> Option<DecoderConfig> {
    match layout {
        OutputLayout::Mono => Some(MONO),
        OutputLayout::Stereo => Some(STEREO),
        OutputLayout::Quad => Some(QUAD),
        OutputLayout::X51 => Some(X51),
        OutputLayout::X51Rear => Some(X51_REAR),
        OutputLayout::X61 => Some(X61),
        OutputLayout::X71 => Some(X71),
        OutputLayout::Ambi3D { .. } => None,
    }
}

const DECODER_HF_SCALE_1O: [f32; MAX_AMBI_ORDER + 1] = [1.0, 1.0, 0.0, 0.0];
const DECODER_HF_SCALE_2O: [f32; MAX_AMBI_ORDER + 1] = [7.45355990e-1, 1.0, 1.0, 0.0];
const DECODER_HF_SCALE_3O: [f32; MAX_AMBI_ORDER + 1] = [5.89792205e-1, 8.79693856e-1, 1.0, 1.0];

fn decoder_hf_scales(order: usize) -> &'static [f32; MAX_AMBI_ORDER + 1] {
    match order {
        0 | 1 => &DECODER_HF_SCALE_1O,
        2 => &DECODER_HF_SCALE_2O,
        _ => &DECODER_HF_SCALE_3O,
    }
}

/// Per-order HF scales for mixing `in_order` B-format into an `out_order` bus.
pub fn hf_order_scales(in_order: usize, out_order: usize) -> [f32; MAX_AMBI_ORDER + 1] {
    debug_assert!(out_order >= in_order);
    let target = decoder_hf_scales(out_order);
    let input = decoder_hf_scales(in_order);

    let mut ret = [0.0f32; MAX_AMBI_ORDER + 1];
    for i in 0..=in_order.min(MAX_AMBI_ORDER) {
        ret[i] = input[i] / target[i];
    }
    ret
}

const HF_BAND: usize = 0;
const LF_BAND: usize = 1;

#[derive(Debug, Clone)]
struct ChannelDecoder {
    gains: [[f32; MAX_OUTPUT_CHANNELS]; 2],
    xover: BandSplitter,
}

/// Decodes an ambisonic bus to speaker feeds.
#[derive(Debug)]
pub struct BFormatDec {
    channels: Vec<ChannelDecoder>,
    dual_band: bool,
    samples: Vec<FloatBufferLine>,
    stabilizer: Option<Box<FrontStabilizer>>,
}

impl BFormatDec {
    /// Builds the decoder for `config`, mapping its speakers onto `real_out`.
    ///
    /// Speakers missing from `real_out` are skipped. `xover_f0norm` is the
    /// crossover frequency over the sample rate, used for dual-band decoding.
    pub fn new(
        config: &DecoderConfig,
        real_out: &[Channel],
        dual_band: bool,
        xover_f0norm: f32,
        stabilizer: Option<Box<FrontStabilizer>>,
    ) -> Self {
        let dual_band = dual_band && config.lf_order_gain.is_some();
        let num_inputs = ambi_2d_channels_from_order(config.order);

        let mut xover = BandSplitter::default();
        if dual_band {
            xover.init(xover_f0norm);
        }

        let mut channels = vec![
            ChannelDecoder {
                gains: [[0.0; MAX_OUTPUT_CHANNELS]; 2],
                xover,
            };
            num_inputs
        ];

        for (speaker, row) in config.channels.iter().zip(config.coeffs.iter()) {
            let Some(out_idx) = real_out.iter().position(|c| c == speaker) else {
                log::warn!("Decoder speaker {:?} is not in the output layout", speaker);
                continue;
            };
            for (j, dec) in channels.iter_mut().enumerate() {
                let order = ORDER_FROM_2D_CHANNEL[j];
                let coeff = row.get(j).copied().unwrap_or(0.0);
                dec.gains[HF_BAND][out_idx] = coeff * config.hf_order_gain[order];
                if let Some(lf) = config.lf_order_gain.filter(|_| dual_band) {
                    dec.gains[LF_BAND][out_idx] = coeff * lf[order];
                }
            }
        }

        Self {
            channels,
            dual_band,
            samples: new_buffer_lines(2),
            stabilizer,
        }
    }

    /// Builds a decoder from explicit per-input gain rows, `coeffs[input][output]`.
    pub fn from_matrix(
        coeffs: &[[f32; MAX_OUTPUT_CHANNELS]],
        coeffs_lf: Option<&[[f32; MAX_OUTPUT_CHANNELS]]>,
        xover_f0norm: f32,
    ) -> Self {
        let mut xover = BandSplitter::default();
        if coeffs_lf.is_some() {
            xover.init(xover_f0norm);
        }
        let channels = coeffs
            .iter()
            .enumerate()
            .map(|(j, hf)| ChannelDecoder {
                gains: [
                    *hf,
                    coeffs_lf
                        .and_then(|lf| lf.get(j))
                        .copied()
                        .unwrap_or([0.0; MAX_OUTPUT_CHANNELS]),
                ],
                xover,
            })
            .collect();

        Self {
            channels,
            dual_band: coeffs_lf.is_some(),
            samples: new_buffer_lines(2),
            stabilizer: None,
        }
    }

    pub fn input_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn is_dual_band(&self) -> bool {
        self.dual_band
    }

    pub fn has_stabilizer(&self) -> bool {
        self.stabilizer.is_some()
    }

    /// Decodes `input` and adds the speaker feeds to `out`.
    pub fn process(&mut self, out: &mut [FloatBufferLine], input: &[FloatBufferLine], todo: usize) {
        let [hf, lf] = &mut self.samples[..] else {
            return;
        };
        for (dec, line) in self.channels.iter_mut().zip(input) {
            if self.dual_band {
                dec.xover.process(&line[..todo], &mut hf[..todo], &mut lf[..todo]);
                mix_constant(&hf[..todo], out, &dec.gains[HF_BAND]);
                mix_constant(&lf[..todo], out, &dec.gains[LF_BAND]);
            } else {
                mix_constant(&line[..todo], out, &dec.gains[HF_BAND]);
            }
        }
    }

    /// Decodes with the front stabilizer when one is attached, otherwise the
    /// same as [`process`](Self::process).
    pub fn process_stabilized(
        &mut self,
        out: &mut [FloatBufferLine],
        input: &[FloatBufferLine],
        todo: usize,
    ) {
        let Some(mut stab) = self.stabilizer.take() else {
            self.process(out, input, todo);
            return;
        };
        stab.pre_process(out, todo);
        self.process(out, input, todo);
        stab.post_process(out, todo);
        self.stabilizer = Some(stab);
    }
}

/// Re-synthesizes a center image for layouts whose decoder leaves the center
/// speaker silent.
///
/// Everything except the front left/right pair is delayed so the all-passed
/// mid signal lines up, then part of the mid signal is moved to the center.
#[derive(Debug)]
pub struct FrontStabilizer {
    lidx: usize,
    ridx: usize,
    cidx: usize,
    delay_buf: Vec<[f32; Self::DELAY_LENGTH]>,
    mid_filter: BandSplitter,
    mid_direct: Vec<f32>,
    side: Vec<f32>,
    temp: Vec<f32>,
    mid_delay: [f32; Self::DELAY_LENGTH],
    mid_hf: Box<FloatBufferLine>,
    mid_lf: Box<FloatBufferLine>,
}

impl FrontStabilizer {
    pub const DELAY_LENGTH: usize = 256;

    /// Creates a stabilizer when `real_out` has front left, right and center
    /// speakers.
    pub fn new(real_out: &[Channel], sample_rate: u32) -> Option<Box<Self>> {
        let find = |ch: Channel| real_out.iter().position(|c| *c == ch);
        let lidx = find(Channel::FrontLeft)?;
        let ridx = find(Channel::FrontRight)?;
        let cidx = find(Channel::FrontCenter)?;

        Some(Box::new(Self {
            lidx,
            ridx,
            cidx,
            delay_buf: vec![[0.0; Self::DELAY_LENGTH]; real_out.len()],
            mid_filter: BandSplitter::new(5000.0 / sample_rate as f32),
            mid_direct: vec![0.0; BUFFER_LINE_SIZE + Self::DELAY_LENGTH],
            side: vec![0.0; BUFFER_LINE_SIZE + Self::DELAY_LENGTH],
            temp: vec![0.0; BUFFER_LINE_SIZE + Self::DELAY_LENGTH],
            mid_delay: [0.0; Self::DELAY_LENGTH],
            mid_hf: Box::new([0.0; BUFFER_LINE_SIZE]),
            mid_lf: Box::new([0.0; BUFFER_LINE_SIZE]),
        }))
    }

    /// Moves any direct front signal out of the way of the decode.
    fn pre_process(&mut self, out: &mut [FloatBufferLine], todo: usize) {
        const DL: usize = FrontStabilizer::DELAY_LENGTH;
        for i in 0..todo {
            let l = out[self.lidx][i];
            let r = out[self.ridx][i];
            self.mid_direct[DL + i] = l + r;
            self.side[DL + i] = l - r;
        }
        out[self.lidx][..todo].fill(0.0);
        out[self.ridx][..todo].fill(0.0);
    }

    fn post_process(&mut self, out: &mut [FloatBufferLine], todo: usize) {
        const DL: usize = FrontStabilizer::DELAY_LENGTH;

        for (i, line) in out.iter_mut().enumerate() {
            if i == self.lidx || i == self.ridx {
                continue;
            }
            let Some(delay) = self.delay_buf.get_mut(i) else {
                continue;
            };
            apply_delay(&mut line[..todo], delay);
        }

        for i in 0..todo {
            self.side[DL + i] += out[self.lidx][i] - out[self.ridx][i];
        }

        // The mid signal is stored newest-first so the all-pass runs backwards
        // in time, cancelling the band splitter's phase shift afterwards.
        let tmp = &mut self.temp[..todo + DL];
        tmp[todo..].copy_from_slice(&self.mid_delay);
        for i in 0..todo {
            tmp[todo - 1 - i] = out[self.lidx][i] + out[self.ridx][i];
        }
        self.mid_delay.copy_from_slice(&tmp[..DL]);

        self.mid_filter.apply_allpass(tmp);
        let tmp = &mut tmp[DL..];
        tmp.reverse();

        self.mid_filter
            .process(tmp, &mut self.mid_hf[..todo], &mut self.mid_lf[..todo]);

        // Low frequencies pan a third of the way to center, highs a quarter.
        let (sin_lf, cos_lf) = (FRAC_PI_2 / 3.0).sin_cos();
        let (sin_hf, cos_hf) = (FRAC_PI_2 / 4.0).sin_cos();
        for i in 0..todo {
            let m = self.mid_lf[i] * cos_lf + self.mid_hf[i] * cos_hf + self.mid_direct[i];
            let c = self.mid_lf[i] * sin_lf + self.mid_hf[i] * sin_hf;
            let s = self.side[i];

            out[self.lidx][i] = (m + s) * 0.5;
            out[self.ridx][i] = (m - s) * 0.5;
            out[self.cidx][i] += c * 0.5;
        }

        self.mid_direct.copy_within(todo..todo + DL, 0);
        self.side.copy_within(todo..todo + DL, 0);
    }
}

/// Delays `samples` by the length of `delay`, which carries the tail between
/// calls.
pub(crate) fn apply_delay(samples: &mut [f32], delay: &mut [f32]) {
    let base = delay.len();
    if base == 0 {
        return;
    }
    if samples.len() >= base {
        samples.rotate_right(base);
        samples[..base].swap_with_slice(delay);
    } else {
        let n = samples.len();
        samples.swap_with_slice(&mut delay[..n]);
        delay.rotate_left(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambi::{acn_map, calc_angle_coeffs, compute_pan_gains};
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_hf_order_scales() {
        let s = hf_order_scales(1, 3);
        assert_abs_diff_eq!(s[0], 1.0 / 5.89792205e-1, epsilon = 1e-5);
        assert_abs_diff_eq!(s[1], 1.0 / 8.79693856e-1, epsilon = 1e-5);
        assert_eq!(s[2], 0.0);
        let same = hf_order_scales(2, 2);
        assert_abs_diff_eq!(same[0], 1.0);
        assert_abs_diff_eq!(same[2], 1.0);
    }

    #[test]
    fn test_stereo_decode_favors_panned_side() {
        let layout = OutputLayout::Stereo;
        let config = builtin_decoder(layout).unwrap();
        let mut dec = BFormatDec::new(&config, layout.channels(), false, 0.01, None);
        assert_eq!(dec.input_channels(), 3);

        // Encode a source hard left into a first-order 2D bus (W, Y, X).
        let coeffs = calc_angle_coeffs(-FRAC_PI_2, 0.0, 0.0);
        let map: Vec<_> = crate::ambi::FROM_ACN_2D[..3]
            .iter()
            .map(|i| crate::ambi::BFChannelConfig::new(*i as usize, 1.0))
            .collect();
        let mut gains = [0.0; MAX_OUTPUT_CHANNELS];
        compute_pan_gains(&map, &coeffs, 1.0, &mut gains);

        let mut input = new_buffer_lines(3);
        for (line, g) in input.iter_mut().zip(gains.iter()) {
            line[..16].fill(*g);
        }
        let mut out = new_buffer_lines(2);
        dec.process(&mut out, &input, 16);
        assert!(out[0][0] > 0.9);
        assert!(out[1][0].abs() < 0.1);
    }

    #[test]
    fn test_quad_is_dual_band_when_requested() {
        let layout = OutputLayout::Quad;
        let config = builtin_decoder(layout).unwrap();
        assert!(BFormatDec::new(&config, layout.channels(), true, 0.01, None).is_dual_band());
        assert!(!BFormatDec::new(&config, layout.channels(), false, 0.01, None).is_dual_band());
        let x51 = builtin_decoder(OutputLayout::X51).unwrap();
        assert!(!BFormatDec::new(&x51, OutputLayout::X51.channels(), true, 0.01, None).is_dual_band());
    }

    #[test]
    fn test_stabilizer_needs_center() {
        assert!(FrontStabilizer::new(OutputLayout::Stereo.channels(), 48000).is_none());
        assert!(FrontStabilizer::new(OutputLayout::X51.channels(), 48000).is_some());
    }

    #[test]
    fn test_apply_delay_short_and_long_blocks() {
        let mut delay = [0.0f32; 4];
        let mut a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        apply_delay(&mut a, &mut delay);
        assert_eq!(a, [0.0, 0.0, 0.0, 0.0, 1.0, 2.0]);
        assert_eq!(delay, [3.0, 4.0, 5.0, 6.0]);

        let mut b = [7.0, 8.0];
        apply_delay(&mut b, &mut delay);
        assert_eq!(b, [3.0, 4.0]);
        assert_eq!(delay, [5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_identity_matrix_decoder() {
        let mut rows = [[0.0f32; MAX_OUTPUT_CHANNELS]; 4];
        for (i, row) in rows.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        let mut dec = BFormatDec::from_matrix(&rows, None, 0.01);
        let mut input = new_buffer_lines(4);
        let mut gains = [0.0; MAX_OUTPUT_CHANNELS];
        compute_pan_gains(&acn_map(4), &calc_angle_coeffs(0.0, 0.0, 0.0), 1.0, &mut gains);
        for (line, g) in input.iter_mut().zip(gains.iter()) {
            line[0] = *g;
        }
        let mut out = new_buffer_lines(4);
        dec.process(&mut out, &input, 1);
        for c in 0..4 {
            assert_abs_diff_eq!(out[c][0], gains[c]);
        }
    }
}
