//! RBJ cookbook biquad, transposed direct form II.

use std::f32::consts::TAU;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiquadType {
    /// Modifies the frequencies above the reference.
    HighShelf,
    /// Modifies the frequencies below the reference.
    LowShelf,
    /// Boosts or cuts a band around the reference.
    Peaking,
    LowPass,
    HighPass,
    BandPass,
}

/// Second-order IIR filter. `f0norm` is the reference frequency divided by the
/// sample rate and must be in (0, 0.5).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadFilter {
    z1: f32,
    z2: f32,
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Default for BiquadFilter {
    fn default() -> Self {
        Self {
            z1: 0.0,
            z2: 0.0,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

/// Reciprocal of Q for a shelf of the given gain and slope (1 = steepest
/// without overshoot).
pub fn rcp_q_from_slope(gain: f32, slope: f32) -> f32 {
    ((gain + 1.0 / gain) * (1.0 / slope - 1.0) + 2.0).sqrt()
}

/// Reciprocal of Q for a bandwidth in octaves.
pub fn rcp_q_from_bandwidth(f0norm: f32, bandwidth: f32) -> f32 {
    let w0 = TAU * f0norm;
    2.0 * (std::f32::consts::LN_2 / 2.0 * bandwidth * w0 / w0.sin()).sinh()
}

impl BiquadFilter {
    pub fn clear(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    /// Sets the coefficients. `gain` is the shelf/peak amplitude and is only
    /// used by the shelf and peaking types.
    pub fn set_params(&mut self, kind: BiquadType, f0norm: f32, gain: f32, rcp_q: f32) {
        let w0 = TAU * f0norm;
        let sin_w0 = w0.sin();
        let cos_w0 = w0.cos();
        let alpha = sin_w0 / 2.0 * rcp_q;

        let mut a = [1.0f32, 0.0, 0.0];
        let mut b = [1.0f32, 0.0, 0.0];
        match kind {
            BiquadType::HighShelf => {
                let sqrtgain_alpha_2 = 2.0 * gain.sqrt() * alpha;
                b[0] = gain * ((gain + 1.0) + (gain - 1.0) * cos_w0 + sqrtgain_alpha_2);
                b[1] = -2.0 * gain * ((gain - 1.0) + (gain + 1.0) * cos_w0);
                b[2] = gain * ((gain + 1.0) + (gain - 1.0) * cos_w0 - sqrtgain_alpha_2);
                a[0] = (gain + 1.0) - (gain - 1.0) * cos_w0 + sqrtgain_alpha_2;
                a[1] = 2.0 * ((gain - 1.0) - (gain + 1.0) * cos_w0);
                a[2] = (gain + 1.0) - (gain - 1.0) * cos_w0 - sqrtgain_alpha_2;
            }
            BiquadType::LowShelf => {
                let sqrtgain_alpha_2 = 2.0 * gain.sqrt() * alpha;
                b[0] = gain * ((gain + 1.0) - (gain - 1.0) * cos_w0 + sqrtgain_alpha_2);
                b[1] = 2.0 * gain * ((gain - 1.0) - (gain + 1.0) * cos_w0);
                b[2] = gain * ((gain + 1.0) - (gain - 1.0) * cos_w0 - sqrtgain_alpha_2);
                a[0] = (gain + 1.0) + (gain - 1.0) * cos_w0 + sqrtgain_alpha_2;
                a[1] = -2.0 * ((gain - 1.0) + (gain + 1.0) * cos_w0);
                a[2] = (gain + 1.0) + (gain - 1.0) * cos_w0 - sqrtgain_alpha_2;
            }
            BiquadType::Peaking => {
                b[0] = 1.0 + alpha * gain;
                b[1] = -2.0 * cos_w0;
                b[2] = 1.0 - alpha * gain;
                a[0] = 1.0 + alpha / gain;
                a[1] = -2.0 * cos_w0;
                a[2] = 1.0 - alpha / gain;
            }
            BiquadType::LowPass => {
                b[0] = (1.0 - cos_w0) / 2.0;
                b[1] = 1.0 - cos_w0;
                b[2] = (1.0 - cos_w0) / 2.0;
                a[0] = 1.0 + alpha;
                a[1] = -2.0 * cos_w0;
                a[2] = 1.0 - alpha;
            }
            BiquadType::HighPass => {
                b[0] = (1.0 + cos_w0) / 2.0;
                b[1] = -(1.0 + cos_w0);
                b[2] = (1.0 + cos_w0) / 2.0;
                a[0] = 1.0 + alpha;
                a[1] = -2.0 * cos_w0;
                a[2] = 1.0 - alpha;
            }
            BiquadType::BandPass => {
                b[0] = alpha;
                b[1] = 0.0;
                b[2] = -alpha;
                a[0] = 1.0 + alpha;
                a[1] = -2.0 * cos_w0;
                a[2] = 1.0 - alpha;
            }
        }

        self.a1 = a[1] / a[0];
        self.a2 = a[2] / a[0];
        self.b0 = b[0] / a[0];
        self.b1 = b[1] / a[0];
        self.b2 = b[2] / a[0];
    }

    /// Shelf parameters from a slope. The gain is floored at -60dB.
    pub fn set_params_from_slope(&mut self, kind: BiquadType, f0norm: f32, gain: f32, slope: f32) {
        let gain = gain.max(0.001);
        self.set_params(kind, f0norm, gain, rcp_q_from_slope(gain, slope));
    }

    pub fn set_params_from_bandwidth(
        &mut self,
        kind: BiquadType,
        f0norm: f32,
        gain: f32,
        bandwidth: f32,
    ) {
        self.set_params(kind, f0norm, gain, rcp_q_from_bandwidth(f0norm, bandwidth));
    }

    /// Takes the coefficients of `other`, keeping this filter's history.
    pub fn copy_params_from(&mut self, other: &BiquadFilter) {
        self.b0 = other.b0;
        self.b1 = other.b1;
        self.b2 = other.b2;
        self.a1 = other.a1;
        self.a2 = other.a2;
    }

    pub fn process(&mut self, src: &[f32], dst: &mut [f32]) {
        let (b0, b1, b2, a1, a2) = (self.b0, self.b1, self.b2, self.a1, self.a2);
        let mut z1 = self.z1;
        let mut z2 = self.z2;
        for (out, &input) in dst.iter_mut().zip(src) {
            let output = input * b0 + z1;
            z1 = input * b1 - output * a1 + z2;
            z2 = input * b2 - output * a2;
            *out = output;
        }
        self.z1 = z1;
        self.z2 = z2;
    }

    pub fn process_in_place(&mut self, samples: &mut [f32]) {
        let (b0, b1, b2, a1, a2) = (self.b0, self.b1, self.b2, self.a1, self.a2);
        let mut z1 = self.z1;
        let mut z2 = self.z2;
        for s in samples.iter_mut() {
            let input = *s;
            let output = input * b0 + z1;
            z1 = input * b1 - output * a1 + z2;
            z2 = input * b2 - output * a2;
            *s = output;
        }
        self.z1 = z1;
        self.z2 = z2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn settle(filter: &mut BiquadFilter, freq_norm: f32) -> f32 {
        let input: Vec<f32> = (0..8192)
            .map(|i| (TAU * freq_norm * i as f32).sin())
            .collect();
        let mut out = vec![0.0; input.len()];
        filter.process(&input, &mut out);
        out[4096..].iter().fold(0.0f32, |m, v| m.max(v.abs()))
    }

    #[test]
    fn test_default_is_passthrough() {
        let mut filter = BiquadFilter::default();
        let src = [0.25f32, -0.5, 1.0, 0.0];
        let mut dst = [0.0f32; 4];
        filter.process(&src, &mut dst);
        assert_eq!(src, dst);
    }

    #[test]
    fn test_high_shelf_unity_gain_is_flat() {
        let mut filter = BiquadFilter::default();
        filter.set_params_from_slope(BiquadType::HighShelf, 5000.0 / 48000.0, 1.0, 1.0);
        assert_abs_diff_eq!(settle(&mut filter, 0.2), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_high_shelf_cuts_highs_only() {
        let mut lows = BiquadFilter::default();
        lows.set_params_from_slope(BiquadType::HighShelf, 5000.0 / 48000.0, 0.25, 1.0);
        let mut highs = lows;
        assert_abs_diff_eq!(settle(&mut lows, 50.0 / 48000.0), 1.0, epsilon = 0.02);
        assert!(settle(&mut highs, 0.4) < 0.3);
    }

    #[test]
    fn test_low_shelf_cuts_lows() {
        let mut filter = BiquadFilter::default();
        filter.set_params_from_slope(BiquadType::LowShelf, 250.0 / 48000.0, 0.1, 1.0);
        let mut highs = filter;
        assert!(settle(&mut filter, 20.0 / 48000.0) < 0.2);
        assert_abs_diff_eq!(settle(&mut highs, 0.25), 1.0, epsilon = 0.02);
    }

    #[test]
    fn test_rcp_q_from_slope_unity() {
        assert_abs_diff_eq!(rcp_q_from_slope(1.0, 1.0), 2f32.sqrt(), epsilon = 1e-6);
    }
}
