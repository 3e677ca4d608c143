//! Two-channel UHJ encoding.
//!
//! ```text
//! S = 0.9396926*W + 0.1855740*X
//! D = j(-0.3420201*W + 0.5098604*X) + 0.6554516*Y
//!
//! Left  = (S + D)/2
//! Right = (S - D)/2
//! ```
//!
//! where `j` is a wide-band +90 degree phase shift, applied with a FIR filter
//! whose every other tap is zero.

use std::f64::consts::PI;
use std::sync::OnceLock;

use crate::defs::{BUFFER_LINE_SIZE, FloatBufferLine};

const FILTER_SIZE: usize = 128;

/// Non-zero taps of the phase shifter, reversed.
fn phase_shift_coeffs() -> &'static [f32; FILTER_SIZE] {
    static COEFFS: OnceLock<[f32; FILTER_SIZE]> = OnceLock::new();
    COEFFS.get_or_init(|| {
        // Taps of a +90 degree shift of a centered impulse in a 256-point
        // periodic frame: -(2/N) * cot(pi * n / N) for odd offsets n.
        let n_fft = (FILTER_SIZE * 2) as f64;
        let mut coeffs = [0.0f32; FILTER_SIZE];
        for (i, c) in coeffs.iter_mut().enumerate() {
            let offset = (FILTER_SIZE - 1) as f64 - 2.0 * i as f64;
            let angle = PI * offset / n_fft;
            *c = (-(2.0 / n_fft) * angle.cos() / angle.sin()) as f32;
        }
        coeffs
    })
}

fn allpass_process(dst: &mut [f32], src: &[f32]) {
    let coeffs = phase_shift_coeffs();
    for (i, out) in dst.iter_mut().enumerate() {
        let mut ret = 0.0f32;
        for (j, c) in coeffs.iter().enumerate() {
            ret += src[i + j * 2] * c;
        }
        *out += ret;
    }
}

/// Stateful UHJ encoder for a first-order horizontal B-format bus.
///
/// Input must be in FuMa order and scaling (W, X, Y). The output is delayed by
/// the filter size.
#[derive(Debug)]
pub struct Uhj2Encoder {
    mid_delay: [f32; FILTER_SIZE],
    side_delay: [f32; FILTER_SIZE],
    mid: Vec<f32>,
    side: Vec<f32>,
    side_history: [f32; FILTER_SIZE * 2 - 1],
    temp: Vec<f32>,
}

impl Default for Uhj2Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Uhj2Encoder {
    pub const FILTER_SIZE: usize = FILTER_SIZE;

    pub fn new() -> Self {
        Self {
            mid_delay: [0.0; FILTER_SIZE],
            side_delay: [0.0; FILTER_SIZE],
            mid: vec![0.0; BUFFER_LINE_SIZE + FILTER_SIZE],
            side: vec![0.0; BUFFER_LINE_SIZE + FILTER_SIZE],
            side_history: [0.0; FILTER_SIZE * 2 - 1],
            temp: vec![0.0; BUFFER_LINE_SIZE + FILTER_SIZE * 2],
        }
    }

    /// Encodes `input` into `left`/`right`, mixing with any direct signal
    /// already present there.
    pub fn encode(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        input: &[FloatBufferLine],
        todo: usize,
    ) {
        let [w, x, y, ..] = input else {
            return;
        };

        self.mid[..FILTER_SIZE].copy_from_slice(&self.mid_delay);
        self.side[..FILTER_SIZE].copy_from_slice(&self.side_delay);
        for i in 0..todo {
            self.mid[FILTER_SIZE + i] = 0.9396926 * w[i] + 0.1855740 * x[i] + left[i] + right[i];
            self.side[FILTER_SIZE + i] = 0.6554516 * y[i] + left[i] - right[i];
        }

        // Keep the future samples for the next call.
        self.mid_delay.copy_from_slice(&self.mid[todo..todo + FILTER_SIZE]);
        self.side_delay.copy_from_slice(&self.side[todo..todo + FILTER_SIZE]);

        let hist = self.side_history.len();
        self.temp[..hist].copy_from_slice(&self.side_history);
        for i in 0..todo {
            self.temp[hist + i] = -0.3420201 * w[i] + 0.5098604 * x[i];
        }
        self.side_history.copy_from_slice(&self.temp[todo..todo + hist]);
        allpass_process(&mut self.side[..todo], &self.temp);

        for i in 0..todo {
            left[i] = (self.mid[i] + self.side[i]) * 0.5;
            right[i] = (self.mid[i] - self.side[i]) * 0.5;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::new_buffer_lines;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_phase_shifter_is_antisymmetric() {
        let c = phase_shift_coeffs();
        for i in 0..FILTER_SIZE / 2 {
            assert_abs_diff_eq!(c[i], -c[FILTER_SIZE - 1 - i], epsilon = 1e-6);
        }
        // The taps nearest the center approach 2/pi.
        assert_abs_diff_eq!(c[FILTER_SIZE / 2].abs(), 0.6366, epsilon = 1e-3);
    }

    #[test]
    fn test_output_is_delayed_by_filter_size() {
        let mut enc = Uhj2Encoder::new();
        let mut input = new_buffer_lines(3);
        input[0][0] = 1.0;
        let mut left = vec![0.0f32; 256];
        let mut right = vec![0.0f32; 256];
        enc.encode(&mut left, &mut right, &input, 256);

        // The phase shifter rings symmetrically around the delay point.
        assert!(left[..FILTER_SIZE / 2].iter().all(|s| s.abs() < 0.01));
        // Mid carries W unfiltered, so the delayed impulse shows up on both sides.
        assert!(left[FILTER_SIZE] + right[FILTER_SIZE] > 0.9);
    }

    #[test]
    fn test_direct_signal_passes_through() {
        let mut enc = Uhj2Encoder::new();
        let input = new_buffer_lines(3);
        let mut left = vec![0.0f32; 512];
        let mut right = vec![0.0f32; 512];
        left[0] = 1.0;
        enc.encode(&mut left, &mut right, &input, 512);
        assert_abs_diff_eq!(left[FILTER_SIZE], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(right[FILTER_SIZE], 0.0, epsilon = 1e-6);
    }
}
