//! Near-field control filters.
//!
//! A point source close to the listener has a bass boost relative to a plane
//! wave. Each ambisonic order gets a filter that applies the boost for the
//! source distance (`w0`) and removes the one implied by the speaker distance
//! (`w1`). Both are `speed_of_sound / (distance * sample_rate)`.

/// Bessel polynomial coefficients per order.
const B: [[f32; 4]; 5] = [
    [0.0, 0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0, 0.0],
    [3.0, 3.0, 0.0, 0.0],
    [3.6778, 6.4595, 2.3222, 0.0],
    [4.2076, 11.4877, 5.7924, 9.1401],
];

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct NfcFilter1 {
    base_gain: f32,
    gain: f32,
    b1: f32,
    a1: f32,
    z: [f32; 1],
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct NfcFilter2 {
    base_gain: f32,
    gain: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z: [f32; 2],
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct NfcFilter3 {
    base_gain: f32,
    gain: f32,
    b1: f32,
    b2: f32,
    b3: f32,
    a1: f32,
    a2: f32,
    a3: f32,
    z: [f32; 3],
}

impl NfcFilter1 {
    fn new(w0: f32, w1: f32) -> Self {
        let mut nfc = Self {
            base_gain: 1.0,
            gain: 1.0,
            ..Default::default()
        };

        let b_00 = B[1][0] * 0.5 * w0;
        let g_0 = 1.0 + b_00;
        nfc.gain *= g_0;
        nfc.b1 = 2.0 * b_00 / g_0;

        let b_00 = B[1][0] * 0.5 * w1;
        let g_0 = 1.0 + b_00;
        nfc.base_gain /= g_0;
        nfc.gain /= g_0;
        nfc.a1 = 2.0 * b_00 / g_0;
        nfc
    }

    fn adjust(&mut self, w0: f32) {
        let b_00 = B[1][0] * 0.5 * w0;
        let g_0 = 1.0 + b_00;
        self.gain = self.base_gain * g_0;
        self.b1 = 2.0 * b_00 / g_0;
    }

    fn process(&mut self, src: &[f32], dst: &mut [f32]) {
        let (gain, b1, a1) = (self.gain, self.b1, self.a1);
        let mut z1 = self.z[0];
        for (out, &x) in dst.iter_mut().zip(src) {
            let y = x * gain - a1 * z1;
            *out = y + b1 * z1;
            z1 += y;
        }
        self.z[0] = z1;
    }
}

impl NfcFilter2 {
    fn new(w0: f32, w1: f32) -> Self {
        let mut nfc = Self {
            base_gain: 1.0,
            gain: 1.0,
            ..Default::default()
        };

        let r = 0.5 * w0;
        let b_10 = B[2][0] * r;
        let b_11 = B[2][1] * r * r;
        let g_1 = 1.0 + b_10 + b_11;
        nfc.gain *= g_1;
        nfc.b1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        nfc.b2 = 4.0 * b_11 / g_1;

        let r = 0.5 * w1;
        let b_10 = B[2][0] * r;
        let b_11 = B[2][1] * r * r;
        let g_1 = 1.0 + b_10 + b_11;
        nfc.base_gain /= g_1;
        nfc.gain /= g_1;
        nfc.a1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        nfc.a2 = 4.0 * b_11 / g_1;
        nfc
    }

    fn adjust(&mut self, w0: f32) {
        let r = 0.5 * w0;
        let b_10 = B[2][0] * r;
        let b_11 = B[2][1] * r * r;
        let g_1 = 1.0 + b_10 + b_11;
        self.gain = self.base_gain * g_1;
        self.b1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        self.b2 = 4.0 * b_11 / g_1;
    }

    fn process(&mut self, src: &[f32], dst: &mut [f32]) {
        let (gain, b1, b2, a1, a2) = (self.gain, self.b1, self.b2, self.a1, self.a2);
        let [mut z1, mut z2] = self.z;
        for (out, &x) in dst.iter_mut().zip(src) {
            let y = x * gain - a1 * z1 - a2 * z2;
            *out = y + b1 * z1 + b2 * z2;
            z2 += z1;
            z1 += y;
        }
        self.z = [z1, z2];
    }
}

impl NfcFilter3 {
    fn new(w0: f32, w1: f32) -> Self {
        let mut nfc = Self {
            base_gain: 1.0,
            gain: 1.0,
            ..Default::default()
        };

        let r = 0.5 * w0;
        let b_10 = B[3][0] * r;
        let b_11 = B[3][1] * r * r;
        let b_00 = B[3][2] * r;
        let g_1 = 1.0 + b_10 + b_11;
        let g_0 = 1.0 + b_00;
        nfc.gain *= g_1 * g_0;
        nfc.b1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        nfc.b2 = 4.0 * b_11 / g_1;
        nfc.b3 = 2.0 * b_00 / g_0;

        let r = 0.5 * w1;
        let b_10 = B[3][0] * r;
        let b_11 = B[3][1] * r * r;
        let b_00 = B[3][2] * r;
        let g_1 = 1.0 + b_10 + b_11;
        let g_0 = 1.0 + b_00;
        nfc.base_gain /= g_1 * g_0;
        nfc.gain /= g_1 * g_0;
        nfc.a1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        nfc.a2 = 4.0 * b_11 / g_1;
        nfc.a3 = 2.0 * b_00 / g_0;
        nfc
    }

    fn adjust(&mut self, w0: f32) {
        let r = 0.5 * w0;
        let b_10 = B[3][0] * r;
        let b_11 = B[3][1] * r * r;
        let b_00 = B[3][2] * r;
        let g_1 = 1.0 + b_10 + b_11;
        let g_0 = 1.0 + b_00;
        self.gain = self.base_gain * g_1 * g_0;
        self.b1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        self.b2 = 4.0 * b_11 / g_1;
        self.b3 = 2.0 * b_00 / g_0;
    }

    fn process(&mut self, src: &[f32], dst: &mut [f32]) {
        let (gain, b1, b2, b3) = (self.gain, self.b1, self.b2, self.b3);
        let (a1, a2, a3) = (self.a1, self.a2, self.a3);
        let [mut z1, mut z2, mut z3] = self.z;
        for (out, &x) in dst.iter_mut().zip(src) {
            let y = x * gain - a1 * z1 - a2 * z2;
            let mut o = y + b1 * z1 + b2 * z2;
            z2 += z1;
            z1 += y;

            let y = o - a3 * z3;
            o = y + b3 * z3;
            z3 += y;
            *out = o;
        }
        self.z = [z1, z2, z3];
    }
}

/// Near-field filters for ambisonic orders 1 through 3.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NfcFilter {
    first: NfcFilter1,
    second: NfcFilter2,
    third: NfcFilter3,
}

impl NfcFilter {
    /// Resets the filters for a speaker distance coefficient `w1`, with no
    /// source boost.
    pub fn init(&mut self, w1: f32) {
        self.first = NfcFilter1::new(0.0, w1);
        self.second = NfcFilter2::new(0.0, w1);
        self.third = NfcFilter3::new(0.0, w1);
    }

    /// Updates the source distance coefficient, keeping history.
    pub fn adjust(&mut self, w0: f32) {
        self.first.adjust(w0);
        self.second.adjust(w0);
        self.third.adjust(w0);
    }

    /// Filters `src` for ambisonic `order` (1..=3) into `dst`. Order 0 is a copy.
    pub fn process(&mut self, order: usize, src: &[f32], dst: &mut [f32]) {
        match order {
            1 => self.first.process(src, dst),
            2 => self.second.process(src, dst),
            3 => self.third.process(src, dst),
            _ => {
                let n = src.len().min(dst.len());
                dst[..n].copy_from_slice(&src[..n]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_matching_distances_are_transparent() {
        let mut nfc = NfcFilter::default();
        let w = 343.3 / (1.5 * 48000.0);
        nfc.init(w);
        nfc.adjust(w);
        let src: Vec<f32> = (0..256).map(|i| (i as f32 * 0.1).sin()).collect();
        for order in 1..=3 {
            let mut dst = vec![0.0; src.len()];
            nfc.process(order, &src, &mut dst);
            for (a, b) in src.iter().zip(&dst) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn test_close_source_boosts_bass() {
        let mut nfc = NfcFilter::default();
        nfc.init(343.3 / (2.0 * 48000.0));
        nfc.adjust(343.3 / (0.25 * 48000.0));
        let src = vec![0.1f32; 4096];
        let mut dst = vec![0.0; src.len()];
        nfc.process(1, &src, &mut dst);
        assert!(dst[4095].abs() > 0.1);
    }
}
