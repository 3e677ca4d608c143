use std::f32::consts::TAU;

/// Splits a signal into two phase-matched bands around a crossover frequency.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandSplitter {
    coeff: f32,
    lp_z1: f32,
    lp_z2: f32,
    ap_z1: f32,
}

impl BandSplitter {
    /// `f0norm` is the crossover frequency divided by the sample rate.
    pub fn new(f0norm: f32) -> Self {
        let mut splitter = Self::default();
        splitter.init(f0norm);
        splitter
    }

    pub fn init(&mut self, f0norm: f32) {
        let w = f0norm * TAU;
        let cw = w.cos();
        self.coeff = if cw > f32::EPSILON {
            (w.sin() - 1.0) / cw
        } else {
            cw * -0.5
        };
        self.clear();
    }

    pub fn clear(&mut self) {
        self.lp_z1 = 0.0;
        self.lp_z2 = 0.0;
        self.ap_z1 = 0.0;
    }

    pub fn process(&mut self, input: &[f32], hpout: &mut [f32], lpout: &mut [f32]) {
        let ap_coeff = self.coeff;
        let lp_coeff = self.coeff * 0.5 + 0.5;
        let mut lp_z1 = self.lp_z1;
        let mut lp_z2 = self.lp_z2;
        let mut ap_z1 = self.ap_z1;

        for ((&x, hp), lp) in input.iter().zip(hpout.iter_mut()).zip(lpout.iter_mut()) {
            let mut d = (x - lp_z1) * lp_coeff;
            let mut lp_y = lp_z1 + d;
            lp_z1 = lp_y + d;

            d = (lp_y - lp_z2) * lp_coeff;
            lp_y = lp_z2 + d;
            lp_z2 = lp_y + d;
            *lp = lp_y;

            let ap_y = x * ap_coeff + ap_z1;
            ap_z1 = x - ap_y * ap_coeff;

            *hp = ap_y - lp_y;
        }

        self.lp_z1 = lp_z1;
        self.lp_z2 = lp_z2;
        self.ap_z1 = ap_z1;
    }

    /// Scales the high band by `hfscale` in place, leaving the low band as is.
    pub fn process_hf_scale(&mut self, samples: &mut [f32], hfscale: f32) {
        if hfscale == 1.0 {
            return;
        }
        let ap_coeff = self.coeff;
        let lp_coeff = self.coeff * 0.5 + 0.5;
        let mut lp_z1 = self.lp_z1;
        let mut lp_z2 = self.lp_z2;
        let mut ap_z1 = self.ap_z1;

        for s in samples.iter_mut() {
            let x = *s;
            let mut d = (x - lp_z1) * lp_coeff;
            let mut lp_y = lp_z1 + d;
            lp_z1 = lp_y + d;

            d = (lp_y - lp_z2) * lp_coeff;
            lp_y = lp_z2 + d;
            lp_z2 = lp_y + d;

            let ap_y = x * ap_coeff + ap_z1;
            ap_z1 = x - ap_y * ap_coeff;

            *s = (ap_y - lp_y) * hfscale + lp_y;
        }

        self.lp_z1 = lp_z1;
        self.lp_z2 = lp_z2;
        self.ap_z1 = ap_z1;
    }

    /// Applies the all-pass section only. Each call starts from a clean state.
    pub fn apply_allpass(&self, samples: &mut [f32]) {
        let coeff = self.coeff;
        let mut z1 = 0.0f32;
        for s in samples.iter_mut() {
            let out = *s * coeff + z1;
            z1 = *s - out * coeff;
            *s = out;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_bands_sum_to_allpass() {
        let mut splitter = BandSplitter::new(400.0 / 48000.0);
        let allpass = splitter;
        let input: Vec<f32> = (0..512).map(|i| ((i * 7919) % 97) as f32 / 97.0 - 0.5).collect();
        let mut hp = vec![0.0; input.len()];
        let mut lp = vec![0.0; input.len()];
        splitter.process(&input, &mut hp, &mut lp);

        let mut ap = input.clone();
        allpass.apply_allpass(&mut ap);
        for i in 0..input.len() {
            assert_abs_diff_eq!(hp[i] + lp[i], ap[i], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_unity_hf_scale_is_noop() {
        let mut splitter = BandSplitter::new(0.01);
        let mut samples = [0.1f32, 0.2, -0.3, 0.4];
        splitter.process_hf_scale(&mut samples, 1.0);
        assert_eq!(samples, [0.1, 0.2, -0.3, 0.4]);
    }

    #[test]
    fn test_hf_scale_keeps_dc() {
        let mut splitter = BandSplitter::new(400.0 / 48000.0);
        let mut samples = vec![1.0f32; 8192];
        splitter.process_hf_scale(&mut samples, 0.5);
        assert_abs_diff_eq!(samples[8191], 1.0, epsilon = 1e-3);
    }
}
