//! Head-related transfer functions.
//!
//! An [`HrtfStore`] holds a grid of impulse response pairs, one per measured
//! direction, with per-ear onset delays. Lookups blend the four nearest
//! measurements. The built-in store is synthesized from a rigid spherical head
//! model, so binaural output works at any sample rate without data files.

mod mixer;

pub use mixer::{DirectHrtfState, HrtfMixParams, mix_hrtf, mix_hrtf_blend};

use std::f32::consts::{FRAC_PI_2, PI, TAU};
use std::f64::consts::PI as PI64;
use std::sync::Arc;

use crate::defs::SPEED_OF_SOUND_METERS_PER_SEC;

/// Longest impulse response the mixer handles, in samples.
pub const HRIR_LENGTH: usize = 128;
/// Input history kept per voice for delayed HRTF reads.
pub const HRTF_HISTORY_LENGTH: usize = 64;
pub const MAX_HRIR_DELAY: usize = HRTF_HISTORY_LENGTH - 1;
/// Delay applied to the direct (bus) HRTF path to hide the reversed all-pass.
pub const HRTF_DIRECT_DELAY: usize = 256;

/// Coefficient applied to both ears for the omnidirectional part of a spread
/// source.
const PASSTHRU_COEFF: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Interleaved left/right impulse response.
pub type HrirArray = [[f32; 2]; HRIR_LENGTH];

/// A filter target: coefficients, per-ear delays and overall gain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HrtfFilter {
    pub coeffs: HrirArray,
    pub delay: [usize; 2],
    pub gain: f32,
}

impl Default for HrtfFilter {
    fn default() -> Self {
        Self {
            coeffs: [[0.0; 2]; HRIR_LENGTH],
            delay: [0; 2],
            gain: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Elevation {
    az_count: usize,
    ir_offset: usize,
}

/// A set of measured (or modelled) head responses at one sample rate.
#[derive(Debug)]
pub struct HrtfStore {
    sample_rate: u32,
    ir_size: usize,
    field_distance: f32,
    elevs: Vec<Elevation>,
    coeffs: Vec<HrirArray>,
    /// Per-ear onset delay in samples.
    delays: Vec<[f32; 2]>,
}

#[derive(Debug, Clone, Copy)]
struct IndexBlend {
    idx: usize,
    blend: f32,
}

fn calc_ev_index(ev_count: usize, ev: f32) -> IndexBlend {
    let ev = (FRAC_PI_2 + ev) * (ev_count - 1) as f32 / PI;
    let idx = ev.max(0.0) as usize;
    IndexBlend {
        idx: idx.min(ev_count - 1),
        blend: ev - idx as f32,
    }
}

fn calc_az_index(az_count: usize, az: f32) -> IndexBlend {
    let az = (TAU + az) * az_count as f32 / TAU;
    let idx = az.max(0.0) as usize;
    IndexBlend {
        idx: idx % az_count,
        blend: az - idx as f32,
    }
}

impl HrtfStore {
    const HEAD_RADIUS: f64 = 0.0875;
    const MODEL_IR_SIZE: usize = 32;
    const ELEVATION_COUNT: usize = 19;
    const EQUATOR_AZIMUTHS: usize = 36;

    /// Synthesizes a store from a spherical head model (Brown/Duda): a
    /// Woodworth time-of-arrival per ear plus a one-pole head-shadow filter
    /// whose high-frequency gain depends on the angle to the ear.
    pub fn spherical_head(sample_rate: u32) -> Arc<Self> {
        let fs = sample_rate as f64;
        let c = SPEED_OF_SOUND_METERS_PER_SEC as f64;
        let a = Self::HEAD_RADIUS;

        let mut elevs = Vec::with_capacity(Self::ELEVATION_COUNT);
        let mut coeffs = Vec::new();
        let mut delays = Vec::new();

        for ei in 0..Self::ELEVATION_COUNT {
            let ev = -PI64 / 2.0 + PI64 * ei as f64 / (Self::ELEVATION_COUNT - 1) as f64;
            let az_count = ((Self::EQUATOR_AZIMUTHS as f64 * ev.cos()).round() as usize).max(1);
            elevs.push(Elevation {
                az_count,
                ir_offset: coeffs.len(),
            });

            for ai in 0..az_count {
                let az = TAU as f64 * ai as f64 / az_count as f64;
                // Listener space: +X right, +Y up, -Z front.
                let dir_x = az.sin() * ev.cos();

                let mut hrir = [[0.0f32; 2]; HRIR_LENGTH];
                let mut delay = [0.0f32; 2];
                for (ear, side) in [(0usize, -1.0f64), (1, 1.0)] {
                    let cos_theta = (dir_x * side).clamp(-1.0, 1.0);
                    let theta = cos_theta.acos();

                    let tof = if theta < PI64 / 2.0 {
                        a / c * (1.0 - cos_theta)
                    } else {
                        a / c * (1.0 + theta - PI64 / 2.0)
                    };
                    delay[ear] = (tof * fs) as f32;

                    let ir = head_shadow_ir(theta, a, c, fs, Self::MODEL_IR_SIZE);
                    for (dst, src) in hrir.iter_mut().zip(ir.iter()) {
                        dst[ear] = *src;
                    }
                }
                coeffs.push(hrir);
                delays.push(delay);
            }
        }

        log::info!(
            "Built spherical head HRTF: {} directions, {} taps, {} Hz",
            coeffs.len(),
            Self::MODEL_IR_SIZE,
            sample_rate
        );

        Arc::new(Self {
            sample_rate,
            ir_size: Self::MODEL_IR_SIZE,
            field_distance: 1.0,
            elevs,
            coeffs,
            delays,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn ir_size(&self) -> usize {
        self.ir_size
    }

    /// Distance in meters the responses were measured at.
    pub fn field_distance(&self) -> f32 {
        self.field_distance
    }

    pub fn measurement_count(&self) -> usize {
        self.coeffs.len()
    }

    /// Blended response for a direction, in radians with azimuth clockwise
    /// from the front. `spread` mixes in an omnidirectional component.
    pub fn coeffs_for(&self, elevation: f32, azimuth: f32, spread: f32) -> (HrirArray, [usize; 2]) {
        let dirfact = 1.0 - spread / TAU;

        let ev0 = calc_ev_index(self.elevs.len(), elevation);
        let ev1_idx = (ev0.idx + 1).min(self.elevs.len() - 1);
        let e0 = self.elevs[ev0.idx];
        let e1 = self.elevs[ev1_idx];

        let az0 = calc_az_index(e0.az_count, azimuth);
        let az1 = calc_az_index(e1.az_count, azimuth);

        let idx = [
            e0.ir_offset + az0.idx,
            e0.ir_offset + (az0.idx + 1) % e0.az_count,
            e1.ir_offset + az1.idx,
            e1.ir_offset + (az1.idx + 1) % e1.az_count,
        ];
        let blend = [
            (1.0 - ev0.blend) * (1.0 - az0.blend) * dirfact,
            (1.0 - ev0.blend) * az0.blend * dirfact,
            ev0.blend * (1.0 - az1.blend) * dirfact,
            ev0.blend * az1.blend * dirfact,
        ];

        let mut delays = [0usize; 2];
        for (ear, out) in delays.iter_mut().enumerate() {
            let d: f32 = idx
                .iter()
                .zip(blend.iter())
                .map(|(i, b)| self.delays[*i][ear] * b)
                .sum();
            *out = (d.round().max(0.0) as usize).min(MAX_HRIR_DELAY);
        }

        let mut coeffs = [[0.0f32; 2]; HRIR_LENGTH];
        coeffs[0] = [PASSTHRU_COEFF * (1.0 - dirfact); 2];
        for (i, mult) in idx.iter().zip(blend.iter()) {
            for (dst, src) in coeffs.iter_mut().zip(self.coeffs[*i].iter()) {
                dst[0] += src[0] * mult;
                dst[1] += src[1] * mult;
            }
        }

        (coeffs, delays)
    }
}

/// Impulse response of the spherical head shadow filter for an angle of
/// incidence `theta` from the ear axis.
fn head_shadow_ir(theta: f64, a: f64, c: f64, fs: f64, len: usize) -> Vec<f32> {
    const ALPHA_MIN: f64 = 0.1;
    const THETA_MIN: f64 = 150.0;

    let alpha = (1.0 + ALPHA_MIN / 2.0)
        + (1.0 - ALPHA_MIN / 2.0) * (theta.to_degrees() / THETA_MIN * 180.0).to_radians().cos();
    // H(s) = (1 + alpha*s*beta) / (1 + s*beta), beta = a / 2c, via bilinear.
    let beta = a / (2.0 * c);
    let k = 2.0 * fs;
    let norm = 1.0 + beta * k;
    let b0 = (1.0 + alpha * beta * k) / norm;
    let b1 = (1.0 - alpha * beta * k) / norm;
    let a1 = (1.0 - beta * k) / norm;

    let taper = len / 4;
    let mut out = Vec::with_capacity(len);
    let mut y1 = 0.0f64;
    for n in 0..len {
        let x0 = if n == 0 { 1.0 } else { 0.0 };
        let x1 = if n == 1 { 1.0 } else { 0.0 };
        let y = b0 * x0 + b1 * x1 - a1 * y1;
        y1 = y;

        let remaining = len - n;
        let window = if remaining <= taper {
            0.5 - 0.5 * (PI64 * remaining as f64 / (taper + 1) as f64).cos()
        } else {
            1.0
        };
        out.push((y * window) as f32);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_index_helpers() {
        let ev = calc_ev_index(19, 0.0);
        assert_eq!(ev.idx, 9);
        assert_abs_diff_eq!(ev.blend, 0.0, epsilon = 1e-5);
        let top = calc_ev_index(19, FRAC_PI_2);
        assert_eq!(top.idx, 18);

        let az = calc_az_index(36, 5f32.to_radians());
        assert_eq!(az.idx, 0);
        assert_abs_diff_eq!(az.blend, 0.5, epsilon = 1e-4);
        let neg = calc_az_index(36, -5f32.to_radians());
        assert_eq!(neg.idx, 35);
    }

    #[test]
    fn test_front_is_symmetric() {
        let store = HrtfStore::spherical_head(48000);
        let (coeffs, delays) = store.coeffs_for(0.0, 0.0, 0.0);
        assert_eq!(delays[0], delays[1]);
        for tap in coeffs.iter() {
            assert_abs_diff_eq!(tap[0], tap[1], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_right_source_reaches_right_ear_first() {
        let store = HrtfStore::spherical_head(48000);
        let (coeffs, delays) = store.coeffs_for(0.0, FRAC_PI_2, 0.0);
        assert!(delays[1] < delays[0]);
        let energy = |ear: usize| coeffs.iter().map(|t| t[ear] * t[ear]).sum::<f32>();
        assert!(energy(1) > energy(0));
    }

    #[test]
    fn test_full_spread_is_passthrough() {
        let store = HrtfStore::spherical_head(44100);
        let (coeffs, _) = store.coeffs_for(0.3, 1.0, TAU);
        assert_abs_diff_eq!(coeffs[0][0], PASSTHRU_COEFF);
        assert!(coeffs[1..].iter().all(|t| t[0] == 0.0 && t[1] == 0.0));
    }

    #[test]
    fn test_delays_fit_history() {
        let store = HrtfStore::spherical_head(192000);
        for az in 0..16 {
            let (_, delays) = store.coeffs_for(0.0, az as f32 * TAU / 16.0, 0.0);
            assert!(delays.iter().all(|d| *d <= MAX_HRIR_DELAY));
        }
    }
}
