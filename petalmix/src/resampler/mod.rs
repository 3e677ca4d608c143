//! Fixed-point sample-rate converters.
//!
//! Positions are expressed as an integer sample index plus a `MIXER_FRAC_BITS`
//! fraction. Every kernel reads `src[pos + n]` for the output sample at a
//! fractional offset, with `pos` pointing past enough history for the widest
//! filter (`MAX_RESAMPLER_EDGE`).

pub mod bsinc;

use std::fmt;
use std::str::FromStr;

use crate::defs::{MIXER_FRAC_BITS, MIXER_FRAC_MASK, MIXER_FRAC_ONE};
use crate::error::PetalMixError;
use bsinc::{BSINC_PHASE_COUNT, BSINC_SCALE_COUNT, BSincTable};

/// Interpolation quality for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampler {
    Point,
    #[default]
    Linear,
    Cubic,
    BSinc12,
    FastBSinc12,
    BSinc24,
    FastBSinc24,
}

impl Resampler {
    pub const ALL: [Resampler; 7] = [
        Self::Point,
        Self::Linear,
        Self::Cubic,
        Self::BSinc12,
        Self::FastBSinc12,
        Self::BSinc24,
        Self::FastBSinc24,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::Linear => "linear",
            Self::Cubic => "cubic",
            Self::BSinc12 => "bsinc12",
            Self::FastBSinc12 => "fast_bsinc12",
            Self::BSinc24 => "bsinc24",
            Self::FastBSinc24 => "fast_bsinc24",
        }
    }
}

impl fmt::Display for Resampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Resampler {
    type Err = PetalMixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let name = match lower.as_str() {
            "none" => "point",
            "bsinc" => {
                log::warn!("Resampler option \"{}\" is deprecated, using bsinc12", s);
                "bsinc12"
            }
            "sinc4" | "sinc8" => {
                log::warn!("Resampler option \"{}\" is deprecated, using cubic", s);
                "cubic"
            }
            other => other,
        };
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.name() == name)
            .ok_or_else(|| PetalMixError::Configuration(format!("Invalid resampler: {}", s)))
    }
}

/// Per-voice bsinc filter selection for the current increment.
#[derive(Debug, Clone, Copy)]
pub struct BsincState {
    /// Scale interpolation factor.
    pub sf: f32,
    /// Filter length, in taps.
    pub m: usize,
    /// Taps before the current sample.
    pub l: usize,
    pub filter_offset: usize,
    table: &'static BSincTable,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum InterpState {
    #[default]
    None,
    BSinc(BsincState),
}

/// Concrete kernel chosen for a voice's resampler and increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleKernel {
    Copy,
    Point,
    #[default]
    Linear,
    Cubic,
    BSinc,
    FastBSinc,
}

/// Resampling tables available to a device.
///
/// Built once when the device is constructed and handed to the mixer, so the
/// mix path never initializes tables lazily.
#[derive(Debug, Clone, Copy)]
pub struct ResamplerCaps {
    bsinc12: &'static BSincTable,
    bsinc24: &'static BSincTable,
}

impl Default for ResamplerCaps {
    fn default() -> Self {
        Self::new()
    }
}

impl ResamplerCaps {
    pub fn new() -> Self {
        Self {
            bsinc12: bsinc::bsinc12(),
            bsinc24: bsinc::bsinc24(),
        }
    }

    /// Selects a kernel for `resampler` at `increment`, preparing any filter
    /// state it needs.
    pub fn prepare(
        &self,
        resampler: Resampler,
        increment: u32,
        state: &mut InterpState,
    ) -> ResampleKernel {
        match resampler {
            Resampler::Point => ResampleKernel::Point,
            Resampler::Linear => ResampleKernel::Linear,
            Resampler::Cubic => ResampleKernel::Cubic,
            Resampler::BSinc12 | Resampler::FastBSinc12 => {
                *state = InterpState::BSinc(bsinc_prepare(increment, self.bsinc12));
                select_bsinc(resampler, increment)
            }
            Resampler::BSinc24 | Resampler::FastBSinc24 => {
                *state = InterpState::BSinc(bsinc_prepare(increment, self.bsinc24));
                select_bsinc(resampler, increment)
            }
        }
    }
}

fn select_bsinc(resampler: Resampler, increment: u32) -> ResampleKernel {
    match resampler {
        Resampler::FastBSinc12 | Resampler::FastBSinc24 => ResampleKernel::FastBSinc,
        _ if increment <= MIXER_FRAC_ONE => ResampleKernel::FastBSinc,
        _ => ResampleKernel::BSinc,
    }
}

fn bsinc_prepare(increment: u32, table: &'static BSincTable) -> BsincState {
    let mut si = BSINC_SCALE_COUNT - 1;
    let mut sf = 0.0f32;

    if increment > MIXER_FRAC_ONE {
        sf = MIXER_FRAC_ONE as f32 / increment as f32;
        sf = ((BSINC_SCALE_COUNT - 1) as f32 * (sf - table.scale_base) * table.scale_range)
            .max(0.0);
        si = (sf as usize).min(BSINC_SCALE_COUNT - 1);
        // Cosine curve between adjacent scales.
        sf = 1.0 - (sf - si as f32).asin().cos();
    }

    let m = table.m[si];
    BsincState {
        sf,
        m,
        l: (m / 2).saturating_sub(1),
        filter_offset: table.filter_offset[si],
        table,
    }
}

/// Number of source samples a kernel reads before the current position.
pub fn kernel_history(kernel: ResampleKernel, state: &InterpState) -> usize {
    match (kernel, state) {
        (ResampleKernel::Cubic, _) => 1,
        (ResampleKernel::BSinc | ResampleKernel::FastBSinc, InterpState::BSinc(bs)) => bs.l,
        _ => 0,
    }
}

#[inline]
fn lerp(a: f32, b: f32, mu: f32) -> f32 {
    a + (b - a) * mu
}

#[inline]
fn cubic(v: &[f32], mu: f32) -> f32 {
    let mu2 = mu * mu;
    let mu3 = mu2 * mu;
    let a0 = -0.5 * mu3 + mu2 + -0.5 * mu;
    let a1 = 1.5 * mu3 + -2.5 * mu2 + 1.0;
    let a2 = -1.5 * mu3 + 2.0 * mu2 + 0.5 * mu;
    let a3 = 0.5 * mu3 + -0.5 * mu2;
    v[0] * a0 + v[1] * a1 + v[2] * a2 + v[3] * a3
}

#[inline]
fn bsinc_sample(bs: &BsincState, v: &[f32], frac: u32, fast: bool) -> f32 {
    const FRAC_PHASE_BITS: u32 = MIXER_FRAC_BITS - bsinc::BSINC_PHASE_BITS;
    const FRAC_PHASE_ONE: u32 = 1 << FRAC_PHASE_BITS;
    const FRAC_PHASE_MASK: u32 = FRAC_PHASE_ONE - 1;
    let pi = (frac >> FRAC_PHASE_BITS) as usize;
    let pf = (frac & FRAC_PHASE_MASK) as f32 * (1.0 / FRAC_PHASE_ONE as f32);

    let m = bs.m;
    let base = bs.filter_offset + pi * m * 4;
    debug_assert!(pi < BSINC_PHASE_COUNT);
    let tab = &bs.table.tab;
    let fil = &tab[base..base + m];
    let phd = &tab[base + m..base + m * 2];

    let mut r = 0.0f32;
    if fast {
        for j in 0..m {
            r += (fil[j] + pf * phd[j]) * v[j];
        }
    } else {
        let sf = bs.sf;
        let scd = &tab[base + m * 2..base + m * 3];
        let spd = &tab[base + m * 3..base + m * 4];
        for j in 0..m {
            r += (fil[j] + sf * scd[j] + pf * (phd[j] + sf * spd[j])) * v[j];
        }
    }
    r
}

/// Resamples `src` starting at index `pos` with fraction `frac`, filling `dst`.
///
/// `src` must hold enough samples around `pos` for the kernel's history and
/// the span covered by `dst.len()` steps of `increment`.
pub fn resample(
    kernel: ResampleKernel,
    state: &InterpState,
    src: &[f32],
    pos: usize,
    frac: u32,
    increment: u32,
    dst: &mut [f32],
) {
    if kernel == ResampleKernel::Copy {
        dst.copy_from_slice(&src[pos..pos + dst.len()]);
        return;
    }

    let bs = match (kernel, state) {
        (ResampleKernel::BSinc | ResampleKernel::FastBSinc, InterpState::BSinc(bs)) => Some(bs),
        _ => None,
    };
    // A bsinc kernel without prepared state can only happen if the caller skipped
    // `prepare`, fall back to linear.
    let kernel = match (kernel, bs) {
        (ResampleKernel::BSinc | ResampleKernel::FastBSinc, None) => ResampleKernel::Linear,
        (k, _) => k,
    };

    let mut src_pos = pos;
    let mut frac = frac;
    for out in dst.iter_mut() {
        *out = match kernel {
            ResampleKernel::Point | ResampleKernel::Copy => src[src_pos],
            ResampleKernel::Linear => lerp(
                src[src_pos],
                src[src_pos + 1],
                frac as f32 * (1.0 / MIXER_FRAC_ONE as f32),
            ),
            ResampleKernel::Cubic => cubic(
                &src[src_pos - 1..src_pos + 3],
                frac as f32 * (1.0 / MIXER_FRAC_ONE as f32),
            ),
            ResampleKernel::BSinc | ResampleKernel::FastBSinc => match bs {
                Some(bs) => bsinc_sample(
                    bs,
                    &src[src_pos - bs.l..src_pos - bs.l + bs.m],
                    frac,
                    kernel == ResampleKernel::FastBSinc,
                ),
                None => 0.0,
            },
        };

        frac += increment;
        src_pos += (frac >> MIXER_FRAC_BITS) as usize;
        frac &= MIXER_FRAC_MASK;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::MAX_RESAMPLER_EDGE;
    use approx::assert_abs_diff_eq;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32 * 0.01).collect()
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("linear".parse::<Resampler>().unwrap(), Resampler::Linear);
        assert_eq!("NONE".parse::<Resampler>().unwrap(), Resampler::Point);
        assert_eq!("bsinc".parse::<Resampler>().unwrap(), Resampler::BSinc12);
        assert_eq!("sinc8".parse::<Resampler>().unwrap(), Resampler::Cubic);
        assert_eq!(
            "fast_bsinc24".parse::<Resampler>().unwrap(),
            Resampler::FastBSinc24
        );
        assert!("sinc16".parse::<Resampler>().is_err());
        for r in Resampler::ALL {
            assert_eq!(r.to_string().parse::<Resampler>().unwrap(), r);
        }
    }

    #[test]
    fn test_copy_is_identity() {
        let src = ramp(128);
        let mut dst = [0.0f32; 64];
        resample(
            ResampleKernel::Copy,
            &InterpState::None,
            &src,
            MAX_RESAMPLER_EDGE,
            0,
            MIXER_FRAC_ONE,
            &mut dst,
        );
        assert_eq!(&dst[..], &src[MAX_RESAMPLER_EDGE..MAX_RESAMPLER_EDGE + 64]);
    }

    #[test]
    fn test_linear_half_step() {
        let src = ramp(128);
        let mut dst = [0.0f32; 8];
        resample(
            ResampleKernel::Linear,
            &InterpState::None,
            &src,
            MAX_RESAMPLER_EDGE,
            0,
            MIXER_FRAC_ONE / 2,
            &mut dst,
        );
        for (i, v) in dst.iter().enumerate() {
            assert_abs_diff_eq!(*v, (MAX_RESAMPLER_EDGE as f32 + i as f32 * 0.5) * 0.01, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_cubic_passes_through_samples() {
        let src = ramp(128);
        let mut dst = [0.0f32; 4];
        resample(
            ResampleKernel::Cubic,
            &InterpState::None,
            &src,
            MAX_RESAMPLER_EDGE,
            0,
            MIXER_FRAC_ONE,
            &mut dst,
        );
        assert_abs_diff_eq!(dst[0], src[MAX_RESAMPLER_EDGE], epsilon = 1e-6);
        assert_abs_diff_eq!(dst[3], src[MAX_RESAMPLER_EDGE + 3], epsilon = 1e-6);
    }

    #[test]
    fn test_bsinc_selection() {
        let caps = ResamplerCaps::new();
        let mut state = InterpState::None;
        assert_eq!(
            caps.prepare(Resampler::BSinc24, MIXER_FRAC_ONE, &mut state),
            ResampleKernel::FastBSinc
        );
        assert_eq!(
            caps.prepare(Resampler::BSinc24, MIXER_FRAC_ONE * 2, &mut state),
            ResampleKernel::BSinc
        );
        assert_eq!(
            caps.prepare(Resampler::FastBSinc12, MIXER_FRAC_ONE * 2, &mut state),
            ResampleKernel::FastBSinc
        );
        match state {
            InterpState::BSinc(bs) => {
                assert!(bs.m <= bsinc::BSINC_POINTS_MAX);
                assert!(bs.l < MAX_RESAMPLER_EDGE);
            }
            InterpState::None => panic!("bsinc state not prepared"),
        }
    }

    #[test]
    fn test_bsinc_dc_response() {
        let caps = ResamplerCaps::new();
        let mut state = InterpState::None;
        let kernel = caps.prepare(Resampler::BSinc24, MIXER_FRAC_ONE, &mut state);
        let src = vec![0.5f32; 256];
        let mut dst = [0.0f32; 32];
        resample(
            kernel,
            &state,
            &src,
            MAX_RESAMPLER_EDGE,
            MIXER_FRAC_ONE / 3,
            MIXER_FRAC_ONE * 3 / 4,
            &mut dst,
        );
        for v in dst {
            assert_abs_diff_eq!(v, 0.5, epsilon = 0.01);
        }
    }
}
