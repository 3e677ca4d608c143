//! Band-limited sinc tables.
//!
//! Each table holds Kaiser-windowed sinc filters for `BSINC_SCALE_COUNT` scales
//! (downsampling ratios) and `BSINC_PHASE_COUNT` phases. For every scale/phase
//! pair four rows of `m` coefficients are stored: the filter, the phase delta,
//! the scale delta and the scale-phase delta, so the kernel can bilinearly
//! interpolate in phase and scale with a single pass.

use std::f64::consts::{PI, TAU};
use std::sync::OnceLock;

pub const BSINC_SCALE_BITS: u32 = 4;
pub const BSINC_SCALE_COUNT: usize = 1 << BSINC_SCALE_BITS;
pub const BSINC_PHASE_BITS: u32 = 5;
pub const BSINC_PHASE_COUNT: usize = 1 << BSINC_PHASE_BITS;

/// Widest filter, including the doubling applied when downsampling.
pub const BSINC_POINTS_MAX: usize = 48;

#[derive(Debug)]
pub struct BSincTable {
    pub scale_base: f32,
    /// Reciprocal of the scale range.
    pub scale_range: f32,
    pub m: [usize; BSINC_SCALE_COUNT],
    pub filter_offset: [usize; BSINC_SCALE_COUNT],
    pub tab: Vec<f32>,
}

fn sinc(x: f64) -> f64 {
    if !(x > 1e-15 || x < -1e-15) {
        return 1.0;
    }
    (PI * x).sin() / (PI * x)
}

/// Zero-order modified Bessel function of the first kind.
pub(crate) fn bessel_i0(x: f64) -> f64 {
    let x2 = x / 2.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    let mut k = 1.0;
    loop {
        let y = x2 / k;
        k += 1.0;
        let last_sum = sum;
        term *= y * y;
        sum += term;
        if sum == last_sum {
            return sum;
        }
    }
}

/// Kaiser window for a normalized position `k` in [-1, 1].
fn kaiser(beta: f64, k: f64, besseli_0_beta: f64) -> f64 {
    if !(-1.0..=1.0).contains(&k) {
        return 0.0;
    }
    bessel_i0(beta * (1.0 - k * k).sqrt()) / besseli_0_beta
}

/// Normalized transition width of the Kaiser window for a rejection in dB.
pub(crate) fn kaiser_width(rejection: f64, order: u32) -> f64 {
    if rejection > 21.19 {
        return (rejection - 7.95) / (order as f64 * 2.285 * TAU);
    }
    5.79 / (order as f64 * TAU)
}

pub(crate) fn kaiser_beta(rejection: f64) -> f64 {
    if rejection > 50.0 {
        0.1102 * (rejection - 8.7)
    } else if rejection >= 21.0 {
        0.5842 * (rejection - 21.0).powf(0.4) + 0.07886 * (rejection - 21.0)
    } else {
        0.0
    }
}

fn generate(rejection: f64, order: u32) -> BSincTable {
    let width = kaiser_width(rejection, order);
    let beta = kaiser_beta(rejection);
    let scale_base = width / 2.0;
    let scale_range = 1.0 - scale_base;
    let besseli_0_beta = bessel_i0(beta);

    let num_points = (order + 1) as f64;
    let scale_at = |si: usize| scale_base + scale_range * si as f64 / (BSINC_SCALE_COUNT - 1) as f64;

    let mut a = [0usize; BSINC_SCALE_COUNT];
    for (si, a_) in a.iter_mut().enumerate() {
        *a_ = ((num_points / 2.0 / scale_at(si)) as usize).min(num_points as usize);
    }

    // filter[si][pi][i], with one extra phase so the last phase delta has a target.
    let row = BSINC_POINTS_MAX;
    let phases = BSINC_PHASE_COUNT + 1;
    let mut filter = vec![0.0f64; BSINC_SCALE_COUNT * phases * row];
    let at = |si: usize, pi: usize, i: usize| (si * phases + pi) * row + i;

    for si in 0..BSINC_SCALE_COUNT {
        let m = a[si] * 2;
        let o = (BSINC_POINTS_MAX - m) / 2;
        let scale = scale_at(si);
        let cutoff = scale - scale_base * scale.max(0.5) * 2.0;
        let a_f = a[si] as f64;
        let l = a_f - 1.0;

        for pi in 0..=BSINC_PHASE_COUNT {
            let phase = l + pi as f64 / BSINC_PHASE_COUNT as f64;
            for i in 0..m {
                let x = i as f64 - phase;
                filter[at(si, pi, o + i)] =
                    kaiser(beta, x / a_f, besseli_0_beta) * cutoff * sinc(cutoff * x);
            }
        }
    }

    let mut m_rounded = [0usize; BSINC_SCALE_COUNT];
    for si in 0..BSINC_SCALE_COUNT {
        m_rounded[si] = (a[si] * 2 + 3) & !3;
    }
    let mut filter_offset = [0usize; BSINC_SCALE_COUNT];
    for si in 1..BSINC_SCALE_COUNT {
        filter_offset[si] = filter_offset[si - 1] + m_rounded[si - 1] * 4 * BSINC_PHASE_COUNT;
    }
    let total = filter_offset[BSINC_SCALE_COUNT - 1]
        + m_rounded[BSINC_SCALE_COUNT - 1] * 4 * BSINC_PHASE_COUNT;

    let mut tab = Vec::with_capacity(total);
    for si in 0..BSINC_SCALE_COUNT {
        let m = m_rounded[si];
        let o = (BSINC_POINTS_MAX - m) / 2;
        let last = si == BSINC_SCALE_COUNT - 1;

        for pi in 0..BSINC_PHASE_COUNT {
            for i in 0..m {
                tab.push(filter[at(si, pi, o + i)] as f32);
            }
            for i in 0..m {
                tab.push((filter[at(si, pi + 1, o + i)] - filter[at(si, pi, o + i)]) as f32);
            }
            // The last scale has nothing to interpolate towards.
            if last {
                tab.extend(std::iter::repeat_n(0.0, m * 2));
                continue;
            }
            for i in 0..m {
                tab.push((filter[at(si + 1, pi, o + i)] - filter[at(si, pi, o + i)]) as f32);
            }
            for i in 0..m {
                let next = filter[at(si + 1, pi + 1, o + i)] - filter[at(si + 1, pi, o + i)];
                let cur = filter[at(si, pi + 1, o + i)] - filter[at(si, pi, o + i)];
                tab.push((next - cur) as f32);
            }
        }
    }
    debug_assert_eq!(tab.len(), total);

    BSincTable {
        scale_base: scale_base as f32,
        scale_range: (1.0 / scale_range) as f32,
        m: m_rounded,
        filter_offset,
        tab,
    }
}

/// 11th order filter (12 points) with a 60dB drop at nyquist.
pub fn bsinc12() -> &'static BSincTable {
    static TABLE: OnceLock<BSincTable> = OnceLock::new();
    TABLE.get_or_init(|| generate(60.0, 11))
}

/// 23rd order filter (24 points) with a 60dB drop at nyquist.
pub fn bsinc24() -> &'static BSincTable {
    static TABLE: OnceLock<BSincTable> = OnceLock::new();
    TABLE.get_or_init(|| generate(60.0, 23))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bessel_i0() {
        assert_relative_eq!(bessel_i0(0.0), 1.0);
        assert_relative_eq!(bessel_i0(1.0), 1.2660658777520082, max_relative = 1e-12);
    }

    #[test]
    fn test_kaiser_parameters() {
        assert_relative_eq!(kaiser_beta(60.0), 0.1102 * 51.3, max_relative = 1e-12);
        assert_eq!(kaiser_beta(10.0), 0.0);
        assert_relative_eq!(
            kaiser_width(60.0, 11),
            52.05 / (11.0 * 2.285 * TAU),
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_table_layout() {
        for table in [bsinc12(), bsinc24()] {
            assert!(table.m.iter().all(|m| m % 4 == 0 && *m <= BSINC_POINTS_MAX));
            // Downsampling scales need more points than the base filter.
            assert!(table.m[0] >= table.m[BSINC_SCALE_COUNT - 1]);
            let last = BSINC_SCALE_COUNT - 1;
            assert_eq!(
                table.tab.len(),
                table.filter_offset[last] + table.m[last] * 4 * BSINC_PHASE_COUNT
            );
        }
        assert_eq!(bsinc24().m[BSINC_SCALE_COUNT - 1], 24);
        assert_eq!(bsinc12().m[BSINC_SCALE_COUNT - 1], 12);
    }

    #[test]
    fn test_unity_scale_filter_has_unity_dc_gain() {
        let table = bsinc24();
        let si = BSINC_SCALE_COUNT - 1;
        let m = table.m[si];
        let fil = &table.tab[table.filter_offset[si]..table.filter_offset[si] + m];
        let dc: f32 = fil.iter().sum();
        assert_relative_eq!(dc, 1.0, max_relative = 0.02);
    }
}
