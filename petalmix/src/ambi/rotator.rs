//! Spherical harmonic rotation.
//!
//! The first-order block is filled from an orthonormal basis and every higher
//! order is derived from the one below it with the Ivanic/Ruedenberg
//! recurrence.

use std::sync::OnceLock;

use crate::defs::{MAX_AMBI_CHANNELS, MAX_AMBI_ORDER};
use crate::math::Vec3;

/// ACN-ordered rotation matrix, `matrix[out][in]`.
pub type AmbiMatrix = [[f32; MAX_AMBI_CHANNELS]; MAX_AMBI_CHANNELS];

#[derive(Debug, Clone, Copy, Default)]
struct RotatorCoeffs {
    u: f32,
    v: f32,
    w: f32,
}

/// u/v/w terms for every (m, n) pair of orders 2 through `MAX_AMBI_ORDER`, in
/// order, degree-major.
fn rotator_coeffs() -> &'static [RotatorCoeffs] {
    static COEFFS: OnceLock<Vec<RotatorCoeffs>> = OnceLock::new();
    COEFFS.get_or_init(|| {
        let mut out = Vec::new();
        for l in 2..=MAX_AMBI_ORDER as i32 {
            for m in -l..=l {
                for n in -l..=l {
                    let d = if m == 0 { 1.0f32 } else { 0.0 };
                    let denom = if n.abs() == l {
                        ((2 * l) * (2 * l - 1)) as f32
                    } else {
                        (l * l - n * n) as f32
                    };
                    let abs_m = m.abs();
                    out.push(RotatorCoeffs {
                        u: ((l * l - m * m) as f32 / denom).sqrt(),
                        v: (((l + abs_m - 1) * (l + abs_m)) as f32 / denom).sqrt()
                            * (1.0 + d)
                            * (1.0 - 2.0 * d)
                            * 0.5,
                        w: (((l - abs_m - 1).max(0) * (l - abs_m)) as f32 / denom).sqrt()
                            * (1.0 - d)
                            * -0.5,
                    });
                }
            }
        }
        out
    })
}

fn p(i: i32, l: i32, a: i32, n: i32, last_band: usize, r: &AmbiMatrix) -> f32 {
    let row = &r[(i + 2) as usize];
    let ri1 = row[3];
    let rim1 = row[1];
    let ri0 = row[2];

    let vec = &r[(a + l - 1) as usize + last_band][last_band..];
    let edge = (l - 1) as usize * 2;
    if n == -l {
        ri1 * vec[0] + rim1 * vec[edge]
    } else if n == l {
        ri1 * vec[edge] - rim1 * vec[0]
    } else {
        ri0 * vec[(n + l - 1) as usize]
    }
}

fn u(l: i32, m: i32, n: i32, last_band: usize, r: &AmbiMatrix) -> f32 {
    p(0, l, m, n, last_band, r)
}

fn v(l: i32, m: i32, n: i32, last_band: usize, r: &AmbiMatrix) -> f32 {
    if m > 0 {
        let p0 = p(1, l, m - 1, n, last_band, r);
        if m == 1 {
            return p0 * std::f32::consts::SQRT_2;
        }
        let p1 = p(-1, l, -m + 1, n, last_band, r);
        return p0 - p1;
    }
    let p1 = p(-1, l, -m - 1, n, last_band, r);
    if m == -1 {
        return p1 * std::f32::consts::SQRT_2;
    }
    let p0 = p(1, l, m + 1, n, last_band, r);
    p0 + p1
}

fn w(l: i32, m: i32, n: i32, last_band: usize, r: &AmbiMatrix) -> f32 {
    debug_assert!(m != 0);
    if m > 0 {
        let p0 = p(1, l, m + 1, n, last_band, r);
        let p1 = p(-1, l, -m - 1, n, last_band, r);
        return p0 + p1;
    }
    let p0 = p(1, l, m - 1, n, last_band, r);
    let p1 = p(-1, l, -m + 1, n, last_band, r);
    p0 - p1
}

/// Fills in orders 2..=`order` of `matrix`, whose zeroth and first order
/// elements must already be set.
pub fn ambi_rotator(matrix: &mut AmbiMatrix, order: usize) {
    if order < 2 {
        return;
    }

    let mut coeffs = rotator_coeffs().iter();
    let mut band_idx = 4usize;
    let mut last_band = 1usize;
    for l in 2..=order.min(MAX_AMBI_ORDER) as i32 {
        let mut y = band_idx;
        for m in -l..=l {
            let mut x = band_idx;
            for n in -l..=l {
                let Some(c) = coeffs.next() else {
                    return;
                };
                let mut r = 0.0f32;
                if c.u != 0.0 {
                    r += c.u * u(l, m, n, last_band, matrix);
                }
                if c.v != 0.0 {
                    r += c.v * v(l, m, n, last_band, matrix);
                }
                if c.w != 0.0 {
                    r += c.w * w(l, m, n, last_band, matrix);
                }
                matrix[y][x] = r;
                x += 1;
            }
            y += 1;
        }
        last_band = band_idx;
        band_idx += l as usize * 2 + 1;
    }
}

/// Rotation for a B-format source oriented by `at`/`up`, expressed in the
/// listener's frame, up to `order`.
pub fn orientation_rotation(at: Vec3, up: Vec3, order: usize) -> AmbiMatrix {
    let n = at.normalize_or_zero();
    let v = up.normalize_or_zero();
    let u = n.cross(v).normalize_or_zero();

    let mut m = [[0.0f32; MAX_AMBI_CHANNELS]; MAX_AMBI_CHANNELS];
    m[0][0] = 1.0;
    m[1][1] = u.x;
    m[1][2] = -v.x;
    m[1][3] = -n.x;
    m[2][1] = -u.y;
    m[2][2] = v.y;
    m[2][3] = n.y;
    m[3][1] = u.z;
    m[3][2] = -v.z;
    m[3][3] = -n.z;
    ambi_rotator(&mut m, order);
    m
}
