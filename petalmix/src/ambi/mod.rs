//! Ambisonic (spherical harmonic) helpers.
//!
//! Internally every bus uses ACN ordering with N3D normalization. Tables here
//! convert from the other layouts and scalings, and compute the encoding
//! coefficients for a direction.

mod decoder;
mod rotator;
mod uhj;

pub use decoder::{BFormatDec, DecoderConfig, FrontStabilizer, builtin_decoder, hf_order_scales};
pub use rotator::{AmbiMatrix, ambi_rotator, orientation_rotation};
pub use uhj::Uhj2Encoder;

use std::f32::consts::{FRAC_PI_2, PI, TAU};

use crate::config::{AmbiLayout, AmbiScaling};
use crate::defs::{MAX_AMBI_CHANNELS, MAX_OUTPUT_CHANNELS};
use crate::math::Vec3;

/// Encoding coefficients for one direction, in ACN order.
pub type AmbiCoeffs = [f32; MAX_AMBI_CHANNELS];

/// ACN index of each 2D (horizontal-only) channel.
pub const FROM_ACN_2D: [u8; 7] = [0, 1, 3, 4, 8, 9, 15];

/// ACN index of each FuMa channel (W X Y Z R S T U V K L M N O P Q).
pub const FROM_FUMA: [u8; MAX_AMBI_CHANNELS] = [0, 3, 1, 2, 6, 7, 5, 8, 4, 12, 13, 11, 14, 10, 15, 9];

/// ACN index of each horizontal FuMa channel (W X Y U V P Q).
pub const FROM_FUMA_2D: [u8; 7] = [0, 3, 1, 8, 4, 15, 9];

pub const FROM_ACN: [u8; MAX_AMBI_CHANNELS] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

/// Ambisonic order of each ACN channel.
pub const ORDER_FROM_CHANNEL: [usize; MAX_AMBI_CHANNELS] =
    [0, 1, 1, 1, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3];

/// Ambisonic order of each ACN-2D channel.
pub const ORDER_FROM_2D_CHANNEL: [usize; 7] = [0, 1, 1, 2, 2, 3, 3];

/// Scale from N3D to N3D.
pub const SCALE_FROM_N3D: [f32; MAX_AMBI_CHANNELS] = [1.0; MAX_AMBI_CHANNELS];

/// Scale from SN3D to N3D, by ACN index.
pub const SCALE_FROM_SN3D: [f32; MAX_AMBI_CHANNELS] = [
    1.0,
    1.732050808,
    1.732050808,
    1.732050808,
    2.236067978,
    2.236067978,
    2.236067978,
    2.236067978,
    2.236067978,
    2.645751311,
    2.645751311,
    2.645751311,
    2.645751311,
    2.645751311,
    2.645751311,
    2.645751311,
];

/// Scale from FuMa (MaxN) to N3D, by ACN index.
pub const SCALE_FROM_FUMA: [f32; MAX_AMBI_CHANNELS] = [
    1.414213562,
    1.732050808,
    1.732050808,
    1.732050808,
    1.936491673,
    1.936491673,
    2.236067978,
    1.936491673,
    1.936491673,
    2.091650066,
    1.972026594,
    2.231093404,
    2.645751311,
    2.231093404,
    1.972026594,
    2.091650066,
];

/// Channel index map for B-format input in the given layout.
pub fn layout_map(layout: AmbiLayout, is_2d: bool) -> &'static [u8] {
    match (layout, is_2d) {
        (AmbiLayout::Acn, false) => &FROM_ACN,
        (AmbiLayout::Acn, true) => &FROM_ACN_2D,
        (AmbiLayout::FuMa, false) => &FROM_FUMA,
        (AmbiLayout::FuMa, true) => &FROM_FUMA_2D,
    }
}

pub fn scales(scaling: AmbiScaling) -> &'static [f32; MAX_AMBI_CHANNELS] {
    match scaling {
        AmbiScaling::N3D => &SCALE_FROM_N3D,
        AmbiScaling::SN3D => &SCALE_FROM_SN3D,
        AmbiScaling::FuMa => &SCALE_FROM_FUMA,
    }
}

/// One channel of an ambisonic bus: which ACN coefficient feeds it, and how
/// it is scaled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BFChannelConfig {
    pub scale: f32,
    pub index: usize,
}

impl BFChannelConfig {
    pub fn new(index: usize, scale: f32) -> Self {
        Self { scale, index }
    }
}

/// Identity ACN/N3D map for `count` channels.
pub fn acn_map(count: usize) -> Vec<BFChannelConfig> {
    (0..count).map(|i| BFChannelConfig::new(i, 1.0)).collect()
}

/// Computes the spherical harmonic coefficients for the ambisonic-space
/// direction `(y, z, x)`, with an angular `spread` in radians.
pub fn calc_ambi_coeffs(y: f32, z: f32, x: f32, spread: f32) -> AmbiCoeffs {
    let mut coeffs = [0.0f32; MAX_AMBI_CHANNELS];

    // Zeroth-order
    coeffs[0] = 1.0;
    // First-order
    coeffs[1] = 1.732050808 * y;
    coeffs[2] = 1.732050808 * z;
    coeffs[3] = 1.732050808 * x;
    // Second-order
    let (xx, yy, zz, xy) = (x * x, y * y, z * z, x * y);
    coeffs[4] = 3.872983346 * xy;
    coeffs[5] = 3.872983346 * y * z;
    coeffs[6] = 1.118033989 * (3.0 * zz - 1.0);
    coeffs[7] = 3.872983346 * x * z;
    coeffs[8] = 1.936491673 * (xx - yy);
    // Third-order
    coeffs[9] = 2.091650066 * (y * (3.0 * xx - yy));
    coeffs[10] = 10.246950766 * (z * xy);
    coeffs[11] = 1.620185175 * (y * (5.0 * zz - 1.0));
    coeffs[12] = 1.322875656 * (z * (5.0 * zz - 3.0));
    coeffs[13] = 1.620185175 * (x * (5.0 * zz - 1.0));
    coeffs[14] = 5.123475383 * (z * (xx - yy));
    coeffs[15] = 2.091650066 * (x * (xx - 3.0 * yy));

    if spread > 0.0 {
        // Zonal harmonics of a cap with the given angular width, scaled so
        // the total energy stays constant as the cap widens.
        let ca = (spread * 0.5).cos();
        let scale = (1.0 + spread / TAU).sqrt();

        let zh0_norm = scale;
        let zh1_norm = scale * 0.5 * (ca + 1.0);
        let zh2_norm = scale * 0.5 * (ca + 1.0) * ca;
        let zh3_norm = scale * 0.125 * (ca + 1.0) * (5.0 * ca * ca - 1.0);

        coeffs[0] *= zh0_norm;
        coeffs[1..4].iter_mut().for_each(|c| *c *= zh1_norm);
        coeffs[4..9].iter_mut().for_each(|c| *c *= zh2_norm);
        coeffs[9..16].iter_mut().for_each(|c| *c *= zh3_norm);
    }

    coeffs
}

/// Coefficients for a direction in listener space (-Z forward, +X right, +Y up).
pub fn calc_direction_coeffs(dir: Vec3, spread: f32) -> AmbiCoeffs {
    calc_ambi_coeffs(-dir.x, dir.y, -dir.z, spread)
}

/// Coefficients for an azimuth (clockwise from front) and elevation, in radians.
pub fn calc_angle_coeffs(azimuth: f32, elevation: f32, spread: f32) -> AmbiCoeffs {
    let x = azimuth.sin() * elevation.cos();
    let y = elevation.sin();
    let z = -azimuth.cos() * elevation.cos();
    calc_direction_coeffs(Vec3::new(x, y, z), spread)
}

/// Scales `coeffs` into per-channel gains for a bus described by `map`.
/// Channels past the end of the map are cleared.
pub fn compute_pan_gains(
    map: &[BFChannelConfig],
    coeffs: &AmbiCoeffs,
    ingain: f32,
    gains: &mut [f32; MAX_OUTPUT_CHANNELS],
) {
    let used = map.len().min(MAX_OUTPUT_CHANNELS);
    for (gain, chan) in gains.iter_mut().zip(map.iter()) {
        *gain = chan.scale * coeffs[chan.index] * ingain;
    }
    gains[used..].fill(0.0);
}

/// Wraps an angle in radians to [-pi, +pi].
pub fn wrap_radians(r: f32) -> f32 {
    if r > PI {
        return (PI + r) % TAU - PI;
    }
    if r < -PI {
        return PI - (PI - r) % TAU;
    }
    r
}

/// Widens front angles for pairwise stereo panning, so that `+/-90/scale`
/// degrees lands on the speakers.
pub fn scale_azimuth_front(azimuth: f32, scale: f32) -> f32 {
    let abs_azi = azimuth.abs();
    if !(abs_azi >= FRAC_PI_2) {
        return (abs_azi * scale).min(FRAC_PI_2).copysign(azimuth);
    }
    azimuth
}
