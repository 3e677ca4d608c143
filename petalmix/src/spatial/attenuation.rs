//! Distance, cone, absorption and Doppler terms for positioned sources.

use crate::config::DistanceModel;
use crate::defs::{REVERB_DECAY_GAIN, SPEED_OF_SOUND_METERS_PER_SEC};
use crate::effect::EffectSlotProps;
use crate::math::{Vec3, lerpf};

/// Broadband, high and low frequency gains of one path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainTriplet {
    pub base: f32,
    pub hf: f32,
    pub lf: f32,
}

impl GainTriplet {
    pub fn new(base: f32) -> Self {
        Self {
            base,
            hf: 1.0,
            lf: 1.0,
        }
    }
}

impl Default for GainTriplet {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Per-send distance behavior derived from the target slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SendDecay {
    /// Rolloff applied to this send's gain.
    pub room_rolloff: f32,
    /// Distances in meters over which the slot's decay reaches -60 dB.
    pub base: f32,
    pub hf: f32,
    pub lf: f32,
}

impl SendDecay {
    /// Decay for a send into `slot`, or an unused send when `None`.
    pub fn for_slot(slot: Option<&EffectSlotProps>, rolloff: f32, room_rolloff: f32) -> Self {
        let Some(slot) = slot else {
            return Self::default();
        };
        if !slot.aux_send_auto {
            // Same falloff as the dry path, without the decay shaping.
            return Self {
                room_rolloff: rolloff,
                ..Default::default()
            };
        }

        let base = slot.decay_time * SPEED_OF_SOUND_METERS_PER_SEC;
        let mut hf = base * slot.decay_hf_ratio;
        if slot.decay_hf_limit && slot.air_absorption_gain_hf < 1.0 {
            // Air can't let the HF ring longer than its own -60 dB distance.
            let absorb_dist = REVERB_DECAY_GAIN.log10() / slot.air_absorption_gain_hf.log10();
            hf = hf.min(absorb_dist);
        }
        Self {
            room_rolloff: slot.room_rolloff_factor + room_rolloff,
            base,
            hf,
            lf: base * slot.decay_lf_ratio,
        }
    }
}

/// Parameters of a distance model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceParams {
    pub model: DistanceModel,
    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff: f32,
}

impl DistanceParams {
    fn clamped(&self) -> bool {
        matches!(
            self.model,
            DistanceModel::InverseClamped
                | DistanceModel::LinearClamped
                | DistanceModel::ExponentClamped
        )
    }

    /// Applies distance attenuation to the dry gain and each wet gain.
    ///
    /// Returns the distance used for absorption and decay. Clamped models
    /// whose max distance is below the reference distance attenuate as their
    /// unclamped form.
    pub fn attenuate(
        &self,
        distance: f32,
        dry: &mut GainTriplet,
        wet: &mut [GainTriplet],
        sends: &[SendDecay],
    ) -> f32 {
        let (ref_d, max_d) = (self.ref_distance, self.max_distance);
        let mut dist = distance;
        if self.clamped() && !(max_d < ref_d) {
            dist = dist.clamp(ref_d, max_d);
        }

        match self.model {
            DistanceModel::Inverse | DistanceModel::InverseClamped => {
                if !(ref_d > 0.0) {
                    return ref_d;
                }
                let scale = |rolloff: f32| {
                    let d = lerpf(ref_d, dist, rolloff);
                    if d > 0.0 { ref_d / d } else { 1.0 }
                };
                dry.base *= scale(self.rolloff);
                for (gain, send) in wet.iter_mut().zip(sends) {
                    gain.base *= scale(send.room_rolloff);
                }
            }
            DistanceModel::Linear | DistanceModel::LinearClamped => {
                if !(max_d != ref_d) {
                    return ref_d;
                }
                let scale = |rolloff: f32| {
                    let attn = rolloff * (dist - ref_d) / (max_d - ref_d);
                    (1.0 - attn).max(0.0)
                };
                dry.base *= scale(self.rolloff);
                for (gain, send) in wet.iter_mut().zip(sends) {
                    gain.base *= scale(send.room_rolloff);
                }
            }
            DistanceModel::Exponent | DistanceModel::ExponentClamped => {
                if !(dist > 0.0 && ref_d > 0.0) {
                    return ref_d;
                }
                let ratio = dist / ref_d;
                dry.base *= ratio.powf(-self.rolloff);
                for (gain, send) in wet.iter_mut().zip(sends) {
                    gain.base *= ratio.powf(-send.room_rolloff);
                }
            }
            DistanceModel::Disable => return ref_d,
        }
        dist
    }
}

/// Angle in degrees between the emission direction and the listener, 0 when
/// the source faces the listener.
///
/// `direction` and `to_source` are unit vectors in listener space.
pub fn cone_angle(direction: Vec3, to_source: Vec3) -> f32 {
    let cos = (-direction.dot(to_source)).clamp(-1.0, 1.0);
    (cos.acos() * 2.0).to_degrees()
}

/// Gain and HF gain for a cone `angle`, interpolated between the inner and
/// outer angles.
pub fn cone_gains(angle: f32, inner: f32, outer: f32, outer_gain: f32, outer_gain_hf: f32) -> (f32, f32) {
    if !(angle > inner) {
        (1.0, 1.0)
    } else if angle < outer {
        let scale = (angle - inner) / (outer - inner);
        (lerpf(1.0, outer_gain, scale), lerpf(1.0, outer_gain_hf, scale))
    } else {
        (outer_gain, outer_gain_hf)
    }
}

/// HF attenuation over `meters` of air.
pub fn air_absorption(gain_hf_per_meter: f32, meters: f32) -> f32 {
    gain_hf_per_meter.powf(meters)
}

/// Applies a slot's initial decay over `meters` to a wet gain.
pub fn apply_send_decay(gain: &mut GainTriplet, decay: &SendDecay, meters: f32) {
    if !(decay.base > 0.0) {
        return;
    }
    let base = REVERB_DECAY_GAIN.powf(meters / decay.base);
    gain.base *= base;
    if base > 0.0 {
        let hf = REVERB_DECAY_GAIN.powf(meters / decay.hf);
        gain.hf *= (hf / base).min(1.0);
        let lf = REVERB_DECAY_GAIN.powf(meters / decay.lf);
        gain.lf *= (lf / base).min(1.0);
    }
}

/// Doppler-shifted pitch.
///
/// Velocities are in listener space and `to_source` is the unit vector from
/// the listener to the source. Motion at or past the speed of sound clamps to
/// 0 (listener outrunning the wave) or infinity (source catching its own
/// wavefront).
pub fn doppler_pitch(
    pitch: f32,
    source_velocity: Vec3,
    listener_velocity: Vec3,
    to_source: Vec3,
    factor: f32,
    speed_of_sound: f32,
) -> f32 {
    if !(factor > 0.0) {
        return pitch;
    }
    let vss = source_velocity.dot(to_source) * -factor;
    let vls = listener_velocity.dot(to_source) * -factor;
    if !(vls < speed_of_sound) {
        0.0
    } else if !(vss < speed_of_sound) {
        f32::INFINITY
    } else {
        pitch * (speed_of_sound - vls) / (speed_of_sound - vss)
    }
}

/// Angular spread in radians of a source with `radius` seen from `distance`.
pub fn source_spread(radius: f32, distance: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    if radius > distance {
        TAU - distance / radius * PI
    } else if distance > 0.0 {
        (radius / distance).asin() * 2.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn params(model: DistanceModel) -> DistanceParams {
        DistanceParams {
            model,
            ref_distance: 1.0,
            max_distance: 10.0,
            rolloff: 1.0,
        }
    }

    fn dry_gain(p: &DistanceParams, distance: f32) -> f32 {
        let mut dry = GainTriplet::default();
        p.attenuate(distance, &mut dry, &mut [], &[]);
        dry.base
    }

    #[test]
    fn test_inverse_models() {
        assert_abs_diff_eq!(dry_gain(&params(DistanceModel::Inverse), 4.0), 0.25);
        assert_abs_diff_eq!(dry_gain(&params(DistanceModel::Inverse), 20.0), 0.05);
        assert_abs_diff_eq!(dry_gain(&params(DistanceModel::InverseClamped), 20.0), 0.1);
        assert_abs_diff_eq!(dry_gain(&params(DistanceModel::InverseClamped), 0.5), 1.0);
    }

    #[test]
    fn test_linear_and_exponent_models() {
        assert_abs_diff_eq!(dry_gain(&params(DistanceModel::Linear), 5.5), 0.5);
        assert_abs_diff_eq!(dry_gain(&params(DistanceModel::Linear), 20.0), 0.0);
        assert_abs_diff_eq!(dry_gain(&params(DistanceModel::ExponentClamped), 4.0), 0.25);
        assert_abs_diff_eq!(dry_gain(&params(DistanceModel::Disable), 4.0), 1.0);
    }

    #[test]
    fn test_clamp_skipped_when_max_below_ref() {
        let p = DistanceParams {
            max_distance: 0.5,
            ..params(DistanceModel::InverseClamped)
        };
        // Attenuates as plain inverse.
        assert_abs_diff_eq!(dry_gain(&p, 4.0), 0.25);
    }

    #[test]
    fn test_wet_uses_room_rolloff() {
        let p = params(DistanceModel::Inverse);
        let mut dry = GainTriplet::default();
        let mut wet = [GainTriplet::default(); 2];
        let sends = [
            SendDecay::default(),
            SendDecay {
                room_rolloff: 1.0,
                ..Default::default()
            },
        ];
        p.attenuate(4.0, &mut dry, &mut wet, &sends);
        assert_abs_diff_eq!(wet[0].base, 1.0);
        assert_abs_diff_eq!(wet[1].base, 0.25);
    }

    #[test]
    fn test_cone() {
        let to_source = Vec3::new(0.0, 0.0, -1.0);
        // Pointing back at the listener.
        assert_abs_diff_eq!(cone_angle(Vec3::Z, to_source), 0.0, epsilon = 1e-3);
        // Pointing away.
        assert_abs_diff_eq!(cone_angle(-Vec3::Z, to_source), 360.0, epsilon = 1e-3);
        assert_abs_diff_eq!(cone_angle(Vec3::X, to_source), 180.0, epsilon = 1e-3);

        assert_eq!(cone_gains(30.0, 60.0, 180.0, 0.0, 0.5), (1.0, 1.0));
        let (g, hf) = cone_gains(120.0, 60.0, 180.0, 0.0, 0.5);
        assert_abs_diff_eq!(g, 0.5);
        assert_abs_diff_eq!(hf, 0.75);
        assert_eq!(cone_gains(270.0, 60.0, 180.0, 0.2, 0.5), (0.2, 0.5));
    }

    #[test]
    fn test_doppler_clamps() {
        let to_source = Vec3::new(0.0, 0.0, -1.0);
        let still = Vec3::ZERO;
        assert_eq!(doppler_pitch(1.0, still, still, to_source, 1.0, 343.3), 1.0);

        // Source approaching at half the speed of sound.
        let approaching = Vec3::new(0.0, 0.0, 171.65);
        assert_abs_diff_eq!(
            doppler_pitch(1.0, approaching, still, to_source, 1.0, 343.3),
            2.0,
            epsilon = 1e-4
        );

        let supersonic = Vec3::new(0.0, 0.0, 400.0);
        assert_eq!(
            doppler_pitch(1.0, supersonic, still, to_source, 1.0, 343.3),
            f32::INFINITY
        );
        // Listener fleeing the source.
        assert_eq!(
            doppler_pitch(1.0, still, supersonic, to_source, 1.0, 343.3),
            0.0
        );
        assert_eq!(doppler_pitch(1.0, supersonic, still, to_source, 0.0, 343.3), 1.0);
    }

    #[test]
    fn test_spread() {
        assert_eq!(source_spread(0.0, 5.0), 0.0);
        assert_abs_diff_eq!(source_spread(1.0, 2.0), std::f32::consts::PI / 3.0, epsilon = 1e-5);
        // Inside the source the image wraps around the listener.
        assert_abs_diff_eq!(source_spread(2.0, 0.0), std::f32::consts::TAU);
    }

    #[test]
    fn test_send_decay() {
        let slot = EffectSlotProps {
            decay_time: 1.0,
            decay_hf_ratio: 0.5,
            decay_lf_ratio: 1.0,
            ..Default::default()
        };
        let decay = SendDecay::for_slot(Some(&slot), 1.0, 0.0);
        assert_abs_diff_eq!(decay.base, 343.3);
        assert_abs_diff_eq!(decay.hf, 171.65);

        let mut gain = GainTriplet::default();
        apply_send_decay(&mut gain, &decay, 343.3);
        assert_abs_diff_eq!(gain.base, 0.001, epsilon = 1e-6);
        assert_abs_diff_eq!(gain.hf, 0.001, epsilon = 1e-6);
        assert_abs_diff_eq!(gain.lf, 1.0, epsilon = 1e-6);

        let manual = EffectSlotProps {
            aux_send_auto: false,
            ..slot
        };
        assert_eq!(SendDecay::for_slot(Some(&manual), 0.7, 0.0).room_rolloff, 0.7);
    }
}
