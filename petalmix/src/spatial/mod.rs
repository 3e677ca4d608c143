//! Spatialization: from a source's props and the listener to voice targets.
//!
//! Everything here runs on the mixer thread when new props arrive. Only the
//! target side of each gain and HRTF filter is written; the voice ramps its
//! current values toward them while mixing.

pub mod attenuation;
pub mod panning;

pub use attenuation::{DistanceParams, GainTriplet, SendDecay};
pub use panning::{PanPosition, calc_panning_and_filters};

use crate::ambi::BFChannelConfig;
use crate::buffer::ChannelFormat;
use crate::config::{ContextProps, DirectMode, DistanceModel, ListenerProps, SpatializeMode};
use crate::defs::{AIR_ABSORB_GAIN_HF, GAIN_MIX_MAX, MAX_SENDS, pitch_to_step};
use crate::effect::EffectSlotProps;
use crate::math::{Mat3, Mat4, Vec3, listener_matrix, listener_rotation};
use crate::mixer::device::DeviceMix;
use crate::voice::{SendTarget, Voice};

/// Listener and context values as the mixer last applied them.
#[derive(Debug, Clone, Copy)]
pub struct ContextParams {
    /// World to listener space.
    pub matrix: Mat4,
    /// Listener velocity in listener space.
    pub velocity: Vec3,
    pub gain: f32,
    pub meters_per_unit: f32,
    pub doppler_factor: f32,
    /// Speed of sound scaled by the doppler velocity.
    pub speed_of_sound: f32,
    pub source_distance_model: bool,
    pub distance_model: DistanceModel,
    pub air_absorption_gain_hf: f32,
    pub cone_scale: f32,
}

impl Default for ContextParams {
    fn default() -> Self {
        let mut params = Self {
            matrix: Mat4::IDENTITY,
            velocity: Vec3::ZERO,
            gain: 1.0,
            meters_per_unit: 1.0,
            doppler_factor: 1.0,
            speed_of_sound: 0.0,
            source_distance_model: false,
            distance_model: DistanceModel::InverseClamped,
            air_absorption_gain_hf: AIR_ABSORB_GAIN_HF,
            cone_scale: 1.0,
        };
        params.apply_context(&ContextProps::default());
        params.apply_listener(&ListenerProps::default());
        params
    }
}

impl ContextParams {
    pub fn apply_listener(&mut self, props: &ListenerProps) {
        let rot: Mat3 = listener_rotation(props.orient_at, props.orient_up);
        self.matrix = listener_matrix(props.position, rot);
        self.velocity = rot * props.velocity;
        self.gain = props.gain;
        self.meters_per_unit = props.meters_per_unit;
    }

    pub fn apply_context(&mut self, props: &ContextProps) {
        self.doppler_factor = props.doppler_factor;
        self.speed_of_sound = props.speed_of_sound * props.doppler_velocity;
        self.source_distance_model = props.source_distance_model;
        self.distance_model = props.distance_model;
        self.air_absorption_gain_hf = props.air_absorption_gain_hf;
        self.cone_scale = props.cone_scale;
    }
}

/// An effect slot as seen by voices sending into it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotParams {
    pub props: EffectSlotProps,
    /// The slot exists and has a non-null effect.
    pub active: bool,
}

/// Read-only inputs for computing a voice's targets.
#[derive(Clone, Copy)]
pub struct SpatialEnv<'a> {
    pub context: &'a ContextParams,
    pub device: &'a DeviceMix,
    pub slots: &'a [SlotParams],
    /// Channel layout of every slot's wet bus.
    pub wet_map: &'a [BFChannelConfig],
}

impl SpatialEnv<'_> {
    fn active_slot(&self, index: Option<usize>) -> Option<(usize, &EffectSlotProps)> {
        let index = index?;
        self.slots
            .get(index)
            .filter(|slot| slot.active)
            .map(|slot| (index, &slot.props))
    }
}

/// Whether props describe a source that gets distance and direction.
fn is_positioned(voice: &Voice) -> bool {
    let props = &voice.props;
    let channels = voice.format.channels;
    let direct_multichannel = props.direct_channels != DirectMode::Off
        && channels != ChannelFormat::Mono
        && !channels.is_ambisonic();
    !(direct_multichannel
        || props.spatialize == SpatializeMode::Off
        || (props.spatialize == SpatializeMode::Auto && channels != ChannelFormat::Mono))
}

/// Recomputes every target of `voice` from its current props.
pub fn calc_source_params(voice: &mut Voice, env: &SpatialEnv<'_>) {
    if is_positioned(voice) {
        calc_attn_source_params(voice, env);
    } else {
        calc_non_attn_source_params(voice, env);
    }
}

fn update_step(voice: &mut Voice, pitch: f32, device: &DeviceMix) {
    let pitch = pitch * voice.frequency as f32 / device.frequency as f32;
    voice.step = pitch_to_step(pitch);
    voice.kernel = device
        .caps
        .prepare(voice.props.resampler, voice.step, &mut voice.interp);
}

fn final_gain(base: f32, path_gain: f32, voice: &Voice, env: &SpatialEnv<'_>) -> f32 {
    let props = &voice.props;
    (base.clamp(props.min_gain, props.max_gain) * path_gain * env.context.gain).min(GAIN_MIX_MAX)
}

/// Sources that play as-is around the listener: no distance, cones or Doppler.
fn calc_non_attn_source_params(voice: &mut Voice, env: &SpatialEnv<'_>) {
    let device = env.device;
    let num_sends = device.num_sends.min(MAX_SENDS);
    for i in 0..num_sends {
        voice.sends[i] = SendTarget {
            slot: env.active_slot(voice.props.sends[i].slot.map(|s| s.index())).map(|(i, _)| i),
            ..Default::default()
        };
    }

    update_step(voice, voice.props.pitch, device);

    let props = voice.props;
    let dry = GainTriplet {
        base: final_gain(props.gain, props.direct.gain, voice, env),
        hf: props.direct.gain_hf,
        lf: props.direct.gain_lf,
    };
    let mut wet = [GainTriplet::default(); MAX_SENDS];
    for (i, gain) in wet.iter_mut().enumerate().take(num_sends) {
        let send = &props.sends[i].filter;
        *gain = GainTriplet {
            base: final_gain(props.gain, send.gain, voice, env),
            hf: send.gain_hf,
            lf: send.gain_lf,
        };
    }

    let pos = PanPosition {
        dir: Vec3::new(0.0, 0.0, -1.0),
        distance: 0.0,
        spread: 0.0,
    };
    calc_panning_and_filters(voice, pos, dry, &wet, env);
}

/// Positioned sources.
fn calc_attn_source_params(voice: &mut Voice, env: &SpatialEnv<'_>) {
    let device = env.device;
    let context = env.context;
    let num_sends = device.num_sends.min(MAX_SENDS);
    let props = voice.props;

    let mut decay = [SendDecay::default(); MAX_SENDS];
    for i in 0..num_sends {
        let slot = env.active_slot(props.sends[i].slot.map(|s| s.index()));
        decay[i] = SendDecay::for_slot(
            slot.map(|(_, p)| p),
            props.rolloff_factor,
            props.room_rolloff_factor,
        );
        voice.sends[i] = SendTarget {
            slot: slot.map(|(idx, _)| idx),
            ..Default::default()
        };
    }

    // Into listener space.
    let mut position = props.position;
    let mut velocity = props.velocity;
    let mut direction = props.direction;
    if !props.head_relative {
        position = context.matrix.transform_point3(position);
        velocity = context.matrix.transform_vector3(velocity);
        direction = context.matrix.transform_vector3(direction);
    } else {
        velocity += context.velocity;
    }

    let directional = direction.length() > 0.0;
    let direction = direction.normalize_or_zero();
    let limit = (props.ref_distance / 1024.0).max(f32::EPSILON);
    let mut distance = position.length();
    let to_source = if distance > limit {
        position / distance
    } else {
        distance = 0.0;
        Vec3::ZERO
    };

    let mut dry = GainTriplet::new(props.gain);
    let mut wet = [dry; MAX_SENDS];

    let model = if context.source_distance_model {
        props.distance_model
    } else {
        context.distance_model
    };
    let attenuation = DistanceParams {
        model,
        ref_distance: props.ref_distance,
        max_distance: props.max_distance,
        rolloff: props.rolloff_factor,
    };
    let clamped_dist = attenuation.attenuate(
        distance,
        &mut dry,
        &mut wet[..num_sends],
        &decay[..num_sends],
    );

    if directional && props.inner_angle < 360.0 {
        let angle = attenuation::cone_angle(direction, to_source) * context.cone_scale;
        let (cone_gain, cone_hf) = attenuation::cone_gains(
            angle,
            props.inner_angle,
            props.outer_angle,
            props.outer_gain,
            props.outer_gain_hf,
        );
        dry.base *= cone_gain;
        if props.dry_gain_hf_auto {
            dry.hf *= cone_hf;
        }
        for gain in wet.iter_mut().take(num_sends) {
            if props.wet_gain_auto {
                gain.base *= cone_gain;
            }
            if props.wet_gain_hf_auto {
                gain.hf *= cone_hf;
            }
        }
    }

    dry.base = final_gain(dry.base, props.direct.gain, voice, env);
    dry.hf *= props.direct.gain_hf;
    dry.lf *= props.direct.gain_lf;
    for (i, gain) in wet.iter_mut().enumerate().take(num_sends) {
        let send = &props.sends[i].filter;
        gain.base = final_gain(gain.base, send.gain, voice, env);
        gain.hf *= send.gain_hf;
        gain.lf *= send.gain_lf;
    }

    if clamped_dist > props.ref_distance && props.rolloff_factor > 0.0 {
        let meters =
            (clamped_dist - props.ref_distance) * props.rolloff_factor * context.meters_per_unit;
        if props.air_absorption_factor > 0.0 {
            let hf = attenuation::air_absorption(
                context.air_absorption_gain_hf,
                meters * props.air_absorption_factor,
            );
            dry.hf *= hf;
            for gain in wet.iter_mut().take(num_sends) {
                gain.hf *= hf;
            }
        }
        if props.wet_gain_auto {
            for (gain, decay) in wet.iter_mut().zip(decay.iter()).take(num_sends) {
                attenuation::apply_send_decay(gain, decay, meters);
            }
        }
    }

    let pitch = attenuation::doppler_pitch(
        props.pitch,
        velocity,
        context.velocity,
        to_source,
        props.doppler_factor * context.doppler_factor,
        context.speed_of_sound,
    );
    update_step(voice, pitch, device);

    let spread = attenuation::source_spread(props.radius, distance);
    let pos = PanPosition {
        dir: to_source,
        distance: distance * context.meters_per_unit,
        spread,
    };
    calc_panning_and_filters(voice, pos, dry, &wet, env);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferFormat;
    use crate::config::{OutputLayout, PetalMixDeviceDesc, SourceProps};
    use crate::defs::MIXER_FRAC_ONE;
    use crate::voice::{DryTarget, VoiceSlot, VoiceStart};
    use approx::assert_abs_diff_eq;

    struct Setup {
        device: DeviceMix,
        context: ContextParams,
        slots: Vec<SlotParams>,
        wet_map: Vec<BFChannelConfig>,
    }

    impl Setup {
        fn new(desc: PetalMixDeviceDesc) -> Self {
            let (device, _) = DeviceMix::new(&desc).unwrap();
            let wet_map = crate::ambi::acn_map(device.wet_channels());
            Self {
                device,
                context: ContextParams::default(),
                slots: vec![SlotParams::default(); 2],
                wet_map,
            }
        }

        fn env(&self) -> SpatialEnv<'_> {
            SpatialEnv {
                context: &self.context,
                device: &self.device,
                slots: &self.slots,
                wet_map: &self.wet_map,
            }
        }

        fn voice(&self, channels: ChannelFormat, props: SourceProps) -> Voice {
            let mut voice = Voice::default();
            let start = VoiceStart {
                format: BufferFormat {
                    channels,
                    ..Default::default()
                },
                ..Default::default()
            };
            voice.start(&VoiceSlot::default(), &start, &self.device);
            voice.props = props;
            calc_source_params(&mut voice, &self.env());
            voice
        }
    }

    fn bformat() -> Setup {
        Setup::new(PetalMixDeviceDesc {
            output: OutputLayout::Ambi3D { order: 1 },
            ..Default::default()
        })
    }

    #[test]
    fn test_source_ahead_pans_forward() {
        let setup = bformat();
        let voice = setup.voice(
            ChannelFormat::Mono,
            SourceProps::spatial(Vec3::new(0.0, 0.0, -1.0)),
        );
        let gains = &voice.chans[0].dry.gains.target;
        assert_abs_diff_eq!(gains[0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(gains[1], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(gains[3], 1.732050808, epsilon = 1e-5);
        assert_eq!(voice.step, MIXER_FRAC_ONE);
    }

    #[test]
    fn test_cone_scale_narrows_the_angle() {
        let mut setup = bformat();
        // 60 degrees off the listener: between the inner and outer cones.
        let props = SourceProps {
            direction: Vec3::new(0.5, 0.0, 0.866_025_4),
            inner_angle: 40.0,
            outer_angle: 90.0,
            outer_gain: 0.0,
            ..SourceProps::spatial(Vec3::new(0.0, 0.0, -1.0))
        };
        let voice = setup.voice(ChannelFormat::Mono, props);
        assert_abs_diff_eq!(voice.chans[0].dry.gains.target[0], 0.6, epsilon = 1e-4);

        setup.context.apply_context(&ContextProps {
            cone_scale: ContextProps::HALF_ANGLE_CONE_SCALE,
            ..Default::default()
        });
        let voice = setup.voice(ChannelFormat::Mono, props);
        assert_abs_diff_eq!(voice.chans[0].dry.gains.target[0], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_inverse_distance_gain() {
        let setup = bformat();
        let voice = setup.voice(
            ChannelFormat::Mono,
            SourceProps::spatial(Vec3::new(0.0, 0.0, -4.0)),
        );
        assert_abs_diff_eq!(voice.chans[0].dry.gains.target[0], 0.25, epsilon = 1e-5);
    }

    #[test]
    fn test_listener_turn_moves_source() {
        let mut setup = bformat();
        setup.context.apply_listener(&ListenerProps {
            orient_at: Vec3::X,
            ..Default::default()
        });
        // A source at +X is now straight ahead.
        let voice = setup.voice(
            ChannelFormat::Mono,
            SourceProps::spatial(Vec3::new(2.0, 0.0, 0.0)),
        );
        let gains = &voice.chans[0].dry.gains.target;
        assert_abs_diff_eq!(gains[1], 0.0, epsilon = 1e-4);
        assert!(gains[3] > 0.8);
    }

    #[test]
    fn test_stereo_is_not_positioned_by_default() {
        let setup = bformat();
        let voice = setup.voice(
            ChannelFormat::Stereo,
            SourceProps::spatial(Vec3::new(0.0, 0.0, -10.0)),
        );
        // Unattenuated, each channel panned to its own side.
        let left = &voice.chans[0].dry.gains.target;
        assert_abs_diff_eq!(left[0], 1.0, epsilon = 1e-5);
        assert!(left[1] > 0.0);
        let right = &voice.chans[1].dry.gains.target;
        assert!(right[1] < 0.0);
    }

    #[test]
    fn test_direct_channels_match_outputs() {
        let setup = Setup::new(PetalMixDeviceDesc {
            output: OutputLayout::X51,
            ..Default::default()
        });
        let props = SourceProps {
            direct_channels: DirectMode::RemixMismatch,
            ..SourceProps::non_spatial()
        };
        let voice = setup.voice(ChannelFormat::Quad, props);
        assert_eq!(voice.dry_target, DryTarget::RealOut);
        // Back channels are remixed onto the sides of a 5.1 layout.
        let bl = &voice.chans[2].dry.gains.target;
        let side_left = setup.device.real_index(crate::config::Channel::SideLeft).unwrap();
        assert_abs_diff_eq!(bl[side_left], 1.0);
        let fl = &voice.chans[0].dry.gains.target;
        assert_abs_diff_eq!(fl[0], 1.0);
    }

    #[test]
    fn test_hrtf_voice_uses_filters() {
        let setup = Setup::new(PetalMixDeviceDesc {
            stereo_encoding: crate::config::StereoEncoding::Hrtf,
            ..Default::default()
        });
        let voice = setup.voice(
            ChannelFormat::Mono,
            SourceProps::spatial(Vec3::new(-1.0, 0.0, 0.0)),
        );
        assert!(voice.has_hrtf);
        let target = voice.chans[0].dry.hrtf.target;
        assert_abs_diff_eq!(target.gain, 1.0, epsilon = 1e-5);
        // Left of the listener: the right ear hears it later.
        assert!(target.delay[1] >= target.delay[0]);
    }

    #[test]
    fn test_doppler_changes_step() {
        let setup = bformat();
        let props = SourceProps {
            velocity: Vec3::new(0.0, 0.0, 171.65),
            ..SourceProps::spatial(Vec3::new(0.0, 0.0, -10.0))
        };
        let voice = setup.voice(ChannelFormat::Mono, props);
        assert_abs_diff_eq!(
            voice.step as f32 / MIXER_FRAC_ONE as f32,
            2.0,
            epsilon = 1e-3
        );
    }
}
