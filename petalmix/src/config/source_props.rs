use crate::defs::{AIR_ABSORB_GAIN_HF, MAX_SENDS, SPEED_OF_SOUND_METERS_PER_SEC};
use crate::effect::EffectSlotId;
use crate::math::Vec3;
use crate::resampler::Resampler;

/// Distance attenuation model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceModel {
    Disable,
    Inverse,
    #[default]
    InverseClamped,
    Linear,
    LinearClamped,
    Exponent,
    ExponentClamped,
}

/// Whether a source is positioned in 3D.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpatializeMode {
    Off,
    On,
    /// Spatialize mono sources only.
    #[default]
    Auto,
}

/// Direct channel passthrough for multichannel sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectMode {
    #[default]
    Off,
    /// Channels missing on the output are dropped.
    DropMismatch,
    /// Channels missing on the output are panned into the mix.
    RemixMismatch,
}

/// Low/high shelf filter parameters for a path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterProps {
    pub gain: f32,
    pub gain_hf: f32,
    pub hf_reference: f32,
    pub gain_lf: f32,
    pub lf_reference: f32,
}

impl Default for FilterProps {
    fn default() -> Self {
        Self {
            gain: 1.0,
            gain_hf: 1.0,
            hf_reference: 5000.0,
            gain_lf: 1.0,
            lf_reference: 250.0,
        }
    }
}

/// An auxiliary send: target slot plus its filter.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SendProps {
    pub slot: Option<EffectSlotId>,
    pub filter: FilterProps,
}

/// Every tunable of a source that affects mixing.
///
/// This is the payload of a props snapshot. Values are expected to be validated
/// before they are published.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceProps {
    pub pitch: f32,
    pub gain: f32,
    pub outer_gain: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    /// Cone angles in degrees.
    pub inner_angle: f32,
    pub outer_angle: f32,
    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
    pub position: Vec3,
    pub velocity: Vec3,
    pub direction: Vec3,
    /// Orientation used to rotate B-format sources.
    pub orient_at: Vec3,
    pub orient_up: Vec3,
    pub head_relative: bool,
    pub distance_model: DistanceModel,
    pub resampler: Resampler,
    pub direct_channels: DirectMode,
    pub spatialize: SpatializeMode,
    pub dry_gain_hf_auto: bool,
    pub wet_gain_auto: bool,
    pub wet_gain_hf_auto: bool,
    pub outer_gain_hf: f32,
    pub air_absorption_factor: f32,
    pub room_rolloff_factor: f32,
    pub doppler_factor: f32,
    /// Left/right angles in radians for stereo sources.
    pub stereo_pan: [f32; 2],
    /// Source radius, spreading the image when the listener is close.
    pub radius: f32,
    pub direct: FilterProps,
    pub sends: [SendProps; MAX_SENDS],
}

impl Default for SourceProps {
    fn default() -> Self {
        Self {
            pitch: 1.0,
            gain: 1.0,
            outer_gain: 0.0,
            min_gain: 0.0,
            max_gain: 1.0,
            inner_angle: 360.0,
            outer_angle: 360.0,
            ref_distance: 1.0,
            max_distance: f32::MAX,
            rolloff_factor: 1.0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            direction: Vec3::ZERO,
            orient_at: Vec3::new(0.0, 0.0, -1.0),
            orient_up: Vec3::new(0.0, 1.0, 0.0),
            head_relative: false,
            distance_model: DistanceModel::InverseClamped,
            resampler: Resampler::default(),
            direct_channels: DirectMode::Off,
            spatialize: SpatializeMode::Auto,
            dry_gain_hf_auto: true,
            wet_gain_auto: true,
            wet_gain_hf_auto: true,
            outer_gain_hf: 1.0,
            air_absorption_factor: 0.0,
            room_rolloff_factor: 0.0,
            doppler_factor: 1.0,
            stereo_pan: [30f32.to_radians(), (-30f32).to_radians()],
            radius: 0.0,
            direct: FilterProps::default(),
            sends: [SendProps::default(); MAX_SENDS],
        }
    }
}

impl SourceProps {
    /// A positioned mono-style source at `position`.
    pub fn spatial(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// A source that follows the listener, for music and UI sounds.
    pub fn non_spatial() -> Self {
        Self {
            head_relative: true,
            spatialize: SpatializeMode::Off,
            ..Default::default()
        }
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_pitch(mut self, pitch: f32) -> Self {
        self.pitch = pitch;
        self
    }

    pub fn with_send(mut self, index: usize, slot: EffectSlotId) -> Self {
        if let Some(send) = self.sends.get_mut(index) {
            send.slot = Some(slot);
        }
        self
    }
}

/// Listener properties.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerProps {
    pub position: Vec3,
    pub velocity: Vec3,
    pub orient_at: Vec3,
    pub orient_up: Vec3,
    pub gain: f32,
    pub meters_per_unit: f32,
}

impl Default for ListenerProps {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            orient_at: Vec3::new(0.0, 0.0, -1.0),
            orient_up: Vec3::new(0.0, 1.0, 0.0),
            gain: 1.0,
            meters_per_unit: 1.0,
        }
    }
}

/// Context-wide properties.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextProps {
    pub doppler_factor: f32,
    pub doppler_velocity: f32,
    pub speed_of_sound: f32,
    /// Use each source's distance model instead of the context's.
    pub source_distance_model: bool,
    pub distance_model: DistanceModel,
    /// HF gain per meter of air absorption.
    pub air_absorption_gain_hf: f32,
    /// Multiplier on the angle between a source's direction and the
    /// listener before it is compared with the cone angles.
    pub cone_scale: f32,
}

impl ContextProps {
    /// Reads cone angles as half-angles from the source direction.
    pub const HALF_ANGLE_CONE_SCALE: f32 = 0.5;
}

impl Default for ContextProps {
    fn default() -> Self {
        Self {
            doppler_factor: 1.0,
            doppler_velocity: 1.0,
            speed_of_sound: SPEED_OF_SOUND_METERS_PER_SEC,
            source_distance_model: false,
            distance_model: DistanceModel::InverseClamped,
            air_absorption_gain_hf: AIR_ABSORB_GAIN_HF,
            cone_scale: 1.0,
        }
    }
}
