use crate::error::{PetalMixError, Result};
use crate::resampler::Resampler;

/// Physical speaker feed identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    FrontLeft,
    FrontRight,
    FrontCenter,
    Lfe,
    BackLeft,
    BackRight,
    BackCenter,
    SideLeft,
    SideRight,
    /// Raw ambisonic output channel, by index.
    Aux(u8),
}

/// Output channel configuration of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    Mono,
    Stereo,
    Quad,
    X51,
    X51Rear,
    X61,
    X71,
    /// Periphonic B-format output of the given order (1..=3).
    Ambi3D { order: usize },
}

const MONO: &[Channel] = &[Channel::FrontCenter];
const STEREO: &[Channel] = &[Channel::FrontLeft, Channel::FrontRight];
const QUAD: &[Channel] = &[
    Channel::FrontLeft,
    Channel::FrontRight,
    Channel::BackLeft,
    Channel::BackRight,
];
const X51: &[Channel] = &[
    Channel::FrontLeft,
    Channel::FrontRight,
    Channel::FrontCenter,
    Channel::Lfe,
    Channel::SideLeft,
    Channel::SideRight,
];
const X51_REAR: &[Channel] = &[
    Channel::FrontLeft,
    Channel::FrontRight,
    Channel::FrontCenter,
    Channel::Lfe,
    Channel::BackLeft,
    Channel::BackRight,
];
const X61: &[Channel] = &[
    Channel::FrontLeft,
    Channel::FrontRight,
    Channel::FrontCenter,
    Channel::Lfe,
    Channel::BackCenter,
    Channel::SideLeft,
    Channel::SideRight,
];
const X71: &[Channel] = &[
    Channel::FrontLeft,
    Channel::FrontRight,
    Channel::FrontCenter,
    Channel::Lfe,
    Channel::BackLeft,
    Channel::BackRight,
    Channel::SideLeft,
    Channel::SideRight,
];
const AMBI: &[Channel] = &[
    Channel::Aux(0),
    Channel::Aux(1),
    Channel::Aux(2),
    Channel::Aux(3),
    Channel::Aux(4),
    Channel::Aux(5),
    Channel::Aux(6),
    Channel::Aux(7),
    Channel::Aux(8),
    Channel::Aux(9),
    Channel::Aux(10),
    Channel::Aux(11),
    Channel::Aux(12),
    Channel::Aux(13),
    Channel::Aux(14),
    Channel::Aux(15),
];

impl OutputLayout {
    /// Channels in interleaved output order.
    pub fn channels(&self) -> &'static [Channel] {
        match self {
            Self::Mono => MONO,
            Self::Stereo => STEREO,
            Self::Quad => QUAD,
            Self::X51 => X51,
            Self::X51Rear => X51_REAR,
            Self::X61 => X61,
            Self::X71 => X71,
            Self::Ambi3D { order } => &AMBI[..(order + 1) * (order + 1)],
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }
}

/// How a stereo device renders the 3D mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StereoEncoding {
    /// Ambisonic decode to a pair of speakers at +/-30 degrees.
    #[default]
    Basic,
    /// Two-channel UHJ matrix encoding.
    Uhj,
    /// Binaural rendering for headphones.
    Hrtf,
}

/// HRTF rendering quality when `StereoEncoding::Hrtf` is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HrtfMode {
    /// Per-source HRTF filtering plus a first-order ambisonic bed.
    #[default]
    Full,
    /// Everything is panned through a first-order ambisonic HRTF rig.
    Ambi1,
    /// Everything is panned through a second-order ambisonic HRTF rig.
    Ambi2,
}

/// Channel ordering of B-format data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmbiLayout {
    #[default]
    Acn,
    FuMa,
}

/// Normalization of B-format data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmbiScaling {
    #[default]
    N3D,
    SN3D,
    FuMa,
}

/// Output sample representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    #[default]
    F32,
}

impl SampleType {
    pub fn bytes(&self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
        }
    }

    /// Default dither depth for integer formats, `None` for float output.
    pub fn default_dither_depth(&self) -> Option<u32> {
        match self {
            Self::I8 | Self::U8 => Some(8),
            Self::I16 | Self::U16 => Some(16),
            _ => None,
        }
    }
}

/// Configuration descriptor for a PetalMix device
#[derive(Debug, Clone)]
pub struct PetalMixDeviceDesc {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Speaker layout of the output
    pub output: OutputLayout,
    /// Rendering used for stereo output
    pub stereo_encoding: StereoEncoding,
    /// HRTF rig used when rendering binaurally
    pub hrtf_mode: HrtfMode,
    /// Channel order for `OutputLayout::Ambi3D`
    pub ambi_layout: AmbiLayout,
    /// Normalization for `OutputLayout::Ambi3D`
    pub ambi_scaling: AmbiScaling,
    /// Use dual-band decoders where the layout has one
    pub hq_decoder: bool,
    /// Re-synthesize a center image for layouts whose decoder skips the center speaker
    pub front_stabilizer: bool,
    /// Default resampler for new sources
    pub resampler: Resampler,
    /// Number of voices allocated up front
    pub max_voices: usize,
    /// Auxiliary sends per source
    pub num_aux_sends: usize,
    /// Effect slots allocated up front
    pub max_effect_slots: usize,
    /// Near-field compensation reference distance in meters (0 disables)
    pub nfc_distance: f32,
    /// Optional speaker distances in meters, in output channel order
    pub speaker_distances: Option<Vec<f32>>,
    /// Crossover frequency for dual-band processing
    pub xover_freq: f32,
    /// Enable the output limiter
    pub limiter: bool,
    /// Dither depth in bits (None disables, defaults follow the sample type)
    pub dither_depth: Option<u32>,
    /// Output sample type
    pub sample_type: SampleType,
    /// Capacity of the mixer-to-application event ring
    pub event_ring_size: usize,
}

impl Default for PetalMixDeviceDesc {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            output: OutputLayout::Stereo,
            stereo_encoding: StereoEncoding::Basic,
            hrtf_mode: HrtfMode::Full,
            ambi_layout: AmbiLayout::Acn,
            ambi_scaling: AmbiScaling::N3D,
            hq_decoder: true,
            front_stabilizer: false,
            resampler: Resampler::Linear,
            max_voices: 64,
            num_aux_sends: 2,
            max_effect_slots: 4,
            nfc_distance: 0.0,
            speaker_distances: None,
            xover_freq: 400.0,
            limiter: false,
            dither_depth: None,
            sample_type: SampleType::F32,
            event_ring_size: 511,
        }
    }
}

impl PetalMixDeviceDesc {
    /// Checks the descriptor for values the renderer cannot honor.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::Configuration` describing the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PetalMixError::Configuration(
                "Sample rate must be greater than 0".into(),
            ));
        }
        if self.max_voices == 0 {
            return Err(PetalMixError::Configuration(
                "At least one voice is required".into(),
            ));
        }
        if self.num_aux_sends > crate::defs::MAX_SENDS {
            return Err(PetalMixError::Configuration(format!(
                "Too many auxiliary sends: {} (max {})",
                self.num_aux_sends,
                crate::defs::MAX_SENDS
            )));
        }
        if let OutputLayout::Ambi3D { order } = self.output {
            if !(1..=crate::defs::MAX_AMBI_ORDER).contains(&order) {
                return Err(PetalMixError::Configuration(format!(
                    "Unsupported ambisonic output order {}",
                    order
                )));
            }
        }
        if let Some(distances) = &self.speaker_distances {
            if distances.len() != self.output.channel_count() {
                return Err(PetalMixError::Configuration(format!(
                    "Expected {} speaker distances, got {}",
                    self.output.channel_count(),
                    distances.len()
                )));
            }
            if distances.iter().any(|d| !(d.is_finite() && *d >= 0.0)) {
                return Err(PetalMixError::Configuration(
                    "Speaker distances must be finite and non-negative".into(),
                ));
            }
        }
        if !(self.xover_freq > 0.0 && self.xover_freq < self.sample_rate as f32 * 0.5) {
            return Err(PetalMixError::Configuration(format!(
                "Crossover frequency {} Hz is out of range",
                self.xover_freq
            )));
        }
        if self.event_ring_size == 0 {
            return Err(PetalMixError::Configuration(
                "Event ring needs a non-zero capacity".into(),
            ));
        }
        Ok(())
    }

    /// Dither depth after applying the sample type default.
    pub fn effective_dither_depth(&self) -> Option<u32> {
        self.dither_depth
            .or_else(|| self.sample_type.default_dither_depth())
            .filter(|bits| *bits > 0 && *bits <= 24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_desc_is_valid() {
        assert!(PetalMixDeviceDesc::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let desc = PetalMixDeviceDesc {
            num_aux_sends: 7,
            ..Default::default()
        };
        assert!(desc.validate().is_err());

        let desc = PetalMixDeviceDesc {
            output: OutputLayout::Ambi3D { order: 4 },
            ..Default::default()
        };
        assert!(desc.validate().is_err());

        let desc = PetalMixDeviceDesc {
            speaker_distances: Some(vec![1.0]),
            ..Default::default()
        };
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_layout_channel_counts() {
        assert_eq!(OutputLayout::X71.channel_count(), 8);
        assert_eq!(OutputLayout::X61.channel_count(), 7);
        assert_eq!(OutputLayout::Ambi3D { order: 2 }.channel_count(), 9);
    }

    #[test]
    fn test_dither_defaults() {
        let mut desc = PetalMixDeviceDesc::default();
        assert_eq!(desc.effective_dither_depth(), None);
        desc.sample_type = SampleType::I16;
        assert_eq!(desc.effective_dither_depth(), Some(16));
        desc.dither_depth = Some(0);
        assert_eq!(desc.effective_dither_depth(), None);
    }
}
