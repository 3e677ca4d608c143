//! Device render setup: which bus voices pan into and how it reaches the
//! speakers.

use std::sync::Arc;

use crate::ambi::{
    BFChannelConfig, BFormatDec, FROM_ACN_2D, FROM_FUMA, FrontStabilizer, SCALE_FROM_FUMA,
    Uhj2Encoder, acn_map, builtin_decoder, layout_map, scales,
};
use crate::config::{Channel, HrtfMode, OutputLayout, PetalMixDeviceDesc, StereoEncoding};
use crate::defs::{
    MAX_AMBI_ORDER, SPEED_OF_SOUND_METERS_PER_SEC, ambi_2d_channels_from_order,
    ambi_channels_from_order,
};
use crate::error::{PetalMixError, Result};
use crate::hrtf::{DirectHrtfState, HrtfStore};
use crate::resampler::ResamplerCaps;

/// How point sources are panned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Ambisonic panning into the dry bus.
    Normal,
    /// Ambisonic panning with front angles widened for a speaker pair.
    Pairwise,
    /// Per-source HRTF filtering.
    Hrtf,
}

/// Where a source channel missing from the output goes.
#[derive(Debug, Clone, Copy)]
pub struct RemixEntry {
    pub channel: Channel,
    pub targets: &'static [(Channel, f32)],
}

use Channel::{BackCenter, BackLeft, BackRight, FrontCenter, FrontLeft, FrontRight};
use Channel::{SideLeft, SideRight};

const REMIX_MONO: &[RemixEntry] = &[
    RemixEntry { channel: FrontLeft, targets: &[(FrontCenter, 0.5)] },
    RemixEntry { channel: FrontRight, targets: &[(FrontCenter, 0.5)] },
    RemixEntry { channel: SideLeft, targets: &[(FrontCenter, 0.5 / 9.0)] },
    RemixEntry { channel: SideRight, targets: &[(FrontCenter, 0.5 / 9.0)] },
    RemixEntry { channel: BackLeft, targets: &[(FrontCenter, 0.5 / 9.0)] },
    RemixEntry { channel: BackRight, targets: &[(FrontCenter, 0.5 / 9.0)] },
    RemixEntry { channel: BackCenter, targets: &[(FrontCenter, 1.0 / 9.0)] },
];
const REMIX_STEREO: &[RemixEntry] = &[
    RemixEntry { channel: FrontCenter, targets: &[(FrontLeft, 0.5), (FrontRight, 0.5)] },
    RemixEntry { channel: SideLeft, targets: &[(FrontLeft, 1.0 / 9.0)] },
    RemixEntry { channel: SideRight, targets: &[(FrontRight, 1.0 / 9.0)] },
    RemixEntry { channel: BackLeft, targets: &[(FrontLeft, 1.0 / 9.0)] },
    RemixEntry { channel: BackRight, targets: &[(FrontRight, 1.0 / 9.0)] },
    RemixEntry {
        channel: BackCenter,
        targets: &[(FrontLeft, 0.5 / 9.0), (FrontRight, 0.5 / 9.0)],
    },
];
const REMIX_QUAD: &[RemixEntry] = &[
    RemixEntry { channel: FrontCenter, targets: &[(FrontLeft, 0.5), (FrontRight, 0.5)] },
    RemixEntry { channel: SideLeft, targets: &[(FrontLeft, 0.5), (BackLeft, 0.5)] },
    RemixEntry { channel: SideRight, targets: &[(FrontRight, 0.5), (BackRight, 0.5)] },
    RemixEntry { channel: BackCenter, targets: &[(BackLeft, 0.5), (BackRight, 0.5)] },
];
const REMIX_X51: &[RemixEntry] = &[
    RemixEntry { channel: BackLeft, targets: &[(SideLeft, 1.0)] },
    RemixEntry { channel: BackRight, targets: &[(SideRight, 1.0)] },
    RemixEntry { channel: BackCenter, targets: &[(SideLeft, 0.5), (SideRight, 0.5)] },
];
const REMIX_X51_REAR: &[RemixEntry] = &[
    RemixEntry { channel: SideLeft, targets: &[(BackLeft, 1.0)] },
    RemixEntry { channel: SideRight, targets: &[(BackRight, 1.0)] },
    RemixEntry { channel: BackCenter, targets: &[(BackLeft, 0.5), (BackRight, 0.5)] },
];
const REMIX_X61: &[RemixEntry] = &[
    RemixEntry { channel: BackLeft, targets: &[(BackCenter, 0.5), (SideLeft, 0.5)] },
    RemixEntry { channel: BackRight, targets: &[(BackCenter, 0.5), (SideRight, 0.5)] },
];
const REMIX_X71: &[RemixEntry] = &[
    RemixEntry { channel: BackCenter, targets: &[(BackLeft, 0.5), (BackRight, 0.5)] },
];

fn remix_map(layout: OutputLayout) -> &'static [RemixEntry] {
    match layout {
        OutputLayout::Mono => REMIX_MONO,
        OutputLayout::Stereo => REMIX_STEREO,
        OutputLayout::Quad => REMIX_QUAD,
        OutputLayout::X51 => REMIX_X51,
        OutputLayout::X51Rear => REMIX_X51_REAR,
        OutputLayout::X61 => REMIX_X61,
        OutputLayout::X71 => REMIX_X71,
        OutputLayout::Ambi3D { .. } => &[],
    }
}

/// Device-level stage turning the dry bus into speaker feeds.
pub enum PostProcess {
    /// The dry bus is the output.
    None,
    Decode(BFormatDec),
    Hrtf(DirectHrtfState),
    Uhj(Uhj2Encoder),
}

impl PostProcess {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Decode(_) => "ambisonic decode",
            Self::Hrtf(_) => "binaural",
            Self::Uhj(_) => "UHJ",
        }
    }
}

/// Everything voices need to know about the device's mix.
#[derive(Debug, Clone)]
pub struct DeviceMix {
    pub frequency: u32,
    pub output: OutputLayout,
    pub render_mode: RenderMode,
    /// Physical output channels.
    pub real_out: Vec<Channel>,
    /// Channel layout of the dry bus.
    pub dry_map: Vec<BFChannelConfig>,
    /// The dry bus is the output (raw B-format).
    pub dry_is_real: bool,
    pub ambi_order: usize,
    /// Dry bus channels per ambisonic order.
    pub nfc_chans: [usize; MAX_AMBI_ORDER + 1],
    /// Near-field reference distance, 0 when disabled.
    pub avg_speaker_dist: f32,
    pub xover_freq: f32,
    pub hrtf: Option<Arc<HrtfStore>>,
    pub ir_size: usize,
    pub num_sends: usize,
    pub remix: &'static [RemixEntry],
    pub caps: ResamplerCaps,
}

fn chans_per_order(order: usize, is_2d: bool) -> [usize; MAX_AMBI_ORDER + 1] {
    let mut out = [0; MAX_AMBI_ORDER + 1];
    for (i, count) in out.iter_mut().enumerate().take(order + 1) {
        *count = match (i, is_2d) {
            (0, _) => 1,
            (_, true) => 2,
            (_, false) => i * 2 + 1,
        };
    }
    out
}

impl DeviceMix {
    /// Chooses the renderer for `desc` and builds its post stage.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::Configuration` for a descriptor that fails
    /// validation.
    pub fn new(desc: &PetalMixDeviceDesc) -> Result<(Self, PostProcess)> {
        desc.validate()?;

        let rate = desc.sample_rate;
        let xover_norm = desc.xover_freq / rate as f32;
        let mut device = Self {
            frequency: rate,
            output: desc.output,
            render_mode: RenderMode::Normal,
            real_out: desc.output.channels().to_vec(),
            dry_map: Vec::new(),
            dry_is_real: false,
            ambi_order: 0,
            nfc_chans: [0; MAX_AMBI_ORDER + 1],
            avg_speaker_dist: 0.0,
            xover_freq: desc.xover_freq,
            hrtf: None,
            ir_size: 0,
            num_sends: desc.num_aux_sends,
            remix: remix_map(desc.output),
            caps: ResamplerCaps::new(),
        };
        let nfc_dist = || {
            (desc.nfc_distance > 0.0).then(|| desc.nfc_distance.clamp(0.1, 10.0))
        };

        let post = match (desc.output, desc.stereo_encoding) {
            (OutputLayout::Ambi3D { order }, _) => {
                let map = layout_map(desc.ambi_layout, false);
                let scale = scales(desc.ambi_scaling);
                device.dry_map = map[..ambi_channels_from_order(order)]
                    .iter()
                    .map(|acn| BFChannelConfig::new(*acn as usize, 1.0 / scale[*acn as usize]))
                    .collect();
                device.dry_is_real = true;
                device.ambi_order = order;
                device.nfc_chans = chans_per_order(order, false);
                device.avg_speaker_dist = nfc_dist().unwrap_or(0.0);
                log::info!(
                    "Rendering order {} B-format ({:?}/{:?})",
                    order,
                    desc.ambi_layout,
                    desc.ambi_scaling
                );
                PostProcess::None
            }
            (OutputLayout::Stereo, StereoEncoding::Hrtf) => {
                let store = HrtfStore::spherical_head(rate);
                let order = match desc.hrtf_mode {
                    HrtfMode::Full | HrtfMode::Ambi1 => 1,
                    HrtfMode::Ambi2 => 2,
                };
                if desc.hrtf_mode == HrtfMode::Full {
                    device.render_mode = RenderMode::Hrtf;
                }
                device.dry_map = acn_map(ambi_channels_from_order(order));
                device.ambi_order = order;
                device.nfc_chans = chans_per_order(order, false);
                if desc.nfc_distance > 0.0 {
                    device.avg_speaker_dist = store.field_distance();
                }
                let state = DirectHrtfState::new(&store, order, xover_norm);
                device.ir_size = state.ir_size().max(store.ir_size());
                log::info!(
                    "Rendering binaural output ({:?}, {} measurements)",
                    desc.hrtf_mode,
                    store.measurement_count()
                );
                device.hrtf = Some(store);
                PostProcess::Hrtf(state)
            }
            (OutputLayout::Stereo, StereoEncoding::Uhj) => {
                device.dry_map = FROM_FUMA[..3]
                    .iter()
                    .map(|acn| {
                        BFChannelConfig::new(*acn as usize, 1.0 / SCALE_FROM_FUMA[*acn as usize])
                    })
                    .collect();
                device.ambi_order = 1;
                device.nfc_chans = chans_per_order(1, true);
                log::info!("Rendering UHJ stereo output");
                PostProcess::Uhj(Uhj2Encoder::new())
            }
            (layout, _) => {
                let config = builtin_decoder(layout).ok_or_else(|| {
                    PetalMixError::Configuration(format!("No decoder for {:?}", layout))
                })?;
                let order = config.order;
                device.dry_map = FROM_ACN_2D[..ambi_2d_channels_from_order(order)]
                    .iter()
                    .map(|acn| BFChannelConfig::new(*acn as usize, 1.0))
                    .collect();
                device.ambi_order = order;
                device.nfc_chans = chans_per_order(order, true);
                device.avg_speaker_dist = nfc_dist().unwrap_or(0.0);
                if layout == OutputLayout::Stereo {
                    device.render_mode = RenderMode::Pairwise;
                }

                let stabilizer = if desc.front_stabilizer
                    && !config.channels.contains(&Channel::FrontCenter)
                {
                    FrontStabilizer::new(&device.real_out, rate)
                } else {
                    None
                };
                let decoder =
                    BFormatDec::new(&config, &device.real_out, desc.hq_decoder, xover_norm, stabilizer);
                log::info!(
                    "Decoding order {} ambisonics to {:?} ({}{})",
                    order,
                    layout,
                    if decoder.is_dual_band() { "dual-band" } else { "single-band" },
                    if decoder.has_stabilizer() { ", front stabilizer" } else { "" }
                );
                PostProcess::Decode(decoder)
            }
        };

        if device.avg_speaker_dist > 0.0 {
            log::info!(
                "Near-field compensation at {:.2} m",
                device.avg_speaker_dist
            );
        }
        Ok((device, post))
    }

    /// Number of lines in the main bus: dry lines, then real output lines
    /// unless they are the same.
    pub fn main_channels(&self) -> usize {
        if self.dry_is_real {
            self.dry_map.len()
        } else {
            self.dry_map.len() + self.real_out.len()
        }
    }

    pub fn dry_range(&self) -> std::ops::Range<usize> {
        0..self.dry_map.len()
    }

    pub fn real_range(&self) -> std::ops::Range<usize> {
        if self.dry_is_real {
            self.dry_range()
        } else {
            self.dry_map.len()..self.dry_map.len() + self.real_out.len()
        }
    }

    /// Channels of each effect slot's wet bus.
    pub fn wet_channels(&self) -> usize {
        ambi_channels_from_order(self.ambi_order)
    }

    /// Index of a physical channel in the real output.
    pub fn real_index(&self, channel: Channel) -> Option<usize> {
        self.real_out.iter().position(|c| *c == channel)
    }

    /// Distance coefficient for near-field filters at `distance` meters.
    pub fn nfc_w(&self, distance: f32) -> f32 {
        SPEED_OF_SOUND_METERS_PER_SEC / (distance * self.frequency as f32)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(frequency: u32, ambi_order: usize) -> Self {
        Self {
            frequency,
            output: OutputLayout::Ambi3D { order: ambi_order },
            render_mode: RenderMode::Normal,
            real_out: OutputLayout::Ambi3D { order: ambi_order }.channels().to_vec(),
            dry_map: acn_map(ambi_channels_from_order(ambi_order)),
            dry_is_real: true,
            ambi_order,
            nfc_chans: chans_per_order(ambi_order, false),
            avg_speaker_dist: 0.0,
            xover_freq: 400.0,
            hrtf: None,
            ir_size: 0,
            num_sends: 2,
            remix: &[],
            caps: ResamplerCaps::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_uses_pairwise_decode() {
        let (device, post) = DeviceMix::new(&PetalMixDeviceDesc::default()).unwrap();
        assert_eq!(device.render_mode, RenderMode::Pairwise);
        assert!(matches!(post, PostProcess::Decode(_)));
        assert_eq!(device.dry_map.len(), 3);
        assert_eq!(device.real_range(), 3..5);
        assert_eq!(device.nfc_chans, [1, 2, 0, 0]);
    }

    #[test]
    fn test_hrtf_full_renders_per_source() {
        let desc = PetalMixDeviceDesc {
            stereo_encoding: StereoEncoding::Hrtf,
            ..Default::default()
        };
        let (device, post) = DeviceMix::new(&desc).unwrap();
        assert_eq!(device.render_mode, RenderMode::Hrtf);
        assert!(device.hrtf.is_some());
        assert_eq!(device.dry_map.len(), 4);
        assert!(matches!(post, PostProcess::Hrtf(_)));

        let desc = PetalMixDeviceDesc {
            stereo_encoding: StereoEncoding::Hrtf,
            hrtf_mode: HrtfMode::Ambi2,
            ..Default::default()
        };
        let (device, _) = DeviceMix::new(&desc).unwrap();
        assert_eq!(device.render_mode, RenderMode::Normal);
        assert_eq!(device.dry_map.len(), 9);
    }

    #[test]
    fn test_raw_bformat_output() {
        let desc = PetalMixDeviceDesc {
            output: OutputLayout::Ambi3D { order: 2 },
            ambi_layout: crate::config::AmbiLayout::FuMa,
            ambi_scaling: crate::config::AmbiScaling::FuMa,
            nfc_distance: 20.0,
            ..Default::default()
        };
        let (device, post) = DeviceMix::new(&desc).unwrap();
        assert!(device.dry_is_real);
        assert_eq!(device.main_channels(), 9);
        assert_eq!(device.dry_map[1].index, 3);
        assert_eq!(device.avg_speaker_dist, 10.0);
        assert!(matches!(post, PostProcess::None));
    }

    #[test]
    fn test_uhj_bus_is_fuma_first_order() {
        let desc = PetalMixDeviceDesc {
            stereo_encoding: StereoEncoding::Uhj,
            ..Default::default()
        };
        let (device, post) = DeviceMix::new(&desc).unwrap();
        let indices: Vec<usize> = device.dry_map.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 3, 1]);
        assert!(matches!(post, PostProcess::Uhj(_)));
    }

    #[test]
    fn test_surround_remix_tables() {
        let (device, _) = DeviceMix::new(&PetalMixDeviceDesc {
            output: OutputLayout::X51,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(device.render_mode, RenderMode::Normal);
        let back = device.remix.iter().find(|e| e.channel == BackLeft).unwrap();
        assert_eq!(back.targets, &[(SideLeft, 1.0)]);
    }
}
