//! Turns a source direction into per-channel gain and HRTF targets.

use std::f32::consts::TAU;

use super::SpatialEnv;
use super::attenuation::GainTriplet;
use crate::ambi::{
    AmbiCoeffs, ORDER_FROM_CHANNEL, calc_angle_coeffs, calc_direction_coeffs, compute_pan_gains,
    layout_map, orientation_rotation, scale_azimuth_front, scales, wrap_radians,
};
use crate::buffer::ChannelFormat;
use crate::config::{Channel, DirectMode, OutputLayout};
use crate::defs::{MAX_SENDS, SPEED_OF_SOUND_METERS_PER_SEC};
use crate::filters::BiquadType;
use crate::hrtf::HrtfFilter;
use crate::mixer::device::RenderMode;
use crate::voice::{DryTarget, FilterType, Voice};

/// A source channel's speaker position.
#[derive(Debug, Clone, Copy)]
struct ChanMap {
    channel: Channel,
    angle: f32,
    elevation: f32,
}

const fn speaker(channel: Channel, degrees: f32) -> ChanMap {
    ChanMap {
        channel,
        angle: degrees * std::f32::consts::PI / 180.0,
        elevation: 0.0,
    }
}

const MONO_MAP: [ChanMap; 1] = [speaker(Channel::FrontCenter, 0.0)];
const REAR_MAP: [ChanMap; 2] = [speaker(Channel::BackLeft, -150.0), speaker(Channel::BackRight, 150.0)];
const QUAD_MAP: [ChanMap; 4] = [
    speaker(Channel::FrontLeft, -45.0),
    speaker(Channel::FrontRight, 45.0),
    speaker(Channel::BackLeft, -135.0),
    speaker(Channel::BackRight, 135.0),
];
const X51_MAP: [ChanMap; 6] = [
    speaker(Channel::FrontLeft, -30.0),
    speaker(Channel::FrontRight, 30.0),
    speaker(Channel::FrontCenter, 0.0),
    speaker(Channel::Lfe, 0.0),
    speaker(Channel::SideLeft, -110.0),
    speaker(Channel::SideRight, 110.0),
];
const X61_MAP: [ChanMap; 7] = [
    speaker(Channel::FrontLeft, -30.0),
    speaker(Channel::FrontRight, 30.0),
    speaker(Channel::FrontCenter, 0.0),
    speaker(Channel::Lfe, 0.0),
    speaker(Channel::BackCenter, 180.0),
    speaker(Channel::SideLeft, -90.0),
    speaker(Channel::SideRight, 90.0),
];
const X71_MAP: [ChanMap; 8] = [
    speaker(Channel::FrontLeft, -30.0),
    speaker(Channel::FrontRight, 30.0),
    speaker(Channel::FrontCenter, 0.0),
    speaker(Channel::Lfe, 0.0),
    speaker(Channel::BackLeft, -150.0),
    speaker(Channel::BackRight, 150.0),
    speaker(Channel::SideLeft, -90.0),
    speaker(Channel::SideRight, 90.0),
];

/// Source position relative to the listener: unit direction (or zero) plus
/// distance in meters and angular spread.
#[derive(Debug, Clone, Copy)]
pub struct PanPosition {
    pub dir: crate::math::Vec3,
    pub distance: f32,
    pub spread: f32,
}

/// Elevation and clockwise azimuth of a listener-space direction.
fn direction_angles(dir: crate::math::Vec3) -> (f32, f32) {
    let ev = dir.y.clamp(-1.0, 1.0).asin();
    let az = dir.x.atan2(-dir.z);
    (ev, az)
}

fn pan_coeffs(mode: RenderMode, dir: crate::math::Vec3, spread: f32) -> AmbiCoeffs {
    if mode != RenderMode::Pairwise {
        return calc_direction_coeffs(dir, spread);
    }
    let (ev, az) = direction_angles(dir);
    // +/-60 degrees lands on the speakers.
    calc_angle_coeffs(scale_azimuth_front(az, 1.5), ev, spread)
}

/// Computes every gain, HRTF and filter target of `voice` for a source at
/// `pos`, given its dry and per-send gains.
pub fn calc_panning_and_filters(
    voice: &mut Voice,
    pos: PanPosition,
    dry: GainTriplet,
    wet: &[GainTriplet; MAX_SENDS],
    env: &SpatialEnv<'_>,
) {
    let device = env.device;
    let num_sends = device.num_sends.min(MAX_SENDS);
    let num_channels = voice.num_channels;
    let frequency = device.frequency as f32;
    let props = voice.props;

    for chan in voice.chans.iter_mut().take(num_channels) {
        chan.dry.hrtf.target = HrtfFilter::default();
        chan.dry.gains.target.fill(0.0);
        for send in chan.wet.iter_mut().take(num_sends) {
            send.gains.target.fill(0.0);
        }
    }

    let mut direct = props.direct_channels;
    let mut stereo_map = [speaker(Channel::FrontLeft, -30.0), speaker(Channel::FrontRight, 30.0)];
    let (chans, downmix): (&[ChanMap], f32) = match voice.format.channels {
        ChannelFormat::Mono => {
            direct = DirectMode::Off;
            (&MONO_MAP, 1.0)
        }
        ChannelFormat::Stereo => {
            if direct == DirectMode::Off {
                // Pan angles are counter-clockwise.
                stereo_map[0].angle = wrap_radians(-props.stereo_pan[0]);
                stereo_map[1].angle = wrap_radians(-props.stereo_pan[1]);
            }
            (&stereo_map, 1.0 / 2.0)
        }
        ChannelFormat::Rear => (&REAR_MAP, 1.0 / 2.0),
        ChannelFormat::Quad => (&QUAD_MAP, 1.0 / 4.0),
        // LFE is left out of the downmix.
        ChannelFormat::X51 => (&X51_MAP, 1.0 / 5.0),
        ChannelFormat::X61 => (&X61_MAP, 1.0 / 6.0),
        ChannelFormat::X71 => (&X71_MAP, 1.0 / 7.0),
        ChannelFormat::BFormat2D { .. } | ChannelFormat::BFormat3D { .. } => {
            direct = DirectMode::Off;
            (&[], 1.0)
        }
    };

    // Slot index for each active send.
    let mut send_slots = [None; MAX_SENDS];
    for (i, slot) in send_slots.iter_mut().enumerate().take(num_sends) {
        *slot = voice.sends[i].slot;
    }
    let wet_map = env.wet_map;

    voice.has_hrtf = false;
    voice.has_nfc = false;
    voice.dry_target = DryTarget::Dry;
    let near = !(pos.distance > f32::EPSILON);

    if voice.format.channels.is_ambisonic() {
        if device.avg_speaker_dist > 0.0 {
            let w0 = if near {
                0.0
            } else {
                let mdist = pos.distance.max(device.avg_speaker_dist / 4.0);
                SPEED_OF_SOUND_METERS_PER_SEC / (mdist * frequency)
            };
            // Only W is panned; the other channels keep their plane-wave filters.
            voice.chans[0].dry.nfc.adjust(w0);
            voice.has_nfc = true;
        }

        // Spread blends between full coverage and panning W toward the source.
        let coverage = if near { 1.0 } else { pos.spread / TAU };
        let mut coeffs = pan_coeffs(device.render_mode, pos.dir, 0.0);
        coeffs[1..].iter_mut().for_each(|c| *c *= 1.0 - coverage);

        let ambi_scales = scales(voice.format.ambi_scaling);
        let chan0 = &mut voice.chans[0];
        compute_pan_gains(&device.dry_map, &coeffs, dry.base * ambi_scales[0], &mut chan0.dry.gains.target);
        for (i, slot) in send_slots.iter().enumerate().take(num_sends) {
            if slot.is_some() {
                compute_pan_gains(
                    wet_map,
                    &coeffs,
                    wet[i].base * ambi_scales[0],
                    &mut chan0.wet[i].gains.target,
                );
            }
        }

        if coverage > 0.0 {
            let mut at = props.orient_at.normalize_or_zero();
            let mut up = props.orient_up.normalize_or_zero();
            if !props.head_relative {
                at = env.context.matrix.transform_vector3(at);
                up = env.context.matrix.transform_vector3(up);
            }
            let voice_order = voice.format.channels.ambi_order();
            let shrot = orientation_rotation(at, up, voice_order.min(device.ambi_order));

            let is_2d = matches!(voice.format.channels, ChannelFormat::BFormat2D { .. });
            let index_map = layout_map(voice.format.ambi_layout, is_2d);
            for (c, chan) in voice.chans.iter_mut().enumerate().take(num_channels).skip(1) {
                let Some(acn) = index_map.get(c).map(|a| *a as usize) else {
                    break;
                };
                let order = ORDER_FROM_CHANNEL[acn];
                let offset = order * order;
                let scale = ambi_scales[acn] * coverage;

                let mut coeffs: AmbiCoeffs = [0.0; crate::defs::MAX_AMBI_CHANNELS];
                for x in 0..order * 2 + 1 {
                    coeffs[offset + x] = shrot[offset + x][acn] * scale;
                }

                compute_pan_gains(&device.dry_map, &coeffs, dry.base, &mut chan.dry.gains.target);
                for (i, slot) in send_slots.iter().enumerate().take(num_sends) {
                    if slot.is_some() {
                        compute_pan_gains(wet_map, &coeffs, wet[i].base, &mut chan.wet[i].gains.target);
                    }
                }
            }
        }
    } else if direct != DirectMode::Off && !matches!(device.output, OutputLayout::Ambi3D { .. }) {
        // Channels go straight to the matching outputs.
        voice.dry_target = DryTarget::RealOut;
        for (map, chan) in chans.iter().zip(voice.chans.iter_mut()) {
            let target = &mut chan.dry.gains.target;
            if let Some(idx) = device.real_index(map.channel) {
                target[idx] = dry.base;
            } else if direct == DirectMode::RemixMismatch {
                let remix = device.remix.iter().find(|e| e.channel == map.channel);
                for (out, mix) in remix.map(|e| e.targets).unwrap_or(&[]) {
                    if let Some(idx) = device.real_index(*out) {
                        target[idx] = dry.base * mix;
                    }
                }
            }

            // Sends are ambisonic and can't channel-match.
            let coeffs = calc_angle_coeffs(map.angle, map.elevation, 0.0);
            for (i, slot) in send_slots.iter().enumerate().take(num_sends) {
                if slot.is_some() {
                    compute_pan_gains(wet_map, &coeffs, wet[i].base, &mut chan.wet[i].gains.target);
                }
            }
        }
    } else if device.render_mode == RenderMode::Hrtf {
        voice.dry_target = DryTarget::RealOut;
        if let Some(store) = device.hrtf.as_deref() {
            if !near {
                let (ev, az) = direction_angles(pos.dir);
                let (coeffs, delay) = store.coeffs_for(ev, az, pos.spread);
                let target = HrtfFilter {
                    coeffs,
                    delay,
                    gain: dry.base * downmix,
                };
                let pan = calc_direction_coeffs(pos.dir, pos.spread);
                for (map, chan) in chans.iter().zip(voice.chans.iter_mut()) {
                    if map.channel == Channel::Lfe {
                        continue;
                    }
                    chan.dry.hrtf.target = target;
                    for (i, slot) in send_slots.iter().enumerate().take(num_sends) {
                        if slot.is_some() {
                            compute_pan_gains(
                                wet_map,
                                &pan,
                                wet[i].base * downmix,
                                &mut chan.wet[i].gains.target,
                            );
                        }
                    }
                }
            } else {
                // Local sources place each channel on a virtual speaker.
                for (map, chan) in chans.iter().zip(voice.chans.iter_mut()) {
                    if map.channel == Channel::Lfe {
                        continue;
                    }
                    let (coeffs, delay) = store.coeffs_for(map.elevation, map.angle, pos.spread);
                    chan.dry.hrtf.target = HrtfFilter {
                        coeffs,
                        delay,
                        gain: dry.base,
                    };
                    let pan = calc_angle_coeffs(map.angle, map.elevation, pos.spread);
                    for (i, slot) in send_slots.iter().enumerate().take(num_sends) {
                        if slot.is_some() {
                            compute_pan_gains(wet_map, &pan, wet[i].base, &mut chan.wet[i].gains.target);
                        }
                    }
                }
            }
            voice.has_hrtf = true;
        }
    } else {
        if device.avg_speaker_dist > 0.0 {
            // A source at the listener is treated as a plane wave.
            let w0 = if near {
                0.0
            } else {
                let mdist = pos.distance.max(device.avg_speaker_dist / 4.0);
                SPEED_OF_SOUND_METERS_PER_SEC / (mdist * frequency)
            };
            for chan in voice.chans.iter_mut().take(num_channels) {
                chan.dry.nfc.adjust(w0);
            }
            voice.has_nfc = true;
        }

        let shared = (!near).then(|| pan_coeffs(device.render_mode, pos.dir, pos.spread));
        for (map, chan) in chans.iter().zip(voice.chans.iter_mut()) {
            if map.channel == Channel::Lfe {
                if device.dry_is_real {
                    if let Some(idx) = device.real_index(Channel::Lfe) {
                        chan.dry.gains.target[idx] = dry.base;
                    }
                }
                continue;
            }

            let (coeffs, dry_gain, wet_scale) = match shared {
                Some(coeffs) => (coeffs, dry.base * downmix, downmix),
                None => {
                    let angle = if device.render_mode == RenderMode::Pairwise {
                        scale_azimuth_front(map.angle, 3.0)
                    } else {
                        map.angle
                    };
                    (calc_angle_coeffs(angle, map.elevation, pos.spread), dry.base, 1.0)
                }
            };
            compute_pan_gains(&device.dry_map, &coeffs, dry_gain, &mut chan.dry.gains.target);
            for (i, slot) in send_slots.iter().enumerate().take(num_sends) {
                if slot.is_some() {
                    compute_pan_gains(
                        wet_map,
                        &coeffs,
                        wet[i].base * wet_scale,
                        &mut chan.wet[i].gains.target,
                    );
                }
            }
        }
    }

    // Shelf filters, shared by every channel of a path.
    voice.dry_filter = FilterType::from_gains(dry.hf, dry.lf);
    {
        let hf_norm = props.direct.hf_reference / frequency;
        let lf_norm = props.direct.lf_reference / frequency;
        let (first, rest) = voice.chans.split_at_mut(1);
        let parms = &mut first[0].dry;
        parms
            .low_pass
            .set_params_from_slope(BiquadType::HighShelf, hf_norm, dry.hf.max(0.001), 1.0);
        parms
            .high_pass
            .set_params_from_slope(BiquadType::LowShelf, lf_norm, dry.lf.max(0.001), 1.0);
        for chan in rest.iter_mut().take(num_channels.saturating_sub(1)) {
            chan.dry.low_pass.copy_params_from(&parms.low_pass);
            chan.dry.high_pass.copy_params_from(&parms.high_pass);
        }
    }
    for i in 0..num_sends {
        voice.sends[i].filter = FilterType::from_gains(wet[i].hf, wet[i].lf);
        let send = &props.sends[i].filter;
        let hf_norm = send.hf_reference / frequency;
        let lf_norm = send.lf_reference / frequency;
        let (first, rest) = voice.chans.split_at_mut(1);
        let parms = &mut first[0].wet[i];
        parms
            .low_pass
            .set_params_from_slope(BiquadType::HighShelf, hf_norm, wet[i].hf.max(0.001), 1.0);
        parms
            .high_pass
            .set_params_from_slope(BiquadType::LowShelf, lf_norm, wet[i].lf.max(0.001), 1.0);
        for chan in rest.iter_mut().take(num_channels.saturating_sub(1)) {
            chan.wet[i].low_pass.copy_params_from(&parms.low_pass);
            chan.wet[i].high_pass.copy_params_from(&parms.high_pass);
        }
    }
}
