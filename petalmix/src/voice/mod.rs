//! Voices: the mixer-side instances of playing sources.
//!
//! A voice is split in two. [`VoiceSlot`] holds the atomics control threads
//! read and write (binding, play state, position). [`Voice`] holds everything
//! only the mixer touches: filter and gain history, resampler state and the
//! spatialization targets computed from the latest props.

pub mod change;

pub use change::{VoiceChange, VoiceChangeKind, VoiceChangeQueue};

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering, fence};

use crate::buffer::{BufferFormat, BufferItem, BufferKind};
use crate::config::SourceProps;
use crate::defs::{
    BUFFER_LINE_SIZE, FRESH_FADE_SAMPLES, FloatBufferLine, MAX_AMBI_ORDER, MAX_OUTPUT_CHANNELS,
    MAX_RESAMPLER_EDGE, MAX_RESAMPLER_PADDING, MAX_SENDS, MIXER_FRAC_BITS, MIXER_FRAC_MASK,
    MIXER_FRAC_ONE, SPEED_OF_SOUND_METERS_PER_SEC,
};
use crate::filters::{BandSplitter, BiquadFilter, NfcFilter};
use crate::hrtf::{
    HRTF_DIRECT_DELAY, HRTF_HISTORY_LENGTH, HrtfFilter, HrtfMixParams, mix_hrtf, mix_hrtf_blend,
};
use crate::math::lerpf;
use crate::mixer::device::DeviceMix;
use crate::mixer::kernels::mix_samples;
use crate::pool::{Mailbox, NIL, Pool};
use crate::resampler::{InterpState, ResampleKernel, resample};

/// Play state of a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum VoiceState {
    #[default]
    Stopped = 0,
    /// Claimed for a source, waiting for its start to be applied.
    Pending = 1,
    Playing = 2,
    /// Fading out over the next block.
    Stopping = 3,
}

impl VoiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Pending,
            2 => Self::Playing,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Control-visible part of a voice.
#[derive(Debug)]
pub struct VoiceSlot {
    source_id: AtomicU64,
    state: AtomicU8,
    pending_change: AtomicBool,
    position: AtomicU32,
    position_frac: AtomicU32,
    current_item: AtomicU32,
    loop_item: AtomicU32,
    /// Latest unconsumed source props.
    pub props: Mailbox,
}

impl Default for VoiceSlot {
    fn default() -> Self {
        Self {
            source_id: AtomicU64::new(0),
            state: AtomicU8::new(VoiceState::Stopped as u8),
            pending_change: AtomicBool::new(false),
            position: AtomicU32::new(0),
            position_frac: AtomicU32::new(0),
            current_item: AtomicU32::new(NIL),
            loop_item: AtomicU32::new(NIL),
            props: Mailbox::default(),
        }
    }
}

/// Cursor into a buffer queue: item, whole frames and fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePosition {
    pub item: u32,
    pub position: u32,
    pub frac: u32,
}

impl VoiceSlot {
    pub fn source_id(&self) -> u64 {
        self.source_id.load(Ordering::Acquire)
    }

    pub fn set_source_id(&self, id: u64) {
        self.source_id.store(id, Ordering::Release);
    }

    pub fn swap_source_id(&self, id: u64) -> u64 {
        self.source_id.swap(id, Ordering::AcqRel)
    }

    pub fn state(&self) -> VoiceState {
        VoiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: VoiceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Moves from `from` to `to`, returning whether the voice was in `from`.
    pub fn transition(&self, from: VoiceState, to: VoiceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn pending_change(&self) -> bool {
        self.pending_change.load(Ordering::Acquire)
    }

    pub fn set_pending_change(&self, pending: bool) {
        self.pending_change.store(pending, Ordering::Release);
    }

    /// Free for a new source: stopped, unbound, no change in flight.
    pub fn is_free(&self) -> bool {
        self.state() == VoiceState::Stopped && self.source_id() == 0 && !self.pending_change()
    }

    pub fn queue_position(&self) -> QueuePosition {
        QueuePosition {
            item: self.current_item.load(Ordering::Relaxed),
            position: self.position.load(Ordering::Relaxed),
            frac: self.position_frac.load(Ordering::Relaxed),
        }
    }

    /// Stores a cursor. Becomes visible to the mixer with the change that
    /// starts the voice, or at the end of a mix.
    pub fn set_queue_position(&self, pos: QueuePosition) {
        self.current_item.store(pos.item, Ordering::Relaxed);
        self.position.store(pos.position, Ordering::Relaxed);
        self.position_frac.store(pos.frac, Ordering::Relaxed);
    }

    pub fn loop_item(&self) -> u32 {
        self.loop_item.load(Ordering::Relaxed)
    }

    pub fn set_loop_item(&self, item: u32) {
        self.loop_item.store(item, Ordering::Relaxed);
    }

    /// Drops the voice's references to the queue.
    pub fn clear_buffers(&self) {
        self.current_item.store(NIL, Ordering::Relaxed);
        self.loop_item.store(NIL, Ordering::Relaxed);
    }
}

/// Initial state carried by a change that starts a voice.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoiceStart {
    pub format: BufferFormat,
    pub kind: BufferKind,
    /// Ramp gains from the first block, for voices starting mid-buffer.
    pub fading: bool,
}

/// Which filters a path runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterType {
    #[default]
    None,
    LowPass,
    HighPass,
    BandPass,
}

impl FilterType {
    pub fn from_gains(gain_hf: f32, gain_lf: f32) -> Self {
        match (gain_hf != 1.0, gain_lf != 1.0) {
            (false, false) => Self::None,
            (true, false) => Self::LowPass,
            (false, true) => Self::HighPass,
            (true, true) => Self::BandPass,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MixGains {
    pub current: [f32; MAX_OUTPUT_CHANNELS],
    pub target: [f32; MAX_OUTPUT_CHANNELS],
}

#[derive(Debug, Clone, Copy)]
pub struct HrtfParams {
    pub old: HrtfFilter,
    pub target: HrtfFilter,
    pub history: [f32; HRTF_HISTORY_LENGTH],
}

impl Default for HrtfParams {
    fn default() -> Self {
        Self {
            old: HrtfFilter::default(),
            target: HrtfFilter::default(),
            history: [0.0; HRTF_HISTORY_LENGTH],
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectParams {
    pub low_pass: BiquadFilter,
    pub high_pass: BiquadFilter,
    pub nfc: NfcFilter,
    pub hrtf: HrtfParams,
    pub gains: MixGains,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendParams {
    pub low_pass: BiquadFilter,
    pub high_pass: BiquadFilter,
    pub gains: MixGains,
}

/// Per input channel state.
#[derive(Debug, Clone, Copy)]
pub struct ChannelData {
    pub prev_samples: [f32; MAX_RESAMPLER_PADDING],
    pub ambi_scale: f32,
    pub ambi_splitter: BandSplitter,
    pub dry: DirectParams,
    pub wet: [SendParams; MAX_SENDS],
}

impl Default for ChannelData {
    fn default() -> Self {
        Self {
            prev_samples: [0.0; MAX_RESAMPLER_PADDING],
            ambi_scale: 1.0,
            ambi_splitter: BandSplitter::default(),
            dry: DirectParams::default(),
            wet: [SendParams::default(); MAX_SENDS],
        }
    }
}

/// Bus the dry path mixes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DryTarget {
    /// The device's ambisonic (or panning) bus.
    #[default]
    Dry,
    /// The physical output channels.
    RealOut,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendTarget {
    /// Effect slot index, `None` when the send is unused.
    pub slot: Option<usize>,
    pub filter: FilterType,
}

/// What happened to a voice during one mix call, for event reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MixOutcome {
    pub source_id: u64,
    pub buffers_completed: u32,
    /// The queue ran out and the voice is now stopping.
    pub ended: bool,
}

/// Scratch lines shared by every voice mix.
pub struct MixScratch {
    source: Vec<f32>,
    resampled: Vec<f32>,
    filtered: Vec<f32>,
    nfc: Vec<f32>,
    hrtf_source: Vec<f32>,
}

impl Default for MixScratch {
    fn default() -> Self {
        Self {
            source: vec![0.0; BUFFER_LINE_SIZE + MAX_RESAMPLER_PADDING],
            resampled: vec![0.0; BUFFER_LINE_SIZE],
            filtered: vec![0.0; BUFFER_LINE_SIZE],
            nfc: vec![0.0; BUFFER_LINE_SIZE],
            hrtf_source: vec![0.0; HRTF_HISTORY_LENGTH + BUFFER_LINE_SIZE],
        }
    }
}

/// Output buses for one block.
pub struct MixTargets<'a> {
    /// Dry bus lines followed by real output lines (which may be the same).
    pub main: &'a mut [FloatBufferLine],
    pub dry: Range<usize>,
    pub real: Range<usize>,
    /// Wet bus per effect slot.
    pub wet: &'a mut [Vec<FloatBufferLine>],
    /// Stereo accumulator for HRTF voices.
    pub hrtf_accum: &'a mut [[f32; 2]],
    pub ir_size: usize,
    /// Dry bus channels per ambisonic order, for near-field filtering.
    pub nfc_chans: [usize; MAX_AMBI_ORDER + 1],
}

/// Mixer-owned voice state.
#[derive(Debug, Clone)]
pub struct Voice {
    pub props: SourceProps,
    pub format: BufferFormat,
    pub kind: BufferKind,
    pub frequency: u32,

    position: u32,
    position_frac: u32,
    current_item: u32,

    pub step: u32,
    pub kernel: ResampleKernel,
    pub interp: InterpState,

    pub is_ambisonic: bool,
    pub has_hrtf: bool,
    pub has_nfc: bool,
    pub fading: bool,
    callback_stopped: bool,
    num_callback_samples: usize,
    /// Targets must be computed before the next mix.
    pub needs_update: bool,

    pub dry_target: DryTarget,
    pub dry_filter: FilterType,
    pub sends: [SendTarget; MAX_SENDS],

    pub num_channels: usize,
    pub chans: Vec<ChannelData>,
}

impl Default for Voice {
    fn default() -> Self {
        Self {
            props: SourceProps::default(),
            format: BufferFormat::default(),
            kind: BufferKind::Static,
            frequency: 0,
            position: 0,
            position_frac: 0,
            current_item: NIL,
            step: 0,
            kernel: ResampleKernel::default(),
            interp: InterpState::default(),
            is_ambisonic: false,
            has_hrtf: false,
            has_nfc: false,
            fading: false,
            callback_stopped: false,
            num_callback_samples: 0,
            needs_update: false,
            dry_target: DryTarget::Dry,
            dry_filter: FilterType::None,
            sends: [SendTarget::default(); MAX_SENDS],
            num_channels: 0,
            chans: vec![ChannelData::default(); MAX_OUTPUT_CHANNELS],
        }
    }
}

/// Runs the filters selected by `ty`, returning the filtered samples.
fn apply_filters<'a>(
    lp: &mut BiquadFilter,
    hp: &mut BiquadFilter,
    dst: &'a mut [f32],
    src: &'a [f32],
    ty: FilterType,
) -> &'a [f32] {
    match ty {
        FilterType::None => {
            lp.clear();
            hp.clear();
            src
        }
        FilterType::LowPass => {
            lp.process(src, dst);
            hp.clear();
            dst
        }
        FilterType::HighPass => {
            lp.clear();
            hp.process(src, dst);
            dst
        }
        FilterType::BandPass => {
            lp.process(src, dst);
            hp.process_in_place(dst);
            dst
        }
    }
}

/// Copies one channel of interleaved `data` into `dst`, returning the count.
fn load_channel(data: &[f32], chan: usize, stride: usize, start: usize, dst: &mut [f32]) -> usize {
    let src = data.get(start * stride + chan..).unwrap_or(&[]);
    let mut count = 0;
    for (out, sample) in dst.iter_mut().zip(src.iter().step_by(stride)) {
        *out = *sample;
        count += 1;
    }
    count
}

fn load_static(
    item: &BufferItem,
    looping: bool,
    pos: usize,
    chan: usize,
    stride: usize,
    dst: &mut [f32],
) -> usize {
    let Some(buffer) = item.buffer.as_ref() else {
        return 0;
    };
    let data = buffer.samples();

    if !looping || pos >= item.loop_end {
        if pos >= item.sample_len {
            return 0;
        }
        let avail = (item.sample_len - pos).min(dst.len());
        return load_channel(data, chan, stride, pos, &mut dst[..avail]);
    }

    let avail = (item.loop_end - pos).min(dst.len());
    let mut filled = load_channel(data, chan, stride, pos, &mut dst[..avail]);
    let loop_len = item.loop_end - item.loop_start;
    while filled < dst.len() && loop_len > 0 {
        let todo = loop_len.min(dst.len() - filled);
        filled += load_channel(
            data,
            chan,
            stride,
            item.loop_start,
            &mut dst[filled..filled + todo],
        );
    }
    filled
}

fn load_queue(
    items: &Pool<BufferItem>,
    mut idx: u32,
    loop_item: u32,
    mut pos: usize,
    chan: usize,
    stride: usize,
    dst: &mut [f32],
) -> usize {
    let mut filled = 0;
    while idx != NIL && filled < dst.len() {
        // SAFETY: queue items are written before being linked and never
        // modified while reachable from a voice.
        let Some(item) = (unsafe { items.get(idx) }) else {
            break;
        };
        if pos >= item.sample_len {
            pos -= item.sample_len;
        } else {
            if let Some(buffer) = item.buffer.as_ref() {
                let avail = (item.sample_len - pos).min(dst.len() - filled);
                filled += load_channel(
                    buffer.samples(),
                    chan,
                    stride,
                    pos,
                    &mut dst[filled..filled + avail],
                );
            }
            pos = 0;
        }
        idx = match items.next(idx) {
            NIL => loop_item,
            next => next,
        };
    }
    filled
}

impl Voice {
    /// Initializes the voice for a new source from the start payload and the
    /// cursor stored in `slot`.
    pub fn start(&mut self, slot: &VoiceSlot, start: &VoiceStart, device: &DeviceMix) {
        let pos = slot.queue_position();
        self.position = pos.position;
        self.position_frac = pos.frac;
        self.current_item = pos.item;

        self.format = start.format;
        self.kind = start.kind;
        self.frequency = start.format.sample_rate;
        self.fading = start.fading;
        self.callback_stopped = false;
        self.num_callback_samples = 0;
        self.has_hrtf = false;
        self.has_nfc = false;
        self.step = 0;
        self.needs_update = true;
        self.num_channels = start.format.channel_count().min(MAX_OUTPUT_CHANNELS);

        let voice_order = start.format.channels.ambi_order();
        self.is_ambisonic = voice_order > 0 && device.ambi_order > voice_order;
        let is_2d = matches!(
            start.format.channels,
            crate::buffer::ChannelFormat::BFormat2D { .. }
        );
        let scales = if self.is_ambisonic {
            crate::ambi::hf_order_scales(voice_order, device.ambi_order)
        } else {
            [1.0; MAX_AMBI_ORDER + 1]
        };
        let splitter = BandSplitter::new(device.xover_freq / device.frequency as f32);
        let nfc_w1 = (device.avg_speaker_dist > 0.0).then(|| {
            SPEED_OF_SOUND_METERS_PER_SEC / (device.avg_speaker_dist * device.frequency as f32)
        });

        for (i, chan) in self.chans.iter_mut().take(self.num_channels).enumerate() {
            *chan = ChannelData::default();
            if self.is_ambisonic {
                let order = if is_2d {
                    crate::ambi::ORDER_FROM_2D_CHANNEL.get(i).copied().unwrap_or(0)
                } else {
                    crate::ambi::ORDER_FROM_CHANNEL.get(i).copied().unwrap_or(0)
                };
                chan.ambi_scale = scales[order];
                chan.ambi_splitter = splitter;
            }
            if let Some(w1) = nfc_w1 {
                chan.dry.nfc.init(w1);
            }
        }
    }

    /// Detaches the voice from its queue; the next mix plays held samples.
    pub fn clear_buffers(&mut self) {
        self.current_item = NIL;
    }

    pub fn queue_position(&self) -> QueuePosition {
        QueuePosition {
            item: self.current_item,
            position: self.position,
            frac: self.position_frac,
        }
    }

    /// Mixes `samples_to_do` samples into `out`.
    ///
    /// `state` is the play state the scheduler observed; a stopping voice
    /// fades to silence and ends up `Stopped`.
    #[allow(clippy::too_many_arguments)]
    pub fn mix(
        &mut self,
        slot: &VoiceSlot,
        state: VoiceState,
        items: &Pool<BufferItem>,
        out: &mut MixTargets<'_>,
        scratch: &mut MixScratch,
        samples_to_do: usize,
    ) -> MixOutcome {
        let mut outcome = MixOutcome {
            source_id: slot.source_id(),
            ..Default::default()
        };

        let increment = self.step as usize;
        if increment < 1 {
            if state == VoiceState::Stopping {
                slot.set_state(VoiceState::Stopped);
            }
            return outcome;
        }

        let loop_item = slot.loop_item();
        let looping = loop_item != NIL;
        let mut data_pos = self.position as usize;
        let mut data_frac = self.position_frac as usize;
        let mut current = self.current_item;
        let num_chans = self.num_channels;
        let stride = self.format.channel_count();

        let kernel = if increment == MIXER_FRAC_ONE as usize && data_frac == 0 {
            ResampleKernel::Copy
        } else {
            self.kernel
        };

        let mut counter = if self.fading { samples_to_do } else { 0 };
        if counter == 0 {
            for chan in self.chans.iter_mut().take(num_chans) {
                if self.has_hrtf {
                    chan.dry.hrtf.old = chan.dry.hrtf.target;
                } else {
                    chan.dry.gains.current = chan.dry.gains.target;
                }
                for (send, target) in chan.wet.iter_mut().zip(self.sends.iter()) {
                    if target.slot.is_some() {
                        send.gains.current = send.gains.target;
                    }
                }
            }
        } else if current == NIL {
            counter = counter.min(FRESH_FADE_SAMPLES);
        }

        // Callback data stays locked for the whole block; a contended lock
        // reads as an underrun for this block.
        // SAFETY: queue items are never modified while reachable.
        let current_buffer = unsafe { items.get(current) }.and_then(|item| item.buffer.as_ref());
        let mut callback = match (self.kind, current_buffer) {
            (BufferKind::Callback, Some(buffer)) => {
                buffer.callback().and_then(|cb| cb.try_lock().ok())
            }
            _ => None,
        };

        let silent = [0.0f32; MAX_OUTPUT_CHANNELS];
        let mut buffers_done = 0u32;
        let mut out_pos = 0usize;
        while out_pos < samples_to_do {
            let mut dst_size = samples_to_do - out_pos;
            let mut src_size = if increment <= MIXER_FRAC_ONE as usize {
                (((dst_size - 1) * increment + data_frac) >> MIXER_FRAC_BITS)
                    + 1
                    + MAX_RESAMPLER_PADDING
            } else {
                ((dst_size * increment + data_frac) >> MIXER_FRAC_BITS) + MAX_RESAMPLER_PADDING
            };
            if src_size > BUFFER_LINE_SIZE + MAX_RESAMPLER_PADDING {
                src_size = BUFFER_LINE_SIZE + MAX_RESAMPLER_PADDING;
                let data_size = src_size - MAX_RESAMPLER_PADDING;
                let max_dst = (((data_size << MIXER_FRAC_BITS) - data_frac) / increment) & !3;
                dst_size = dst_size.min(max_dst.max(1));
            }

            if self.kind == BufferKind::Callback && current != NIL && !self.callback_stopped {
                if let Some(stream) = callback.as_deref_mut() {
                    let to_load = (src_size - MAX_RESAMPLER_EDGE).min(
                        stream.data.len() / stride.max(1),
                    );
                    if to_load > self.num_callback_samples {
                        let need = to_load - self.num_callback_samples;
                        let range = self.num_callback_samples * stride..to_load * stride;
                        let got = (stream.func)(&mut stream.data[range]);
                        if got < 1 {
                            self.callback_stopped = true;
                        } else if (got as usize) < need {
                            self.callback_stopped = true;
                            self.num_callback_samples += got as usize;
                        } else {
                            self.num_callback_samples = to_load;
                        }
                    }
                }
            }

            for (chan_idx, chan) in self.chans.iter_mut().take(num_chans).enumerate() {
                let src = &mut scratch.source[..src_size];
                src[..MAX_RESAMPLER_EDGE].copy_from_slice(&chan.prev_samples[..MAX_RESAMPLER_EDGE]);
                let load_dst = &mut src[MAX_RESAMPLER_EDGE..];

                let loaded = if current == NIL {
                    let tail = &chan.prev_samples[MAX_RESAMPLER_EDGE..];
                    let n = tail.len().min(load_dst.len());
                    load_dst[..n].copy_from_slice(&tail[..n]);
                    n
                } else {
                    match self.kind {
                        BufferKind::Static => match unsafe { items.get(current) } {
                            Some(item) => {
                                load_static(item, looping, data_pos, chan_idx, stride, load_dst)
                            }
                            None => 0,
                        },
                        BufferKind::Callback => match callback.as_deref() {
                            Some(stream) if data_pos < self.num_callback_samples => {
                                let avail =
                                    (self.num_callback_samples - data_pos).min(load_dst.len());
                                load_channel(
                                    &stream.data,
                                    chan_idx,
                                    stride,
                                    data_pos,
                                    &mut load_dst[..avail],
                                )
                            }
                            _ => 0,
                        },
                        BufferKind::Streaming => load_queue(
                            items, current, loop_item, data_pos, chan_idx, stride, load_dst,
                        ),
                    }
                };

                // Hold the last sample over any underrun.
                let filled = MAX_RESAMPLER_EDGE + loaded;
                let last = src[filled - 1];
                src[filled..].fill(last);

                let src_offset = (increment * dst_size + data_frac) >> MIXER_FRAC_BITS;
                chan.prev_samples
                    .copy_from_slice(&src[src_offset..src_offset + MAX_RESAMPLER_PADDING]);

                let resampled = &mut scratch.resampled[..dst_size];
                resample(
                    kernel,
                    &self.interp,
                    src,
                    MAX_RESAMPLER_EDGE,
                    data_frac as u32,
                    increment as u32,
                    resampled,
                );
                if self.is_ambisonic {
                    chan.ambi_splitter.process_hf_scale(resampled, chan.ambi_scale);
                }

                // Dry path.
                {
                    let parms = &mut chan.dry;
                    let samples = apply_filters(
                        &mut parms.low_pass,
                        &mut parms.high_pass,
                        &mut scratch.filtered[..dst_size],
                        &scratch.resampled[..dst_size],
                        self.dry_filter,
                    );
                    let range = match self.dry_target {
                        DryTarget::Dry => out.dry.clone(),
                        DryTarget::RealOut => out.real.clone(),
                    };
                    let lines = &mut out.main[range];

                    if self.has_hrtf {
                        let target_gain = if state == VoiceState::Stopping {
                            0.0
                        } else {
                            parms.hrtf.target.gain
                        };
                        do_hrtf_mix(
                            samples,
                            &mut parms.hrtf,
                            target_gain,
                            counter,
                            out_pos,
                            out.hrtf_accum,
                            out.ir_size,
                            &mut scratch.hrtf_source,
                        );
                    } else {
                        let targets = if state == VoiceState::Stopping {
                            silent
                        } else {
                            parms.gains.target
                        };
                        if self.has_nfc {
                            do_nfc_mix(
                                samples,
                                lines,
                                parms,
                                &targets,
                                counter,
                                out_pos,
                                &out.nfc_chans,
                                &mut scratch.nfc[..dst_size],
                            );
                        } else {
                            mix_samples(
                                samples,
                                lines,
                                &mut parms.gains.current,
                                &targets,
                                counter,
                                out_pos,
                            );
                        }
                    }
                }

                // Send paths.
                for (parms, target) in chan.wet.iter_mut().zip(self.sends.iter()) {
                    let Some(bus) = target.slot.and_then(|s| out.wet.get_mut(s)) else {
                        continue;
                    };
                    let samples = apply_filters(
                        &mut parms.low_pass,
                        &mut parms.high_pass,
                        &mut scratch.filtered[..dst_size],
                        &scratch.resampled[..dst_size],
                        target.filter,
                    );
                    let targets = if state == VoiceState::Stopping {
                        silent
                    } else {
                        parms.gains.target
                    };
                    mix_samples(
                        samples,
                        bus,
                        &mut parms.gains.current,
                        &targets,
                        counter,
                        out_pos,
                    );
                }
            }

            // Advance the cursor by the source samples consumed.
            data_frac += increment * dst_size;
            let src_done = data_frac >> MIXER_FRAC_BITS;
            data_pos += src_done;
            data_frac &= MIXER_FRAC_MASK as usize;
            out_pos += dst_size;
            counter = counter.max(dst_size) - dst_size;

            if current == NIL {
                continue;
            }

            match self.kind {
                BufferKind::Static => {
                    // SAFETY: as above.
                    let Some(item) = (unsafe { items.get(current) }) else {
                        current = NIL;
                        break;
                    };
                    if looping {
                        if data_pos >= item.loop_end && item.loop_end > item.loop_start {
                            let loop_len = item.loop_end - item.loop_start;
                            data_pos = ((data_pos - item.loop_start) % loop_len) + item.loop_start;
                        }
                    } else if data_pos >= item.sample_len {
                        current = NIL;
                        break;
                    }
                }
                BufferKind::Callback => {
                    if src_done < self.num_callback_samples {
                        if let Some(stream) = callback.as_deref_mut() {
                            stream.data.copy_within(
                                src_done * stride..self.num_callback_samples * stride,
                                0,
                            );
                        }
                        self.num_callback_samples -= src_done;
                    } else {
                        current = NIL;
                        self.num_callback_samples = 0;
                    }
                    data_pos = 0;
                }
                BufferKind::Streaming => {
                    while current != NIL {
                        // SAFETY: as above.
                        let Some(item) = (unsafe { items.get(current) }) else {
                            current = NIL;
                            break;
                        };
                        if item.sample_len > data_pos {
                            break;
                        }
                        data_pos -= item.sample_len;
                        buffers_done += 1;
                        current = match items.next(current) {
                            NIL => loop_item,
                            next => next,
                        };
                    }
                    if current == NIL {
                        break;
                    }
                }
            }
        }
        drop(callback);

        self.fading = true;

        if state == VoiceState::Stopping {
            slot.set_state(VoiceState::Stopped);
            return MixOutcome {
                source_id: 0,
                ..Default::default()
            };
        }

        self.position = data_pos as u32;
        self.position_frac = data_frac as u32;
        self.current_item = current;
        slot.set_queue_position(self.queue_position());
        if current == NIL {
            slot.set_loop_item(NIL);
            slot.set_source_id(0);
        }
        fence(Ordering::Release);

        outcome.buffers_completed = buffers_done;
        if current == NIL {
            slot.set_state(VoiceState::Stopping);
            outcome.ended = true;
        }
        outcome
    }
}

#[allow(clippy::too_many_arguments)]
fn do_hrtf_mix(
    samples: &[f32],
    parms: &mut HrtfParams,
    target_gain: f32,
    counter: usize,
    mut out_pos: usize,
    accum: &mut [[f32; 2]],
    ir_size: usize,
    scratch: &mut [f32],
) {
    let dst_size = samples.len();
    let src = &mut scratch[..HRTF_HISTORY_LENGTH + dst_size];
    src[..HRTF_HISTORY_LENGTH].copy_from_slice(&parms.history);
    src[HRTF_HISTORY_LENGTH..].copy_from_slice(samples);
    parms
        .history
        .copy_from_slice(&src[dst_size..dst_size + HRTF_HISTORY_LENGTH]);

    let HrtfParams { old, target, .. } = parms;

    let mut fademix = 0;
    if counter > 0 && out_pos == 0 {
        fademix = dst_size.min(counter);
        let mut gain = target_gain;
        if counter > fademix {
            let a = fademix as f32 / counter as f32;
            gain = lerpf(old.gain, target_gain, a);
        }
        let blend = HrtfMixParams {
            coeffs: &target.coeffs,
            delay: target.delay,
            gain: 0.0,
            gain_step: gain / fademix as f32,
        };
        mix_hrtf_blend(
            src,
            &mut accum[HRTF_DIRECT_DELAY + out_pos..],
            ir_size,
            old,
            &blend,
            fademix,
        );
        *old = *target;
        old.gain = gain;
        out_pos += fademix;
    }

    if fademix < dst_size {
        let todo = dst_size - fademix;
        let mut gain = target_gain;
        if counter > dst_size {
            let a = todo as f32 / (counter - fademix) as f32;
            gain = lerpf(old.gain, target_gain, a);
        }
        let params = HrtfMixParams {
            coeffs: &target.coeffs,
            delay: target.delay,
            gain: old.gain,
            gain_step: (gain - old.gain) / todo as f32,
        };
        mix_hrtf(
            &src[fademix..],
            &mut accum[HRTF_DIRECT_DELAY + out_pos..],
            ir_size,
            &params,
            todo,
        );
        old.gain = gain;
    }
}

#[allow(clippy::too_many_arguments)]
fn do_nfc_mix(
    samples: &[f32],
    lines: &mut [FloatBufferLine],
    parms: &mut DirectParams,
    targets: &[f32; MAX_OUTPUT_CHANNELS],
    counter: usize,
    out_pos: usize,
    chans_per_order: &[usize; MAX_AMBI_ORDER + 1],
    nfc_samples: &mut [f32],
) {
    let first = chans_per_order[0].min(lines.len());
    mix_samples(
        samples,
        &mut lines[..first],
        &mut parms.gains.current[..first],
        &targets[..first],
        counter,
        out_pos,
    );

    let mut offset = first;
    for (order, count) in chans_per_order.iter().enumerate().skip(1) {
        if *count == 0 || offset >= lines.len() {
            break;
        }
        let end = (offset + count).min(lines.len());
        parms.nfc.process(order, samples, nfc_samples);
        mix_samples(
            nfc_samples,
            &mut lines[offset..end],
            &mut parms.gains.current[offset..end],
            &targets[offset..end],
            counter,
            out_pos,
        );
        offset = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AudioBuffer, ChannelFormat};
    use crate::defs::new_buffer_lines;
    use std::sync::Arc;

    struct Bench {
        items: Pool<BufferItem>,
        slot: VoiceSlot,
        voice: Voice,
        main: Vec<FloatBufferLine>,
        wet: Vec<Vec<FloatBufferLine>>,
        accum: Vec<[f32; 2]>,
        scratch: MixScratch,
    }

    impl Bench {
        fn new(samples: Vec<f32>) -> Self {
            let items = Pool::new("test");
            let buffer = AudioBuffer::from_f32(ChannelFormat::Mono, 48000, samples).unwrap();
            let item = items.acquire(BufferItem::new(Some(Arc::new(buffer)))).unwrap();
            let slot = VoiceSlot::default();
            slot.set_queue_position(QueuePosition {
                item,
                position: 0,
                frac: 0,
            });
            slot.set_source_id(7);
            slot.set_state(VoiceState::Playing);

            let mut voice = Voice::default();
            let device = DeviceMix::for_tests(48000, 1);
            voice.start(&slot, &VoiceStart::default(), &device);
            voice.step = MIXER_FRAC_ONE;
            voice.chans[0].dry.gains.target[0] = 1.0;
            Self {
                items,
                slot,
                voice,
                main: new_buffer_lines(1),
                wet: Vec::new(),
                accum: vec![[0.0; 2]; BUFFER_LINE_SIZE * 2],
                scratch: MixScratch::default(),
            }
        }

        fn mix(&mut self, todo: usize) -> MixOutcome {
            for line in self.main.iter_mut() {
                line.fill(0.0);
            }
            let mut out = MixTargets {
                main: &mut self.main,
                dry: 0..1,
                real: 0..1,
                wet: &mut self.wet,
                hrtf_accum: &mut self.accum,
                ir_size: 0,
                nfc_chans: [1, 0, 0, 0],
            };
            let state = self.slot.state();
            self.voice
                .mix(&self.slot, state, &self.items, &mut out, &mut self.scratch, todo)
        }
    }

    #[test]
    fn test_unit_pitch_is_identity() {
        let input: Vec<f32> = (0..256).map(|i| ((i * 37) % 101) as f32 / 101.0 - 0.5).collect();
        let mut bench = Bench::new(input.clone());
        bench.mix(128);
        assert_eq!(&bench.main[0][..128], &input[..128]);
        bench.mix(128);
        assert_eq!(&bench.main[0][..128], &input[128..]);
    }

    #[test]
    fn test_static_end_stops_and_fades() {
        let mut bench = Bench::new(vec![0.5; 100]);
        let outcome = bench.mix(64);
        assert!(!outcome.ended);
        let outcome = bench.mix(64);
        assert!(outcome.ended);
        assert_eq!(outcome.source_id, 7);
        assert_eq!(bench.slot.state(), VoiceState::Stopping);
        assert_eq!(bench.slot.source_id(), 0);

        // The stopping pass ramps the held sample down to silence.
        bench.mix(64);
        assert_eq!(bench.slot.state(), VoiceState::Stopped);
        let out = &bench.main[0][..64];
        assert!(out[0] > 0.4);
        assert!(out[63].abs() < 0.01);
        assert!(out.windows(2).all(|w| w[1] <= w[0] + 1e-6));
    }

    #[test]
    fn test_static_loop_wraps_position() {
        let mut bench = Bench::new((0..100).map(|i| i as f32).collect());
        // SAFETY: the test thread owns every node.
        let item = unsafe { bench.items.get_mut(bench.slot.queue_position().item) }.unwrap();
        item.loop_start = 20;
        item.loop_end = 80;
        bench.slot.set_loop_item(bench.slot.queue_position().item);

        bench.mix(100);
        let pos = bench.slot.queue_position().position as usize;
        assert_eq!(pos, ((100 - 20) % 60) + 20);
        // The sample after the loop end is the loop start.
        assert_eq!(bench.main[0][80], 20.0);
    }
}
