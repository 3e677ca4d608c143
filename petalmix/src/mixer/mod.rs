//! The mixer: per-block scheduling of voice changes, property updates,
//! voice mixing, effects and output post-processing.
//!
//! [`ContextShared`] is everything control threads and the mixer both touch;
//! it is lock-free. [`MixScheduler`] is owned by whoever renders (the device
//! callback, or a control thread rendering offline) behind a mutex the
//! callback only ever `try_lock`s.

pub mod device;
pub mod kernels;
pub mod post;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::ambi::{BFChannelConfig, acn_map};
use crate::buffer::BufferItem;
use crate::config::{ContextProps, ListenerProps, PetalMixDeviceDesc, SourceProps};
use crate::defs::{BUFFER_LINE_SIZE, FloatBufferLine, new_buffer_lines};
use crate::effect::{EffectSlotProps, EffectState, EffectTarget, NullEffect, sort_by_target};
use crate::error::Result;
use crate::events::{AsyncEvent, EventMask, EventMessage, EventSink, SourceState};
use crate::hrtf::{HRIR_LENGTH, HRTF_DIRECT_DELAY};
use crate::pool::{Mailbox, Pool};
use crate::spatial::{ContextParams, SlotParams, SpatialEnv, calc_source_params};
use crate::voice::{
    MixScratch, MixTargets, Voice, VoiceChange, VoiceChangeKind, VoiceChangeQueue, VoiceSlot,
    VoiceState,
};
use device::{DeviceMix, PostProcess};
use post::{DeviceClock, Dither, DistanceComp, Limiter, OutputSample, write_interleaved};

/// A new effect slot configuration, published to the mixer.
#[derive(Default)]
pub struct SlotUpdate {
    pub props: EffectSlotProps,
    pub active: bool,
    /// Replaces the slot's effect when set.
    pub state: Option<Box<dyn EffectState>>,
}

/// State shared between control threads and the mixer.
pub struct ContextShared {
    pub(crate) frequency: u32,
    pub(crate) wet_channels: usize,
    pub(crate) voices: Box<[VoiceSlot]>,
    pub(crate) changes: VoiceChangeQueue,
    pub(crate) source_props: Pool<SourceProps>,
    pub(crate) items: Pool<BufferItem>,
    pub(crate) listener_props: Pool<ListenerProps>,
    pub(crate) listener_update: Mailbox,
    pub(crate) context_props: Pool<ContextProps>,
    pub(crate) context_update: Mailbox,
    pub(crate) slot_props: Pool<SlotUpdate>,
    pub(crate) slot_updates: Box<[Mailbox]>,
    hold_updates: AtomicBool,
    /// Odd while the mixer applies property updates.
    update_count: AtomicU32,
    /// Odd while a block is being mixed.
    mix_count: AtomicU32,
    event_mask: AtomicU32,
    connected: AtomicBool,
    pub(crate) clock: DeviceClock,
}

impl ContextShared {
    /// # Errors
    ///
    /// Returns `PetalMixError::ResourceExhausted` if the initial pools
    /// cannot be allocated.
    pub fn new(desc: &PetalMixDeviceDesc, wet_channels: usize) -> Result<Self> {
        let voices = (0..desc.max_voices).map(|_| VoiceSlot::default()).collect();
        let slot_updates = (0..desc.max_effect_slots)
            .map(|_| Mailbox::default())
            .collect();
        Ok(Self {
            frequency: desc.sample_rate,
            wet_channels,
            voices,
            changes: VoiceChangeQueue::new(desc.max_voices)?,
            source_props: Pool::with_capacity("source props", desc.max_voices)?,
            items: Pool::new("buffer queue"),
            listener_props: Pool::with_capacity("listener props", 1)?,
            listener_update: Mailbox::default(),
            context_props: Pool::with_capacity("context props", 1)?,
            context_update: Mailbox::default(),
            slot_props: Pool::with_capacity("effect slot props", desc.max_effect_slots)?,
            slot_updates,
            hold_updates: AtomicBool::new(false),
            update_count: AtomicU32::new(0),
            mix_count: AtomicU32::new(0),
            event_mask: AtomicU32::new(EventMask::NONE.bits()),
            connected: AtomicBool::new(true),
            clock: DeviceClock::new(desc.sample_rate),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn event_mask(&self) -> EventMask {
        EventMask::from_bits(self.event_mask.load(Ordering::Acquire))
    }

    pub fn set_event_mask(&self, mask: EventMask) {
        self.event_mask.store(mask.bits(), Ordering::Release);
    }

    /// Stops the mixer from applying property updates.
    pub fn hold_updates(&self) {
        self.hold_updates.store(true, Ordering::Release);
        // Let an update pass in progress finish so the held set is whole.
        while self.update_count.load(Ordering::Acquire) & 1 != 0 {
            std::hint::spin_loop();
        }
    }

    pub fn release_updates(&self) {
        self.hold_updates.store(false, Ordering::Release);
    }

    pub fn updates_held(&self) -> bool {
        self.hold_updates.load(Ordering::Acquire)
    }

    /// Blocks completed so far.
    pub fn mix_generation(&self) -> u32 {
        self.mix_count.load(Ordering::Acquire) >> 1
    }

    /// Waits out a block the mixer is in the middle of.
    pub fn wait_for_mix(&self) {
        let count = self.mix_count.load(Ordering::Acquire);
        if count & 1 != 0 {
            while self.mix_count.load(Ordering::Acquire) == count {
                std::thread::yield_now();
            }
        }
    }

    /// Runs `read` outside of any block so what it sees is consistent.
    pub fn read_stable<T>(&self, mut read: impl FnMut() -> T) -> T {
        loop {
            let before = self.mix_count.load(Ordering::Acquire);
            if before & 1 != 0 {
                std::thread::yield_now();
                continue;
            }
            let value = read();
            std::sync::atomic::fence(Ordering::Acquire);
            if self.mix_count.load(Ordering::Acquire) == before {
                return value;
            }
        }
    }

    fn begin_mix(&self) {
        self.mix_count.fetch_add(1, Ordering::AcqRel);
    }

    fn end_mix(&self) {
        self.mix_count.fetch_add(1, Ordering::AcqRel);
    }
}

/// The device mixer.
pub struct MixScheduler {
    shared: Arc<ContextShared>,
    device: DeviceMix,
    post: PostProcess,
    voices: Vec<Voice>,
    scratch: MixScratch,
    /// Dry lines followed by real output lines.
    main: Vec<FloatBufferLine>,
    hrtf_accum: Vec<[f32; 2]>,
    context: ContextParams,
    slot_params: Vec<SlotParams>,
    effects: Vec<Box<dyn EffectState>>,
    wet: Vec<Vec<FloatBufferLine>>,
    wet_map: Vec<BFChannelConfig>,
    slot_order: Vec<usize>,
    resort_slots: bool,
    distance_comp: Option<DistanceComp>,
    limiter: Option<Limiter>,
    dither: Option<Dither>,
    events: EventSink,
}

impl MixScheduler {
    /// Builds the mixer for `desc` around an existing shared context.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::Configuration` if the descriptor is invalid.
    pub fn new(
        desc: &PetalMixDeviceDesc,
        device: DeviceMix,
        post: PostProcess,
        shared: Arc<ContextShared>,
        events: EventSink,
    ) -> Result<Self> {
        desc.validate()?;

        let wet_channels = device.wet_channels();
        let slots = desc.max_effect_slots;
        let distance_comp = match desc.speaker_distances.as_deref() {
            Some(distances) if distances.len() == device.real_out.len() => {
                DistanceComp::new(distances, desc.sample_rate)
            }
            Some(distances) => {
                log::warn!(
                    "Ignoring {} speaker distances for {} output channels",
                    distances.len(),
                    device.real_out.len()
                );
                None
            }
            None => None,
        };
        let dither = desc.effective_dither_depth().map(|depth| {
            log::info!("Dithering to {} bits", depth);
            Dither::new(depth)
        });
        if desc.limiter {
            log::info!("Output limiter enabled");
        }

        log::info!(
            "Mixer ready: {} Hz, {} output channel(s), {} post stage, {} voices, {} effect slots",
            desc.sample_rate,
            device.real_out.len(),
            post.name(),
            desc.max_voices,
            slots
        );

        Ok(Self {
            shared,
            post,
            voices: (0..desc.max_voices).map(|_| Voice::default()).collect(),
            scratch: MixScratch::default(),
            main: new_buffer_lines(device.main_channels()),
            hrtf_accum: vec![[0.0; 2]; BUFFER_LINE_SIZE + HRIR_LENGTH + HRTF_DIRECT_DELAY],
            context: ContextParams::default(),
            slot_params: vec![SlotParams::default(); slots],
            effects: (0..slots)
                .map(|_| Box::new(NullEffect) as Box<dyn EffectState>)
                .collect(),
            wet: (0..slots).map(|_| new_buffer_lines(wet_channels)).collect(),
            wet_map: acn_map(wet_channels),
            slot_order: (0..slots).collect(),
            resort_slots: false,
            distance_comp,
            limiter: desc.limiter.then(|| Limiter::new(desc.sample_rate)),
            dither,
            events,
            device,
        })
    }

    pub fn device(&self) -> &DeviceMix {
        &self.device
    }

    pub fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    /// Renders interleaved frames of `channels` samples into `out`, filling
    /// it completely. Returns the frames written.
    pub fn render_into<T: OutputSample>(&mut self, out: &mut [T], channels: usize) -> usize {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let mut done = 0;
        while done < frames {
            let todo = (frames - done).min(BUFFER_LINE_SIZE);
            self.mix_block(todo);
            let real = &self.main[self.device.real_range()];
            write_interleaved(real, &mut out[done * channels..], channels, todo);
            done += todo;
        }
        frames
    }

    /// Mixes one block of up to `BUFFER_LINE_SIZE` samples into the real
    /// output lines.
    pub fn mix_block(&mut self, todo: usize) {
        let todo = todo.min(BUFFER_LINE_SIZE);
        let shared = self.shared.clone();
        shared.begin_mix();

        for line in self.main.iter_mut() {
            line[..todo].fill(0.0);
        }

        self.process_voice_changes();
        if shared.is_connected() {
            self.process_param_updates();
            self.mix_voices(todo);
            self.process_effects(todo);
            self.post_process(todo);
        } else {
            self.stop_all_voices();
        }

        shared.clock.advance(todo);
        shared.end_mix();
        self.events.flush();
    }

    /// Stops every voice and reports the device as lost. Only the first call
    /// has an effect.
    pub fn disconnect(&mut self, message: &str) {
        let shared = self.shared.clone();
        if !shared.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        log::error!("Device disconnected: {}", message);

        shared.begin_mix();
        self.process_voice_changes();
        self.stop_all_voices();
        if shared.event_mask().contains(EventMask::DISCONNECTED) {
            self.events.post_reliable(AsyncEvent::Disconnected {
                message: EventMessage::new(message),
            });
        }
        shared.end_mix();
        self.events.flush();
    }

    /// Asks the event thread to exit after delivering what is pending.
    pub fn kill_event_thread(&mut self) {
        self.events.shutdown();
    }

    fn stop_all_voices(&mut self) {
        let mask = self.shared.event_mask();
        for (slot, voice) in self.shared.voices.iter().zip(self.voices.iter_mut()) {
            voice.clear_buffers();
            slot.clear_buffers();
            let source_id = slot.swap_source_id(0);
            slot.set_state(VoiceState::Stopped);
            slot.set_pending_change(false);
            if source_id != 0 && mask.contains(EventMask::SOURCE_STATE) {
                self.events.post_reliable(AsyncEvent::SourceStateChanged {
                    source_id,
                    state: SourceState::Stopped,
                });
            }
        }
    }

    fn process_voice_changes(&mut self) {
        let Self {
            shared,
            voices,
            device,
            events,
            ..
        } = self;
        let mask = shared.event_mask();
        let slots = &shared.voices;

        shared.changes.drain(|change| {
            let sendevt = apply_voice_change(change, slots, voices, device);
            if sendevt && mask.contains(EventMask::SOURCE_STATE) {
                let state = match change.kind {
                    VoiceChangeKind::Stop => SourceState::Stopped,
                    VoiceChangeKind::Pause => SourceState::Paused,
                    VoiceChangeKind::Play | VoiceChangeKind::Restart => SourceState::Playing,
                    VoiceChangeKind::Reset => SourceState::Initial,
                };
                events.post_reliable(AsyncEvent::SourceStateChanged {
                    source_id: change.source_id,
                    state,
                });
            }
        });
    }

    fn process_param_updates(&mut self) {
        let shared = self.shared.clone();
        let held = shared.updates_held();
        shared.update_count.fetch_add(1, Ordering::AcqRel);

        let mut force = false;
        if !held {
            if let Some(idx) = shared.context_update.take() {
                // SAFETY: taken from the mailbox; owned until released.
                if let Some(props) = unsafe { shared.context_props.get(idx) } {
                    self.context.apply_context(props);
                }
                shared.context_props.release(idx);
                force = true;
            }
            if let Some(idx) = shared.listener_update.take() {
                // SAFETY: as above.
                if let Some(props) = unsafe { shared.listener_props.get(idx) } {
                    self.context.apply_listener(props);
                }
                shared.listener_props.release(idx);
                force = true;
            }
            for slot in 0..shared.slot_updates.len() {
                if let Some(idx) = shared.slot_updates[slot].take() {
                    self.apply_slot_update(slot, idx);
                    force = true;
                }
            }
        }

        let env = SpatialEnv {
            context: &self.context,
            device: &self.device,
            slots: &self.slot_params,
            wet_map: &self.wet_map,
        };
        for (slot, voice) in shared.voices.iter().zip(self.voices.iter_mut()) {
            let state = slot.state();
            if state == VoiceState::Stopped && !voice.needs_update {
                continue;
            }
            // Freshly started voices always take their props.
            let update = if !held || voice.needs_update {
                slot.props.take()
            } else {
                None
            };
            if let Some(idx) = update {
                // SAFETY: as above.
                if let Some(props) = unsafe { shared.source_props.get(idx) } {
                    voice.props = *props;
                }
                shared.source_props.release(idx);
                calc_source_params(voice, &env);
            } else if force || voice.needs_update {
                calc_source_params(voice, &env);
            }
            voice.needs_update = false;
        }

        shared.update_count.fetch_add(1, Ordering::AcqRel);
    }

    fn apply_slot_update(&mut self, slot: usize, idx: u32) {
        let pool = &self.shared.slot_props;
        // SAFETY: taken from the mailbox; owned until released.
        let Some(update) = (unsafe { pool.get_mut(idx) }) else {
            pool.release(idx);
            return;
        };
        let old_target = self.slot_params[slot].props.target;
        self.slot_params[slot] = SlotParams {
            props: update.props,
            active: update.active,
        };
        if let Some(state) = update.state.take() {
            let old = std::mem::replace(&mut self.effects[slot], state);
            // A full ring leaves the old state on the node, dropped on reuse.
            if let Err(AsyncEvent::ReleaseEffectState(old)) =
                self.events.post(AsyncEvent::ReleaseEffectState(old))
            {
                update.state = Some(old);
            }
        }
        pool.release(idx);

        if old_target != self.slot_params[slot].props.target {
            self.resort_slots = true;
        }
        let props = self.slot_params[slot].props;
        let map = match self.target_of(slot) {
            Some(_) => &self.wet_map[..],
            None => &self.device.dry_map[..],
        };
        self.effects[slot].update(&props, EffectTarget { map });
    }

    fn target_of(&self, slot: usize) -> Option<usize> {
        slot_target(&self.slot_params, slot)
    }

    fn mix_voices(&mut self, todo: usize) {
        let Self {
            shared,
            device,
            voices,
            scratch,
            main,
            hrtf_accum,
            wet,
            events,
            ..
        } = self;
        let mask = shared.event_mask();

        for line in wet.iter_mut().flat_map(|bus| bus.iter_mut()) {
            line[..todo].fill(0.0);
        }

        let mut targets = MixTargets {
            main,
            dry: device.dry_range(),
            real: device.real_range(),
            wet,
            hrtf_accum,
            ir_size: device.ir_size,
            nfc_chans: device.nfc_chans,
        };
        for (slot, voice) in shared.voices.iter().zip(voices.iter_mut()) {
            let state = slot.state();
            if !matches!(state, VoiceState::Playing | VoiceState::Stopping) {
                continue;
            }
            let outcome = voice.mix(slot, state, &shared.items, &mut targets, scratch, todo);
            if outcome.source_id == 0 {
                continue;
            }
            if outcome.buffers_completed > 0 && mask.contains(EventMask::BUFFER_COMPLETED) {
                let event = AsyncEvent::BufferCompleted {
                    source_id: outcome.source_id,
                    count: outcome.buffers_completed,
                };
                if events.post(event).is_err() {
                    events.note_dropped();
                }
            }
            if outcome.ended && mask.contains(EventMask::SOURCE_STATE) {
                events.post_reliable(AsyncEvent::SourceStateChanged {
                    source_id: outcome.source_id,
                    state: SourceState::Stopped,
                });
            }
        }
    }

    fn process_effects(&mut self, todo: usize) {
        if self.resort_slots {
            let params = &self.slot_params;
            sort_by_target(&mut self.slot_order, |s| slot_target(params, s));
            self.resort_slots = false;
        }

        let dry = self.device.dry_range();
        for n in 0..self.slot_order.len() {
            let slot = self.slot_order[n];
            if !self.slot_params[slot].active {
                continue;
            }
            let input = std::mem::take(&mut self.wet[slot]);
            match self.target_of(slot) {
                Some(target) => self.effects[slot].process(todo, &input, &mut self.wet[target]),
                None => self.effects[slot].process(todo, &input, &mut self.main[dry.clone()]),
            }
            self.wet[slot] = input;
        }
    }

    fn post_process(&mut self, todo: usize) {
        let dry_len = self.device.dry_map.len();
        if !self.device.dry_is_real {
            let (dry, real) = self.main.split_at_mut(dry_len);
            match &mut self.post {
                PostProcess::None => {}
                PostProcess::Decode(decoder) => decoder.process_stabilized(real, dry, todo),
                PostProcess::Hrtf(hrtf) => {
                    if let [left, right, ..] = real {
                        hrtf.mix_direct(
                            &mut left[..todo],
                            &mut right[..todo],
                            dry,
                            &mut self.hrtf_accum,
                            todo,
                        );
                    }
                }
                PostProcess::Uhj(encoder) => {
                    if let [left, right, ..] = real {
                        encoder.encode(&mut left[..todo], &mut right[..todo], dry, todo);
                    }
                }
            }
        }

        let real = &mut self.main[self.device.real_range()];
        if let Some(comp) = self.distance_comp.as_mut() {
            comp.apply(real, todo);
        }
        if let Some(limiter) = self.limiter.as_mut() {
            limiter.apply(real, todo);
        }
        if let Some(dither) = self.dither.as_mut() {
            dither.apply(real, todo);
        }
    }

    #[cfg(test)]
    pub(crate) fn voice(&self, index: usize) -> &Voice {
        &self.voices[index]
    }
}

/// The active slot `slot` outputs into, if any.
fn slot_target(params: &[SlotParams], slot: usize) -> Option<usize> {
    let target = params.get(slot)?.props.target?.index();
    (target != slot && params.get(target).is_some_and(|t| t.active)).then_some(target)
}

/// Applies one change. Returns whether the application should hear about it.
fn apply_voice_change(
    change: &VoiceChange,
    slots: &[VoiceSlot],
    voices: &mut [Voice],
    device: &DeviceMix,
) -> bool {
    let pair = |idx: Option<usize>| idx.filter(|i| *i < slots.len());

    match change.kind {
        VoiceChangeKind::Stop | VoiceChangeKind::Reset => {
            let mut sendevt = false;
            if let Some(v) = pair(change.voice) {
                voices[v].clear_buffers();
                slots[v].clear_buffers();
                sendevt = slots[v].swap_source_id(0) != 0;
                slots[v].transition(VoiceState::Playing, VoiceState::Stopping);
                // A voice stopped before its start was applied never plays.
                slots[v].transition(VoiceState::Pending, VoiceState::Stopped);
                slots[v].set_pending_change(false);
            }
            sendevt || change.kind == VoiceChangeKind::Reset
        }
        VoiceChangeKind::Pause => {
            let Some(v) = pair(change.voice) else {
                return false;
            };
            let paused = slots[v].transition(VoiceState::Playing, VoiceState::Stopping);
            slots[v].set_pending_change(false);
            paused
        }
        VoiceChangeKind::Play => {
            // With an old voice to stop, only report if it had already ended.
            let sendevt = match pair(change.old_voice) {
                Some(old) => {
                    voices[old].clear_buffers();
                    slots[old].clear_buffers();
                    slots[old].set_source_id(0);
                    let stopped = slots[old].transition(VoiceState::Playing, VoiceState::Stopping);
                    slots[old].set_pending_change(false);
                    !stopped
                }
                None => true,
            };
            if let Some(v) = pair(change.voice) {
                if let Some(start) = change.start.as_ref() {
                    voices[v].start(&slots[v], start, device);
                }
                voices[v].needs_update = true;
                slots[v].set_state(VoiceState::Playing);
                slots[v].set_pending_change(false);
            }
            sendevt
        }
        VoiceChangeKind::Restart => {
            if let (Some(old), Some(v)) = (pair(change.old_voice), pair(change.voice)) {
                voices[old].clear_buffers();
                slots[old].clear_buffers();
                if slots[old].swap_source_id(0) != 0 {
                    let was_playing =
                        slots[old].transition(VoiceState::Playing, VoiceState::Stopping);
                    if let Some(start) = change.start.as_ref() {
                        voices[v].start(&slots[v], start, device);
                    }
                    voices[v].needs_update = true;
                    slots[v].set_state(if was_playing {
                        VoiceState::Playing
                    } else {
                        VoiceState::Stopped
                    });
                }
                slots[old].set_pending_change(false);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AudioBuffer, ChannelFormat};
    use crate::events::EventThread;
    use crate::voice::{QueuePosition, VoiceStart};
    use crossbeam_channel::unbounded;

    fn scheduler() -> (MixScheduler, EventThread) {
        let desc = PetalMixDeviceDesc::default();
        let (device, post) = DeviceMix::new(&desc).unwrap();
        let shared = Arc::new(ContextShared::new(&desc, device.wet_channels()).unwrap());
        let (tx, _rx) = unbounded();
        let (thread, sink) = EventThread::spawn(desc.event_ring_size, tx).unwrap();
        let mixer = MixScheduler::new(&desc, device, post, shared, sink).unwrap();
        (mixer, thread)
    }

    /// Binds a voice to a one-second static buffer, as a control thread would.
    fn bind(shared: &ContextShared, voice: usize, source_id: u64) {
        let buffer = AudioBuffer::from_f32(ChannelFormat::Mono, 48000, vec![0.1; 48000]).unwrap();
        let item = shared
            .items
            .acquire(BufferItem::new(Some(Arc::new(buffer))))
            .unwrap();
        shared.voices[voice].set_queue_position(QueuePosition {
            item,
            position: 0,
            frac: 0,
        });
        shared.voices[voice].set_source_id(source_id);
        shared.voices[voice].set_state(VoiceState::Pending);
        shared.voices[voice].set_pending_change(true);
    }

    fn play(voice: usize, source_id: u64) -> VoiceChange {
        VoiceChange {
            kind: VoiceChangeKind::Play,
            voice: Some(voice),
            source_id,
            start: Some(VoiceStart::default()),
            ..Default::default()
        }
    }

    #[test]
    fn test_mix_counter_is_even_between_blocks() {
        let (mut mixer, _thread) = scheduler();
        let shared = mixer.shared().clone();
        assert_eq!(shared.mix_generation(), 0);
        let mut out = [0.0f32; 64];
        mixer.render_into(&mut out, 2);
        assert_eq!(shared.mix_generation(), 1);
        shared.wait_for_mix();
        assert_eq!(shared.clock.time_ns(), 32u64 * 1_000_000_000 / 48000);
    }

    #[test]
    fn test_play_then_stop_transitions() {
        let (mut mixer, _thread) = scheduler();
        let shared = mixer.shared().clone();
        bind(&shared, 0, 5);
        shared.changes.send(&[play(0, 5)]).unwrap();
        mixer.mix_block(16);
        assert_eq!(shared.voices[0].state(), VoiceState::Playing);
        assert!(!shared.voices[0].pending_change());

        shared
            .changes
            .send(&[VoiceChange {
                kind: VoiceChangeKind::Stop,
                voice: Some(0),
                source_id: 5,
                ..Default::default()
            }])
            .unwrap();
        mixer.mix_block(16);
        // Faded out within the block.
        assert_eq!(shared.voices[0].state(), VoiceState::Stopped);
        assert_eq!(shared.voices[0].source_id(), 0);
        assert!(shared.voices[0].is_free());
    }

    #[test]
    fn test_restart_follows_old_voice_state() {
        let (mut mixer, _thread) = scheduler();
        let shared = mixer.shared().clone();
        bind(&shared, 0, 9);
        shared.changes.send(&[play(0, 9)]).unwrap();
        mixer.mix_block(16);

        bind(&shared, 1, 9);
        shared
            .changes
            .send(&[VoiceChange {
                kind: VoiceChangeKind::Restart,
                voice: Some(1),
                old_voice: Some(0),
                source_id: 9,
                start: Some(VoiceStart::default()),
            }])
            .unwrap();
        mixer.mix_block(16);
        assert_eq!(shared.voices[1].state(), VoiceState::Playing);
        assert_eq!(shared.voices[0].source_id(), 0);
        assert_eq!(shared.voices[0].state(), VoiceState::Stopped);
    }

    #[test]
    fn test_restart_after_old_voice_ended_stays_pending() {
        let (mut mixer, _thread) = scheduler();
        let shared = mixer.shared().clone();
        bind(&shared, 1, 9);
        shared
            .changes
            .send(&[VoiceChange {
                kind: VoiceChangeKind::Restart,
                voice: Some(1),
                old_voice: Some(0),
                source_id: 9,
                start: Some(VoiceStart::default()),
            }])
            .unwrap();
        mixer.mix_block(16);
        assert_eq!(shared.voices[1].state(), VoiceState::Pending);
    }

    #[test]
    fn test_disconnect_stops_everything_once() {
        let (mut mixer, _thread) = scheduler();
        let shared = mixer.shared().clone();
        for v in 0..3 {
            bind(&shared, v, 10 + v as u64);
            shared.changes.send(&[play(v, 10 + v as u64)]).unwrap();
        }
        mixer.mix_block(16);
        mixer.disconnect("unplugged");
        assert!(!shared.is_connected());
        for v in 0..3 {
            assert_eq!(shared.voices[v].state(), VoiceState::Stopped);
            assert_eq!(shared.voices[v].source_id(), 0);
        }

        let mut out = [1.0f32; 32];
        mixer.render_into(&mut out, 2);
        assert!(out.iter().all(|s| *s == 0.0));
    }
}
