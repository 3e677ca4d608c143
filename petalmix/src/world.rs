use crate::buffer::{AudioBuffer, BufferFormat, BufferItem, BufferKind};
use crate::config::{ContextProps, ListenerProps, PetalMixDeviceDesc, SourceProps};
use crate::defs::{MAX_SENDS, MIXER_FRAC_ONE};
use crate::effect::{EffectSlotId, EffectSlotProps, EffectState, NullEffect};
use crate::error::{PetalMixError, Result};
use crate::events::{EventMask, EventThread, PetalMixEvent, SourceState};
use crate::mixer::device::DeviceMix;
use crate::mixer::post::OutputSample;
use crate::mixer::{ContextShared, MixScheduler, SlotUpdate};
use crate::pool::NIL;
use crate::voice::{QueuePosition, VoiceChange, VoiceChangeKind, VoiceStart, VoiceState};
use crossbeam_channel::{Receiver, unbounded};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Handle to a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    /// The id carried by events about this source.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Source({})", self.0)
    }
}

/// A playback position to seek to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Offset {
    Samples(u64),
    Seconds(f64),
    Bytes(u64),
}

/// Playback position within a source's whole queue.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SourceOffset {
    pub samples: u64,
    /// Fraction of the next sample, in mixer fixed point.
    pub fraction: u32,
    pub seconds: f64,
    pub bytes: u64,
}

struct QueueEntry {
    node: u32,
    buffer: Arc<AudioBuffer>,
}

struct Source {
    props: SourceProps,
    looping: bool,
    kind: BufferKind,
    queue: Vec<QueueEntry>,
    state: SourceState,
    voice: Option<usize>,
    /// Where the next play starts.
    pending_offset: Option<u64>,
    /// Restart whose outcome hasn't been checked.
    restart_ticket: Option<u64>,
}

impl Source {
    fn new(props: SourceProps) -> Self {
        Self {
            props,
            looping: false,
            kind: BufferKind::Static,
            queue: Vec::new(),
            state: SourceState::Initial,
            voice: None,
            pending_offset: None,
            restart_ticket: None,
        }
    }

    fn format(&self) -> Option<&BufferFormat> {
        self.queue.first().map(|entry| entry.buffer.format())
    }

    fn total_frames(&self) -> u64 {
        self.queue.iter().map(|e| e.buffer.frames() as u64).sum()
    }

    fn loop_node(&self) -> u32 {
        match self.queue.first() {
            Some(entry) if self.looping && self.kind != BufferKind::Callback => entry.node,
            _ => NIL,
        }
    }

    /// Queue cursor for a sample offset from the start of the queue.
    fn position_at(&self, offset: u64) -> Option<QueuePosition> {
        if self.kind == BufferKind::Callback {
            return self.queue.first().map(|entry| QueuePosition {
                item: entry.node,
                position: 0,
                frac: 0,
            });
        }
        let mut remaining = offset;
        for entry in &self.queue {
            let frames = entry.buffer.frames() as u64;
            if remaining < frames {
                return Some(QueuePosition {
                    item: entry.node,
                    position: remaining as u32,
                    frac: 0,
                });
            }
            remaining -= frames;
        }
        None
    }
}

/// Queue nodes waiting for the mixer to let go of them.
struct Retired {
    ticket: u64,
    nodes: Vec<u32>,
}

enum PlayAction {
    /// Nothing left to play; stops the old voice if there is one.
    Halt { voice: Option<usize> },
    Resume(usize),
    Start {
        old_voice: Option<usize>,
        pos: QueuePosition,
    },
}

/// Main control object for a mixing device.
///
/// `PetalMixWorld` owns the sources, buffer queues and effect slots, and
/// drives the mixer through lock-free voice changes and property mailboxes.
/// The mixer runs either in the audio callback of a [`PetalMixEngine`] or
/// offline through [`render`](Self::render).
///
/// [`PetalMixEngine`]: crate::engine::PetalMixEngine
pub struct PetalMixWorld {
    desc: PetalMixDeviceDesc,
    channels: usize,
    shared: Arc<ContextShared>,
    mixer: Arc<Mutex<MixScheduler>>,
    sources: HashMap<SourceId, Source>,
    next_source_id: u64,
    slots: Vec<Option<(EffectSlotProps, bool)>>,
    listener: ListenerProps,
    context: ContextProps,
    last_ticket: u64,
    retired: Vec<Retired>,
    event_receiver: Receiver<PetalMixEvent>,
    event_thread: EventThread,
}

impl PetalMixWorld {
    /// Builds the mixer described by `desc` and starts the event thread.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::Configuration` for an invalid descriptor, or
    /// `PetalMixError::Engine` if the event thread cannot start.
    pub fn new(desc: PetalMixDeviceDesc) -> Result<Self> {
        desc.validate()?;
        let (device, post) = DeviceMix::new(&desc)?;
        let channels = device.real_out.len();
        let shared = Arc::new(ContextShared::new(&desc, device.wet_channels())?);
        let (event_sender, event_receiver) = unbounded();
        let (event_thread, sink) = EventThread::spawn(desc.event_ring_size, event_sender)?;
        let mixer = MixScheduler::new(&desc, device, post, shared.clone(), sink)?;

        Ok(Self {
            slots: (0..desc.max_effect_slots).map(|_| None).collect(),
            desc,
            channels,
            shared,
            mixer: Arc::new(Mutex::new(mixer)),
            sources: HashMap::new(),
            next_source_id: 1,
            listener: ListenerProps::default(),
            context: ContextProps::default(),
            last_ticket: 0,
            retired: Vec::new(),
            event_receiver,
            event_thread,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.desc.sample_rate
    }

    /// Interleaved channels per output frame.
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn desc(&self) -> &PetalMixDeviceDesc {
        &self.desc
    }

    pub(crate) fn mixer(&self) -> Arc<Mutex<MixScheduler>> {
        self.mixer.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    // ----------------------------------------------------------------------
    // Sources

    /// Creates a source with `props`.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::InvalidValue` if `props` is out of range.
    pub fn create_source(&mut self, props: SourceProps) -> Result<SourceId> {
        self.validate_source_props(&props)?;
        let id = SourceId(self.next_source_id);
        self.next_source_id += 1;
        self.sources.insert(id, Source::new(props));
        log::debug!("Created {}", id);
        Ok(id)
    }

    /// Stops and removes a source. Its queued buffers are released once the
    /// mixer no longer references them.
    ///
    /// # Errors
    ///
    /// Returns an error if the source doesn't exist.
    pub fn delete_source(&mut self, id: SourceId) -> Result<()> {
        self.collect_retired();
        self.stop(id)?;
        let Some(source) = self.sources.remove(&id) else {
            return Err(unknown_source(id));
        };
        let nodes = source.queue.iter().map(|e| e.node).collect();
        self.retire(nodes);
        log::debug!("Deleted {}", id);
        Ok(())
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.sources.keys().copied().collect()
    }

    /// Replaces a source's properties. A playing source picks them up at
    /// the next block unless updates are deferred.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::InvalidValue` for out-of-range properties.
    pub fn set_props(&mut self, id: SourceId, props: SourceProps) -> Result<()> {
        self.validate_source_props(&props)?;
        self.sync_source(id)?;
        let voice = {
            let source = self.source_mut(id)?;
            source.props = props;
            source.voice
        };
        if let Some(voice) = voice {
            self.publish_props(voice, &props)?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the source doesn't exist.
    pub fn props(&self, id: SourceId) -> Result<SourceProps> {
        self.source(id).map(|s| s.props)
    }

    /// # Errors
    ///
    /// Returns an error if the source doesn't exist.
    pub fn set_looping(&mut self, id: SourceId, looping: bool) -> Result<()> {
        self.sync_source(id)?;
        let (voice, loop_node) = {
            let source = self.source_mut(id)?;
            source.looping = looping;
            (source.voice, source.loop_node())
        };
        if let Some(voice) = voice {
            self.shared.voices[voice].set_loop_item(loop_node);
        }
        Ok(())
    }

    /// Sets a single buffer to play, or clears the source with `None`.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::InvalidOperation` if the source is playing
    /// or paused.
    pub fn set_buffer(&mut self, id: SourceId, buffer: Option<Arc<AudioBuffer>>) -> Result<()> {
        self.collect_retired();
        self.sync_source(id)?;
        let state = self.source(id)?.state;
        if matches!(state, SourceState::Playing | SourceState::Paused) {
            return Err(PetalMixError::InvalidOperation(format!(
                "Cannot set the buffer of {} while it is {}",
                id, state
            )));
        }

        let entry = match buffer {
            Some(buffer) => {
                let node = self
                    .shared
                    .items
                    .acquire(BufferItem::new(Some(buffer.clone())))?;
                Some(QueueEntry { node, buffer })
            }
            None => None,
        };

        let source = self.source_mut(id)?;
        let old: Vec<u32> = source.queue.drain(..).map(|e| e.node).collect();
        source.kind = match &entry {
            Some(entry) if entry.buffer.is_callback() => BufferKind::Callback,
            _ => BufferKind::Static,
        };
        source.queue.extend(entry);
        source.pending_offset = None;
        self.retire(old);
        Ok(())
    }

    /// Appends buffers to a source's queue, making it a streaming source.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::InvalidOperation` if the source has a static
    /// buffer set, or `PetalMixError::AudioFormat` if the buffers don't
    /// share the queue's format.
    pub fn queue_buffers(&mut self, id: SourceId, buffers: &[Arc<AudioBuffer>]) -> Result<()> {
        self.collect_retired();
        let source = self.source(id)?;
        if buffers.is_empty() {
            return Ok(());
        }
        if source.kind != BufferKind::Streaming && !source.queue.is_empty() {
            return Err(PetalMixError::InvalidOperation(format!(
                "{} has a static buffer set",
                id
            )));
        }
        let format = source.format().copied().unwrap_or(*buffers[0].format());
        for buffer in buffers {
            if buffer.is_callback() {
                return Err(PetalMixError::InvalidOperation(
                    "Callback buffers cannot be queued".into(),
                ));
            }
            let other = buffer.format();
            if other.channels != format.channels || other.sample_rate != format.sample_rate {
                return Err(PetalMixError::AudioFormat(format!(
                    "Queued buffer format {:?}/{} Hz doesn't match {:?}/{} Hz",
                    other.channels, other.sample_rate, format.channels, format.sample_rate
                )));
            }
        }

        let shared = self.shared.clone();
        let items = &shared.items;
        let mut entries = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            match items.acquire(BufferItem::new(Some(buffer.clone()))) {
                Ok(node) => entries.push(QueueEntry {
                    node,
                    buffer: buffer.clone(),
                }),
                Err(err) => {
                    for entry in entries {
                        items.release(entry.node);
                    }
                    return Err(err);
                }
            }
        }
        for pair in entries.windows(2) {
            if let Some(link) = items.link(pair[0].node) {
                link.store(pair[1].node, std::sync::atomic::Ordering::Relaxed);
            }
        }

        let source = self.source_mut(id)?;
        // Publishing the first new node makes the whole chain visible.
        if let (Some(last), Some(first)) = (source.queue.last(), entries.first()) {
            if let Some(link) = items.link(last.node) {
                link.store(first.node, std::sync::atomic::Ordering::Release);
            }
        }
        source.kind = BufferKind::Streaming;
        source.queue.extend(entries);
        Ok(())
    }

    /// Removes `count` processed buffers from the front of the queue.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::InvalidValue` if fewer than `count` buffers
    /// have been processed, or `PetalMixError::InvalidOperation` for a
    /// static or looping source.
    pub fn unqueue_buffers(&mut self, id: SourceId, count: usize) -> Result<Vec<Arc<AudioBuffer>>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let processed = self.buffers_processed(id)?;
        let source = self.source(id)?;
        if source.kind != BufferKind::Streaming {
            return Err(PetalMixError::InvalidOperation(format!(
                "{} is not a streaming source",
                id
            )));
        }
        if source.looping {
            return Err(PetalMixError::InvalidOperation(format!(
                "Cannot unqueue from looping {}",
                id
            )));
        }
        if count > processed {
            return Err(PetalMixError::InvalidValue(format!(
                "Unqueuing {} buffers but only {} processed",
                count, processed
            )));
        }

        // The mixer may still be finishing the block that passed them.
        self.shared.wait_for_mix();
        let source = self.source_mut(id)?;
        let removed: Vec<QueueEntry> = source.queue.drain(..count).collect();
        let items = &self.shared.items;
        let mut buffers = Vec::with_capacity(removed.len());
        for entry in removed {
            // SAFETY: processed nodes are behind every voice cursor.
            if let Some(item) = unsafe { items.get_mut(entry.node) } {
                item.buffer = None;
            }
            items.release(entry.node);
            buffers.push(entry.buffer);
        }
        Ok(buffers)
    }

    /// Starts a source from its pending offset, restarts a playing source
    /// from the beginning, or resumes a paused one.
    ///
    /// # Errors
    ///
    /// See [`play_batch`](Self::play_batch).
    pub fn play(&mut self, id: SourceId) -> Result<()> {
        self.play_batch(&[id])
    }

    /// Plays several sources so they start in the same block. Sources with
    /// nothing to play, such as a queue of empty buffers, are stopped.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::Disconnected` after a device loss, or
    /// `PetalMixError::ResourceExhausted` when there aren't enough free
    /// voices; nothing starts in either case.
    pub fn play_batch(&mut self, ids: &[SourceId]) -> Result<()> {
        if !self.shared.is_connected() {
            return Err(PetalMixError::Disconnected(
                "Cannot play on a disconnected device".into(),
            ));
        }
        self.collect_retired();

        let mut unique: Vec<SourceId> = Vec::with_capacity(ids.len());
        for id in ids {
            self.sync_source(*id)?;
            if !unique.contains(id) {
                unique.push(*id);
            }
        }

        // Positions are resolved before any voice is touched.
        let mut actions = Vec::with_capacity(unique.len());
        for id in &unique {
            let source = self.source(*id)?;
            let action = match (source.state, source.voice) {
                (SourceState::Paused, Some(voice)) => PlayAction::Resume(voice),
                (state, voice) => {
                    let old_voice = voice.filter(|_| state == SourceState::Playing);
                    match source.position_at(source.pending_offset.unwrap_or(0)) {
                        Some(pos) => PlayAction::Start { old_voice, pos },
                        None => PlayAction::Halt { voice: old_voice },
                    }
                }
            };
            actions.push((*id, action));
        }

        let needed = actions
            .iter()
            .filter(|(_, a)| matches!(a, PlayAction::Start { .. }))
            .count();
        let free = self.free_voices(needed);
        if free.len() < needed {
            return Err(PetalMixError::ResourceExhausted(format!(
                "Need {} voices, {} free",
                needed,
                free.len()
            )));
        }

        let mut free = free.into_iter();
        let mut changes = Vec::with_capacity(actions.len());
        let mut outcomes = Vec::with_capacity(actions.len());
        let mut bound = Vec::new();
        let mut touched = Vec::new();
        let mut failure = None;
        for (id, action) in &actions {
            let source_id = id.raw();
            match *action {
                PlayAction::Halt { voice } => {
                    if let Some(voice) = voice {
                        self.shared.voices[voice].set_pending_change(true);
                        touched.push(voice);
                        changes.push(VoiceChange {
                            kind: VoiceChangeKind::Stop,
                            voice: Some(voice),
                            source_id,
                            ..Default::default()
                        });
                    }
                    outcomes.push((*id, SourceState::Stopped, None, true));
                }
                PlayAction::Resume(voice) => {
                    self.shared.voices[voice].set_pending_change(true);
                    touched.push(voice);
                    changes.push(VoiceChange {
                        kind: VoiceChangeKind::Play,
                        voice: Some(voice),
                        source_id,
                        ..Default::default()
                    });
                    outcomes.push((*id, SourceState::Playing, Some(voice), false));
                }
                PlayAction::Start { old_voice, pos } => {
                    let Some(voice) = free.next() else {
                        break;
                    };
                    match self.bind_voice(*id, voice, pos) {
                        Ok(start) => {
                            bound.push(voice);
                            changes.push(VoiceChange {
                                kind: VoiceChangeKind::Play,
                                voice: Some(voice),
                                old_voice,
                                source_id,
                                start: Some(start),
                            });
                            outcomes.push((*id, SourceState::Playing, Some(voice), true));
                        }
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
            }
        }

        let sent = match failure {
            Some(err) => Err(err),
            None => self.send_changes(&changes),
        };
        if let Err(err) = sent {
            for voice in bound {
                self.unbind_voice(voice);
            }
            for voice in touched {
                self.shared.voices[voice].set_pending_change(false);
            }
            return Err(err);
        }

        for (id, state, voice, restarted) in outcomes {
            let source = self.source_mut(id)?;
            source.state = state;
            source.voice = voice;
            if restarted {
                source.pending_offset = None;
                source.restart_ticket = None;
            }
        }
        Ok(())
    }

    /// Pauses a playing source, keeping its position.
    ///
    /// # Errors
    ///
    /// Returns an error if the source doesn't exist.
    pub fn pause(&mut self, id: SourceId) -> Result<()> {
        self.sync_source(id)?;
        let source = self.source(id)?;
        if source.state != SourceState::Playing {
            return Ok(());
        }
        if let Some(voice) = source.voice {
            self.shared.voices[voice].set_pending_change(true);
            self.send_changes(&[VoiceChange {
                kind: VoiceChangeKind::Pause,
                voice: Some(voice),
                source_id: id.raw(),
                ..Default::default()
            }])?;
        }
        self.source_mut(id)?.state = SourceState::Paused;
        Ok(())
    }

    /// Stops a source. Playing again starts from the beginning.
    ///
    /// # Errors
    ///
    /// Returns an error if the source doesn't exist.
    pub fn stop(&mut self, id: SourceId) -> Result<()> {
        self.sync_source(id)?;
        let source = self.source(id)?;
        if let Some(voice) = source.voice {
            self.shared.voices[voice].set_pending_change(true);
            self.send_changes(&[VoiceChange {
                kind: VoiceChangeKind::Stop,
                voice: Some(voice),
                source_id: id.raw(),
                ..Default::default()
            }])?;
        }
        let source = self.source_mut(id)?;
        if source.state != SourceState::Initial {
            source.state = SourceState::Stopped;
        }
        source.voice = None;
        source.pending_offset = None;
        source.restart_ticket = None;
        Ok(())
    }

    /// Stops a source and returns it to the initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if the source doesn't exist.
    pub fn rewind(&mut self, id: SourceId) -> Result<()> {
        self.sync_source(id)?;
        let voice = self.source(id)?.voice;
        if let Some(voice) = voice {
            self.shared.voices[voice].set_pending_change(true);
        }
        self.send_changes(&[VoiceChange {
            kind: VoiceChangeKind::Reset,
            voice,
            source_id: id.raw(),
            ..Default::default()
        }])?;
        let source = self.source_mut(id)?;
        source.state = SourceState::Initial;
        source.voice = None;
        source.pending_offset = None;
        source.restart_ticket = None;
        Ok(())
    }

    /// Moves the playback position. A playing or paused source crossfades
    /// to the new position; otherwise it applies at the next play.
    ///
    /// If the old voice ends before the move is applied, the source stops.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::InvalidValue` for an offset past the end of
    /// the queue, or `PetalMixError::ResourceExhausted` if no voice is free
    /// for the crossfade.
    pub fn set_offset(&mut self, id: SourceId, offset: Offset) -> Result<()> {
        self.sync_source(id)?;
        let source = self.source(id)?;
        let Some(format) = source.format().copied() else {
            return Err(PetalMixError::InvalidOperation(format!(
                "{} has no buffers",
                id
            )));
        };
        let samples = match offset {
            Offset::Samples(samples) => samples,
            Offset::Seconds(seconds) if seconds >= 0.0 && seconds.is_finite() => {
                (seconds * format.sample_rate as f64) as u64
            }
            Offset::Bytes(bytes) => bytes / format.frame_bytes().max(1) as u64,
            Offset::Seconds(seconds) => {
                return Err(PetalMixError::InvalidValue(format!(
                    "Invalid offset {} s",
                    seconds
                )));
            }
        };
        if source.kind != BufferKind::Callback && samples >= source.total_frames() {
            return Err(PetalMixError::InvalidValue(format!(
                "Offset {} is past the end of {} ({} samples)",
                samples,
                id,
                source.total_frames()
            )));
        }

        let old_voice = match (source.state, source.voice) {
            (SourceState::Playing | SourceState::Paused, Some(voice)) => voice,
            _ => {
                self.source_mut(id)?.pending_offset = Some(samples);
                return Ok(());
            }
        };

        let Some(voice) = self.free_voices(1).first().copied() else {
            return Err(PetalMixError::ResourceExhausted(
                "No free voice to move the offset".into(),
            ));
        };
        let Some(pos) = self.source(id)?.position_at(samples) else {
            return Err(PetalMixError::InvalidValue(format!(
                "Offset {} is past the end of {}",
                samples, id
            )));
        };
        let mut start = self.bind_voice(id, voice, pos)?;
        start.fading = true;
        let sent = self.send_changes(&[VoiceChange {
            kind: VoiceChangeKind::Restart,
            voice: Some(voice),
            old_voice: Some(old_voice),
            source_id: id.raw(),
            start: Some(start),
        }]);
        let ticket = match sent {
            Ok(ticket) => ticket,
            Err(err) => {
                self.unbind_voice(voice);
                return Err(err);
            }
        };
        let source = self.source_mut(id)?;
        source.voice = Some(voice);
        source.restart_ticket = Some(ticket);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the source doesn't exist.
    pub fn state(&mut self, id: SourceId) -> Result<SourceState> {
        self.sync_source(id)?;
        self.source(id).map(|s| s.state)
    }

    /// Current position relative to the start of the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the source doesn't exist.
    pub fn offset(&mut self, id: SourceId) -> Result<SourceOffset> {
        self.sync_source(id)?;
        let source = self.source(id)?;
        let (samples, fraction) = match source.voice {
            Some(voice) => {
                let slot = &self.shared.voices[voice];
                let pos = self.shared.read_stable(|| slot.queue_position());
                if pos.item == NIL {
                    (source.total_frames(), 0)
                } else {
                    let before: u64 = source
                        .queue
                        .iter()
                        .take_while(|e| e.node != pos.item)
                        .map(|e| e.buffer.frames() as u64)
                        .sum();
                    (before + u64::from(pos.position), pos.frac)
                }
            }
            None => (source.pending_offset.unwrap_or(0), 0),
        };

        let (rate, frame_bytes) = source
            .format()
            .map_or((self.desc.sample_rate, 0), |f| (f.sample_rate, f.frame_bytes()));
        let exact = samples as f64 + f64::from(fraction) / f64::from(MIXER_FRAC_ONE);
        Ok(SourceOffset {
            samples,
            fraction,
            seconds: exact / f64::from(rate.max(1)),
            bytes: samples * frame_bytes as u64,
        })
    }

    /// Buffers of a streaming queue the mixer has finished with.
    ///
    /// # Errors
    ///
    /// Returns an error if the source doesn't exist.
    pub fn buffers_processed(&mut self, id: SourceId) -> Result<usize> {
        self.sync_source(id)?;
        let source = self.source(id)?;
        if source.looping || source.kind != BufferKind::Streaming {
            return Ok(0);
        }
        Ok(match (source.state, source.voice) {
            (SourceState::Initial, _) => 0,
            (_, Some(voice)) => {
                let slot = &self.shared.voices[voice];
                let item = self.shared.read_stable(|| slot.queue_position().item);
                if item == NIL {
                    source.queue.len()
                } else {
                    source.queue.iter().take_while(|e| e.node != item).count()
                }
            }
            (SourceState::Stopped, None) => source.queue.len(),
            _ => 0,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the source doesn't exist.
    pub fn buffers_queued(&self, id: SourceId) -> Result<usize> {
        self.source(id).map(|s| s.queue.len())
    }

    // ----------------------------------------------------------------------
    // Listener and context

    /// # Errors
    ///
    /// Returns `PetalMixError::InvalidValue` for non-finite vectors or a
    /// non-positive unit scale.
    pub fn set_listener(&mut self, props: ListenerProps) -> Result<()> {
        let finite = [props.position, props.velocity, props.orient_at, props.orient_up]
            .iter()
            .all(|v| v.is_finite());
        if !finite || !(props.gain >= 0.0) || !(props.meters_per_unit > 0.0) {
            return Err(PetalMixError::InvalidValue(format!(
                "Invalid listener properties: {:?}",
                props
            )));
        }
        let idx = self.shared.listener_props.acquire(props)?;
        self.shared
            .listener_update
            .publish(&self.shared.listener_props, idx);
        self.listener = props;
        Ok(())
    }

    pub fn listener(&self) -> ListenerProps {
        self.listener
    }

    /// # Errors
    ///
    /// Returns `PetalMixError::InvalidValue` for negative factors, a
    /// non-positive speed of sound or cone scale.
    pub fn set_context_props(&mut self, props: ContextProps) -> Result<()> {
        if !(props.doppler_factor >= 0.0)
            || !(props.doppler_velocity > 0.0)
            || !(props.speed_of_sound > 0.0)
            || !(0.0..=1.0).contains(&props.air_absorption_gain_hf)
            || !(props.cone_scale > 0.0 && props.cone_scale.is_finite())
        {
            return Err(PetalMixError::InvalidValue(format!(
                "Invalid context properties: {:?}",
                props
            )));
        }
        let idx = self.shared.context_props.acquire(props)?;
        self.shared
            .context_update
            .publish(&self.shared.context_props, idx);
        self.context = props;
        Ok(())
    }

    pub fn context_props(&self) -> ContextProps {
        self.context
    }

    /// Holds back property changes until [`process_updates`](Self::process_updates)
    /// so a set of changes lands in the same block. Voice changes still
    /// apply.
    pub fn defer_updates(&self) {
        self.shared.hold_updates();
    }

    pub fn process_updates(&self) {
        self.shared.release_updates();
    }

    // ----------------------------------------------------------------------
    // Effect slots

    /// Creates an effect slot running `effect`.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::ResourceExhausted` when every slot is in
    /// use, or `PetalMixError::InvalidValue` for bad properties.
    pub fn create_effect_slot(
        &mut self,
        props: EffectSlotProps,
        effect: Box<dyn EffectState>,
    ) -> Result<EffectSlotId> {
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            return Err(PetalMixError::ResourceExhausted(format!(
                "All {} effect slots in use",
                self.slots.len()
            )));
        };
        let id = EffectSlotId(index as u32);
        self.validate_slot_props(id, &props)?;
        let active = !effect.is_null();
        self.publish_slot(id, props, active, Some(effect))?;
        self.slots[index] = Some((props, active));
        log::debug!("Created {}", id);
        Ok(id)
    }

    /// # Errors
    ///
    /// Returns an error for an unknown slot or bad properties.
    pub fn update_effect_slot(&mut self, id: EffectSlotId, props: EffectSlotProps) -> Result<()> {
        self.validate_slot_props(id, &props)?;
        let active = self.slot(id)?.1;
        self.publish_slot(id, props, active, None)?;
        self.slots[id.index()] = Some((props, active));
        Ok(())
    }

    /// Replaces a slot's effect. The old one is dropped on the event thread.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown slot.
    pub fn set_effect(&mut self, id: EffectSlotId, effect: Box<dyn EffectState>) -> Result<()> {
        let props = self.slot(id)?.0;
        let active = !effect.is_null();
        self.publish_slot(id, props, active, Some(effect))?;
        self.slots[id.index()] = Some((props, active));
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `PetalMixError::InvalidOperation` if another slot outputs
    /// into this one.
    pub fn delete_effect_slot(&mut self, id: EffectSlotId) -> Result<()> {
        self.slot(id)?;
        let targeted = self
            .slots
            .iter()
            .flatten()
            .any(|(props, _)| props.target == Some(id));
        if targeted {
            return Err(PetalMixError::InvalidOperation(format!(
                "{} is the target of another slot",
                id
            )));
        }
        self.publish_slot(id, EffectSlotProps::default(), false, Some(Box::new(NullEffect)))?;
        self.slots[id.index()] = None;
        log::debug!("Deleted {}", id);
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Events and rendering

    /// Chooses which events the mixer reports.
    pub fn enable_events(&self, mask: EventMask) {
        self.shared.set_event_mask(mask);
    }

    /// Returns every event delivered since the last poll.
    pub fn poll_events(&self) -> Vec<PetalMixEvent> {
        self.event_receiver.try_iter().collect()
    }

    /// Renders interleaved frames of [`channels`](Self::channels) samples
    /// without an audio device. Returns the frames written.
    pub fn render<T: OutputSample>(&mut self, out: &mut [T]) -> usize {
        let frames = self
            .mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .render_into(out, self.channels);
        self.collect_retired();
        frames
    }

    /// Reports the device as lost: every voice stops and a
    /// [`PetalMixEvent::Disconnected`] is posted once.
    pub fn disconnect(&self, message: &str) {
        self.mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disconnect(message);
    }

    /// Audio time rendered so far.
    pub fn clock_time(&self) -> Duration {
        let clock = &self.shared.clock;
        Duration::from_nanos(self.shared.read_stable(|| clock.time_ns()))
    }

    // ----------------------------------------------------------------------
    // Internals

    fn source(&self, id: SourceId) -> Result<&Source> {
        self.sources.get(&id).ok_or_else(|| unknown_source(id))
    }

    fn source_mut(&mut self, id: SourceId) -> Result<&mut Source> {
        self.sources.get_mut(&id).ok_or_else(|| unknown_source(id))
    }

    fn slot(&self, id: EffectSlotId) -> Result<(EffectSlotProps, bool)> {
        self.slots
            .get(id.index())
            .copied()
            .flatten()
            .ok_or_else(|| PetalMixError::InvalidValue(format!("Unknown {}", id)))
    }

    /// Brings a source's state up to date with what the mixer did.
    fn sync_source(&mut self, id: SourceId) -> Result<()> {
        let shared = self.shared.clone();
        let source = self.source_mut(id)?;

        if let Some(ticket) = source.restart_ticket {
            if shared.changes.applied() >= ticket {
                source.restart_ticket = None;
                if let Some(voice) = source.voice {
                    let slot = &shared.voices[voice];
                    // The old voice ended before the move took effect.
                    if slot.state() == VoiceState::Pending && slot.source_id() == id.raw() {
                        slot.clear_buffers();
                        slot.set_source_id(0);
                        slot.set_state(VoiceState::Stopped);
                        source.voice = None;
                        source.state = SourceState::Stopped;
                        log::debug!("{} ended before its offset moved", id);
                    }
                }
            }
        }

        if let Some(voice) = source.voice {
            if shared.voices[voice].source_id() != id.raw() {
                source.voice = None;
                if matches!(source.state, SourceState::Playing | SourceState::Paused) {
                    source.state = SourceState::Stopped;
                }
            }
        } else if source.state == SourceState::Playing {
            source.state = SourceState::Stopped;
        }
        Ok(())
    }

    fn free_voices(&self, count: usize) -> Vec<usize> {
        self.shared
            .voices
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_free())
            .map(|(i, _)| i)
            .take(count)
            .collect()
    }

    /// Points `voice` at the source's queue and props, ready for a change
    /// that starts it. The slot is left alone if the props can't be
    /// published.
    fn bind_voice(&self, id: SourceId, voice: usize, pos: QueuePosition) -> Result<VoiceStart> {
        let source = self.source(id)?;
        let pool = &self.shared.source_props;
        let props_idx = pool.acquire(source.props)?;

        // Leading empty items don't count as progress.
        let skipped: u64 = source
            .queue
            .iter()
            .take_while(|e| e.node != pos.item)
            .map(|e| e.buffer.frames() as u64)
            .sum();
        let start = VoiceStart {
            format: source.format().copied().unwrap_or_default(),
            kind: source.kind,
            fading: skipped > 0 || pos.position > 0,
        };

        let slot = &self.shared.voices[voice];
        slot.set_queue_position(pos);
        slot.set_loop_item(source.loop_node());
        slot.set_source_id(id.raw());
        slot.set_state(VoiceState::Pending);
        slot.set_pending_change(true);
        slot.props.publish(pool, props_idx);
        log::debug!("{} bound to voice {}", id, voice);
        Ok(start)
    }

    /// Returns a voice bound by [`bind_voice`](Self::bind_voice) whose
    /// change never went out.
    fn unbind_voice(&self, voice: usize) {
        let slot = &self.shared.voices[voice];
        if let Some(idx) = slot.props.take() {
            self.shared.source_props.release(idx);
        }
        slot.clear_buffers();
        slot.set_source_id(0);
        slot.set_state(VoiceState::Stopped);
        slot.set_pending_change(false);
    }

    fn publish_props(&self, voice: usize, props: &SourceProps) -> Result<()> {
        let pool = &self.shared.source_props;
        let idx = pool.acquire(*props)?;
        self.shared.voices[voice].props.publish(pool, idx);
        Ok(())
    }

    fn publish_slot(
        &self,
        id: EffectSlotId,
        props: EffectSlotProps,
        active: bool,
        effect: Option<Box<dyn EffectState>>,
    ) -> Result<()> {
        let pool = &self.shared.slot_props;
        let Some(mailbox) = self.shared.slot_updates.get(id.index()) else {
            return Err(PetalMixError::InvalidValue(format!("Unknown {}", id)));
        };
        let mut effect = effect.map(|mut effect| {
            effect.device_update(self.shared.frequency, self.shared.wet_channels);
            effect
        });
        // Keep an effect from an update the mixer hasn't picked up yet.
        if effect.is_none() {
            if let Some(pending) = mailbox.take() {
                // SAFETY: taken from the mailbox; owned until released.
                if let Some(update) = unsafe { pool.get_mut(pending) } {
                    effect = update.state.take();
                }
                pool.release(pending);
            }
        }
        let idx = pool.acquire(SlotUpdate {
            props,
            active,
            state: effect,
        })?;
        mailbox.publish(pool, idx);
        Ok(())
    }

    fn send_changes(&mut self, changes: &[VoiceChange]) -> Result<u64> {
        let ticket = self.shared.changes.send(changes)?;
        self.last_ticket = self.last_ticket.max(ticket);
        Ok(ticket)
    }

    fn retire(&mut self, nodes: Vec<u32>) {
        if nodes.is_empty() {
            return;
        }
        self.retired.push(Retired {
            ticket: self.last_ticket,
            nodes,
        });
        self.collect_retired();
    }

    /// Releases queue nodes once every change that could leave a voice on
    /// them has been applied.
    fn collect_retired(&mut self) {
        let applied = self.shared.changes.applied();
        if !self.retired.iter().any(|r| r.ticket <= applied) {
            return;
        }
        self.shared.wait_for_mix();
        let items = &self.shared.items;
        self.retired.retain(|retired| {
            if retired.ticket > applied {
                return true;
            }
            for node in &retired.nodes {
                // SAFETY: no voice references the node any more.
                if let Some(item) = unsafe { items.get_mut(*node) } {
                    item.buffer = None;
                }
                items.release(*node);
            }
            false
        });
    }

    fn validate_source_props(&self, props: &SourceProps) -> Result<()> {
        let vectors = [
            props.position,
            props.velocity,
            props.direction,
            props.orient_at,
            props.orient_up,
        ];
        let non_negative = [
            props.pitch,
            props.gain,
            props.min_gain,
            props.max_gain,
            props.ref_distance,
            props.max_distance,
            props.rolloff_factor,
            props.room_rolloff_factor,
            props.doppler_factor,
            props.radius,
        ];
        let unit = [
            props.outer_gain,
            props.outer_gain_hf,
            props.direct.gain,
            props.direct.gain_hf,
            props.direct.gain_lf,
        ];
        let valid = vectors.iter().all(|v| v.is_finite())
            && non_negative.iter().all(|v| *v >= 0.0)
            && unit.iter().all(|v| (0.0..=1.0).contains(v))
            && (0.0..=360.0).contains(&props.inner_angle)
            && (0.0..=360.0).contains(&props.outer_angle)
            && (0.0..=10.0).contains(&props.air_absorption_factor)
            && props.stereo_pan.iter().all(|a| a.is_finite());
        if !valid {
            return Err(PetalMixError::InvalidValue(format!(
                "Invalid source properties: {:?}",
                props
            )));
        }

        for (i, send) in props.sends.iter().enumerate().take(MAX_SENDS) {
            let Some(slot) = send.slot else {
                continue;
            };
            if i >= self.desc.num_aux_sends {
                return Err(PetalMixError::InvalidValue(format!(
                    "Send {} is past the device's {} sends",
                    i, self.desc.num_aux_sends
                )));
            }
            self.slot(slot)?;
        }
        Ok(())
    }

    fn validate_slot_props(&self, id: EffectSlotId, props: &EffectSlotProps) -> Result<()> {
        if !(0.0..=1.0).contains(&props.gain) || !(props.room_rolloff_factor >= 0.0) {
            return Err(PetalMixError::InvalidValue(format!(
                "Invalid effect slot properties: {:?}",
                props
            )));
        }
        if let Some(target) = props.target {
            if target == id {
                return Err(PetalMixError::InvalidValue(format!(
                    "{} cannot output into itself",
                    id
                )));
            }
            self.slot(target)?;
        }
        Ok(())
    }
}

impl Drop for PetalMixWorld {
    fn drop(&mut self) {
        self.mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill_event_thread();
        self.event_thread.join();
    }
}

fn unknown_source(id: SourceId) -> PetalMixError {
    PetalMixError::InvalidValue(format!("Unknown {}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ChannelFormat;

    fn world() -> PetalMixWorld {
        PetalMixWorld::new(PetalMixDeviceDesc::default()).unwrap()
    }

    fn tone(frames: usize) -> Arc<AudioBuffer> {
        let samples = (0..frames).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();
        Arc::new(AudioBuffer::from_f32(ChannelFormat::Mono, 48000, samples).unwrap())
    }

    #[test]
    fn test_source_lifecycle() {
        let mut world = world();
        let id = world.create_source(SourceProps::non_spatial()).unwrap();
        assert_eq!(world.state(id).unwrap(), SourceState::Initial);
        world.set_buffer(id, Some(tone(4800))).unwrap();
        world.play(id).unwrap();
        assert_eq!(world.state(id).unwrap(), SourceState::Playing);

        let mut out = vec![0.0f32; 512 * world.channels()];
        world.render(&mut out);
        assert!(out.iter().any(|s| *s != 0.0));

        world.pause(id).unwrap();
        world.render(&mut out);
        assert_eq!(world.state(id).unwrap(), SourceState::Paused);
        let paused_at = world.offset(id).unwrap().samples;
        world.render(&mut out);
        assert_eq!(world.offset(id).unwrap().samples, paused_at);

        world.play(id).unwrap();
        world.render(&mut out);
        assert!(world.offset(id).unwrap().samples > paused_at);

        world.stop(id).unwrap();
        assert_eq!(world.state(id).unwrap(), SourceState::Stopped);
        world.delete_source(id).unwrap();
        assert!(world.state(id).is_err());
    }

    #[test]
    fn test_static_buffer_runs_out() {
        let mut world = world();
        let id = world.create_source(SourceProps::non_spatial()).unwrap();
        world.set_buffer(id, Some(tone(300))).unwrap();
        world.play(id).unwrap();
        let mut out = vec![0.0f32; 1024 * world.channels()];
        world.render(&mut out);
        assert_eq!(world.state(id).unwrap(), SourceState::Stopped);
        assert_eq!(world.offset(id).unwrap().samples, 0);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut world = world();
        let bad = SourceProps {
            gain: -1.0,
            ..Default::default()
        };
        assert!(world.create_source(bad).is_err());
        let bad = SourceProps::spatial(crate::math::Vec3::new(f32::NAN, 0.0, 0.0));
        assert!(world.create_source(bad).is_err());

        let id = world.create_source(SourceProps::default()).unwrap();
        world.set_buffer(id, Some(tone(100))).unwrap();
        assert!(world.set_offset(id, Offset::Samples(100)).is_err());
        assert!(world.set_offset(id, Offset::Seconds(-1.0)).is_err());
        assert!(world.set_offset(id, Offset::Samples(99)).is_ok());
        assert_eq!(world.offset(id).unwrap().samples, 99);

        let flat = ContextProps {
            cone_scale: 0.0,
            ..Default::default()
        };
        assert!(world.set_context_props(flat).is_err());
    }

    #[test]
    fn test_static_and_streaming_dont_mix() {
        let mut world = world();
        let id = world.create_source(SourceProps::default()).unwrap();
        world.set_buffer(id, Some(tone(100))).unwrap();
        assert!(world.queue_buffers(id, &[tone(100)]).is_err());

        let stereo = Arc::new(
            AudioBuffer::from_f32(ChannelFormat::Stereo, 48000, vec![0.0; 200]).unwrap(),
        );
        let streaming = world.create_source(SourceProps::default()).unwrap();
        world.queue_buffers(streaming, &[tone(100)]).unwrap();
        assert!(world.queue_buffers(streaming, &[stereo]).is_err());
        assert_eq!(world.buffers_queued(streaming).unwrap(), 1);
    }

    #[test]
    fn test_voice_exhaustion_starts_nothing() {
        let mut world = PetalMixWorld::new(PetalMixDeviceDesc {
            max_voices: 2,
            ..Default::default()
        })
        .unwrap();
        let ids: Vec<SourceId> = (0..3)
            .map(|_| {
                let id = world.create_source(SourceProps::non_spatial()).unwrap();
                world.set_buffer(id, Some(tone(4800))).unwrap();
                id
            })
            .collect();
        assert!(matches!(
            world.play_batch(&ids),
            Err(PetalMixError::ResourceExhausted(_))
        ));
        for id in &ids {
            assert_eq!(world.state(*id).unwrap(), SourceState::Initial);
        }
        world.play_batch(&ids[..2]).unwrap();
        assert_eq!(world.state(ids[1]).unwrap(), SourceState::Playing);
    }

    fn empty() -> Arc<AudioBuffer> {
        Arc::new(AudioBuffer::from_f32(ChannelFormat::Mono, 48000, Vec::new()).unwrap())
    }

    #[test]
    fn test_empty_queue_stops_without_a_voice() {
        let mut world = world();
        let id = world.create_source(SourceProps::non_spatial()).unwrap();
        world.queue_buffers(id, &[empty(), empty()]).unwrap();
        world.play(id).unwrap();
        assert_eq!(world.state(id).unwrap(), SourceState::Stopped);
        assert_eq!(world.free_voices(usize::MAX).len(), world.shared.voices.len());

        let skipping = world.create_source(SourceProps::non_spatial()).unwrap();
        world.queue_buffers(skipping, &[empty(), tone(300)]).unwrap();
        world.play(skipping).unwrap();
        let mut out = vec![0.0f32; 100 * world.channels()];
        world.render(&mut out);
        assert_eq!(world.state(skipping).unwrap(), SourceState::Playing);
        assert_eq!(world.offset(skipping).unwrap().samples, 100);
    }

    #[test]
    fn test_batch_with_empty_source_keeps_voices() {
        let mut world = PetalMixWorld::new(PetalMixDeviceDesc {
            max_voices: 2,
            ..Default::default()
        })
        .unwrap();
        let good = world.create_source(SourceProps::non_spatial()).unwrap();
        world.set_buffer(good, Some(tone(4800))).unwrap();
        let hollow = world.create_source(SourceProps::non_spatial()).unwrap();
        world.set_buffer(hollow, Some(empty())).unwrap();

        world.play_batch(&[good, hollow]).unwrap();
        assert_eq!(world.state(good).unwrap(), SourceState::Playing);
        assert_eq!(world.state(hollow).unwrap(), SourceState::Stopped);

        world.stop(good).unwrap();
        let mut out = vec![0.0f32; 256 * world.channels()];
        world.render(&mut out);
        world.render(&mut out);

        let pair: Vec<SourceId> = (0..2)
            .map(|_| {
                let id = world.create_source(SourceProps::non_spatial()).unwrap();
                world.set_buffer(id, Some(tone(4800))).unwrap();
                id
            })
            .collect();
        world.play_batch(&pair).unwrap();
        for id in &pair {
            assert_eq!(world.state(*id).unwrap(), SourceState::Playing);
        }
    }

    #[test]
    fn test_effect_slots() {
        let mut world = world();
        let a = world
            .create_effect_slot(EffectSlotProps::default(), Box::new(NullEffect))
            .unwrap();
        let b = world
            .create_effect_slot(
                EffectSlotProps {
                    target: Some(a),
                    ..Default::default()
                },
                Box::new(crate::effect::DedicatedEffect::default()),
            )
            .unwrap();
        assert!(world.delete_effect_slot(a).is_err());
        let looped = EffectSlotProps {
            target: Some(b),
            ..Default::default()
        };
        assert!(world.update_effect_slot(b, looped).is_err());

        let props = SourceProps::default().with_send(0, b);
        let id = world.create_source(props).unwrap();
        world.delete_effect_slot(b).unwrap();
        world.delete_effect_slot(a).unwrap();
        assert!(world.set_props(id, props).is_err());
    }
}
