//! Auxiliary effect slots.
//!
//! Each slot owns an ambisonic wet bus that voices send into, and an
//! [`EffectState`] that turns the bus into output, either into another slot's
//! bus or into the device's dry bus. Slots feeding other slots are processed
//! first.

use std::fmt;

use crate::ambi::BFChannelConfig;
use crate::defs::{FloatBufferLine, MAX_AMBI_CHANNELS, MAX_OUTPUT_CHANNELS};
use crate::mixer::kernels::mix_constant;

/// Handle to an effect slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectSlotId(pub(crate) u32);

impl EffectSlotId {
    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EffectSlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EffectSlot({})", self.0)
    }
}

/// Properties of an effect slot that affect how voices send into it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectSlotProps {
    pub gain: f32,
    /// Derive send gains from distance and the slot's decay parameters.
    pub aux_send_auto: bool,
    /// Slot this one outputs into, or the device when `None`.
    pub target: Option<EffectSlotId>,
    /// Rolloff added to each source's room rolloff factor.
    pub room_rolloff_factor: f32,
    /// Decay time in seconds of the room the effect models (0 disables).
    pub decay_time: f32,
    pub decay_lf_ratio: f32,
    pub decay_hf_ratio: f32,
    /// Limit the HF decay to what air absorption allows.
    pub decay_hf_limit: bool,
    pub air_absorption_gain_hf: f32,
}

impl Default for EffectSlotProps {
    fn default() -> Self {
        Self {
            gain: 1.0,
            aux_send_auto: true,
            target: None,
            room_rolloff_factor: 0.0,
            decay_time: 0.0,
            decay_lf_ratio: 0.0,
            decay_hf_ratio: 0.0,
            decay_hf_limit: false,
            air_absorption_gain_hf: 1.0,
        }
    }
}

/// Where an effect writes its output.
#[derive(Debug, Clone, Copy)]
pub struct EffectTarget<'a> {
    /// Channel layout of the output bus.
    pub map: &'a [BFChannelConfig],
}

/// Effect processing run on the mixer thread.
///
/// `update` and `process` are called from the mixer and must not block or
/// allocate. `device_update` runs on a control thread before the state is
/// installed.
pub trait EffectState: Send + Sync {
    /// Prepares for the device sample rate and the slot bus width.
    fn device_update(&mut self, sample_rate: u32, bus_channels: usize);

    /// Applies new slot properties and the output layout.
    fn update(&mut self, props: &EffectSlotProps, target: EffectTarget<'_>);

    /// Processes `samples_to_do` samples of the slot bus into `output`.
    fn process(
        &mut self,
        samples_to_do: usize,
        input: &[FloatBufferLine],
        output: &mut [FloatBufferLine],
    );

    /// A null effect produces nothing; sends to its slot are skipped.
    fn is_null(&self) -> bool {
        false
    }
}

/// Outputs silence.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEffect;

impl EffectState for NullEffect {
    fn device_update(&mut self, _sample_rate: u32, _bus_channels: usize) {}

    fn update(&mut self, _props: &EffectSlotProps, _target: EffectTarget<'_>) {}

    fn process(&mut self, _: usize, _: &[FloatBufferLine], _: &mut [FloatBufferLine]) {}

    fn is_null(&self) -> bool {
        true
    }
}

/// Passes the slot bus through to the target, scaled by the slot gain.
#[derive(Debug, Clone)]
pub struct DedicatedEffect {
    gains: [[f32; MAX_OUTPUT_CHANNELS]; MAX_AMBI_CHANNELS],
    channels: usize,
}

impl Default for DedicatedEffect {
    fn default() -> Self {
        Self {
            gains: [[0.0; MAX_OUTPUT_CHANNELS]; MAX_AMBI_CHANNELS],
            channels: 0,
        }
    }
}

impl EffectState for DedicatedEffect {
    fn device_update(&mut self, _sample_rate: u32, bus_channels: usize) {
        self.channels = bus_channels.min(MAX_AMBI_CHANNELS);
    }

    fn update(&mut self, props: &EffectSlotProps, target: EffectTarget<'_>) {
        for (acn, row) in self.gains.iter_mut().enumerate() {
            row.fill(0.0);
            for (out, chan) in row.iter_mut().zip(target.map) {
                if chan.index == acn {
                    *out = chan.scale * props.gain;
                }
            }
        }
    }

    fn process(
        &mut self,
        samples_to_do: usize,
        input: &[FloatBufferLine],
        output: &mut [FloatBufferLine],
    ) {
        for (line, gains) in input.iter().take(self.channels).zip(self.gains.iter()) {
            mix_constant(&line[..samples_to_do], output, gains);
        }
    }
}

/// Orders `slots` so every slot comes before the slot it outputs into.
///
/// `target_of(slot)` returns the slot's target. Cycles are left in place at the
/// end of the list. Runs in place without allocating.
pub fn sort_by_target(slots: &mut [usize], target_of: impl Fn(usize) -> Option<usize>) {
    let mut start = 0;
    while start < slots.len() {
        let mut next = start;
        for i in start..slots.len() {
            let slot = slots[i];
            let targeted = slots[start..]
                .iter()
                .any(|other| *other != slot && target_of(*other) == Some(slot));
            if !targeted {
                slots.swap(next, i);
                next += 1;
            }
        }
        if next == start {
            break;
        }
        start = next;
    }
}
