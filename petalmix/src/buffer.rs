//! Sample storage and the queue items voices read from.
//!
//! Buffers are immutable once created and shared through `Arc`. Samples are
//! converted to interleaved `f32` up front so the mixer only ever reads one
//! representation; the original sample type is kept for byte offsets.

use std::sync::{Arc, Mutex};

use crate::config::{AmbiLayout, AmbiScaling};
use crate::defs::{BUFFER_LINE_SIZE, MAX_AMBI_ORDER, MAX_RESAMPLER_PADDING};
use crate::defs::{ambi_2d_channels_from_order, ambi_channels_from_order};
use crate::error::{PetalMixError, Result};

/// Channel configuration of buffer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFormat {
    Mono,
    Stereo,
    /// Back left/right pair.
    Rear,
    Quad,
    X51,
    X61,
    X71,
    /// Horizontal-only B-format of the given order.
    BFormat2D { order: usize },
    /// Periphonic B-format of the given order.
    BFormat3D { order: usize },
}

impl ChannelFormat {
    pub fn channel_count(&self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo | Self::Rear => 2,
            Self::Quad => 4,
            Self::X51 => 6,
            Self::X61 => 7,
            Self::X71 => 8,
            Self::BFormat2D { order } => ambi_2d_channels_from_order(*order),
            Self::BFormat3D { order } => ambi_channels_from_order(*order),
        }
    }

    pub fn is_ambisonic(&self) -> bool {
        matches!(self, Self::BFormat2D { .. } | Self::BFormat3D { .. })
    }

    pub fn ambi_order(&self) -> usize {
        match self {
            Self::BFormat2D { order } | Self::BFormat3D { order } => *order,
            _ => 0,
        }
    }
}

/// Sample representation the buffer was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferSampleType {
    U8,
    I16,
    #[default]
    F32,
}

impl BufferSampleType {
    pub fn bytes(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::F32 => 4,
        }
    }
}

/// Everything a voice needs to know about the data it plays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferFormat {
    pub channels: ChannelFormat,
    pub sample_rate: u32,
    pub sample_type: BufferSampleType,
    pub ambi_layout: AmbiLayout,
    pub ambi_scaling: AmbiScaling,
}

impl Default for BufferFormat {
    fn default() -> Self {
        Self {
            channels: ChannelFormat::Mono,
            sample_rate: 48000,
            sample_type: BufferSampleType::F32,
            ambi_layout: AmbiLayout::Acn,
            ambi_scaling: AmbiScaling::N3D,
        }
    }
}

impl BufferFormat {
    pub fn channel_count(&self) -> usize {
        self.channels.channel_count()
    }

    /// Size of one frame in the original representation.
    pub fn frame_bytes(&self) -> usize {
        self.channel_count() * self.sample_type.bytes()
    }
}

/// User function feeding a callback buffer.
///
/// Fills the interleaved slice (a whole number of frames) and returns the
/// number of frames written. Fewer frames than requested ends the stream
/// after they play out; zero or a negative value ends it immediately.
pub type BufferCallback = Box<dyn FnMut(&mut [f32]) -> i32 + Send>;

pub(crate) struct CallbackStream {
    pub(crate) func: BufferCallback,
    /// Interleaved frames pulled from `func` but not yet consumed.
    pub(crate) data: Vec<f32>,
}

/// Frames a callback buffer keeps ahead of the mixer.
pub const CALLBACK_BUFFER_FRAMES: usize = BUFFER_LINE_SIZE + MAX_RESAMPLER_PADDING;

/// Immutable audio data, or a callback producing it.
pub struct AudioBuffer {
    format: BufferFormat,
    data: Vec<f32>,
    frames: usize,
    loop_start: usize,
    loop_end: usize,
    callback: Option<Mutex<CallbackStream>>,
}

impl std::fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("format", &self.format)
            .field("frames", &self.frames)
            .field("loop_start", &self.loop_start)
            .field("loop_end", &self.loop_end)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

fn check_format(channels: ChannelFormat, sample_rate: u32) -> Result<()> {
    if sample_rate == 0 {
        return Err(PetalMixError::AudioFormat(
            "Sample rate must be greater than 0".into(),
        ));
    }
    let order = channels.ambi_order();
    if channels.is_ambisonic() && !(1..=MAX_AMBI_ORDER).contains(&order) {
        return Err(PetalMixError::AudioFormat(format!(
            "Unsupported B-format order {}",
            order
        )));
    }
    Ok(())
}

impl AudioBuffer {
    /// Creates a buffer from interleaved float samples.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::AudioFormat` if the sample count is not a whole
    /// number of frames, or the format is invalid.
    pub fn from_f32(channels: ChannelFormat, sample_rate: u32, samples: Vec<f32>) -> Result<Self> {
        Self::build(channels, sample_rate, BufferSampleType::F32, samples)
    }

    /// Creates a buffer from interleaved 16-bit samples.
    pub fn from_i16(channels: ChannelFormat, sample_rate: u32, samples: &[i16]) -> Result<Self> {
        let data = samples.iter().map(|s| *s as f32 / 32768.0).collect();
        Self::build(channels, sample_rate, BufferSampleType::I16, data)
    }

    /// Creates a buffer from interleaved unsigned 8-bit samples.
    pub fn from_u8(channels: ChannelFormat, sample_rate: u32, samples: &[u8]) -> Result<Self> {
        let data = samples.iter().map(|s| (*s as f32 - 128.0) / 128.0).collect();
        Self::build(channels, sample_rate, BufferSampleType::U8, data)
    }

    fn build(
        channels: ChannelFormat,
        sample_rate: u32,
        sample_type: BufferSampleType,
        data: Vec<f32>,
    ) -> Result<Self> {
        check_format(channels, sample_rate)?;
        let count = channels.channel_count();
        if data.len() % count != 0 {
            return Err(PetalMixError::AudioFormat(format!(
                "{} samples is not a whole number of {}-channel frames",
                data.len(),
                count
            )));
        }
        let frames = data.len() / count;
        Ok(Self {
            format: BufferFormat {
                channels,
                sample_rate,
                sample_type,
                ..Default::default()
            },
            data,
            frames,
            loop_start: 0,
            loop_end: frames,
            callback: None,
        })
    }

    /// Creates a buffer whose samples come from `func` as the mixer needs them.
    pub fn from_callback<F>(channels: ChannelFormat, sample_rate: u32, func: F) -> Result<Self>
    where
        F: FnMut(&mut [f32]) -> i32 + Send + 'static,
    {
        check_format(channels, sample_rate)?;
        Ok(Self {
            format: BufferFormat {
                channels,
                sample_rate,
                ..Default::default()
            },
            data: Vec::new(),
            frames: 0,
            loop_start: 0,
            loop_end: 0,
            callback: Some(Mutex::new(CallbackStream {
                func: Box::new(func),
                data: vec![0.0; CALLBACK_BUFFER_FRAMES * channels.channel_count()],
            })),
        })
    }

    /// Sets the channel order and normalization of B-format data.
    pub fn with_ambisonic(mut self, layout: AmbiLayout, scaling: AmbiScaling) -> Result<Self> {
        if !self.format.channels.is_ambisonic() {
            return Err(PetalMixError::AudioFormat(
                "Ambisonic layout on a non B-format buffer".into(),
            ));
        }
        self.format.ambi_layout = layout;
        self.format.ambi_scaling = scaling;
        Ok(self)
    }

    /// Sets the loop region in frames, used when the buffer plays looping as a
    /// static source.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::InvalidValue` unless `start < end <= frames`.
    pub fn with_loop_points(mut self, start: usize, end: usize) -> Result<Self> {
        if start >= end || end > self.frames {
            return Err(PetalMixError::InvalidValue(format!(
                "Invalid loop points {}..{} for {} frames",
                start, end, self.frames
            )));
        }
        self.loop_start = start;
        self.loop_end = end;
        Ok(self)
    }

    pub fn format(&self) -> &BufferFormat {
        &self.format
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn loop_points(&self) -> (usize, usize) {
        (self.loop_start, self.loop_end)
    }

    pub fn is_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames as f64 / self.format.sample_rate as f64
    }

    pub(crate) fn samples(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn callback(&self) -> Option<&Mutex<CallbackStream>> {
        self.callback.as_ref()
    }
}

/// How a voice consumes its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferKind {
    /// A single buffer set on the source, loopable on its loop points.
    #[default]
    Static,
    /// A queue of buffers, appended to while playing.
    Streaming,
    /// Samples produced on demand by a callback.
    Callback,
}

/// One entry of a source's buffer queue, stored in a pool and linked through
/// the node's write-once link.
#[derive(Debug, Clone, Default)]
pub struct BufferItem {
    pub buffer: Option<Arc<AudioBuffer>>,
    /// Frames of data, zero for empty and callback entries.
    pub sample_len: usize,
    pub loop_start: usize,
    pub loop_end: usize,
}

impl BufferItem {
    pub fn new(buffer: Option<Arc<AudioBuffer>>) -> Self {
        match buffer {
            Some(buffer) => Self {
                sample_len: buffer.frames(),
                loop_start: buffer.loop_start,
                loop_end: buffer.loop_end,
                buffer: Some(buffer),
            },
            None => Self::default(),
        }
    }

    pub fn is_callback(&self) -> bool {
        self.buffer.as_ref().is_some_and(|b| b.is_callback())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_conversion() {
        let buf = AudioBuffer::from_i16(ChannelFormat::Stereo, 44100, &[-32768, 16384, 0, 0]).unwrap();
        assert_eq!(buf.frames(), 2);
        assert_eq!(buf.samples()[0], -1.0);
        assert_eq!(buf.samples()[1], 0.5);
        assert_eq!(buf.format().frame_bytes(), 4);

        let buf = AudioBuffer::from_u8(ChannelFormat::Mono, 8000, &[128, 255, 0]).unwrap();
        assert_eq!(buf.samples()[0], 0.0);
        assert_eq!(buf.samples()[2], -1.0);
    }

    #[test]
    fn test_rejects_partial_frames() {
        assert!(AudioBuffer::from_f32(ChannelFormat::Stereo, 48000, vec![0.0; 3]).is_err());
        assert!(AudioBuffer::from_f32(ChannelFormat::BFormat3D { order: 4 }, 48000, vec![]).is_err());
        assert!(AudioBuffer::from_f32(ChannelFormat::Mono, 0, vec![]).is_err());
    }

    #[test]
    fn test_loop_points() {
        let buf = AudioBuffer::from_f32(ChannelFormat::Mono, 48000, vec![0.0; 100]).unwrap();
        assert_eq!(buf.loop_points(), (0, 100));
        let buf = buf.with_loop_points(10, 90).unwrap();
        let item = BufferItem::new(Some(Arc::new(buf)));
        assert_eq!((item.loop_start, item.loop_end, item.sample_len), (10, 90, 100));

        let buf = AudioBuffer::from_f32(ChannelFormat::Mono, 48000, vec![0.0; 100]).unwrap();
        assert!(buf.with_loop_points(50, 50).is_err());
    }

    #[test]
    fn test_ambisonic_channel_counts() {
        assert_eq!(ChannelFormat::BFormat3D { order: 2 }.channel_count(), 9);
        assert_eq!(ChannelFormat::BFormat2D { order: 3 }.channel_count(), 7);
        let buf = AudioBuffer::from_f32(ChannelFormat::Stereo, 48000, vec![]).unwrap();
        assert!(buf.with_ambisonic(AmbiLayout::FuMa, AmbiScaling::FuMa).is_err());
    }
}
