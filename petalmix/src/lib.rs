pub mod ambi;
pub mod buffer;
pub mod config;
pub mod defs;
pub mod effect;
pub mod engine;
pub mod error;
pub mod events;
pub mod filters;
pub mod hrtf;
pub mod math;
pub mod mixer;
pub mod pool;
pub mod resampler;
pub mod spatial;
pub mod voice;
pub mod world;

pub use buffer::{AudioBuffer, BufferFormat, ChannelFormat};
pub use config::{
    ContextProps, DistanceModel, HrtfMode, ListenerProps, OutputLayout, PetalMixDeviceDesc,
    SourceProps, StereoEncoding,
};
pub use effect::{DedicatedEffect, EffectSlotId, EffectSlotProps, EffectState, NullEffect};
pub use engine::PetalMixEngine;
pub use error::{PetalMixError, Result};
pub use events::{EventMask, PetalMixEvent, SourceState};
pub use mixer::post::OutputSample;
pub use resampler::Resampler;
pub use world::{Offset, PetalMixWorld, SourceId, SourceOffset};
