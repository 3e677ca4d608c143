//! Device and source configuration types.

mod device_desc;
mod source_props;

pub use device_desc::{
    AmbiLayout, AmbiScaling, Channel, HrtfMode, OutputLayout, PetalMixDeviceDesc, SampleType,
    StereoEncoding,
};
pub use source_props::{
    ContextProps, DirectMode, DistanceModel, FilterProps, ListenerProps, SendProps, SourceProps,
    SpatializeMode,
};
