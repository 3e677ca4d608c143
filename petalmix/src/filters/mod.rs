//! IIR filters used on the mix path.

mod biquad;
mod nfc;
mod splitter;

pub use biquad::{BiquadFilter, BiquadType, rcp_q_from_bandwidth, rcp_q_from_slope};
pub use nfc::NfcFilter;
pub use splitter::BandSplitter;
