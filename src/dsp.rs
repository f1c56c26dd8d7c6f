//! Modules related to DSP algorithms, ie: PeakMeter, Resampler, etc.

pub mod peak_meter;
pub mod power_meter;
pub mod resampler;
pub mod smoothing_filter;
