//! Self-calibration of the physics model
//!
//! Each panel group carries multiplicative correction factors, one per
//! weather/time bucket plus a group-wide fallback. Factors are learned from
//! actual vs. physics output with bounded exponential smoothing. A separate
//! operator-triggered rescue pass handles groups whose error is too large for
//! the normal bound (typically a wrong nominal capacity).

pub mod bucket;
pub mod table;

pub use bucket::*;
pub use table::*;
