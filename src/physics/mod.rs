//! Physics model of PV output
//!
//! Sun/panel geometry, plane-of-array irradiance, NOCT thermal derating and
//! per-group aggregation. Everything in here is pure and total: out-of-range
//! inputs produce zero output instead of errors.

pub mod geometry;
pub mod irradiance;
pub mod panel_group;
pub mod thermal;

pub use geometry::*;
pub use irradiance::*;
pub use panel_group::*;
pub use thermal::*;
