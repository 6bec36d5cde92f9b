//! Forecast orchestration
//!
//! [`ForecastOrchestrator`] owns the committed model snapshot, the production
//! history and the training state machine, and turns weather inputs into an
//! hourly and daily forecast.

pub mod commands;
pub mod engine;
pub mod history;
pub mod safeguard;
pub mod window;

pub use engine::*;
pub use history::*;
pub use safeguard::*;
pub use window::*;
