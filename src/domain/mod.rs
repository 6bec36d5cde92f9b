pub mod forecast;
pub mod weather;

pub use forecast::*;
pub use weather::*;
