//! Small shared utilities

pub mod throttle;

pub use throttle::{LogThrottler, Throttle};
