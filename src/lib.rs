//! camview - WHEP camera wall client
//!
//! This crate connects camera tiles to a WHEP media server over WebRTC,
//! supervises stream liveness and reconnects with a bounded retry.

pub mod config;
pub mod error;
pub mod events;
pub mod utils;
pub mod whep;

pub use error::{AppError, Result};
