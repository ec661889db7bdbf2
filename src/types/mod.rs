//! Common types used throughout the communication layer.
mod config;
mod plan;

pub use comms_core::*;

pub use self::config::*;
pub use self::plan::*;

/// Path used by operations that do not distinguish between multiple routes.
pub const DEFAULT_PATH: i32 = 0;
