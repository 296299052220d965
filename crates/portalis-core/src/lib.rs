//! Portalis Core
//!
//! Shared building blocks for the Portalis render manager: logging bootstrap,
//! profiling hooks, the key/value configuration store and the math types used
//! by the portal traversal.

pub mod config;
pub mod logging;
pub mod math;
pub mod profiling;

/// Monotonic time stamp used by every cache; usually the frame number.
pub type Ticks = u64;
