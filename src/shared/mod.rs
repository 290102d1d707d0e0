//! Primitives for sharing data between tasks.
//!
//! - [`SharedData`]: immutable, reference counted.
//! - [`MutableSharedData`]: async reader/writer lock.
//! - [`ConcurrentMap`]: sharded concurrent map.
//! - [`ConfigData`]: versioned value with change subscriptions.

mod config_data;
mod data;
mod map;

pub use config_data::{BacklogPolicy, ConfigData, ConfigDataOptions, ConfigSnapshot, Subscription};
pub use data::{MutableSharedData, SharedData};
pub use map::ConcurrentMap;
