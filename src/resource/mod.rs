//! Resource lifecycle management.
//!
//! Guards own a value plus a cleanup action; the registry tracks every guard
//! and runs scope-exit cleanups on its background scheduler.

mod guard;
mod id;
mod priority;
mod registry;

pub use guard::ResourceGuard;
pub use id::ResourceId;
pub use priority::{CleanupPriority, CleanupQueue};
pub use registry::{
    CleanupReport, RegistryConfig, RegistryStats, ResourceInfo, ResourceRegistry, ResourceState,
    ShutdownReport,
};
