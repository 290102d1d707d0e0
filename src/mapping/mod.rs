//! Memory-mapped file access.
//!
//! The only place in the crate that reinterprets bytes. Layout is checked
//! once at open time; element reads afterwards are plain slice indexing.

mod element;
mod view;

pub use element::MappedElement;
pub use view::MappedView;

use serde::{Deserialize, Serialize};

/// Layout constraints checked when a file is mapped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingRules {
    /// Bytes skipped before element 0 (e.g. a header).
    pub offset: u64,
    /// Upper bound on the element count.
    pub max_elements: Option<usize>,
    /// Accept files with no elements after `offset`.
    pub allow_empty: bool,
}
