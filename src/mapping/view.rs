//! Typed, bounds-checked views over a memory-mapped file.

use std::fs::File;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use tracing::debug;

use super::element::MappedElement;
use super::MappingRules;
use crate::error::{CoreError, Result};
use crate::resource::{CleanupPriority, ResourceGuard, ResourceId, ResourceRegistry};

/// The mapping itself. Owned by a registry guard so unmapping is tracked.
pub(crate) struct MappedRegion {
    mmap: Mmap,
    path: PathBuf,
}

/// Read-only typed view of a mapped file.
///
/// Clones and sub-slices share one mapping, which is released through the
/// registry when the last of them drops.
pub struct MappedView<T: MappedElement> {
    region: Arc<ResourceGuard<MappedRegion>>,
    /// Byte offset of element 0 within the mapping.
    start: usize,
    len: usize,
    _element: PhantomData<T>,
}

impl<T: MappedElement> MappedView<T> {
    /// Map `path` and validate it as a sequence of `T`.
    pub fn open(
        registry: &ResourceRegistry,
        path: impl AsRef<Path>,
        rules: &MappingRules,
    ) -> Result<Self> {
        let path = path.as_ref();
        let size = size_of::<T>();
        if size == 0 {
            return Err(CoreError::InvalidLayout("zero-sized element type".into()));
        }

        let file = File::open(path)?;
        // SAFETY: the file is opened read-only and the map is never written
        // through. Callers must not truncate the file while views exist.
        let mmap = unsafe { Mmap::map(&file)? };
        let (start, len) = validate_layout::<T>(&mmap, rules)?;

        let region = MappedRegion {
            mmap,
            path: path.to_path_buf(),
        };
        let guard = registry.guard_sync(region, CleanupPriority::Low, |region| {
            debug!(path = %region.path.display(), "unmapping file");
            drop(region);
            Ok(())
        })?;
        debug!(
            path = %path.display(),
            resource_id = %guard.id(),
            elements = len,
            "file mapped"
        );

        Ok(Self {
            region: Arc::new(guard),
            start,
            len,
            _element: PhantomData,
        })
    }

    fn region(&self) -> Option<&MappedRegion> {
        self.region.get().ok()
    }

    /// Registry id of the underlying mapping.
    pub fn resource_id(&self) -> ResourceId {
        self.region.id()
    }

    pub fn path(&self) -> Option<&Path> {
        self.region().map(|region| region.path.as_path())
    }

    pub fn as_slice(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        let Some(region) = self.region() else {
            return &[];
        };
        let bytes = &region.mmap[self.start..self.start + self.len * size_of::<T>()];
        // SAFETY: `open` checked that the range lies inside the map and that
        // its start is aligned for `T`; `T: MappedElement` accepts any bytes.
        // The map lives as long as `self.region`.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<T>(), self.len) }
    }

    pub fn get(&self, index: usize) -> Result<&T> {
        self.as_slice().get(index).ok_or(CoreError::OutOfBounds {
            index,
            len: self.len,
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len * size_of::<T>()
    }

    /// Sub-view sharing the same mapping.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Result<Self> {
        let from = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let to = match range.end_bound() {
            Bound::Included(&n) => n.saturating_add(1),
            Bound::Excluded(&n) => n,
            Bound::Unbounded => self.len,
        };
        if to > self.len {
            return Err(CoreError::OutOfBounds { index: to, len: self.len });
        }
        if from > to {
            return Err(CoreError::OutOfBounds { index: from, len: to });
        }
        Ok(Self {
            region: self.region.clone(),
            start: self.start + from * size_of::<T>(),
            len: to - from,
            _element: PhantomData,
        })
    }

    /// Views currently sharing this mapping.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.region)
    }
}

impl<T: MappedElement> Clone for MappedView<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
            start: self.start,
            len: self.len,
            _element: PhantomData,
        }
    }
}

impl<'a, T: MappedElement> IntoIterator for &'a MappedView<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: MappedElement + std::fmt::Debug> std::fmt::Debug for MappedView<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedView")
            .field("resource_id", &self.resource_id())
            .field("path", &self.path())
            .field("len", &self.len)
            .finish()
    }
}

/// Returns the byte offset of element 0 and the element count.
fn validate_layout<T: MappedElement>(bytes: &[u8], rules: &MappingRules) -> Result<(usize, usize)> {
    let size = size_of::<T>();
    let file_len = bytes.len();
    let offset = usize::try_from(rules.offset)
        .map_err(|_| CoreError::InvalidLayout(format!("offset {} does not fit", rules.offset)))?;
    if offset > file_len {
        return Err(CoreError::InvalidLayout(format!(
            "offset {offset} beyond file length {file_len}"
        )));
    }
    let available = file_len - offset;
    if available % size != 0 {
        return Err(CoreError::InvalidLayout(format!(
            "{available} bytes after offset is not a multiple of element size {size}"
        )));
    }
    let len = available / size;
    if len == 0 {
        if rules.allow_empty {
            return Ok((offset, 0));
        }
        return Err(CoreError::InvalidLayout("mapping contains no elements".into()));
    }
    if let Some(max) = rules.max_elements {
        if len > max {
            return Err(CoreError::InvalidLayout(format!(
                "{len} elements exceeds limit of {max}"
            )));
        }
    }
    let address = bytes.as_ptr() as usize + offset;
    if address % align_of::<T>() != 0 {
        return Err(CoreError::InvalidLayout(format!(
            "offset {offset} is not aligned to {}",
            align_of::<T>()
        )));
    }
    Ok((offset, len))
}
