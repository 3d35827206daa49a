use std::{mem, ptr::NonNull, slice};

use tracing::debug;

use crate::{cluster::ClusterProvider, error::HeapError};

type Slot = Option<NonNull<u8>>;

/// Book of clusters backing one arena.
///
/// A root cluster holds one slot per arena cluster. Slots are filled in
/// order and only when every earlier cluster is in use, so the first empty
/// slot marks the end of the arena.
pub(crate) struct ClusterDirectory {
  name: &'static str,
  root: Option<NonNull<Slot>>,
  capacity: usize,
}

impl ClusterDirectory {
  pub fn new(
    name: &'static str,
    cluster_size: usize,
  ) -> Self {
    Self {
      name,
      root: None,
      capacity: cluster_size / mem::size_of::<Slot>(),
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  /// Maximum number of clusters the arena can grow to.
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Returns the cluster in slot `index`, mapping the root table and the
  /// cluster itself on first use.
  pub fn cluster(
    &mut self,
    provider: &mut ClusterProvider,
    index: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    debug_assert!(index < self.capacity);

    let root = match self.root {
      Some(root) => root,
      None => {
        let root = provider.request().map_err(|source| self.map_error(source))?;
        debug!(arena = self.name, "arena directory mapped");
        *self.root.insert(root.cast::<Slot>())
      }
    };

    // Safety: `index` is within the root cluster, which the OS zero-filled
    // and which only ever holds `Slot` values.
    let slot = unsafe { &mut *root.as_ptr().add(index) };

    if let Some(cluster) = *slot {
      return Ok(cluster);
    }

    let cluster = provider.request().map_err(|source| self.map_error(source))?;
    debug!(arena = self.name, index, "arena grew");
    *slot = Some(cluster);
    Ok(cluster)
  }

  /// Clusters mapped so far, in slot order.
  pub fn mapped(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
    let slots: &[Slot] = match self.root {
      // Safety: the root cluster holds exactly `capacity` slots.
      Some(root) => unsafe { slice::from_raw_parts(root.as_ptr(), self.capacity) },
      None => &[],
    };
    slots.iter().map_while(|slot| *slot)
  }

  /// Unmaps every arena cluster and the root table.
  ///
  /// # Safety
  ///
  /// Nothing carved out of this arena may be used afterwards.
  pub unsafe fn release_all(
    &mut self,
    provider: &mut ClusterProvider,
  ) {
    let Some(root) = self.root.take() else {
      return;
    };

    // Safety: as in `mapped`; the root is still mapped here.
    let slots = unsafe { slice::from_raw_parts(root.as_ptr(), self.capacity) };
    for cluster in slots.iter().map_while(|slot| *slot) {
      unsafe { provider.release(cluster) };
    }
    unsafe { provider.release(root.cast::<u8>()) };
  }

  fn map_error(
    &self,
    source: crate::error::ClusterError,
  ) -> HeapError {
    HeapError::Arena {
      arena: self.name,
      source,
    }
  }
}
