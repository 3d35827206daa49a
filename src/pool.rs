//! Fixed-size pools: one cluster of equal blocks tracked by one bitmap.
//!
//! ```text
//!   Size class chain (all pools hand out 2^size_exp byte blocks):
//!
//!   class head ──► ┌──────────┐ next ┌──────────┐ next ┌──────────┐
//!                  │ PoolNode │ ───► │ PoolNode │ ───► │ PoolNode │
//!                  └────┬─────┘ ◄─── └────┬─────┘ ◄─── └────┬─────┘
//!                       │       prev      │       prev      │
//!                  bitmap + cluster  bitmap + cluster  bitmap + (none)
//! ```
//!
//! Pool nodes live in their own arena. A pool only holds a cluster while it
//! has live blocks.

use std::{mem, ptr, ptr::NonNull};

use tracing::debug;

use crate::{
  arena::ClusterDirectory,
  bitmap::{Bitmap, BitmapArena},
  cluster::ClusterProvider,
  error::HeapError,
};

/// Bookkeeping for one cluster's worth of equal-size blocks.
///
/// An all-zero node is a free arena slot; `size_exp` is never zero for a
/// pool in use.
#[repr(C)]
pub(crate) struct PoolNode {
  size_exp: usize,
  bitmap: Option<Bitmap>,
  cluster: Option<NonNull<u8>>,
  prev: Option<NonNull<PoolNode>>,
  next: Option<NonNull<PoolNode>>,
  live: usize,
}

impl PoolNode {
  pub fn block_size(&self) -> usize {
    1 << self.size_exp
  }

  pub fn live_blocks(&self) -> usize {
    self.live
  }

  pub fn cluster_base(&self) -> Option<NonNull<u8>> {
    self.cluster
  }

  pub fn next(&self) -> Option<NonNull<PoolNode>> {
    self.next
  }

  /// Hands out the lowest free block, mapping the cluster on first use.
  ///
  /// `Ok(None)` means this pool is full and the caller should move on to a
  /// sibling.
  pub fn find_block(
    &mut self,
    provider: &mut ClusterProvider,
  ) -> Result<Option<NonNull<u8>>, HeapError> {
    let Some(bitmap) = self.bitmap else {
      return Ok(None);
    };
    let Some(index) = bitmap.find_free_block() else {
      return Ok(None);
    };

    let cluster = match self.cluster {
      Some(cluster) => cluster,
      None => {
        let block_size = self.block_size();
        let cluster = provider
          .request()
          .map_err(|source| HeapError::PoolCluster { block_size, source })?;
        debug!(block_size, cluster = ?cluster, "pool cluster mapped");
        *self.cluster.insert(cluster)
      }
    };

    bitmap.mark(index);
    self.live += 1;

    // Safety: `index` is below the bitmap's bit count, so the block lies
    // inside the cluster.
    Ok(Some(unsafe { cluster.add(index << self.size_exp) }))
  }

  /// Gives a block back. The cluster is unmapped when the last live block
  /// goes; the block's contents are never touched.
  ///
  /// # Safety
  ///
  /// `block` must have been returned by [`PoolNode::find_block`] on this
  /// pool and not released since.
  pub unsafe fn release_block(
    &mut self,
    provider: &mut ClusterProvider,
    block: NonNull<u8>,
  ) {
    let (Some(cluster), Some(bitmap)) = (self.cluster, self.bitmap) else {
      debug_assert!(false, "release into a pool without a cluster");
      return;
    };

    let index = (block.as_ptr() as usize - cluster.as_ptr() as usize) >> self.size_exp;
    debug_assert!(bitmap.is_marked(index), "block released twice");
    bitmap.unmark(index);
    self.live -= 1;

    if self.live == 0 {
      unsafe { provider.release(cluster) };
      self.cluster = None;
      debug!(block_size = self.block_size(), "pool cluster released");
    }
  }
}

/// Opaque reference to the pool owning a fixed-size allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHandle(NonNull<PoolNode>);

impl PoolHandle {
  pub(crate) fn new(node: NonNull<PoolNode>) -> Self {
    Self(node)
  }

  pub(crate) fn as_ptr(self) -> NonNull<PoolNode> {
    self.0
  }

  fn node(&self) -> &PoolNode {
    // Safety: handles are only built from pools of a live heap.
    unsafe { self.0.as_ref() }
  }

  /// Size of every block in the pool, back-pointer header included.
  pub fn block_size(&self) -> usize {
    self.node().block_size()
  }

  pub fn live_blocks(&self) -> usize {
    self.node().live_blocks()
  }

  /// Start of the cluster the pool carves blocks from, if one is mapped.
  pub fn cluster_base(&self) -> Option<NonNull<u8>> {
    self.node().cluster_base()
  }
}

/// Arena of [`PoolNode`] slots.
pub(crate) struct PoolArena {
  directory: ClusterDirectory,
  nodes_per_cluster: usize,
}

impl PoolArena {
  pub fn new(cluster_size: usize) -> Self {
    Self {
      directory: ClusterDirectory::new("pool", cluster_size),
      nodes_per_cluster: cluster_size / mem::size_of::<PoolNode>(),
    }
  }

  /// Takes the first free slot and sets it up as an empty pool of
  /// `2^size_exp` byte blocks.
  pub fn create(
    &mut self,
    provider: &mut ClusterProvider,
    bitmaps: &mut BitmapArena,
    size_exp: u32,
  ) -> Result<NonNull<PoolNode>, HeapError> {
    debug_assert!(size_exp > 0);
    let slot = self.free_slot(provider)?;
    let bitmap = bitmaps.create(provider, 1 << size_exp)?;

    // Safety: `slot` is an unused, properly aligned node in an arena cluster.
    unsafe {
      ptr::write(
        slot.as_ptr(),
        PoolNode {
          size_exp: size_exp as usize,
          bitmap: Some(bitmap),
          cluster: None,
          prev: None,
          next: None,
          live: 0,
        },
      );
    }

    debug!(block_size = 1usize << size_exp, node = ?slot, "pool created");
    Ok(slot)
  }

  fn free_slot(
    &mut self,
    provider: &mut ClusterProvider,
  ) -> Result<NonNull<PoolNode>, HeapError> {
    for index in 0..self.directory.capacity() {
      let nodes = self.directory.cluster(provider, index)?.cast::<PoolNode>();

      for offset in 0..self.nodes_per_cluster {
        // Safety: the arena cluster is an array of `nodes_per_cluster` nodes.
        let node = unsafe { nodes.add(offset) };
        if unsafe { node.as_ref().size_exp } == 0 {
          return Ok(node);
        }
      }
    }

    Err(HeapError::ArenaFull {
      arena: self.directory.name(),
    })
  }

  /// Destroys `head` and every pool after it, releasing their bitmaps and
  /// clusters and freeing their slots.
  ///
  /// # Safety
  ///
  /// No block of any pool in the chain may be used afterwards.
  pub unsafe fn destroy_chain(
    &mut self,
    provider: &mut ClusterProvider,
    bitmaps: &mut BitmapArena,
    head: Option<NonNull<PoolNode>>,
  ) {
    let mut current = head;

    while let Some(mut node) = current {
      let node = unsafe { node.as_mut() };
      current = node.next.take();

      if let Some(bitmap) = node.bitmap.take() {
        bitmaps.destroy(bitmap);
      }
      if let Some(cluster) = node.cluster.take() {
        unsafe { provider.release(cluster) };
      }
      node.prev = None;
      node.live = 0;
      node.size_exp = 0;
    }
  }

  pub fn clusters(&self) -> usize {
    self.directory.mapped().count()
  }

  /// # Safety
  ///
  /// Every pool node handed out by this arena becomes dangling.
  pub unsafe fn release_all(
    &mut self,
    provider: &mut ClusterProvider,
  ) {
    unsafe { self.directory.release_all(provider) };
  }
}

/// Links `node` in front of `head` and returns the new head.
pub(crate) fn push_front(
  head: Option<NonNull<PoolNode>>,
  mut node: NonNull<PoolNode>,
) -> NonNull<PoolNode> {
  unsafe {
    node.as_mut().next = head;
    node.as_mut().prev = None;
    if let Some(mut old) = head {
      debug_assert!(old.as_ref().prev.is_none());
      old.as_mut().prev = Some(node);
    }
  }
  node
}
