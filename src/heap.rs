use std::{
  io::{self, Write},
  process,
  ptr::NonNull,
};

use tracing::{debug, error, trace, warn};

use crate::{
  bitmap::BitmapArena,
  cluster::ClusterProvider,
  config::{
    HEADER_SIZE, HeapConfig, LARGEST_MANAGED_ALLOCATION, LARGEST_MANAGED_INDEX, SIZE_CLASS_COUNT,
    SMALLEST_CLASS_SHIFT,
  },
  error::HeapError,
  header::{self, Owner},
  pool::{PoolArena, PoolHandle, PoolNode, push_front},
  stats::{ClassStats, HeapStats, VarSizeReport},
  varsize::VarSizeAllocator,
};

/// The allocator engine: size-class pools in front of an overflow heap.
///
/// Nothing is mapped until the first allocation. Dropping the heap unmaps
/// everything it ever mapped, live allocations included.
///
/// A `Heap` is single-threaded; wrap it in a
/// [`SharedHeap`](crate::SharedHeap) to share it.
pub struct Heap {
  config: HeapConfig,
  provider: ClusterProvider,
  bitmaps: BitmapArena,
  pools: PoolArena,
  classes: [Option<NonNull<PoolNode>>; SIZE_CLASS_COUNT],
  overflow: VarSizeAllocator,
  requests: u64,
}

// Safety: every pointer a heap holds refers to memory the heap mapped and
// owns; nothing is shared with other values.
unsafe impl Send for Heap {}

impl Default for Heap {
  fn default() -> Self {
    Self::new()
  }
}

impl Heap {
  pub fn new() -> Self {
    Self::build(HeapConfig::default())
  }

  pub fn with_config(config: HeapConfig) -> Result<Self, HeapError> {
    config.validate()?;
    Ok(Self::build(config))
  }

  fn build(config: HeapConfig) -> Self {
    let provider = ClusterProvider::new(&config);
    let cluster_size = provider.cluster_size();
    Self {
      config,
      provider,
      bitmaps: BitmapArena::new(cluster_size),
      pools: PoolArena::new(cluster_size),
      classes: [None; SIZE_CLASS_COUNT],
      overflow: VarSizeAllocator::new(cluster_size),
      requests: 0,
    }
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  /// Size class serving a header-inclusive request of `size` bytes, or
  /// `None` when it belongs to the overflow heap.
  ///
  /// Class `i` holds blocks of `32 << i` bytes.
  pub fn size_class(size: usize) -> Option<usize> {
    if size > LARGEST_MANAGED_ALLOCATION {
      return None;
    }

    let mut remaining = size.saturating_sub(1) >> SMALLEST_CLASS_SHIFT;
    let mut class = 0;
    while remaining != 0 && class < LARGEST_MANAGED_INDEX {
      class += 1;
      remaining >>= 1;
    }
    Some(class)
  }

  /// Allocates `size` bytes, reporting every failure to the caller.
  pub fn try_allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    self.requests += 1;

    let total = size.checked_add(HEADER_SIZE).ok_or(HeapError::SizeOverflow { size })?;

    let address = match Self::size_class(total) {
      Some(class) => self.allocate_fixed(class)?,
      None => {
        let block = self.overflow.allocate(&mut self.provider, total)?;
        unsafe { header::stamp(block, Owner::Overflow) }
      }
    };

    trace!(size, address = ?address, "allocated");
    Ok(address)
  }

  /// Allocates `size` bytes.
  ///
  /// Returns `None` when the overflow heap cannot grow. When the fixed-size
  /// pools cannot grow the process is aborted, since the size-class tables
  /// would be left half-built.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Option<NonNull<u8>> {
    match self.try_allocate(size) {
      Ok(address) => Some(address),
      Err(err) if err.is_fatal() => {
        error!(size, %err, "fixed-size pools exhausted");
        let _ = writeln!(io::stderr(), "clusterheap: {size}-byte request: {err}, aborting");
        process::abort();
      }
      Err(err) => {
        warn!(size, %err, "allocation failed");
        None
      }
    }
  }

  fn allocate_fixed(
    &mut self,
    class: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    loop {
      let mut current = self.classes[class];

      while let Some(mut node) = current {
        let pool = unsafe { node.as_mut() };
        if let Some(block) = pool.find_block(&mut self.provider)? {
          return Ok(unsafe { header::stamp(block, Owner::Pool(PoolHandle::new(node))) });
        }
        current = pool.next();
      }

      let size_exp = SMALLEST_CLASS_SHIFT + class as u32;
      let node = self.pools.create(&mut self.provider, &mut self.bitmaps, size_exp)?;
      self.classes[class] = Some(push_front(self.classes[class], node));
    }
  }

  /// Releases an address returned by this heap. Null is ignored.
  ///
  /// # Safety
  ///
  /// A non-null `address` must come from [`Heap::allocate`] or
  /// [`Heap::try_allocate`] on this heap. Releasing a fixed-size block twice
  /// is undefined behavior; a second release of an overflow block is
  /// ignored.
  pub unsafe fn release(
    &mut self,
    address: *mut u8,
  ) {
    let Some(address) = NonNull::new(address) else {
      return;
    };

    let (owner, block) = unsafe { header::read(address) };
    match owner {
      Owner::Overflow => unsafe { self.overflow.release(block) },
      Owner::Pool(pool) => unsafe { pool.as_ptr().as_mut().release_block(&mut self.provider, block) },
    }

    trace!(address = ?address, ?owner, "released");
  }

  /// Decodes the back-pointer of a live allocation.
  ///
  /// # Safety
  ///
  /// `address` must be a live allocation of this heap, and the returned
  /// handle must not outlive the heap.
  pub unsafe fn owner(
    &self,
    address: NonNull<u8>,
  ) -> Owner {
    unsafe { header::read(address).0 }
  }

  pub fn stats(&self) -> HeapStats {
    let mut classes = [ClassStats::default(); SIZE_CLASS_COUNT];

    for (index, class) in classes.iter_mut().enumerate() {
      class.block_size = 1 << (SMALLEST_CLASS_SHIFT as usize + index);

      let mut current = self.classes[index];
      while let Some(node) = current {
        let pool = unsafe { node.as_ref() };
        class.pools += 1;
        class.live_blocks += pool.live_blocks();
        current = pool.next();
      }
    }

    HeapStats {
      requests: self.requests,
      classes,
      arena_clusters: self.bitmaps.clusters() + self.pools.clusters(),
      provider: self.provider.stats(),
    }
  }

  pub fn var_size_report(&self) -> VarSizeReport {
    self.overflow.report()
  }

  /// Writes request and per-class counts.
  pub fn print_counts(
    &self,
    out: &mut impl io::Write,
  ) -> io::Result<()> {
    writeln!(out, "{}", self.stats())
  }

  /// Writes both overflow lists and their totals.
  pub fn print_var_size_list(
    &self,
    out: &mut impl io::Write,
  ) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "{}", self.var_size_report())
  }

  /// Unmaps everything: pools, arenas and overflow slabs. The heap starts
  /// over from nothing on the next allocation.
  ///
  /// # Safety
  ///
  /// Every address handed out so far becomes dangling.
  pub unsafe fn release_all(&mut self) {
    for head in self.classes.iter_mut() {
      let head = head.take();
      unsafe { self.pools.destroy_chain(&mut self.provider, &mut self.bitmaps, head) };
    }

    unsafe {
      self.overflow.release_all(&mut self.provider);
      self.pools.release_all(&mut self.provider);
      self.bitmaps.release_all(&mut self.provider);
    }

    debug!(requests = self.requests, "heap released");
  }
}

impl Drop for Heap {
  fn drop(&mut self) {
    unsafe { self.release_all() };
  }
}
