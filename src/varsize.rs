//! First-fit, coalescing allocator for requests too big for any size class.
//!
//! ```text
//!   Slab from the cluster provider, after two allocations:
//!
//!   ┌──────────────────────────────────────┬────────────┬────────────┐
//!   │ free block (head part, shrinks)      │ used block │ used block │
//!   └──────────────────────────────────────┴────────────┴────────────┘
//!   ▲                                       ▲            ▲
//!   free list                               used list ──►│
//! ```
//!
//! Requests are carved off the tail of the first free block big enough.
//! Both lists are kept in address order so that a release can merge with
//! its neighbours in one pass.

use std::{mem, ptr::NonNull};

use tracing::{debug, trace};

use crate::{
  align::checked_align_to,
  block::VarBlock,
  cluster::{ClusterProvider, Slab},
  config::OVERFLOW_ALIGNMENT,
  error::{ClusterError, HeapError},
  stats::{BlockInfo, VarSizeReport},
};

type Link = Option<NonNull<VarBlock>>;

#[repr(C)]
struct LedgerPage {
  next: Option<NonNull<LedgerPage>>,
  len: usize,
}

/// Record of every slab mapped for the overflow heap, kept in clusters of
/// its own so teardown can unmap slabs whose blocks have since merged.
struct SlabLedger {
  head: Option<NonNull<LedgerPage>>,
  per_page: usize,
  slabs: usize,
  bytes: usize,
}

impl SlabLedger {
  fn new(cluster_size: usize) -> Self {
    Self {
      head: None,
      per_page: (cluster_size - mem::size_of::<LedgerPage>()) / mem::size_of::<Slab>(),
      slabs: 0,
      bytes: 0,
    }
  }

  fn entries(page: NonNull<LedgerPage>) -> NonNull<Slab> {
    unsafe { page.add(1).cast::<Slab>() }
  }

  /// Makes sure the next `push` has room.
  fn reserve(
    &mut self,
    provider: &mut ClusterProvider,
  ) -> Result<(), ClusterError> {
    if let Some(head) = self.head {
      if unsafe { head.as_ref().len } < self.per_page {
        return Ok(());
      }
    }

    let page = provider.request()?.cast::<LedgerPage>();
    unsafe {
      page.write(LedgerPage {
        next: self.head,
        len: 0,
      })
    };
    self.head = Some(page);
    Ok(())
  }

  fn push(
    &mut self,
    slab: Slab,
  ) {
    let Some(mut head) = self.head else {
      debug_assert!(false, "push without reserve");
      return;
    };
    let page = unsafe { head.as_mut() };
    debug_assert!(page.len < self.per_page);

    unsafe { Self::entries(head).add(page.len).write(slab) };
    page.len += 1;
    self.slabs += 1;
    self.bytes += slab.len;
  }

  /// # Safety
  ///
  /// Nothing inside any recorded slab may be used afterwards.
  unsafe fn release_all(
    &mut self,
    provider: &mut ClusterProvider,
  ) {
    let mut current = self.head.take();

    while let Some(page) = current {
      let (next, len) = unsafe { (page.as_ref().next, page.as_ref().len) };
      for index in 0..len {
        let slab = unsafe { Self::entries(page).add(index).read() };
        unsafe { provider.release_slab(slab) };
      }
      unsafe { provider.release(page.cast::<u8>()) };
      current = next;
    }

    self.slabs = 0;
    self.bytes = 0;
  }
}

/// The overflow heap: address-ordered free and used lists over slabs.
pub(crate) struct VarSizeAllocator {
  free: Link,
  used: Link,
  ledger: SlabLedger,
}

impl VarSizeAllocator {
  pub fn new(cluster_size: usize) -> Self {
    Self {
      free: None,
      used: None,
      ledger: SlabLedger::new(cluster_size),
    }
  }

  /// Block size needed for `size` data bytes: header added, rounded up to
  /// the overflow alignment.
  pub fn request_size(size: usize) -> Option<usize> {
    size
      .checked_add(VarBlock::HEADER_SIZE)
      .and_then(|size| checked_align_to(size, OVERFLOW_ALIGNMENT))
  }

  /// Returns the address of `size` usable bytes, growing the heap by a new
  /// slab when no free block fits.
  pub fn allocate(
    &mut self,
    provider: &mut ClusterProvider,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    let request = Self::request_size(size).ok_or(HeapError::SizeOverflow { size })?;

    let (prev, block) = loop {
      if let Some(fit) = self.find_free_block(request) {
        break fit;
      }
      self
        .grow(provider, request)
        .map_err(|source| HeapError::OverflowSlab { size, source })?;
    };

    let carved = unsafe { self.carve(prev, block, request) };
    insert_sorted(&mut self.used, carved);

    let data = VarBlock::data(carved);
    trace!(block = ?carved, request, "overflow block allocated");
    Ok(data)
  }

  /// Gives back the block whose data starts at `data`. Addresses that are
  /// not on the used list are ignored.
  ///
  /// # Safety
  ///
  /// `data` must point at least a block header past the start of a mapping.
  pub unsafe fn release(
    &mut self,
    data: NonNull<u8>,
  ) {
    let block = unsafe { VarBlock::from_data(data) };

    if !self.unlink_used(block) {
      debug!(block = ?block, "release of a block not held by the overflow heap");
      return;
    }

    trace!(block = ?block, size = unsafe { block.as_ref().size }, "overflow block released");
    self.insert_free(block);
  }

  /// First free block of at least `request` bytes, with its list
  /// predecessor.
  fn find_free_block(
    &self,
    request: usize,
  ) -> Option<(Link, NonNull<VarBlock>)> {
    let mut prev = None;
    let mut current = self.free;

    while let Some(block) = current {
      let header = unsafe { block.as_ref() };
      if header.size >= request {
        return Some((prev, block));
      }
      prev = current;
      current = header.next;
    }

    None
  }

  /// Takes `request` bytes out of the free block `block`: the whole block
  /// on an exact fit, its tail otherwise.
  unsafe fn carve(
    &mut self,
    prev: Link,
    mut block: NonNull<VarBlock>,
    request: usize,
  ) -> NonNull<VarBlock> {
    let header = unsafe { block.as_mut() };

    if header.size == request {
      match prev {
        Some(mut prev) => unsafe { prev.as_mut().next = header.next },
        None => self.free = header.next,
      }
      header.next = None;
      return block;
    }

    header.size -= request;
    unsafe { VarBlock::init(block.cast::<u8>().add(header.size), request) }
  }

  fn unlink_used(
    &mut self,
    block: NonNull<VarBlock>,
  ) -> bool {
    let mut prev: Link = None;
    let mut current = self.used;

    while let Some(mut candidate) = current {
      if VarBlock::addr(candidate) > VarBlock::addr(block) {
        return false;
      }

      let next = unsafe { candidate.as_ref().next };
      if candidate == block {
        match prev {
          Some(mut prev) => unsafe { prev.as_mut().next = next },
          None => self.used = next,
        }
        unsafe { candidate.as_mut().next = None };
        return true;
      }

      prev = current;
      current = next;
    }

    false
  }

  /// Puts `block` on the free list and merges it with the blocks directly
  /// after and before it, one hop each way.
  fn insert_free(
    &mut self,
    mut block: NonNull<VarBlock>,
  ) {
    let prev = insert_sorted(&mut self.free, block);

    unsafe {
      let header = block.as_mut();
      if let Some(next) = header.next {
        if VarBlock::end(block) == VarBlock::addr(next) {
          header.size += next.as_ref().size;
          header.next = next.as_ref().next;
        }
      }
    }

    if let Some(mut prev) = prev {
      if VarBlock::end(prev) == VarBlock::addr(block) {
        unsafe {
          let header = prev.as_mut();
          header.size += block.as_ref().size;
          header.next = block.as_ref().next;
        }
      }
    }
  }

  fn grow(
    &mut self,
    provider: &mut ClusterProvider,
    request: usize,
  ) -> Result<(), ClusterError> {
    self.ledger.reserve(provider)?;
    let slab = provider.big_request(request)?;
    self.ledger.push(slab);

    debug!(base = ?slab.base, len = slab.len, request, "overflow heap grew");
    let block = unsafe { VarBlock::init(slab.base, slab.len) };
    self.insert_free(block);
    Ok(())
  }

  /// Snapshot of both lists.
  pub fn report(&self) -> VarSizeReport {
    VarSizeReport {
      used: collect(self.used),
      free: collect(self.free),
      slabs: self.ledger.slabs,
      slab_bytes: self.ledger.bytes,
    }
  }

  /// Unmaps every slab and forgets all blocks.
  ///
  /// # Safety
  ///
  /// No overflow allocation may be used afterwards.
  pub unsafe fn release_all(
    &mut self,
    provider: &mut ClusterProvider,
  ) {
    self.free = None;
    self.used = None;
    unsafe { self.ledger.release_all(provider) };
  }
}

/// Links `block` into the address-ordered list at `head` and returns its
/// new predecessor.
fn insert_sorted(
  head: &mut Link,
  mut block: NonNull<VarBlock>,
) -> Link {
  let mut prev: Link = None;
  let mut current = *head;

  while let Some(candidate) = current {
    if VarBlock::addr(candidate) > VarBlock::addr(block) {
      break;
    }
    prev = current;
    current = unsafe { candidate.as_ref().next };
  }

  unsafe { block.as_mut().next = current };
  match prev {
    Some(mut prev) => unsafe { prev.as_mut().next = Some(block) },
    None => *head = Some(block),
  }
  prev
}

fn collect(head: Link) -> Vec<BlockInfo> {
  let mut blocks = Vec::new();
  let mut current = head;

  while let Some(block) = current {
    let header = unsafe { block.as_ref() };
    blocks.push(BlockInfo {
      address: VarBlock::addr(block),
      size: header.size,
    });
    current = header.next;
  }

  blocks
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::HeapConfig;

  struct Fixture {
    provider: ClusterProvider,
    heap: VarSizeAllocator,
  }

  impl Fixture {
    fn new() -> Self {
      Self::with_config(HeapConfig::default())
    }

    fn with_config(config: HeapConfig) -> Self {
      let provider = ClusterProvider::new(&config);
      let heap = VarSizeAllocator::new(provider.cluster_size());
      Self { provider, heap }
    }

    fn allocate(
      &mut self,
      size: usize,
    ) -> NonNull<u8> {
      self.heap.allocate(&mut self.provider, size).unwrap()
    }

    fn release(
      &mut self,
      data: NonNull<u8>,
    ) {
      unsafe { self.heap.release(data) };
    }
  }

  impl Drop for Fixture {
    fn drop(&mut self) {
      unsafe { self.heap.release_all(&mut self.provider) };
      if !std::thread::panicking() {
        assert_eq!(self.provider.stats().mapped_bytes, 0);
      }
    }
  }

  #[test]
  fn test_request_size() {
    assert_eq!(VarSizeAllocator::request_size(20008), Some(20032));
    assert_eq!(VarSizeAllocator::request_size(16), Some(32));
    assert_eq!(VarSizeAllocator::request_size(17), Some(64));
    assert_eq!(VarSizeAllocator::request_size(usize::MAX - 8), None);
  }

  #[test]
  fn test_allocate_then_release_restores_one_slab() {
    let mut fx = Fixture::new();

    let data = fx.allocate(20008);
    let report = fx.heap.report();
    assert_eq!(report.used.len(), 1);
    assert_eq!(report.used[0].size, 20032);
    assert_eq!(report.free.len(), 1);
    assert_eq!(report.free[0].size, 131072 - 20032);
    assert_eq!(report.slab_bytes, 131072);

    // tail carve: the block ends where the slab ends
    let used = report.used[0];
    assert_eq!(used.address + used.size, report.free[0].address + 131072);
    assert_eq!(data.as_ptr() as usize, used.address + VarBlock::HEADER_SIZE);

    fx.release(data);
    let report = fx.heap.report();
    assert_eq!(report.used_count(), 0);
    assert_eq!(report.free_count(), 1);
    assert_eq!(report.free[0].size, 131072);
  }

  #[test]
  fn test_coalesce_neighbours_in_either_order() {
    for reversed in [false, true] {
      let mut fx = Fixture::new();

      let a = fx.allocate(1000);
      let b = fx.allocate(1000);
      assert_eq!(a.as_ptr() as usize - b.as_ptr() as usize, 1024);

      let total = |fx: &Fixture| {
        let report = fx.heap.report();
        report.used_bytes() + report.free_bytes()
      };
      assert_eq!(total(&fx), 131072);

      let (first, second) = if reversed { (b, a) } else { (a, b) };
      fx.release(first);
      assert_eq!(total(&fx), 131072);
      fx.release(second);
      assert_eq!(total(&fx), 131072);

      let report = fx.heap.report();
      assert_eq!(report.used_count(), 0);
      assert_eq!(report.free_count(), 1);
      assert_eq!(report.free_bytes(), 131072);
    }
  }

  #[test]
  fn test_merge_is_one_hop_per_direction() {
    let mut fx = Fixture::new();

    let a = fx.allocate(1000);
    let b = fx.allocate(1000);
    let c = fx.allocate(1000);

    // [head][c][b][a]: free a and c first, they are not adjacent
    fx.release(a);
    fx.release(c);
    assert_eq!(fx.heap.report().free_count(), 2);

    // b bridges both sides
    fx.release(b);
    let report = fx.heap.report();
    assert_eq!(report.free_count(), 1);
    assert_eq!(report.free[0].size, 131072);
  }

  #[test]
  fn test_exact_fit_takes_whole_block() {
    let mut fx = Fixture::new();

    let tail = fx.allocate(1000);
    let rest = 131072 - 1024;
    let whole = fx.allocate(rest - VarBlock::HEADER_SIZE);

    let report = fx.heap.report();
    assert_eq!(report.free_count(), 0);
    assert_eq!(report.used_count(), 2);
    assert_eq!(report.used[0].size, rest);
    assert_eq!(whole.as_ptr() as usize, report.used[0].address + VarBlock::HEADER_SIZE);

    fx.release(tail);
    fx.release(whole);
    let report = fx.heap.report();
    assert_eq!(report.free_count(), 1);
    assert_eq!(report.free_bytes(), 131072);
  }

  #[test]
  fn test_first_fit_prefers_lower_address() {
    let mut fx = Fixture::new();

    let _a = fx.allocate(4000);
    let b = fx.allocate(1000);
    let _c = fx.allocate(4000);
    let d = fx.allocate(1000);
    let _e = fx.allocate(4000);

    // free holes at d (lower) and b (higher), plus the head block
    fx.release(b);
    fx.release(d);
    assert_eq!(fx.heap.report().free_count(), 3);

    // head block comes first in address order and fits
    let next = fx.allocate(1000);
    let head = fx.heap.report().free[0];
    assert_eq!(next.as_ptr() as usize, head.address + head.size + VarBlock::HEADER_SIZE);
  }

  #[test]
  fn test_release_of_unknown_block_is_ignored() {
    let mut fx = Fixture::new();

    let data = fx.allocate(5000);
    let before = fx.heap.report();

    fx.release(data);
    let after_first = fx.heap.report();
    fx.release(data);
    assert_eq!(fx.heap.report(), after_first);

    let other = fx.allocate(5000);
    let inside = unsafe { other.add(64) };
    fx.release(inside);
    assert_eq!(fx.heap.report().used_count(), 1);
    assert_ne!(before, after_first);
  }

  #[test]
  fn test_large_request_gets_its_own_slab() {
    let mut fx = Fixture::new();

    let small = fx.allocate(20000);
    let big = fx.allocate(300_000);

    let report = fx.heap.report();
    assert_eq!(report.slabs, 2);
    // 300_000 + header rounds to 5 clusters, doubled
    assert_eq!(report.slab_bytes, 131072 + 10 * 65536);

    fx.release(big);
    fx.release(small);
    assert_eq!(fx.heap.report().used_count(), 0);
  }

  #[test]
  fn test_slab_exhaustion_is_an_error() {
    // one ledger page and one slab
    let mut fx = Fixture::with_config(HeapConfig::new().with_mapping_limit(3 * 65536));

    let data = fx.allocate(20000);
    let err = fx.heap.allocate(&mut fx.provider, 200_000).unwrap_err();
    assert!(matches!(err, HeapError::OverflowSlab { size: 200_000, .. }));
    assert!(!err.is_fatal());

    // still usable from the existing slab
    let more = fx.allocate(20000);
    fx.release(more);
    fx.release(data);
  }
}
