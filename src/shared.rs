use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::{
  config::HeapConfig,
  error::HeapError,
  heap::Heap,
  stats::{HeapStats, VarSizeReport},
};

/// A [`Heap`] behind a lock, for use from several threads.
///
/// Every call takes the lock for its whole duration; there is no per-thread
/// caching.
#[derive(Default)]
pub struct SharedHeap {
  inner: Mutex<Heap>,
}

impl SharedHeap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_config(config: HeapConfig) -> Result<Self, HeapError> {
    Ok(Self {
      inner: Mutex::new(Heap::with_config(config)?),
    })
  }

  pub fn allocate(
    &self,
    size: usize,
  ) -> Option<NonNull<u8>> {
    self.inner.lock().allocate(size)
  }

  pub fn try_allocate(
    &self,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    self.inner.lock().try_allocate(size)
  }

  /// # Safety
  ///
  /// Same contract as [`Heap::release`].
  pub unsafe fn release(
    &self,
    address: *mut u8,
  ) {
    unsafe { self.inner.lock().release(address) }
  }

  pub fn stats(&self) -> HeapStats {
    self.inner.lock().stats()
  }

  pub fn var_size_report(&self) -> VarSizeReport {
    self.inner.lock().var_size_report()
  }

  /// Runs `f` with the heap locked.
  pub fn with<R>(
    &self,
    f: impl FnOnce(&mut Heap) -> R,
  ) -> R {
    f(&mut self.inner.lock())
  }

  pub fn into_inner(self) -> Heap {
    self.inner.into_inner()
  }
}
