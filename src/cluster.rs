//! Source of raw memory: anonymous, zero-filled, page-aligned mappings.
//!
//! Clusters carry no header. Whoever requests one remembers it and hands it
//! back; slabs from [`ClusterProvider::big_request`] must be released with
//! the length they were granted.

use std::{io, ptr, ptr::NonNull};

use tracing::{trace, warn};

use crate::{
  align::checked_align_to,
  config::HeapConfig,
  error::ClusterError,
  stats::ProviderStats,
};

/// A multi-cluster mapping and the length actually granted for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slab {
  pub base: NonNull<u8>,
  pub len: usize,
}

pub(crate) struct ClusterProvider {
  cluster_size: usize,
  page_size: Option<usize>,
  mapping_limit: Option<usize>,
  mapped: usize,
  live_clusters: usize,
  live_slabs: usize,
}

impl ClusterProvider {
  pub fn new(config: &HeapConfig) -> Self {
    Self {
      cluster_size: config.cluster_size,
      page_size: None,
      mapping_limit: config.mapping_limit,
      mapped: 0,
      live_clusters: 0,
      live_slabs: 0,
    }
  }

  pub fn cluster_size(&self) -> usize {
    self.cluster_size
  }

  /// OS page size, queried on first use.
  pub fn page_size(&mut self) -> usize {
    *self.page_size.get_or_insert_with(os_page_size)
  }

  /// Maps one nominal-size cluster.
  pub fn request(&mut self) -> Result<NonNull<u8>, ClusterError> {
    let cluster = self.map(self.cluster_size)?;
    self.live_clusters += 1;
    Ok(cluster)
  }

  /// Maps a slab of at least `desired` bytes.
  ///
  /// The length is rounded up to whole clusters, doubled to leave headroom
  /// for the same slab to grow into, and rounded to whole pages.
  pub fn big_request(
    &mut self,
    desired: usize,
  ) -> Result<Slab, ClusterError> {
    let too_large = ClusterError::TooLarge { requested: desired };
    let page_size = self.page_size();

    let len = desired
      .div_ceil(self.cluster_size)
      .max(1)
      .checked_mul(self.cluster_size)
      .and_then(|len| len.checked_mul(2))
      .and_then(|len| checked_align_to(len, page_size))
      .ok_or(too_large)?;

    let base = self.map(len)?;
    self.live_slabs += 1;
    Ok(Slab { base, len })
  }

  /// Unmaps a nominal-size cluster.
  ///
  /// # Safety
  ///
  /// `cluster` must come from [`ClusterProvider::request`] on this provider
  /// and must not be used afterwards.
  pub unsafe fn release(
    &mut self,
    cluster: NonNull<u8>,
  ) {
    unsafe { self.unmap(cluster, self.cluster_size) };
    self.live_clusters -= 1;
  }

  /// Unmaps a slab with the length it was granted.
  ///
  /// # Safety
  ///
  /// `slab` must come from [`ClusterProvider::big_request`] on this provider
  /// and must not be used afterwards.
  pub unsafe fn release_slab(
    &mut self,
    slab: Slab,
  ) {
    unsafe { self.unmap(slab.base, slab.len) };
    self.live_slabs -= 1;
  }

  pub fn stats(&self) -> ProviderStats {
    ProviderStats {
      cluster_size: self.cluster_size,
      live_clusters: self.live_clusters,
      live_slabs: self.live_slabs,
      mapped_bytes: self.mapped,
    }
  }

  fn map(
    &mut self,
    len: usize,
  ) -> Result<NonNull<u8>, ClusterError> {
    if let Some(limit) = self.mapping_limit {
      if self.mapped.saturating_add(len) > limit {
        warn!(len, mapped = self.mapped, limit, "mapping limit reached");
        return Err(ClusterError::LimitExceeded {
          requested: len,
          mapped: self.mapped,
          limit,
        });
      }
    }

    // Safety: FFI call to mmap; no existing memory is touched.
    let address = unsafe {
      libc::mmap(
        ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
      )
    };

    if address == libc::MAP_FAILED {
      let source = io::Error::last_os_error();
      warn!(len, %source, "mmap failed");
      return Err(ClusterError::Map { len, source });
    }

    let Some(base) = NonNull::new(address.cast::<u8>()) else {
      return Err(ClusterError::Map {
        len,
        source: io::Error::other("mmap returned null"),
      });
    };

    self.mapped += len;
    trace!(address = ?base, len, "mapped");
    Ok(base)
  }

  unsafe fn unmap(
    &mut self,
    base: NonNull<u8>,
    len: usize,
  ) {
    // Safety: the caller guarantees `base..base + len` is one of our mappings.
    if unsafe { libc::munmap(base.as_ptr().cast::<libc::c_void>(), len) } == -1 {
      warn!(address = ?base, len, error = %io::Error::last_os_error(), "munmap failed");
      return;
    }
    self.mapped -= len;
    trace!(address = ?base, len, "unmapped");
  }
}

fn os_page_size() -> usize {
  // Safety: FFI call to sysconf.
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size > 0 { size as usize } else { 4096 }
}
