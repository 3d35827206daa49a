//! Free/used bit vectors for fixed-size pools, packed into a shared arena.
//!
//! ```text
//!   Bitmap arena cluster (32-bit words):
//!
//!   ┌──────┬──────┬────────────┬──────┬──────┬──────┬─────┬──────────────
//!   │ bits │ full │ bit words  │  0   │  0   │ bits │ full│ bit words ...
//!   └──────┴──────┴────────────┴──────┴──────┴──────┴─────┴──────────────
//!   └──────── live bitmap ─────┘└ free run ┘└──────── live bitmap ───────
//! ```
//!
//! A live bitmap always starts with its (nonzero) bit count, so a scan can
//! hop from one bitmap to the next. A zero word is unclaimed space.

use std::{ptr, ptr::NonNull, slice};

use crate::{arena::ClusterDirectory, cluster::ClusterProvider, error::HeapError};

const HEADER_WORDS: usize = 2;
const WORD_BITS: usize = 32;
const HIGH_ORDER_BIT: u32 = 0x8000_0000;

/// Handle to a bitmap living in a [`BitmapArena`].
///
/// Valid until the arena destroys it or is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Bitmap(NonNull<u32>);

fn words_for(bits: usize) -> usize {
  bits.div_ceil(WORD_BITS).max(1)
}

/// Words occupied by a bitmap of `bits` bits, header included.
fn footprint(bits: usize) -> usize {
  HEADER_WORDS + words_for(bits)
}

fn locate(index: usize) -> (usize, u32) {
  (index >> 5, HIGH_ORDER_BIT >> (index & 0x1f))
}

impl Bitmap {
  fn header(&self) -> *mut u32 {
    self.0.as_ptr()
  }

  fn word(
    &self,
    index: usize,
  ) -> *mut u32 {
    debug_assert!(index < words_for(self.bit_count()));
    // Safety: the handle points at a live bitmap whose bit words follow its
    // two header words inside one mapped arena cluster.
    unsafe { self.header().add(HEADER_WORDS + index) }
  }

  fn words(&self) -> &[u32] {
    unsafe { slice::from_raw_parts(self.word(0), words_for(self.bit_count())) }
  }

  pub fn bit_count(&self) -> usize {
    unsafe { *self.header() as usize }
  }

  /// Whether the last scan found every bit set.
  pub fn is_full(&self) -> bool {
    unsafe { *self.header().add(1) != 0 }
  }

  fn set_full(
    &self,
    full: bool,
  ) {
    unsafe { *self.header().add(1) = full as u32 };
  }

  /// Index of the lowest clear bit, most significant bit first in each word.
  ///
  /// Once a scan comes up empty the bitmap is flagged full and later calls
  /// return `None` without scanning until a bit is cleared.
  pub fn find_free_block(&self) -> Option<usize> {
    if self.is_full() {
      return None;
    }

    let bits = self.bit_count();
    if let Some(index) = scan_words(self.words(), bits) {
      return Some(index);
    }

    self.set_full(true);
    None
  }

  pub fn mark(
    &self,
    index: usize,
  ) {
    debug_assert!(index < self.bit_count());
    let (word, mask) = locate(index);
    unsafe { *self.word(word) |= mask };
  }

  /// Clears a bit. The bitmap is no longer full afterwards.
  pub fn unmark(
    &self,
    index: usize,
  ) {
    debug_assert!(index < self.bit_count());
    let (word, mask) = locate(index);
    unsafe { *self.word(word) &= !mask };
    self.set_full(false);
  }

  pub fn is_marked(
    &self,
    index: usize,
  ) -> bool {
    let (word, mask) = locate(index);
    self.words()[word] & mask != 0
  }

  /// Clears every bit, leaving the bit count alone.
  pub fn clear(&self) {
    unsafe { ptr::write_bytes(self.word(0), 0, words_for(self.bit_count())) };
  }
}

fn scan_words(
  words: &[u32],
  bits: usize,
) -> Option<usize> {
  for (position, &word) in words.iter().enumerate() {
    if word == u32::MAX {
      continue;
    }

    let index = position * WORD_BITS + word.leading_ones() as usize;
    return (index < bits).then_some(index);
  }
  None
}

/// Start of the first run of `needed` zero words, hopping over live bitmaps.
fn find_zero_run(
  words: &[u32],
  needed: usize,
) -> Option<usize> {
  let mut index = 0;
  let mut run_start = 0;
  let mut run = 0;

  while index < words.len() {
    let word = words[index];

    if word != 0 {
      run = 0;
      index += footprint(word as usize);
      continue;
    }

    if run == 0 {
      if words.len() - index < needed {
        return None;
      }
      run_start = index;
    }

    run += 1;
    index += 1;

    if run == needed {
      return Some(run_start);
    }
  }

  None
}

/// Arena holding every bitmap of a heap.
pub(crate) struct BitmapArena {
  directory: ClusterDirectory,
  cluster_size: usize,
}

impl BitmapArena {
  pub fn new(cluster_size: usize) -> Self {
    Self {
      directory: ClusterDirectory::new("bitmap", cluster_size),
      cluster_size,
    }
  }

  /// Carves out a cleared bitmap with one bit per `block_size` block of a
  /// cluster.
  pub fn create(
    &mut self,
    provider: &mut ClusterProvider,
    block_size: usize,
  ) -> Result<Bitmap, HeapError> {
    let bits = (self.cluster_size / block_size).max(1);
    let Ok(count) = u32::try_from(bits) else {
      return Err(HeapError::InvalidConfig(format!(
        "{bits} blocks per cluster do not fit a bitmap header"
      )));
    };
    let needed = footprint(bits);
    let words_per_cluster = self.cluster_size / size_of::<u32>();

    for index in 0..self.directory.capacity() {
      let cluster = self.directory.cluster(provider, index)?;
      // Safety: arena clusters hold nothing but bitmap words.
      let words = unsafe { slice::from_raw_parts_mut(cluster.cast::<u32>().as_ptr(), words_per_cluster) };

      if let Some(start) = find_zero_run(words, needed) {
        words[start] = count;
        words[start + 1] = 0;
        return Ok(Bitmap(NonNull::from(&mut words[start])));
      }
    }

    Err(HeapError::ArenaFull {
      arena: self.directory.name(),
    })
  }

  /// Returns a bitmap's words to the arena as a zero run.
  pub fn destroy(
    &mut self,
    bitmap: Bitmap,
  ) {
    bitmap.clear();
    bitmap.set_full(false);
    unsafe { *bitmap.header() = 0 };
  }

  pub fn clusters(&self) -> usize {
    self.directory.mapped().count()
  }

  /// # Safety
  ///
  /// Every bitmap handed out by this arena becomes dangling.
  pub unsafe fn release_all(
    &mut self,
    provider: &mut ClusterProvider,
  ) {
    unsafe { self.directory.release_all(provider) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::HeapConfig;

  fn setup() -> (ClusterProvider, BitmapArena) {
    let provider = ClusterProvider::new(&HeapConfig::default());
    let arena = BitmapArena::new(provider.cluster_size());
    (provider, arena)
  }

  #[test]
  fn test_create_sizes_bitmap_from_block_size() {
    let (mut provider, mut arena) = setup();

    let small_blocks = arena.create(&mut provider, 32).unwrap();
    assert_eq!(small_blocks.bit_count(), 2048);
    assert!(!small_blocks.is_full());

    let big_blocks = arena.create(&mut provider, 16384).unwrap();
    assert_eq!(big_blocks.bit_count(), 4);

    let huge_blocks = arena.create(&mut provider, 1 << 20).unwrap();
    assert_eq!(huge_blocks.bit_count(), 1);

    // packed back to back
    let gap = big_blocks.0.as_ptr() as usize - small_blocks.0.as_ptr() as usize;
    assert_eq!(gap, footprint(2048) * 4);

    unsafe { arena.release_all(&mut provider) };
    assert_eq!(provider.stats().live_clusters, 0);
  }

  #[cfg(target_pointer_width = "64")]
  #[test]
  fn test_bit_count_past_u32_is_rejected() {
    let mut provider = ClusterProvider::new(&HeapConfig::default());
    let mut arena = BitmapArena::new(1 << 40);

    let err = arena.create(&mut provider, 32).unwrap_err();
    assert!(matches!(err, HeapError::InvalidConfig(_)));
    assert_eq!(provider.stats().mapped_bytes, 0);
  }

  #[test]
  fn test_find_mark_unmark() {
    let (mut provider, mut arena) = setup();
    let bitmap = arena.create(&mut provider, 64).unwrap();

    assert_eq!(bitmap.find_free_block(), Some(0));
    bitmap.mark(0);
    bitmap.mark(1);
    assert_eq!(bitmap.find_free_block(), Some(2));

    // word 0 full, continue in word 1
    for index in 2..32 {
      bitmap.mark(index);
    }
    assert_eq!(bitmap.find_free_block(), Some(32));

    bitmap.unmark(5);
    assert!(!bitmap.is_marked(5));
    assert!(bitmap.is_marked(6));
    assert_eq!(bitmap.find_free_block(), Some(5));

    // most significant bit is index 0
    assert_eq!(bitmap.words()[0], !(HIGH_ORDER_BIT >> 5));

    bitmap.clear();
    assert_eq!(bitmap.find_free_block(), Some(0));
    assert_eq!(bitmap.bit_count(), 1024);

    unsafe { arena.release_all(&mut provider) };
  }

  #[test]
  fn test_exhaustion_short_circuits() {
    let (mut provider, mut arena) = setup();
    let bitmap = arena.create(&mut provider, 128).unwrap();
    let bits = bitmap.bit_count();

    for index in 0..bits {
      bitmap.mark(index);
    }

    assert_eq!(bitmap.find_free_block(), None);
    assert!(bitmap.is_full());

    // a stale clear bit behind the flag is not seen until unmark resets it
    let (word, mask) = locate(17);
    unsafe { *bitmap.word(word) &= !mask };
    assert_eq!(bitmap.find_free_block(), None);

    bitmap.unmark(200);
    assert!(!bitmap.is_full());
    assert_eq!(bitmap.find_free_block(), Some(17));

    unsafe { arena.release_all(&mut provider) };
  }

  #[test]
  fn test_small_bitmap_ignores_padding_bits() {
    let (mut provider, mut arena) = setup();
    let bitmap = arena.create(&mut provider, 16384).unwrap();

    for expected in 0..4 {
      let index = bitmap.find_free_block().unwrap();
      assert_eq!(index, expected);
      bitmap.mark(index);
    }

    assert_eq!(bitmap.find_free_block(), None);
    assert!(bitmap.is_full());

    unsafe { arena.release_all(&mut provider) };
  }

  #[test]
  fn test_destroyed_bitmap_space_is_reused() {
    let (mut provider, mut arena) = setup();

    let first = arena.create(&mut provider, 32).unwrap();
    let middle = arena.create(&mut provider, 32).unwrap();
    let last = arena.create(&mut provider, 32).unwrap();

    middle.mark(3);
    arena.destroy(middle);

    let reused = arena.create(&mut provider, 32).unwrap();
    assert_eq!(reused, middle);
    assert_eq!(reused.find_free_block(), Some(0));

    // a smaller bitmap fits in the hole of a destroyed one as well
    arena.destroy(reused);
    let smaller = arena.create(&mut provider, 4096).unwrap();
    assert_eq!(smaller, middle);
    let after = arena.create(&mut provider, 4096).unwrap();
    assert!(after.0 > smaller.0 && after.0 < last.0);

    assert_eq!(first.bit_count(), 2048);
    assert_eq!(last.bit_count(), 2048);

    unsafe { arena.release_all(&mut provider) };
  }

  #[test]
  fn test_arena_grows_into_new_cluster() {
    let (mut provider, mut arena) = setup();
    let per_cluster = (65536 / 4) / footprint(2048);

    let mut bitmaps = Vec::new();
    for _ in 0..per_cluster {
      bitmaps.push(arena.create(&mut provider, 32).unwrap());
    }
    assert_eq!(arena.clusters(), 1);

    let spill = arena.create(&mut provider, 32).unwrap();
    assert_eq!(arena.clusters(), 2);
    assert!(!bitmaps.contains(&spill));

    unsafe { arena.release_all(&mut provider) };
    assert_eq!(provider.stats().live_clusters, 0);
  }

  #[test]
  fn test_find_zero_run_skips_live_bitmaps() {
    // bitmap of 40 bits occupies 2 + 2 words
    let words = [40, 0, 0, 0, 0, 0, 0, 7, 0, 0];
    assert_eq!(find_zero_run(&words, 2), Some(4));
    assert_eq!(find_zero_run(&words, 3), Some(4));
    assert_eq!(find_zero_run(&words, 4), None);
  }
}
