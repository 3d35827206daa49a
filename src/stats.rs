//! Diagnostic snapshots. The text layout is for people, not for parsing.

use std::fmt;

use crate::config::SIZE_CLASS_COUNT;

/// Mapping counters of the cluster provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStats {
  pub cluster_size: usize,
  /// Nominal-size clusters currently mapped (pools, arenas, ledger).
  pub live_clusters: usize,
  /// Overflow slabs currently mapped.
  pub live_slabs: usize,
  pub mapped_bytes: usize,
}

/// One size class of the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
  pub block_size: usize,
  /// Pools chained for this class.
  pub pools: usize,
  /// Blocks handed out and not yet released, over all pools of the class.
  pub live_blocks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
  /// Allocation requests seen since the heap was built.
  pub requests: u64,
  pub classes: [ClassStats; SIZE_CLASS_COUNT],
  /// Clusters holding bitmaps and pool nodes, directory roots excluded.
  pub arena_clusters: usize,
  pub provider: ProviderStats,
}

impl HeapStats {
  pub fn live_blocks(&self) -> usize {
    self.classes.iter().map(|class| class.live_blocks).sum()
  }
}

impl fmt::Display for HeapStats {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    writeln!(f, "Total requests: {}", self.requests)?;
    for class in &self.classes {
      writeln!(
        f,
        "{} bytes:\t{}\t({} pools)",
        class.block_size, class.live_blocks, class.pools
      )?;
    }
    write!(
      f,
      "Mapped: {} bytes in {} clusters ({} for arenas) and {} slabs",
      self.provider.mapped_bytes,
      self.provider.live_clusters,
      self.arena_clusters,
      self.provider.live_slabs
    )
  }
}

/// Address and header-inclusive size of an overflow block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  pub address: usize,
  pub size: usize,
}

/// Both overflow lists, in address order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarSizeReport {
  pub used: Vec<BlockInfo>,
  pub free: Vec<BlockInfo>,
  pub slabs: usize,
  pub slab_bytes: usize,
}

impl VarSizeReport {
  pub fn used_count(&self) -> usize {
    self.used.len()
  }

  pub fn used_bytes(&self) -> usize {
    self.used.iter().map(|block| block.size).sum()
  }

  pub fn free_count(&self) -> usize {
    self.free.len()
  }

  pub fn free_bytes(&self) -> usize {
    self.free.iter().map(|block| block.size).sum()
  }
}

impl fmt::Display for VarSizeReport {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    writeln!(f, "Used list:")?;
    for block in &self.used {
      writeln!(f, "{:#014x}:{} bytes", block.address, block.size)?;
    }
    writeln!(f)?;
    writeln!(f, "Free list:")?;
    for block in &self.free {
      writeln!(f, "{:#014x}:{} bytes", block.address, block.size)?;
    }
    writeln!(f)?;
    writeln!(f, "Counts:")?;
    writeln!(f, "Used Count:\t{}", self.used_count())?;
    writeln!(f, "Used Size:\t{}", self.used_bytes())?;
    writeln!(f, "Free Count:\t{}", self.free_count())?;
    writeln!(f, "Free Size:\t{}", self.free_bytes())?;
    write!(f, "Total Size:\t{}", self.used_bytes() + self.free_bytes())
  }
}
