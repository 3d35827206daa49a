//! Heap geometry constants and the runtime configuration.
//!
//! The constants fix the size-class layout; `HeapConfig` only tunes how
//! big a cluster is and how much the heap may map in total.

use std::mem;

use tracing::warn;

use crate::error::HeapError;

/// Nominal size of one cluster requested from the OS.
pub const CLUSTER_SIZE: usize = 65536;

/// Largest accepted cluster size. Bitmap bit counts are 32-bit words.
pub const MAX_CLUSTER_SIZE: usize = 1 << 30;

/// log2 of the smallest size class (32 bytes).
pub const SMALLEST_CLASS_SHIFT: u32 = 5;

/// Index of the largest size class served by fixed-size pools.
pub const LARGEST_MANAGED_INDEX: usize = 9;

/// Number of fixed size classes.
pub const SIZE_CLASS_COUNT: usize = LARGEST_MANAGED_INDEX + 1;

/// Largest header-inclusive request served by a fixed-size pool.
pub const LARGEST_MANAGED_ALLOCATION: usize = 32 << LARGEST_MANAGED_INDEX;

/// Granularity of overflow blocks.
pub const OVERFLOW_ALIGNMENT: usize = 32;

/// Size of the back-pointer word stored in front of every returned address.
pub const HEADER_SIZE: usize = mem::size_of::<usize>();

/// Size of the `{ size, next }` header in front of every overflow block.
pub const OVERFLOW_HEADER_SIZE: usize = 2 * mem::size_of::<usize>();

const CLUSTER_SIZE_VAR: &str = "CLUSTERHEAP_CLUSTER_SIZE";
const MAPPING_LIMIT_VAR: &str = "CLUSTERHEAP_MAPPING_LIMIT";

/// Runtime knobs for a [`Heap`](crate::Heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
  /// Bytes per nominal cluster. Power of two, at least
  /// [`LARGEST_MANAGED_ALLOCATION`].
  pub cluster_size: usize,
  /// Upper bound on bytes mapped at any one time. `None` leaves it to the OS.
  pub mapping_limit: Option<usize>,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      cluster_size: CLUSTER_SIZE,
      mapping_limit: None,
    }
  }
}

impl HeapConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_cluster_size(
    mut self,
    cluster_size: usize,
  ) -> Self {
    self.cluster_size = cluster_size;
    self
  }

  pub fn with_mapping_limit(
    mut self,
    limit: usize,
  ) -> Self {
    self.mapping_limit = Some(limit);
    self
  }

  /// Builds a configuration from `CLUSTERHEAP_CLUSTER_SIZE` and
  /// `CLUSTERHEAP_MAPPING_LIMIT`.
  ///
  /// Values that do not parse, or that fail [`HeapConfig::validate`], are
  /// dropped in favour of the defaults.
  pub fn from_env() -> Self {
    let mut config = Self::default();

    if let Some(size) = parse_env(CLUSTER_SIZE_VAR) {
      let candidate = config.with_cluster_size(size);
      match candidate.validate() {
        Ok(()) => config = candidate,
        Err(err) => warn!(var = CLUSTER_SIZE_VAR, %err, "ignoring cluster size override"),
      }
    }

    if let Some(limit) = parse_env(MAPPING_LIMIT_VAR) {
      config = config.with_mapping_limit(limit);
    }

    config
  }

  /// Checks that the cluster size can hold at least one block of every
  /// size class and keeps the shift arithmetic exact.
  pub fn validate(&self) -> Result<(), HeapError> {
    if !self.cluster_size.is_power_of_two() {
      return Err(HeapError::InvalidConfig(format!(
        "cluster size {} is not a power of two",
        self.cluster_size
      )));
    }

    if self.cluster_size < LARGEST_MANAGED_ALLOCATION {
      return Err(HeapError::InvalidConfig(format!(
        "cluster size {} is smaller than the largest size class ({})",
        self.cluster_size, LARGEST_MANAGED_ALLOCATION
      )));
    }

    if self.cluster_size > MAX_CLUSTER_SIZE {
      return Err(HeapError::InvalidConfig(format!(
        "cluster size {} is larger than {}",
        self.cluster_size, MAX_CLUSTER_SIZE
      )));
    }

    Ok(())
  }
}

fn parse_env(var: &str) -> Option<usize> {
  let raw = std::env::var(var).ok()?;
  match raw.trim().parse::<usize>() {
    Ok(value) => Some(value),
    Err(err) => {
      warn!(var, value = %raw, %err, "ignoring unparsable setting");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_class_constants() {
    assert_eq!(SIZE_CLASS_COUNT, 10);
    assert_eq!(LARGEST_MANAGED_ALLOCATION, 16384);
    assert_eq!(1usize << (SMALLEST_CLASS_SHIFT as usize + LARGEST_MANAGED_INDEX), 16384);
  }

  #[test]
  fn test_default_config_is_valid() {
    let config = HeapConfig::default();
    assert_eq!(config.cluster_size, CLUSTER_SIZE);
    assert_eq!(config.mapping_limit, None);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_validate_rejects_bad_cluster_sizes() {
    assert!(HeapConfig::new().with_cluster_size(65535).validate().is_err());
    assert!(HeapConfig::new().with_cluster_size(8192).validate().is_err());
    assert!(HeapConfig::new().with_cluster_size(16384).validate().is_ok());
    assert!(HeapConfig::new().with_cluster_size(1 << 20).validate().is_ok());
    assert!(HeapConfig::new().with_cluster_size(MAX_CLUSTER_SIZE).validate().is_ok());
    assert!(matches!(
      HeapConfig::new().with_cluster_size(MAX_CLUSTER_SIZE * 2).validate(),
      Err(HeapError::InvalidConfig(_))
    ));
  }

  #[test]
  fn test_from_env() {
    // only this test touches these variables
    unsafe {
      std::env::set_var(CLUSTER_SIZE_VAR, "131072");
      std::env::set_var(MAPPING_LIMIT_VAR, " 1048576 ");
    }
    let config = HeapConfig::from_env();
    assert_eq!(config.cluster_size, 131072);
    assert_eq!(config.mapping_limit, Some(1048576));

    unsafe {
      std::env::set_var(CLUSTER_SIZE_VAR, "1000");
      std::env::set_var(MAPPING_LIMIT_VAR, "lots");
    }
    assert_eq!(HeapConfig::from_env(), HeapConfig::default());

    unsafe {
      std::env::remove_var(CLUSTER_SIZE_VAR);
      std::env::remove_var(MAPPING_LIMIT_VAR);
    }
  }
}
