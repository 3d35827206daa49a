use std::io;

use thiserror::Error;

/// Failure to obtain memory from the OS.
#[derive(Debug, Error)]
pub enum ClusterError {
  #[error("mmap of {len} bytes failed: {source}")]
  Map {
    len: usize,
    #[source]
    source: io::Error,
  },
  #[error("mapping {requested} more bytes would exceed the {limit}-byte limit ({mapped} already mapped)")]
  LimitExceeded {
    requested: usize,
    mapped: usize,
    limit: usize,
  },
  #[error("a mapping covering {requested} bytes does not fit in the address space")]
  TooLarge { requested: usize },
}

/// Failure of an allocation or of heap construction.
#[derive(Debug, Error)]
pub enum HeapError {
  #[error("cannot map a cluster for the {arena} arena")]
  Arena {
    arena: &'static str,
    #[source]
    source: ClusterError,
  },
  #[error("the {arena} arena has no room left")]
  ArenaFull { arena: &'static str },
  #[error("cannot map a cluster for {block_size}-byte blocks")]
  PoolCluster {
    block_size: usize,
    #[source]
    source: ClusterError,
  },
  #[error("cannot grow the overflow heap for a {size}-byte request")]
  OverflowSlab {
    size: usize,
    #[source]
    source: ClusterError,
  },
  #[error("request of {size} bytes overflows the address space")]
  SizeOverflow { size: usize },
  #[error("invalid heap configuration: {0}")]
  InvalidConfig(String),
}

impl HeapError {
  /// Whether the failure happened on the fixed-size path, where the heap
  /// refuses to continue with half-built tables.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      HeapError::Arena { .. } | HeapError::ArenaFull { .. } | HeapError::PoolCluster { .. }
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fatal_classification() {
    let fatal = HeapError::PoolCluster {
      block_size: 64,
      source: ClusterError::LimitExceeded {
        requested: 65536,
        mapped: 0,
        limit: 0,
      },
    };
    assert!(fatal.is_fatal());
    assert!(HeapError::ArenaFull { arena: "bitmap" }.is_fatal());

    let recoverable = HeapError::OverflowSlab {
      size: 20000,
      source: ClusterError::TooLarge { requested: usize::MAX },
    };
    assert!(!recoverable.is_fatal());
    assert!(!HeapError::SizeOverflow { size: usize::MAX }.is_fatal());
  }

  #[test]
  fn test_messages_name_the_source() {
    let err = HeapError::Arena {
      arena: "pool",
      source: ClusterError::Map {
        len: 65536,
        source: io::Error::from_raw_os_error(libc::ENOMEM),
      },
    };
    assert_eq!(err.to_string(), "cannot map a cluster for the pool arena");
    let source = std::error::Error::source(&err).map(ToString::to_string);
    assert!(source.unwrap().starts_with("mmap of 65536 bytes failed"));
  }
}
