//! The back-pointer word in front of every address the heap returns.
//!
//! ```text
//!   ┌──────────────┬──────────────────────────────┐
//!   │ back-pointer │ caller data                  │
//!   │ pool or null │                              │
//!   └──────────────┴──────────────────────────────┘
//!   ▲              ▲
//!   block          returned address
//! ```

use std::ptr::NonNull;

use crate::{config::HEADER_SIZE, pool::{PoolHandle, PoolNode}};

type BackPointer = Option<NonNull<PoolNode>>;

const _: () = assert!(size_of::<BackPointer>() == HEADER_SIZE);

/// Who serves an allocation, as recorded in its back-pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
  /// A fixed-size pool of one of the size classes.
  Pool(PoolHandle),
  /// The variable-size overflow heap.
  Overflow,
}

impl Owner {
  fn back_pointer(self) -> BackPointer {
    match self {
      Owner::Pool(pool) => Some(pool.as_ptr()),
      Owner::Overflow => None,
    }
  }
}

/// Stamps `owner` at the start of `block` and returns the caller address.
///
/// # Safety
///
/// `block` must be valid for a pointer-sized, pointer-aligned write.
pub(crate) unsafe fn stamp(
  block: NonNull<u8>,
  owner: Owner,
) -> NonNull<u8> {
  unsafe {
    block.cast::<BackPointer>().write(owner.back_pointer());
    block.add(HEADER_SIZE)
  }
}

/// Reads the back-pointer in front of `address`; returns the owner and the
/// start of the block.
///
/// # Safety
///
/// `address` must have been returned by [`stamp`].
pub(crate) unsafe fn read(address: NonNull<u8>) -> (Owner, NonNull<u8>) {
  unsafe {
    let block = address.sub(HEADER_SIZE);
    let owner = match block.cast::<BackPointer>().read() {
      Some(node) => Owner::Pool(PoolHandle::new(node)),
      None => Owner::Overflow,
    };
    (owner, block)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_stamp_and_read() {
    let mut storage = [usize::MAX; 4];
    let block = NonNull::from(&mut storage).cast::<u8>();

    let address = unsafe { stamp(block, Owner::Overflow) };
    assert_eq!(address.as_ptr() as usize - block.as_ptr() as usize, HEADER_SIZE);
    assert_eq!(storage[0], 0);

    let (owner, start) = unsafe { read(address) };
    assert_eq!(owner, Owner::Overflow);
    assert_eq!(start, block);

    let fake = NonNull::<PoolNode>::dangling();
    let address = unsafe { stamp(block, Owner::Pool(PoolHandle::new(fake))) };
    let (owner, _) = unsafe { read(address) };
    assert_eq!(owner, Owner::Pool(PoolHandle::new(fake)));
  }
}
