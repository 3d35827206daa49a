use std::{mem, ptr::NonNull};

use crate::config::OVERFLOW_HEADER_SIZE;

/// Header of a variable-size block. The data region follows it directly.
///
/// `size` counts the header too, so `address + size` is where the next
/// block in memory would start.
#[repr(C)]
pub(crate) struct VarBlock {
  pub size: usize,
  pub next: Option<NonNull<VarBlock>>,
}

impl VarBlock {
  pub const HEADER_SIZE: usize = OVERFLOW_HEADER_SIZE;

  /// Writes a fresh header at `at`.
  ///
  /// # Safety
  ///
  /// `at` must be valid for writes of a header and suitably aligned.
  pub unsafe fn init(
    at: NonNull<u8>,
    size: usize,
  ) -> NonNull<VarBlock> {
    let block = at.cast::<VarBlock>();
    unsafe { block.write(VarBlock { size, next: None }) };
    block
  }

  pub fn data(block: NonNull<VarBlock>) -> NonNull<u8> {
    unsafe { block.cast::<u8>().add(Self::HEADER_SIZE) }
  }

  /// # Safety
  ///
  /// `data` must be at least `HEADER_SIZE` bytes past the start of a mapping.
  pub unsafe fn from_data(data: NonNull<u8>) -> NonNull<VarBlock> {
    unsafe { data.sub(Self::HEADER_SIZE).cast::<VarBlock>() }
  }

  pub fn addr(block: NonNull<VarBlock>) -> usize {
    block.as_ptr() as usize
  }

  /// First address past the block.
  pub fn end(block: NonNull<VarBlock>) -> usize {
    Self::addr(block) + unsafe { block.as_ref().size }
  }
}

const _: () = assert!(mem::size_of::<VarBlock>() == VarBlock::HEADER_SIZE);
