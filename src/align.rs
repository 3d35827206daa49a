/// Rounds `value` up to the next multiple of `unit`, which must be a power
/// of two.
///
/// # Examples
///
/// ```rust
/// use clusterheap::align_to;
///
/// assert_eq!(align_to!(20024, 32), 20032);
/// assert_eq!(align_to!(64, 32), 64);
/// assert_eq!(align_to!(1, 4096), 4096);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $unit:expr) => {
    ($value + $unit - 1) & !($unit - 1)
  };
}

/// Checked form of [`align_to!`]: `None` when rounding would overflow.
pub(crate) fn checked_align_to(
  value: usize,
  unit: usize,
) -> Option<usize> {
  debug_assert!(unit.is_power_of_two());
  value.checked_add(unit - 1).map(|_| align_to!(value, unit))
}
