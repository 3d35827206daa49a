use std::{io, io::Read, ptr::NonNull};

use clusterheap::{
  Heap, HeapConfig, Owner, align_to,
  config::{HEADER_SIZE, OVERFLOW_ALIGNMENT, OVERFLOW_HEADER_SIZE},
};
use tracing_subscriber::EnvFilter;

/// Holds the tour between steps when `--pause` is given, so the new
/// anonymous mappings can be looked up in `/proc/<pid>/maps`.
fn block_until_enter_pressed(pause: bool) {
  if !pause {
    return;
  }
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints where an allocation landed and who owns it.
fn print_alloc(
  heap: &Heap,
  size: usize,
  address: NonNull<u8>,
) {
  match unsafe { heap.owner(address) } {
    Owner::Pool(pool) => println!(
      "  {size} bytes at {address:?}: pool of {}-byte blocks, {} live, cluster {:?}",
      pool.block_size(),
      pool.live_blocks(),
      pool.cluster_base(),
    ),
    Owner::Overflow => println!(
      "  {size} bytes at {address:?}: overflow heap, block of {} bytes",
      align_to!(size + HEADER_SIZE + OVERFLOW_HEADER_SIZE, OVERFLOW_ALIGNMENT),
    ),
  }
}

fn main() -> io::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_target(false)
    .init();

  let pause = std::env::args().any(|arg| arg == "--pause");
  let config = HeapConfig::from_env();
  println!("PID = {}, cluster size = {}", std::process::id(), config.cluster_size);

  let mut heap = match Heap::with_config(config) {
    Ok(heap) => heap,
    Err(err) => {
      eprintln!("cannot build heap: {err}");
      std::process::exit(1);
    }
  };
  let mut out = io::stdout().lock();

  block_until_enter_pressed(pause);

  // --------------------------------------------------------------------
  // 1) Three small requests land next to each other in one 64-byte pool.
  // --------------------------------------------------------------------
  println!("\n[1] Allocate 3 x 40 bytes");
  let small: Vec<_> = (0..3).filter_map(|_| heap.allocate(40)).collect();
  for &address in &small {
    print_alloc(&heap, 40, address);
  }
  block_until_enter_pressed(pause);

  // --------------------------------------------------------------------
  // 2) Release the middle one; the next request reuses its block.
  // --------------------------------------------------------------------
  println!("\n[2] Release the middle block and allocate 40 bytes again");
  unsafe { heap.release(small[1].as_ptr()) };
  let again = heap.allocate(40);
  if let Some(address) = again {
    print_alloc(&heap, 40, address);
    println!("  reused the freed block? {}", address == small[1]);
  }
  block_until_enter_pressed(pause);

  // --------------------------------------------------------------------
  // 3) One request per size class.
  // --------------------------------------------------------------------
  println!("\n[3] Walk the size classes");
  let mut classes = Vec::new();
  for size in [1, 100, 200, 500, 1000, 2000, 4000, 8000, 16000] {
    if let Some(address) = heap.allocate(size) {
      print_alloc(&heap, size, address);
      classes.push(address);
    }
  }
  heap.print_counts(&mut out)?;
  block_until_enter_pressed(pause);

  // --------------------------------------------------------------------
  // 4) Past the largest class, requests go to the overflow heap.
  // --------------------------------------------------------------------
  println!("\n[4] Allocate 20000 and 5000000 bytes");
  let large: Vec<_> = [20000, 5_000_000]
    .into_iter()
    .filter_map(|size| heap.allocate(size).inspect(|&address| print_alloc(&heap, size, address)))
    .collect();
  heap.print_var_size_list(&mut out)?;
  block_until_enter_pressed(pause);

  // --------------------------------------------------------------------
  // 5) Release everything; empty pools give their clusters back and the
  //    overflow blocks coalesce into whole slabs again.
  // --------------------------------------------------------------------
  println!("\n[5] Release everything");
  unsafe {
    heap.release(small[0].as_ptr());
    heap.release(small[2].as_ptr());
    for address in again.into_iter().chain(classes).chain(large) {
      heap.release(address.as_ptr());
    }
  }
  heap.print_counts(&mut out)?;
  heap.print_var_size_list(&mut out)?;

  println!("\n[6] End of tour. Dropping the heap unmaps every cluster and slab.");
  Ok(())
}
