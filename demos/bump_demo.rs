use std::io::Read;

use rbarena::Arena;

/// Waits until the user presses ENTER.
/// Useful when you want to inspect memory state with tools like `pmap`,
/// `htop`, `gdb`, or just visually track how allocations move.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

fn main() {
  // A 64 KiB arena over a caller-owned buffer. No `malloc`/`sbrk` involved:
  // `memory` is just a Vec living on this process's heap already.
  let mut memory = vec![0u8; 64 * 1024];

  unsafe {
    let mut em = Arena::create_static(&mut memory).expect("arena should fit in buffer");
    let arena = em.as_mut();

    println!("[start] arena capacity = {} bytes", arena.capacity());
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 1) Allocate space for a u32 and write through it.
    // --------------------------------------------------------------------
    let first = arena.alloc(4).expect("u32 allocation should fit");
    let first_ptr = first.as_ptr() as *mut u32;
    first_ptr.write(0xDEADBEEF);
    println!("\n[1] wrote 0x{:X} through a 4-byte allocation", first_ptr.read());
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 2) Allocate 12 bytes, to show odd-sized requests round up cleanly.
    // --------------------------------------------------------------------
    let second = arena.alloc(12).expect("12-byte allocation should fit");
    println!("\n[2] second allocation at {:?}", second.as_ptr());
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 3) Free the first allocation, then allocate again: the freed block
    //    should be reused from the tree instead of carving new tail space.
    // --------------------------------------------------------------------
    let tail_before = arena.free_size_in_tail();
    rbarena::free(Some(first));
    let third = arena.alloc(4).expect("re-allocation should reuse the freed block");
    println!(
      "\n[3] re-allocated 4 bytes at {:?}; tail free space unchanged: {}",
      third.as_ptr(),
      arena.free_size_in_tail() == tail_before
    );
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 4) Create a bump sub-arena for a burst of small, never-individually-
    //    freed allocations, then tear the whole thing down at once.
    // --------------------------------------------------------------------
    let mut bump = arena.create_bump(4096).expect("bump creation should succeed");
    let b = bump.as_mut();
    for i in 0..100u32 {
      let slot = b.alloc(4).expect("bump allocation should succeed");
      (slot.as_ptr() as *mut u32).write(i);
    }
    println!("\n[4] bumped 100 u32 allocations through a linear sub-arena");
    b.destroy();

    rbarena::free(Some(second));
    rbarena::free(Some(third));

    println!("\n[end] arena capacity = {} bytes", arena.capacity());
  }
}
