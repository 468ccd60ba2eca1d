//! The arena header ("EM" in the original design notes) and everything that
//! operates on a whole arena: the physical block list, the allocation and
//! free engines, scratch regions, and the create/reset/destroy lifecycle.
//!
//! [`Arena`] is laid out binary-compatible with [`Block`] — same four
//! machine words, same accessor tricks — so a parent arena can treat a
//! nested arena's header as just another occupied block of its own. That's
//! what makes [`Arena::destroy`] on a nested arena reduce to an ordinary
//! `free_block_full` call against the parent.

use core::mem;
use core::ptr::{self, NonNull};

use crate::align::{align_down, align_up, is_power_of_two};
use crate::block::{
    Block, BlockState, BLOCK_HEADER_SIZE, BLOCK_MIN_SIZE, DEFAULT_ALIGNMENT, MAGIC_XOR,
    MAX_ALIGNMENT, MIN_ALIGNMENT, POISON_BYTE, SIZE_MASK, WORD_SIZE,
};
use crate::bump::Bump;
use crate::tree;

const IS_DYNAMIC_FLAG: usize = 1;
const IS_NESTED_FLAG: usize = 2;
const TAIL_MASK: usize = !0b11;

const HAS_PADDING_FLAG: usize = 1;
const HAS_SCRATCH_FLAG: usize = 2;
const FREE_BLOCKS_MASK: usize = !0b11;

/// Smallest region an arena can be built over: its own header plus one
/// minimal block.
pub const ARENA_MIN_SIZE: usize = ARENA_HEADER_SIZE + BLOCK_MIN_SIZE;

/// An arena: a contiguous region of memory plus the bookkeeping that turns
/// it into a sequence of [`Block`]s and a free-block tree.
///
/// Every mutating method is `unsafe`: the arena's invariants (capacity,
/// alignment, the physical block chain) only hold if every call the arena
/// has ever seen went through these methods, and the caller is responsible
/// for not using an arena (or anything allocated from it) after it has been
/// [`destroy`](Arena::destroy)ed.
#[repr(C)]
pub struct Arena {
    capacity_and_alignment: usize,
    prev: *mut Block,
    tail: *mut Block,
    free_blocks: *mut Block,
}

pub(crate) const ARENA_HEADER_SIZE: usize = mem::size_of::<Arena>();
const _: () = assert!(ARENA_HEADER_SIZE == BLOCK_HEADER_SIZE);

impl Arena {
    #[inline]
    unsafe fn capacity_raw(em: *const Arena) -> usize {
        unsafe { Block::size(em as *const Block) }
    }

    #[inline]
    unsafe fn set_capacity(em: *mut Arena, size: usize) {
        unsafe { Block::set_size(em as *mut Block, size) }
    }

    #[inline]
    pub(crate) unsafe fn alignment(em: *const Arena) -> usize {
        unsafe { Block::alignment(em as *const Block) }
    }

    #[inline]
    unsafe fn set_alignment(em: *mut Arena, alignment: usize) {
        unsafe { Block::set_alignment(em as *mut Block, alignment) }
    }

    #[inline]
    unsafe fn tail(em: *const Arena) -> *mut Block {
        unsafe { ((*em).tail as usize & TAIL_MASK) as *mut Block }
    }

    #[inline]
    unsafe fn set_tail(em: *mut Arena, block: *mut Block) {
        unsafe {
            let flags = (*em).tail as usize & !TAIL_MASK;
            (*em).tail = (block as usize | flags) as *mut Block;
        }
    }

    #[inline]
    unsafe fn is_dynamic(em: *const Arena) -> bool {
        unsafe { (*em).tail as usize & IS_DYNAMIC_FLAG != 0 }
    }

    #[inline]
    unsafe fn set_is_dynamic(em: *mut Arena, is_dynamic: bool) {
        unsafe {
            let mut bits = (*em).tail as usize;
            if is_dynamic { bits |= IS_DYNAMIC_FLAG } else { bits &= !IS_DYNAMIC_FLAG }
            (*em).tail = bits as *mut Block;
        }
    }

    #[inline]
    pub(crate) unsafe fn is_nested(em: *const Arena) -> bool {
        unsafe { (*em).tail as usize & IS_NESTED_FLAG != 0 }
    }

    #[inline]
    unsafe fn set_is_nested(em: *mut Arena, is_nested: bool) {
        unsafe {
            let mut bits = (*em).tail as usize;
            if is_nested { bits |= IS_NESTED_FLAG } else { bits &= !IS_NESTED_FLAG }
            (*em).tail = bits as *mut Block;
        }
    }

    #[inline]
    unsafe fn free_blocks(em: *const Arena) -> *mut Block {
        unsafe { ((*em).free_blocks as usize & FREE_BLOCKS_MASK) as *mut Block }
    }

    #[inline]
    unsafe fn set_free_blocks(em: *mut Arena, block: *mut Block) {
        unsafe {
            let flags = (*em).free_blocks as usize & !FREE_BLOCKS_MASK;
            (*em).free_blocks = (block as usize | flags) as *mut Block;
        }
    }

    #[inline]
    unsafe fn set_has_padding(em: *mut Arena, has_padding: bool) {
        unsafe {
            let mut bits = (*em).free_blocks as usize;
            if has_padding { bits |= HAS_PADDING_FLAG } else { bits &= !HAS_PADDING_FLAG }
            (*em).free_blocks = bits as *mut Block;
        }
    }

    #[inline]
    unsafe fn has_scratch(em: *const Arena) -> bool {
        unsafe { (*em).free_blocks as usize & HAS_SCRATCH_FLAG != 0 }
    }

    #[inline]
    unsafe fn set_has_scratch(em: *mut Arena, has_scratch: bool) {
        unsafe {
            let mut bits = (*em).free_blocks as usize;
            if has_scratch { bits |= HAS_SCRATCH_FLAG } else { bits &= !HAS_SCRATCH_FLAG }
            (*em).free_blocks = bits as *mut Block;
        }
    }

    /// Address of this arena's first block, accounting for the alignment
    /// padding that may sit between the arena header and it.
    unsafe fn first_block(em: *const Arena) -> *mut Block {
        unsafe {
            let align = Arena::alignment(em);
            let raw_start = em as usize + ARENA_HEADER_SIZE;
            (align_up(raw_start + BLOCK_HEADER_SIZE, align) - BLOCK_HEADER_SIZE) as *mut Block
        }
    }

    /// Bytes still free in the tail block, minus any active scratch region.
    pub fn free_size_in_tail(&self) -> usize {
        unsafe { free_size_in_tail(self as *const Arena) }
    }

    /// Total capacity this arena was created with (in bytes, including its
    /// own header).
    pub fn capacity(&self) -> usize {
        unsafe { Arena::capacity_raw(self as *const Arena) }
    }
}

unsafe fn next_block_unsafe(block: *const Block) -> *mut Block {
    unsafe { (Block::payload(block as *mut Block) as usize + Block::size(block)) as *mut Block }
}

unsafe fn is_block_within_arena(em: *const Arena, block: *const Block) -> bool {
    unsafe {
        let first = Arena::first_block(em);
        (block as usize) >= (first as usize) && (block as usize) < (em as usize + Arena::capacity_raw(em))
    }
}

unsafe fn is_block_in_active_part(em: *const Arena, block: *const Block) -> bool {
    unsafe { is_block_within_arena(em, block) && (block as usize) <= (Arena::tail(em) as usize) }
}

unsafe fn next_block(em: *const Arena, block: *const Block) -> *mut Block {
    unsafe {
        let next = next_block_unsafe(block);
        if is_block_in_active_part(em, next) { next } else { ptr::null_mut() }
    }
}

unsafe fn create_next_block(em: *mut Arena, prev_block: *mut Block) -> *mut Block {
    unsafe {
        debug_assert!(is_block_within_arena(em, prev_block));
        let at = next_block_unsafe(prev_block);
        let block = Block::create(at as *mut u8);
        Block::set_prev(block, prev_block);
        block
    }
}

unsafe fn merge_blocks(em: *mut Arena, target: *mut Block, source: *mut Block) {
    unsafe {
        debug_assert!(next_block_unsafe(target) == source);
        let new_size = Block::size(target) + BLOCK_HEADER_SIZE + Block::size(source);
        Block::set_size(target, new_size);

        let following = next_block(em, target);
        if !following.is_null() {
            Block::set_prev(following, target);
        }
    }
}

/// Splits `block` into `[needed_size][remainder]` if the remainder would be
/// at least `BLOCK_MIN_SIZE`; otherwise leaves `block` untouched (the whole
/// thing goes to the caller). The remainder, if created, is immediately
/// reinserted into the free tree.
pub(crate) unsafe fn split_block(em: *mut Arena, block: *mut Block, needed_size: usize) {
    unsafe {
        let full_size = Block::size(block);
        if full_size <= needed_size || full_size - needed_size < BLOCK_MIN_SIZE {
            return;
        }

        Block::set_size(block, needed_size);
        let remainder = Block::create(next_block_unsafe(block) as *mut u8);
        Block::set_prev(remainder, block);
        Block::set_size(remainder, full_size - needed_size - BLOCK_HEADER_SIZE);

        let following = next_block(em, remainder);
        if !following.is_null() {
            Block::set_prev(following, remainder);
        }

        free_block_full(em, remainder);
    }
}

/// Walks backward from `block` to recover the arena that owns it, per the
/// parent-recovery scheme in [`crate::block`]'s module docs: scratch blocks
/// repurpose `prev` to point straight at the parent; ordinary blocks walk
/// `prev` links until an occupied, non-nested block is found; reaching the
/// very first block falls back to the magic-LSB back-link (or a direct
/// header-sized offset) written at arena-creation time.
///
/// Safety: `block` must be a block that is actually owned, directly or
/// transitively, by some live arena — i.e. it came from a prior
/// `alloc`/`alloc_scratch`/`create_bump`/`create_nested` call. Passing a
/// free block's former payload pointer is unsound (see `DESIGN.md`).
pub(crate) unsafe fn get_parent_arena(block: *mut Block) -> *mut Arena {
    unsafe {
        if Block::state(block) == BlockState::Scratch {
            return Block::prev(block) as *mut Arena;
        }

        let mut cur = block;
        loop {
            let p = Block::prev(cur);
            if p.is_null() {
                break;
            }
            cur = p;
            if Block::state(cur) != BlockState::Free && !Arena::is_nested(cur as *mut Arena) {
                return Block::owner(cur);
            }
        }

        let detector = (cur as usize - WORD_SIZE) as *const usize;
        let val = *detector;
        if val & 1 != 0 {
            (cur as usize - (val >> 1)) as *mut Arena
        } else {
            (cur as usize - ARENA_HEADER_SIZE) as *mut Arena
        }
    }
}

unsafe fn free_size_in_tail(em: *const Arena) -> usize {
    unsafe {
        let tail = Arena::tail(em);
        if tail.is_null() || !Block::is_free(tail) {
            return 0;
        }

        let occupied_relative = (Block::payload(tail) as usize + Block::size(tail)) - em as usize;
        let mut capacity = Arena::capacity_raw(em);

        if Arena::has_scratch(em) {
            let raw_end = em as usize + capacity;
            let aligned_end = align_down(raw_end, MIN_ALIGNMENT);
            let stored_size = *((aligned_end - WORD_SIZE) as *const usize);
            capacity -= stored_size;
        }

        capacity - occupied_relative
    }
}

unsafe fn alloc_in_free_blocks(em: *mut Arena, size: usize, alignment: usize) -> *mut u8 {
    unsafe {
        let mut root = Arena::free_blocks(em);
        let block = tree::find_and_detach(&mut root, size, alignment);
        Arena::set_free_blocks(em, root);

        if block.is_null() {
            return ptr::null_mut();
        }

        Block::set_is_free(block, false);

        let data_ptr = Block::payload(block) as usize;
        let aligned_ptr = align_up(data_ptr, alignment);
        let padding = aligned_ptr - data_ptr;

        let total_needed = padding + size;
        let aligned_needed = align_up(total_needed, WORD_SIZE);

        split_block(em, block, aligned_needed);

        if padding > 0 {
            let spot = (aligned_ptr - WORD_SIZE) as *mut usize;
            *spot = (block as usize) ^ aligned_ptr;
        }

        Block::set_owner(block, em);
        Block::set_magic(block, aligned_ptr as *mut u8);
        Block::set_color(block, crate::block::RED);

        aligned_ptr as *mut u8
    }
}

unsafe fn alloc_in_tail_full(em: *mut Arena, size: usize, alignment: usize) -> *mut u8 {
    unsafe {
        if free_size_in_tail(em) < size {
            return ptr::null_mut();
        }

        let mut tail = Arena::tail(em);
        debug_assert!(!tail.is_null() && Block::is_free(tail));

        let raw_data_ptr = Block::payload(tail) as usize;
        let mut aligned_data_ptr = align_up(raw_data_ptr, alignment);
        let mut padding = aligned_data_ptr - raw_data_ptr;

        let mut minimal_needed = padding + size;
        let mut free_space = free_size_in_tail(em);
        if minimal_needed > free_space {
            return ptr::null_mut();
        }

        if alignment > Arena::alignment(em) && padding > 0 && padding >= BLOCK_MIN_SIZE {
            Block::set_size(tail, padding - BLOCK_HEADER_SIZE);
            let mut root = Arena::free_blocks(em);
            root = tree::insert(root, tail);
            Arena::set_free_blocks(em, root);

            let new_tail = create_next_block(em, tail);
            Arena::set_tail(em, new_tail);
            tail = new_tail;
            padding = 0;
        }

        aligned_data_ptr = Block::payload(tail) as usize + padding;
        minimal_needed = padding + size;
        free_space = free_size_in_tail(em);
        if minimal_needed > free_space {
            return ptr::null_mut();
        }

        let final_needed = if free_space - minimal_needed >= BLOCK_MIN_SIZE {
            let raw_data_end = aligned_data_ptr + size;
            let aligned_data_end =
                align_up(raw_data_end + BLOCK_HEADER_SIZE, Arena::alignment(em)) - BLOCK_HEADER_SIZE;
            let end_padding = aligned_data_end - raw_data_end;
            let full_needed = minimal_needed + end_padding;
            if free_space - full_needed >= BLOCK_MIN_SIZE {
                full_needed
            } else {
                free_space
            }
        } else {
            free_space
        };

        if padding > 0 {
            let spot = (aligned_data_ptr - WORD_SIZE) as *mut usize;
            *spot = (tail as usize) ^ aligned_data_ptr;
        }

        Block::set_size(tail, final_needed);
        Block::set_is_free(tail, false);
        Block::set_magic(tail, aligned_data_ptr as *mut u8);
        Block::set_color(tail, crate::block::RED);
        Block::set_owner(tail, em);

        if free_space != final_needed {
            let new_tail = create_next_block(em, tail);
            Arena::set_tail(em, new_tail);
        }

        aligned_data_ptr as *mut u8
    }
}

pub(crate) unsafe fn free_block_full(em: *mut Arena, block: *mut Block) {
    unsafe {
        if cfg!(all(debug_assertions, feature = "poison")) {
            ptr::write_bytes(Block::payload(block), POISON_BYTE, Block::size(block));
        }

        if Block::state(block) == BlockState::Scratch {
            Arena::set_has_scratch(em, false);
            return;
        }

        Block::set_is_free(block, true);
        Block::set_left(block, ptr::null_mut());
        Block::set_right(block, ptr::null_mut());
        Block::set_color(block, crate::block::RED);

        let tail = Arena::tail(em);
        let prev = Block::prev(block);
        let mut result: *mut Block = block;

        if block == tail {
            Block::set_size(block, 0);
            result = ptr::null_mut();
        } else {
            let next = next_block(em, block);
            if next == tail {
                Block::set_size(block, 0);
                Arena::set_tail(em, block);
                result = ptr::null_mut();
            } else if !next.is_null() && Block::is_free(next) {
                let mut root = Arena::free_blocks(em);
                tree::detach_by_ptr(&mut root, next);
                Arena::set_free_blocks(em, root);
                merge_blocks(em, block, next);
                result = block;
            }
        }

        if !prev.is_null() && is_block_within_arena(em, prev) && Block::is_free(prev) {
            let mut root = Arena::free_blocks(em);
            tree::detach_by_ptr(&mut root, prev);
            Arena::set_free_blocks(em, root);

            if result.is_null() {
                Block::set_size(prev, 0);
                Arena::set_tail(em, prev);
            } else {
                merge_blocks(em, prev, result);
                result = prev;
            }
        }

        if !result.is_null() {
            let mut root = Arena::free_blocks(em);
            root = tree::insert(root, result);
            Arena::set_free_blocks(em, root);
        }
    }
}

/// Recovers the block backing `data`, validates it, and hands it to the
/// free engine. A no-op if `data` is null, misaligned, or doesn't look like
/// live allocator-owned memory — `free` of garbage is defined to do
/// nothing, never to crash.
///
/// # Safety
///
/// If `data` is non-null it must either be null or a pointer previously
/// returned by `alloc`/`alloc_aligned`/`calloc` on some still-live arena,
/// not already freed.
pub unsafe fn free(data: Option<NonNull<u8>>) {
    unsafe {
        let Some(data) = data else { return };
        let data = data.as_ptr();

        if (data as usize) % WORD_SIZE != 0 {
            return;
        }

        let spot_before = (data as usize - WORD_SIZE) as *const usize;
        let check = *spot_before ^ (data as usize);

        let block = if check == MAGIC_XOR {
            (data as usize - BLOCK_HEADER_SIZE) as *mut Block
        } else {
            if check % WORD_SIZE != 0 {
                return;
            }
            check as *mut Block
        };

        if Block::size(block) > SIZE_MASK {
            return;
        }
        if Block::is_free(block) {
            return;
        }
        if !Block::is_valid_magic(block, data) {
            return;
        }

        let em = Block::owner(block);
        if em.is_null() {
            return;
        }
        if !is_block_within_arena(em, block) {
            return;
        }

        free_block_full(em, block);
    }
}

impl Arena {
    /// Builds an arena over caller-owned `memory`, with a given base
    /// alignment. Returns `None` if `memory` is too small to hold an arena
    /// header plus one minimal block, or if `alignment` isn't a supported
    /// power of two.
    pub unsafe fn create_static_aligned(memory: &mut [u8], alignment: usize) -> Option<NonNull<Arena>> {
        unsafe {
            let size = memory.len();
            if size < ARENA_MIN_SIZE || size > SIZE_MASK {
                return None;
            }
            if !is_power_of_two(alignment) || alignment < MIN_ALIGNMENT || alignment > MAX_ALIGNMENT {
                return None;
            }

            let raw_addr = memory.as_mut_ptr() as usize;
            let aligned_addr = align_up(raw_addr, MIN_ALIGNMENT);
            let em_padding = aligned_addr - raw_addr;

            if size < em_padding + ARENA_HEADER_SIZE + BLOCK_MIN_SIZE {
                return None;
            }

            let em = aligned_addr as *mut Arena;

            let aligned_block_start =
                align_up(aligned_addr + BLOCK_HEADER_SIZE + ARENA_HEADER_SIZE, alignment) - BLOCK_HEADER_SIZE;
            let block = Block::create(aligned_block_start as *mut u8);

            let has_padding = aligned_block_start > aligned_addr + ARENA_HEADER_SIZE;
            if has_padding {
                let offset = aligned_block_start - em as usize;
                let detector = (aligned_block_start - WORD_SIZE) as *mut usize;
                *detector = (offset << 1) | 1;
            }

            Arena::set_alignment(em, alignment);
            Arena::set_capacity(em, size - em_padding);
            Arena::set_free_blocks(em, ptr::null_mut());
            Arena::set_has_scratch(em, false);
            Arena::set_has_padding(em, false);
            Arena::set_tail(em, block);
            Arena::set_is_dynamic(em, false);
            Arena::set_is_nested(em, false);

            NonNull::new(em)
        }
    }

    /// [`create_static_aligned`](Arena::create_static_aligned) with
    /// [`DEFAULT_ALIGNMENT`].
    pub unsafe fn create_static(memory: &mut [u8]) -> Option<NonNull<Arena>> {
        unsafe { Arena::create_static_aligned(memory, DEFAULT_ALIGNMENT) }
    }

    /// Allocates `size + header + alignment` bytes from the system
    /// allocator and builds an arena over them. Requires the `malloc`
    /// feature.
    #[cfg(feature = "malloc")]
    pub unsafe fn create_aligned(size: usize, alignment: usize) -> Option<NonNull<Arena>> {
        unsafe {
            if size < BLOCK_MIN_SIZE || size > SIZE_MASK {
                return None;
            }
            if !is_power_of_two(alignment) || alignment < MIN_ALIGNMENT || alignment > MAX_ALIGNMENT {
                return None;
            }

            let total = size + ARENA_HEADER_SIZE + alignment;
            let raw = libc::malloc(total) as *mut u8;
            if raw.is_null() {
                return None;
            }

            let memory = core::slice::from_raw_parts_mut(raw, total);
            let em = match Arena::create_static_aligned(memory, alignment) {
                Some(em) => em,
                None => {
                    libc::free(raw as *mut libc::c_void);
                    return None;
                }
            };

            Arena::set_is_dynamic(em.as_ptr(), true);
            Some(em)
        }
    }

    /// [`create_aligned`](Arena::create_aligned) with [`DEFAULT_ALIGNMENT`].
    #[cfg(feature = "malloc")]
    pub unsafe fn create(size: usize) -> Option<NonNull<Arena>> {
        unsafe { Arena::create_aligned(size, DEFAULT_ALIGNMENT) }
    }

    /// Allocates a block of `size` bytes from `self` and reinterprets it as
    /// a nested arena with its own alignment.
    pub unsafe fn create_nested_aligned(&mut self, size: usize, alignment: usize) -> Option<NonNull<Arena>> {
        unsafe {
            if size < BLOCK_MIN_SIZE || size > SIZE_MASK {
                return None;
            }
            if !is_power_of_two(alignment) || alignment < MIN_ALIGNMENT || alignment > MAX_ALIGNMENT {
                return None;
            }

            let data = self.alloc(size)?;
            let block = recover_block_from_fresh_alloc(data);

            let memory = core::slice::from_raw_parts_mut(block as *mut u8, size);
            let em = Arena::create_static_aligned(memory, alignment)?;
            Arena::set_is_nested(em.as_ptr(), true);
            Some(em)
        }
    }

    /// [`create_nested_aligned`](Arena::create_nested_aligned) using the
    /// parent's own alignment.
    pub unsafe fn create_nested(&mut self, size: usize) -> Option<NonNull<Arena>> {
        unsafe {
            let alignment = Arena::alignment(self as *const Arena);
            self.create_nested_aligned(size, alignment)
        }
    }

    /// Allocates a scratch block (see [`crate::arena`]'s scratch-region
    /// docs) from `self` and reinterprets it as a nested arena.
    pub unsafe fn create_scratch_aligned(&mut self, size: usize, alignment: usize) -> Option<NonNull<Arena>> {
        unsafe {
            if size < BLOCK_MIN_SIZE || size > SIZE_MASK {
                return None;
            }
            if !is_power_of_two(alignment) || alignment < MIN_ALIGNMENT || alignment > MAX_ALIGNMENT {
                return None;
            }

            let data = self.alloc_scratch_aligned(size, alignment)?;
            let block = (data.as_ptr() as usize - BLOCK_HEADER_SIZE) as *mut Block;
            Block::set_prev(block, self as *mut Arena as *mut Block);

            let memory = core::slice::from_raw_parts_mut(block as *mut u8, size);
            let em = Arena::create_static_aligned(memory, alignment)?;
            Arena::set_is_nested(em.as_ptr(), true);
            Some(em)
        }
    }

    /// [`create_scratch_aligned`](Arena::create_scratch_aligned) using the
    /// parent's own alignment.
    pub unsafe fn create_scratch(&mut self, size: usize) -> Option<NonNull<Arena>> {
        unsafe {
            let alignment = Arena::alignment(self as *const Arena);
            self.create_scratch_aligned(size, alignment)
        }
    }

    /// Allocates a block from `self` and turns it into a linear
    /// [`Bump`] sub-arena.
    pub unsafe fn create_bump(&mut self, size: usize) -> Option<NonNull<Bump>> {
        unsafe {
            if size > SIZE_MASK || size < crate::block::MIN_BUFFER_SIZE {
                return None;
            }

            let data = self.alloc(size)?;
            let block = recover_block_from_fresh_alloc(data);

            let bump = block as *mut Bump;
            Bump::set_owner(bump, self as *mut Arena);
            Bump::set_offset(bump, ARENA_HEADER_SIZE);

            NonNull::new(bump)
        }
    }

    /// Logically empties the arena: one fresh free block, no free tree, no
    /// scratch region. Does not touch the underlying bytes.
    pub unsafe fn reset(&mut self) {
        unsafe {
            let em = self as *mut Arena;
            let first = Arena::first_block(em);

            Block::set_size(first, 0);
            Block::set_prev(first, ptr::null_mut());
            Block::set_is_free(first, true);
            Block::set_color(first, crate::block::RED);
            Block::set_left(first, ptr::null_mut());
            Block::set_right(first, ptr::null_mut());

            Arena::set_free_blocks(em, ptr::null_mut());
            Arena::set_tail(em, first);
            Arena::set_has_scratch(em, false);
        }
    }

    /// [`reset`](Arena::reset), then zeroes the (now entirely free) tail
    /// payload.
    pub unsafe fn reset_zero(&mut self) {
        unsafe {
            self.reset();
            let em = self as *mut Arena;
            let tail = Arena::tail(em);
            ptr::write_bytes(Block::payload(tail), 0, free_size_in_tail(em));
        }
    }

    /// Tears the arena down: nested arenas free themselves as a block in
    /// their parent, dynamic arenas return memory to the system allocator,
    /// static arenas do nothing (the caller owns that memory).
    pub unsafe fn destroy(&mut self) {
        unsafe {
            let em = self as *mut Arena;
            if Arena::is_nested(em) {
                let parent = get_parent_arena(em as *mut Block);
                free_block_full(parent, em as *mut Block);
                return;
            }

            #[cfg(feature = "malloc")]
            if Arena::is_dynamic(em) {
                libc::free(em as *mut libc::c_void);
            }
        }
    }

    /// Clears the `HAS_SCRATCH` flag, releasing the scratch region back to
    /// the arena's tail accounting. Prefer freeing the scratch region's
    /// nested arena (if any) or calling [`free`] on its payload pointer;
    /// this is the low-level primitive both go through.
    pub unsafe fn free_scratch(&mut self) {
        unsafe {
            let em = self as *mut Arena;
            if !Arena::has_scratch(em) {
                return;
            }
            Arena::set_has_scratch(em, false);
        }
    }

    /// Allocates `size` bytes with a specific power-of-two `alignment`.
    pub unsafe fn alloc_aligned(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        unsafe {
            let em = self as *mut Arena;
            if size == 0 || size > Arena::capacity_raw(em) {
                return None;
            }
            if !is_power_of_two(alignment) || alignment < MIN_ALIGNMENT || alignment > MAX_ALIGNMENT {
                return None;
            }

            let result = alloc_in_free_blocks(em, size, alignment);
            if !result.is_null() {
                return NonNull::new(result);
            }

            if free_size_in_tail(em) == 0 {
                return None;
            }
            NonNull::new(alloc_in_tail_full(em, size, alignment))
        }
    }

    /// [`alloc_aligned`](Arena::alloc_aligned) with the arena's own
    /// alignment.
    pub unsafe fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        unsafe {
            let alignment = Arena::alignment(self as *const Arena);
            self.alloc_aligned(size, alignment)
        }
    }

    /// Allocates `nmemb * size` zero-initialized bytes. Rejects
    /// multiplication overflow.
    pub unsafe fn calloc(&mut self, nmemb: usize, size: usize) -> Option<NonNull<u8>> {
        unsafe {
            if nmemb > 0 && usize::MAX / nmemb < size {
                return None;
            }
            let total = nmemb * size;
            let ptr = self.alloc(total)?;
            ptr::write_bytes(ptr.as_ptr(), 0, total);
            Some(ptr)
        }
    }

    /// Carves a scratch region of `size` bytes from the physical far end of
    /// the arena, with a specific alignment. Fails if a scratch region is
    /// already active.
    pub unsafe fn alloc_scratch_aligned(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        unsafe {
            let em = self as *mut Arena;
            if size == 0 || Arena::has_scratch(em) || size > Arena::capacity_raw(em) {
                return None;
            }
            if !is_power_of_two(alignment) || alignment < MIN_ALIGNMENT || alignment > MAX_ALIGNMENT {
                return None;
            }
            if size > free_size_in_tail(em) {
                return None;
            }

            let raw_end_of_em = em as usize + Arena::capacity_raw(em);
            let mut end_of_em = raw_end_of_em;
            end_of_em = align_down(end_of_em, MIN_ALIGNMENT);
            end_of_em -= WORD_SIZE;
            let scratch_size_spot = end_of_em;

            let mut scratch_data_spot = end_of_em - size;
            scratch_data_spot = align_down(scratch_data_spot, alignment);

            let block_metadata_spot = scratch_data_spot - BLOCK_HEADER_SIZE;

            let tail = Arena::tail(em);
            debug_assert!(!tail.is_null() && Block::is_free(tail));

            if block_metadata_spot < Block::payload(tail) as usize + Block::size(tail) {
                return None;
            }

            let scratch_size = scratch_size_spot - scratch_data_spot;

            let scratch_block = Block::create(block_metadata_spot as *mut u8);
            Block::set_size(scratch_block, scratch_size);
            Block::set_is_free(scratch_block, false);
            Block::set_magic(scratch_block, scratch_data_spot as *mut u8);
            Block::set_owner(scratch_block, em);
            Block::set_scratch(scratch_block, true);

            *(scratch_size_spot as *mut usize) = raw_end_of_em - block_metadata_spot;

            Arena::set_has_scratch(em, true);

            NonNull::new(scratch_data_spot as *mut u8)
        }
    }

    /// [`alloc_scratch_aligned`](Arena::alloc_scratch_aligned) with the
    /// arena's own alignment.
    pub unsafe fn alloc_scratch(&mut self, size: usize) -> Option<NonNull<u8>> {
        unsafe {
            let alignment = Arena::alignment(self as *const Arena);
            self.alloc_scratch_aligned(size, alignment)
        }
    }
}

/// Recovers the [`Block`] backing a pointer that was *just* returned by
/// `alloc` on this same arena (used by `create_nested`/`create_bump`, which
/// need the block itself, not just its payload).
unsafe fn recover_block_from_fresh_alloc(data: NonNull<u8>) -> *mut Block {
    unsafe {
        let data = data.as_ptr();
        let spot_before = (data as usize - WORD_SIZE) as *const usize;
        let check = *spot_before ^ (data as usize);
        if check == MAGIC_XOR {
            (data as usize - BLOCK_HEADER_SIZE) as *mut Block
        } else {
            check as *mut Block
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_arena(buf: &mut [u8]) -> NonNull<Arena> {
        unsafe { Arena::create_static(buf).expect("arena should fit in buffer") }
    }

    #[test]
    fn carve_and_absorb() {
        let mut buf = vec![0u8; 1024];
        let em = new_arena(&mut buf);
        unsafe {
            let arena = &mut *em.as_ptr();
            let original_tail_free = arena.free_size_in_tail();

            let a = arena.alloc(512).expect("first alloc fits");
            let remaining = arena.free_size_in_tail();
            let b = arena.alloc(remaining).expect("absorbing the rest must succeed");
            assert_eq!(arena.free_size_in_tail(), 0);
            assert!(arena.alloc(1).is_none());

            free(Some(a));
            free(Some(b));
            assert_eq!(arena.free_size_in_tail(), original_tail_free);
        }
    }

    #[test]
    fn split_and_merge_reuse() {
        let mut buf = vec![0u8; 1024];
        let em = new_arena(&mut buf);
        unsafe {
            let arena = &mut *em.as_ptr();
            let a = arena.alloc(128).unwrap();
            let b = arena.alloc(128).unwrap();
            let _c = arena.alloc(128).unwrap();

            free(Some(a));
            free(Some(b));

            let merged_size = 2 * 128 + BLOCK_HEADER_SIZE;
            let merged = arena.alloc(merged_size).expect("merged block must be reused");
            free(Some(merged));
        }
    }

    #[test]
    fn padded_alignment_roundtrip() {
        let mut buf = vec![0u8; 4096];
        unsafe {
            let em = Arena::create_static_aligned(&mut buf, 16).unwrap();
            let arena = &mut *em.as_ptr();
            let ptr = arena.alloc_aligned(50, 16).expect("aligned alloc should succeed");
            assert_eq!(ptr.as_ptr() as usize % 16, 0);
            free(Some(ptr));
        }
    }

    #[test]
    fn heavy_shift_alignment_front_splits() {
        let mut buf = vec![0u8; 4096];
        unsafe {
            let em = Arena::create_static_aligned(&mut buf, 16).unwrap();
            let arena = &mut *em.as_ptr();
            let ptr = arena.alloc_aligned(50, 128).expect("heavily-aligned alloc should succeed");
            assert_eq!(ptr.as_ptr() as usize % 128, 0);
            free(Some(ptr));
        }
    }

    #[test]
    fn scratch_lifecycle() {
        let mut buf = vec![0u8; 2048];
        let em = new_arena(&mut buf);
        unsafe {
            let arena = &mut *em.as_ptr();
            let before = arena.free_size_in_tail();
            let scratch = arena.alloc_scratch(512).expect("scratch alloc should succeed");
            assert!(before - arena.free_size_in_tail() >= 512);

            assert!(arena.alloc(2048 - 512).is_none());
            let small = arena.alloc(128).expect("small alloc should still fit");

            free(Some(scratch));
            free(Some(small));
            assert_eq!(arena.free_size_in_tail(), before);
        }
    }

    #[test]
    fn nested_arena_destroy_returns_capacity() {
        let mut buf = vec![0u8; 8192];
        let em = new_arena(&mut buf);
        unsafe {
            let parent = &mut *em.as_ptr();
            let before = parent.free_size_in_tail();

            let mut nested = parent.create_nested(1024).expect("nested arena should be created");
            let inner = nested.as_mut().alloc(64).expect("alloc inside nested arena should succeed");
            free(Some(inner));

            nested.as_mut().destroy();
            assert_eq!(parent.free_size_in_tail(), before);
        }
    }

    #[test]
    fn tail_allocation_absorbs_remainder() {
        // When the remainder after an allocation would be smaller than
        // BLOCK_MIN_SIZE, the whole free tail is absorbed into the
        // allocation rather than leaving an unusable sliver behind.
        let mut buf = vec![0u8; 256];
        let em = new_arena(&mut buf);
        unsafe {
            let arena = &mut *em.as_ptr();
            let tail_free = arena.free_size_in_tail();
            let request = tail_free - BLOCK_MIN_SIZE + 1;
            let ptr = arena.alloc(request).expect("allocation near the full tail should succeed");
            assert_eq!(arena.free_size_in_tail(), 0);
            free(Some(ptr));
        }
    }
}
