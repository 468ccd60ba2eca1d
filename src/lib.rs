//! # rbarena - A Region-Based General-Purpose Allocator
//!
//! This crate provides a freestanding, header-tagged arena allocator: a
//! contiguous region of memory (caller-supplied or `malloc`-backed) carved
//! into a physical chain of [`Block`](block::Block)s, with free blocks
//! indexed by a left-leaning red-black tree for best-fit search.
//!
//! ## Overview
//!
//! An [`Arena`] owns one region of memory from end to end. Allocating walks
//! the free-block tree for a best fit; if nothing fits, it carves a fresh
//! block off the still-untouched tail. Freeing merges a block back into its
//! physical neighbors before reinserting whatever's left into the tree:
//!
//! ```text
//!   Arena layout:
//!
//!   ┌────────────┬───────────┬───────────┬──────┬─────────────────────────┐
//!   │ Arena      │  Block A  │  Block B  │ ...  │   free tail             │
//!   │ header     │ (occupied)│  (free)   │      │   (never yet carved)    │
//!   └────────────┴───────────┴───────────┴──────┴─────────────────────────┘
//!                      ▲            │
//!                      └── prev ────┘   physical chain, walked by free()
//!                                        to merge neighbors
//!
//!   Block B also sits in the arena's red-black free-block tree, keyed by
//!   (payload size, alignment quality, address) for best-fit lookup.
//! ```
//!
//! Arenas nest: [`Arena::create_nested`] carves a block and reinterprets it
//! as a child arena with its own tree and tail, and [`Arena::create_scratch`]
//! carves a throwaway region from the *far end* of the arena for strictly
//! stack-discipline use. [`Bump`] sub-arenas trade the tree for a plain
//! offset bump, for callers that only ever grow and never free individually.
//!
//! ## Crate Structure
//!
//! ```text
//!   rbarena
//!   ├── align   - Alignment arithmetic (align!, align_to!, align_up/down)
//!   ├── block   - Block header: size, physical links, free/occupied body
//!   ├── tree    - Left-leaning red-black tree of free blocks (best-fit)
//!   ├── arena   - Arena header, allocation/free engine, nesting, scratch
//!   └── bump    - Linear sub-arena carved from one arena block
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rbarena::Arena;
//!
//! fn main() {
//!     let mut memory = vec![0u8; 4096];
//!     unsafe {
//!         let mut arena = Arena::create_static(&mut memory).unwrap();
//!         let arena = arena.as_mut();
//!
//!         let ptr = arena.alloc(128).expect("allocation should fit");
//!         rbarena::free(Some(ptr));
//!     }
//! }
//! ```
//!
//! ## Block Header
//!
//! ```text
//!   Single block:
//!   ┌───────────────────────┬────────────────────────────────┐
//!   │     Block header      │          payload                │
//!   │  ┌─────────────────┐  │                                │
//!   │  │ size | align    │  │  ┌──────────────────────────┐  │
//!   │  │ prev | flags    │  │  │                          │  │
//!   │  │ left/right OR   │  │  │      N bytes usable      │  │
//!   │  │ owner/magic     │  │  │                          │  │
//!   │  └─────────────────┘  │  └──────────────────────────┘  │
//!   │     4 machine words   │                                │
//!   └───────────────────────┴────────────────────────────────┘
//!                           ▲
//!                           └── pointer returned to the caller
//! ```
//!
//! ## Features
//!
//! - `malloc` (default): backs [`Arena::create`]/[`Arena::create_aligned`]
//!   with a single `libc::malloc`/`libc::free` pair. Disabling it restricts
//!   the crate to caller-supplied memory ([`Arena::create_static`],
//!   nested and scratch arenas).
//! - `poison` (default): overwrites freed payloads with a fixed byte
//!   pattern in debug builds, so use-after-free reads stand out instead of
//!   silently appearing to work.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: no synchronization; an `Arena` must not be
//!   shared across threads without an external lock.
//! - **Best effort, not hardened**: `free` rejects garbage it can detect
//!   (misaligned pointers, bad magic, mismatched arena) but is not a defense
//!   against a deliberately adversarial caller.
//!
//! ## Safety
//!
//! This crate manages raw memory directly. Every mutating operation on an
//! [`Arena`] or [`Bump`] is `unsafe`: their invariants only hold if every
//! call they've ever seen went through these APIs, and callers must not use
//! memory after the arena that owns it has been destroyed.

pub mod align;
mod arena;
mod block;
mod bump;
mod tree;

pub use arena::{free, Arena, ARENA_MIN_SIZE};
pub use block::{
    BLOCK_MIN_SIZE, DEFAULT_ALIGNMENT, MAX_ALIGNMENT, MIN_ALIGNMENT, MIN_BUFFER_SIZE, POISON_BYTE,
};
pub use bump::Bump;
