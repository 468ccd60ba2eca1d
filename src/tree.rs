//! Left-leaning red-black tree of free blocks, keyed for best-fit search.
//!
//! Every [`Arena`](crate::arena::Arena) owns exactly one such tree (its
//! `free_blocks` field). Nodes are [`Block`]s already living in arena
//! memory — there's no separate tree-node allocation, the free/left/right
//! fields of a free block's body *are* the tree's intrusive links.
//!
//! Ordering is a triple key, each level only consulted when the previous
//! one ties:
//!
//! 1. payload size, ascending — the point of a best-fit tree
//! 2. alignment quality (CTZ of the payload address), ascending — clusters
//!    well-aligned addresses towards the right, where strict-alignment
//!    requests look first
//! 3. raw address, as a last-resort tiebreaker so every node compares
//!    distinctly and insertion order is irrelevant
//!
//! Deletion is the pragmatic kind: a plain BST splice (replace-with-successor
//! when a node has two children) followed by a single top-level [`balance`]
//! call, not a textbook LLRB delete that rebalances on every step back up
//! the path. The tree can end up with a short run of red links after a
//! delete; it's still a valid BST and best-fit search doesn't care about
//! color, so the simplification costs nothing a caller would notice.

use crate::align::alignment_quality;
use crate::block::Block;

#[inline]
unsafe fn is_red(block: *mut Block) -> bool {
    if block.is_null() {
        return false;
    }
    unsafe { Block::color(block) == crate::block::RED }
}

unsafe fn rotate_left(h: *mut Block) -> *mut Block {
    unsafe {
        let x = Block::right(h);
        Block::set_right(h, Block::left(x));
        Block::set_left(x, h);
        Block::set_color(x, Block::color(h));
        Block::set_color(h, crate::block::RED);
        x
    }
}

unsafe fn rotate_right(h: *mut Block) -> *mut Block {
    unsafe {
        let x = Block::left(h);
        Block::set_left(h, Block::right(x));
        Block::set_right(x, h);
        Block::set_color(x, Block::color(h));
        Block::set_color(h, crate::block::RED);
        x
    }
}

unsafe fn flip_colors(h: *mut Block) {
    unsafe {
        Block::set_color(h, crate::block::RED);
        Block::set_color(Block::left(h), crate::block::BLACK);
        Block::set_color(Block::right(h), crate::block::BLACK);
    }
}

/// Restores the LLRB shape invariant at `h` after a local change. Not a
/// recursive whole-path rebalance — callers that mutate along a path fold
/// this in at every level on the way back up (insert), or call it once at
/// the root (the detach fast path).
unsafe fn balance(h: *mut Block) -> *mut Block {
    unsafe {
        let mut h = h;
        if is_red(Block::right(h)) {
            h = rotate_left(h);
        }
        if is_red(Block::left(h)) && is_red(Block::left(Block::left(h))) {
            h = rotate_right(h);
        }
        if is_red(Block::left(h)) && is_red(Block::right(h)) {
            flip_colors(h);
        }
        h
    }
}

fn key_of(block: *const Block) -> (usize, u32, usize) {
    unsafe {
        let size = Block::size(block);
        let quality = alignment_quality(Block::payload(block as *mut Block) as usize);
        (size, quality, block as usize)
    }
}

/// Inserts `new_block` (a single, already-detached node) into the tree
/// rooted at `root` and returns the new root.
pub(crate) unsafe fn insert(root: *mut Block, new_block: *mut Block) -> *mut Block {
    unsafe {
        if root.is_null() {
            return new_block;
        }

        let (h_size, h_quality, _) = key_of(root);
        let (new_size, new_quality, _) = key_of(new_block);

        if new_size < h_size {
            Block::set_left(root, insert(Block::left(root), new_block));
        } else if new_size > h_size {
            Block::set_right(root, insert(Block::right(root), new_block));
        } else if new_quality < h_quality {
            Block::set_left(root, insert(Block::left(root), new_block));
        } else if new_quality > h_quality {
            Block::set_right(root, insert(Block::right(root), new_block));
        } else if (new_block as usize) > (root as usize) {
            Block::set_left(root, insert(Block::left(root), new_block));
        } else {
            Block::set_right(root, insert(Block::right(root), new_block));
        }

        balance(root)
    }
}

/// Finds the smallest free block whose payload can satisfy `size` bytes at
/// `alignment` once alignment padding is accounted for. Returns the block
/// together with its parent (`None` if it's the root), for a subsequent
/// [`detach_fast`] call.
pub(crate) unsafe fn find_best_fit(
    root: *mut Block,
    size: usize,
    alignment: usize,
) -> (*mut Block, *mut Block) {
    unsafe {
        let mut best: *mut Block = core::ptr::null_mut();
        let mut best_parent: *mut Block = core::ptr::null_mut();
        let mut current = root;
        let mut current_parent: *mut Block = core::ptr::null_mut();

        while !current.is_null() {
            let current_size = Block::size(current);

            if current_size < size {
                current_parent = current;
                current = Block::right(current);
                continue;
            }

            let data_ptr = Block::payload(current) as usize;
            let aligned_ptr = crate::align::align_up(data_ptr, alignment);
            let padding = aligned_ptr - data_ptr;

            if current_size >= size + padding {
                if best.is_null() || current_size < Block::size(best) {
                    best_parent = current_parent;
                    best = current;
                }
                current_parent = current;
                current = Block::left(current);
            } else {
                current_parent = current;
                current = Block::right(current);
            }
        }

        (best, best_parent)
    }
}

/// Splices `target` (found at `parent`, or at `*tree_root` if `parent` is
/// null) out of the tree and rebalances once at the new root.
pub(crate) unsafe fn detach_fast(tree_root: &mut *mut Block, target: *mut Block, parent: *mut Block) {
    unsafe {
        let left_child = Block::left(target);
        let right_child = Block::right(target);

        let replacement = if right_child.is_null() {
            left_child
        } else if left_child.is_null() {
            right_child
        } else {
            let mut min_parent = target;
            let mut min_node = right_child;
            while !Block::left(min_node).is_null() {
                min_parent = min_node;
                min_node = Block::left(min_node);
            }
            if min_parent != target {
                Block::set_left(min_parent, Block::right(min_node));
                Block::set_right(min_node, right_child);
            }
            Block::set_left(min_node, left_child);
            min_node
        };

        if parent.is_null() {
            *tree_root = replacement;
        } else if Block::left(parent) == target {
            Block::set_left(parent, replacement);
        } else {
            Block::set_right(parent, replacement);
        }

        Block::set_left(target, core::ptr::null_mut());
        Block::set_right(target, core::ptr::null_mut());
        Block::set_color(target, crate::block::RED);

        if !(*tree_root).is_null() {
            *tree_root = balance(*tree_root);
        }
    }
}

/// Finds the best-fitting block and detaches it in one step. Returns the
/// detached block, or null if nothing in the tree fits.
pub(crate) unsafe fn find_and_detach(
    tree_root: &mut *mut Block,
    size: usize,
    alignment: usize,
) -> *mut Block {
    unsafe {
        if tree_root.is_null() {
            return core::ptr::null_mut();
        }

        let (best, parent) = find_best_fit(*tree_root, size, alignment);
        if !best.is_null() {
            detach_fast(tree_root, best, parent);
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::WORD_SIZE;

    const SLOT: usize = 64;

    /// A backing buffer big enough to hold `count` independent [`Block`]
    /// headers, each far enough apart that their payload ranges never
    /// overlap the next header.
    struct Slab {
        buf: Vec<u8>,
    }

    impl Slab {
        fn new(count: usize) -> Self {
            Slab { buf: vec![0u8; count * SLOT] }
        }

        unsafe fn block(&mut self, index: usize, size: usize) -> *mut Block {
            unsafe {
                let at = self.buf.as_mut_ptr().add(index * SLOT);
                let block = Block::create(at);
                Block::set_size(block, size);
                block
            }
        }
    }

    /// In-order traversal as a `(size, quality, address)` key sequence, to
    /// check the tree stays sorted after inserts/detaches.
    unsafe fn in_order_keys(root: *mut Block) -> Vec<(usize, u32, usize)> {
        unsafe {
            if root.is_null() {
                return Vec::new();
            }
            let mut out = in_order_keys(Block::left(root));
            out.push(key_of(root));
            out.extend(in_order_keys(Block::right(root)));
            out
        }
    }

    #[test]
    fn insert_keeps_size_ascending_order() {
        let mut slab = Slab::new(5);
        unsafe {
            let sizes = [128usize, 16, 512, 64, 256];
            let mut root: *mut Block = core::ptr::null_mut();
            for (i, &size) in sizes.iter().enumerate() {
                let block = slab.block(i, size);
                root = insert(root, block);
            }

            let keys = in_order_keys(root);
            let observed: Vec<usize> = keys.iter().map(|k| k.0).collect();
            assert_eq!(observed, vec![16, 64, 128, 256, 512]);
        }
    }

    #[test]
    fn best_fit_finds_smallest_sufficient_block() {
        let mut slab = Slab::new(4);
        unsafe {
            let mut root: *mut Block = core::ptr::null_mut();
            for (i, &size) in [32usize, 128, 64, 256].iter().enumerate() {
                root = insert(root, slab.block(i, size));
            }

            let (found, _) = find_best_fit(root, 100, WORD_SIZE);
            assert!(!found.is_null());
            assert_eq!(Block::size(found), 128, "128 is the smallest block that still fits 100 bytes");
        }
    }

    #[test]
    fn best_fit_returns_null_when_nothing_is_large_enough() {
        let mut slab = Slab::new(3);
        unsafe {
            let mut root: *mut Block = core::ptr::null_mut();
            for (i, &size) in [16usize, 32, 64].iter().enumerate() {
                root = insert(root, slab.block(i, size));
            }

            let (found, _) = find_best_fit(root, 1000, WORD_SIZE);
            assert!(found.is_null());
        }
    }

    #[test]
    fn best_fit_skips_blocks_too_small_once_alignment_padding_is_applied() {
        // A block whose raw size is >= the request can still be rejected if
        // the padding needed to reach the requested alignment eats into it.
        let mut slab = Slab::new(2);
        unsafe {
            let tight = slab.block(0, 64);
            let roomy = slab.block(1, 256);

            let mut root: *mut Block = core::ptr::null_mut();
            root = insert(root, tight);
            root = insert(root, roomy);

            let huge_alignment = 256 * WORD_SIZE;
            let (found, _) = find_best_fit(root, 64, huge_alignment);
            // Whichever block is found (if any) must actually have room for
            // 64 bytes once aligned up to `huge_alignment`.
            if !found.is_null() {
                let data = Block::payload(found) as usize;
                let padding = crate::align::align_up(data, huge_alignment) - data;
                assert!(Block::size(found) >= 64 + padding);
            }
        }
    }

    #[test]
    fn find_and_detach_removes_the_returned_node_from_the_tree() {
        let mut slab = Slab::new(5);
        unsafe {
            let mut root: *mut Block = core::ptr::null_mut();
            for (i, &size) in [16usize, 32, 64, 128, 256].iter().enumerate() {
                root = insert(root, slab.block(i, size));
            }

            let detached = find_and_detach(&mut root, 50, WORD_SIZE);
            assert_eq!(Block::size(detached), 64);

            let remaining: Vec<usize> = in_order_keys(root).iter().map(|k| k.0).collect();
            assert_eq!(remaining, vec![16, 32, 128, 256]);
        }
    }

    #[test]
    fn detach_by_ptr_removes_an_arbitrary_node_not_just_the_best_fit() {
        let mut slab = Slab::new(4);
        unsafe {
            let mut root: *mut Block = core::ptr::null_mut();
            let mut nodes = Vec::new();
            for (i, &size) in [16usize, 32, 64, 128].iter().enumerate() {
                let block = slab.block(i, size);
                nodes.push(block);
                root = insert(root, block);
            }

            // Detach the middle-sized node, not whatever best-fit would pick.
            detach_by_ptr(&mut root, nodes[1]);

            let remaining: Vec<usize> = in_order_keys(root).iter().map(|k| k.0).collect();
            assert_eq!(remaining, vec![16, 64, 128]);
        }
    }

    #[test]
    fn detach_fast_on_a_leaf_shrinks_the_tree_by_exactly_one() {
        let mut slab = Slab::new(3);
        unsafe {
            let mut root: *mut Block = core::ptr::null_mut();
            for (i, &size) in [16usize, 32, 64].iter().enumerate() {
                root = insert(root, slab.block(i, size));
            }

            let before = in_order_keys(root).len();
            let victim = find_and_detach(&mut root, 1, WORD_SIZE);
            assert!(!victim.is_null());
            assert_eq!(in_order_keys(root).len(), before - 1);
        }
    }
}

/// Finds `target`'s parent by walking the same triple-key ordering used to
/// insert it, then detaches it. Used when a specific block (not "the best
/// fit") needs to leave the tree, e.g. because it's about to merge with a
/// freshly-freed neighbor.
pub(crate) unsafe fn detach_by_ptr(tree_root: &mut *mut Block, target: *mut Block) {
    unsafe {
        let mut parent: *mut Block = core::ptr::null_mut();
        let mut current = *tree_root;

        let (target_size, target_quality, _) = key_of(target);

        while !current.is_null() && current != target {
            parent = current;
            let current_size = Block::size(current);

            if target_size < current_size {
                current = Block::left(current);
            } else if target_size > current_size {
                current = Block::right(current);
            } else {
                let current_quality = alignment_quality(Block::payload(current) as usize);
                if target_quality < current_quality {
                    current = Block::left(current);
                } else if target_quality > current_quality {
                    current = Block::right(current);
                } else if (target as usize) > (current as usize) {
                    current = Block::left(current);
                } else {
                    current = Block::right(current);
                }
            }
        }

        if current == target {
            detach_fast(tree_root, target, parent);
        }
    }
}
