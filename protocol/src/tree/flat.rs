//! Flat-tree index arithmetic.
//!
//! Every node of the log's binary tree gets a fixed position in one flat
//! sequence, so parents, siblings and spans are pure bit twiddling and no
//! pointers are ever stored:
//!
//! ```text
//!              3
//!          /       \
//!        1           5
//!      /   \       /   \
//!     0     2     4     6     8
//! ```
//!
//! Leaves (blocks) sit at even indices: block `i` is node `2i`. A node's depth
//! is the number of trailing one bits of its index.

/// Node index from depth and offset within that depth.
pub fn index(depth: u64, offset: u64) -> u64 {
    (offset << (depth + 1)) | ((1 << depth) - 1)
}

/// Height above the leaves. Leaves are depth 0.
pub fn depth(index: u64) -> u64 {
    index.trailing_ones() as u64
}

/// Position of a node among the nodes of the same depth.
pub fn offset(index: u64) -> u64 {
    index >> (depth(index) + 1)
}

pub fn parent(index: u64) -> u64 {
    let d = depth(index);
    self::index(d + 1, offset(index) >> 1)
}

pub fn sibling(index: u64) -> u64 {
    let d = depth(index);
    self::index(d, offset(index) ^ 1)
}

/// True when the node is the left child of its parent.
pub fn is_left(index: u64) -> bool {
    offset(index) & 1 == 0
}

pub fn left_child(index: u64) -> Option<u64> {
    let d = depth(index);
    if d == 0 {
        return None;
    }
    Some(self::index(d - 1, offset(index) << 1))
}

pub fn right_child(index: u64) -> Option<u64> {
    let d = depth(index);
    if d == 0 {
        return None;
    }
    Some(self::index(d - 1, (offset(index) << 1) + 1))
}

/// Leftmost leaf (as a node index) under this node.
pub fn left_span(index: u64) -> u64 {
    let d = depth(index);
    if d == 0 {
        return index;
    }
    offset(index) * (2 << d)
}

/// Rightmost leaf (as a node index) under this node.
pub fn right_span(index: u64) -> u64 {
    let d = depth(index);
    if d == 0 {
        return index;
    }
    (offset(index) + 1) * (2 << d) - 2
}

/// Roots of the complete subtrees covering every node left of `index`.
///
/// `index` must be even; for a log of `n` blocks pass `2n`. Roots come back
/// left to right, largest first.
pub fn full_roots(index: u64) -> Vec<u64> {
    let mut roots = Vec::new();
    let mut remaining = index >> 1;
    let mut offset = 0;
    let mut factor = 1;

    while remaining > 0 {
        while factor * 2 <= remaining {
            factor *= 2;
        }
        roots.push(offset + factor - 1);
        offset += 2 * factor;
        remaining -= factor;
        factor = 1;
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_and_offset() {
        assert_eq!(depth(0), 0);
        assert_eq!(depth(1), 1);
        assert_eq!(depth(3), 2);
        assert_eq!(depth(7), 3);
        assert_eq!(offset(4), 2);
        assert_eq!(offset(5), 1);
        assert_eq!(index(1, 1), 5);
        assert_eq!(index(0, 3), 6);
    }

    #[test]
    fn family_relations() {
        assert_eq!(parent(0), 1);
        assert_eq!(parent(2), 1);
        assert_eq!(parent(1), 3);
        assert_eq!(parent(5), 3);
        assert_eq!(sibling(0), 2);
        assert_eq!(sibling(5), 1);
        assert_eq!(sibling(3), 11);
        assert_eq!(left_child(3), Some(1));
        assert_eq!(right_child(3), Some(5));
        assert_eq!(left_child(4), None);
        assert!(is_left(1));
        assert!(!is_left(5));
    }

    #[test]
    fn spans_cover_leaves() {
        assert_eq!(left_span(3), 0);
        assert_eq!(right_span(3), 6);
        assert_eq!(left_span(9), 8);
        assert_eq!(right_span(9), 10);
        assert_eq!(left_span(7), 0);
        assert_eq!(right_span(7), 14);
        assert_eq!(right_span(4), 4);
    }

    #[test]
    fn full_roots_match_binary_decomposition() {
        assert!(full_roots(0).is_empty());
        assert_eq!(full_roots(2), vec![0]);
        assert_eq!(full_roots(6), vec![1, 4]);
        assert_eq!(full_roots(8), vec![3]);
        assert_eq!(full_roots(14), vec![3, 9, 12]);
        assert_eq!(full_roots(16), vec![7]);
    }

    #[test]
    fn children_of_parent_round_trip() {
        for i in 0..64u64 {
            let p = parent(i);
            let kids = [left_child(p).unwrap(), right_child(p).unwrap()];
            assert!(kids.contains(&i));
            assert!(kids.contains(&sibling(i)));
        }
    }
}
