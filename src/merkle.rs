//! The per-file merkle hash tree of v2 torrents.
//!
//! Each v2 file carries a perfect binary tree over `num_leafs =
//! next_pow2(num_blocks)` leaves, where a leaf is the SHA-256 of one 16 KiB
//! block and leaves past the end of the file are defined as 32 zero bytes.
//! The tree is stored as a dense node array (heap layout, root at index 0)
//! plus a bitmap of which nodes hold values verified against the root.
//!
//! A hash only ever enters the verified set by hashing up to a node that is
//! already verified. The root comes from the torrent metainfo and is
//! verified by construction.

use bitvec::prelude::{bitvec, Msb0};
use sha2::{Digest, Sha256};

use crate::{Bitfield, Sha256Hash};

/// Returns the number of leaves in the tree of a file with the given number
/// of blocks: the next power of two, at least 1.
pub(crate) fn num_leafs(num_blocks: usize) -> usize {
    num_blocks.max(1).next_power_of_two()
}

/// Returns the total node count of a perfect binary tree with the given
/// (power of two) number of leaves.
pub(crate) fn num_nodes(num_leafs: usize) -> usize {
    debug_assert!(num_leafs.is_power_of_two());
    2 * num_leafs - 1
}

/// The number of layers below the root: `log2(num_leafs)`.
pub(crate) fn num_layers(num_leafs: usize) -> usize {
    debug_assert!(num_leafs.is_power_of_two());
    num_leafs.trailing_zeros() as usize
}

/// The node index of the first (left-most) leaf.
pub(crate) fn first_leaf(num_leafs: usize) -> usize {
    num_leafs - 1
}

pub(crate) fn parent(node: usize) -> usize {
    debug_assert!(node > 0);
    (node - 1) / 2
}

pub(crate) fn left_child(node: usize) -> usize {
    2 * node + 1
}

pub(crate) fn right_child(node: usize) -> usize {
    2 * node + 2
}

pub(crate) fn sibling(node: usize) -> usize {
    debug_assert!(node > 0);
    ((node - 1) ^ 1) + 1
}

/// Hashes two sibling nodes into their parent.
pub(crate) fn combine(left: &Sha256Hash, right: &Sha256Hash) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let digest = hasher.finalize();
    let mut hash = [0; 32];
    hash.copy_from_slice(&digest);
    hash
}

/// The hash of an all-pad subtree whose root is `layer` levels above the
/// leaves: zero bytes at layer 0, combined with itself at each level up.
pub(crate) fn pad_hash(layer: usize) -> Sha256Hash {
    let mut hash = [0; 32];
    for _ in 0..layer {
        hash = combine(&hash, &hash);
    }
    hash
}

/// Folds a run of leaf hashes into the root of the smallest perfect subtree
/// containing them, padding with `pad` to the next power of two.
///
/// This is how a piece hash is computed from its block hashes.
pub(crate) fn root_from_leaves(
    leaves: &[Sha256Hash],
    pad: &Sha256Hash,
) -> Sha256Hash {
    debug_assert!(!leaves.is_empty());
    let width = num_leafs(leaves.len());
    let mut layer: Vec<Sha256Hash> = Vec::with_capacity(width);
    layer.extend_from_slice(leaves);
    layer.resize(width, *pad);
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| combine(&pair[0], &pair[1]))
            .collect();
    }
    layer[0]
}

/// The outcome of offering a single block (leaf) hash to the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockHashResult {
    /// The leaf hashed up to a verified ancestor; it and every intermediate
    /// node on the way are now part of the verified set.
    Success,
    /// The leaf was recorded but there aren't enough sibling hashes yet to
    /// connect it to a verified ancestor.
    Unknown,
    /// The leaf contradicts a verified ancestor through verified siblings
    /// only: this exact block is corrupt. No other block's state changed.
    BlockHashFailed,
    /// A full set of sibling leaves computed an ancestor that disagrees with
    /// the verified value, but some of those siblings were themselves
    /// unverified: the covered range must be re-downloaded, the culprit is
    /// not pinpointed. All pending leaves under the ancestor are dropped.
    PieceHashFailed,
}

/// A sparse merkle tree for one file of a v2 torrent.
#[derive(Debug)]
pub(crate) struct MerkleTree {
    /// The number of actual 16 KiB blocks in the file (leaves that are not
    /// padding).
    num_blocks: usize,
    /// Blocks per piece; a power of two. The piece layer of this tree sits
    /// `log2(blocks_per_piece)` levels above the leaves.
    blocks_per_piece: usize,
    /// Dense node array in heap order; only entries flagged in `verified`
    /// hold meaningful values.
    nodes: Vec<Sha256Hash>,
    /// Which nodes hold values verified up to the root.
    verified: Bitfield,
    /// Leaf hashes that have been offered but can't be verified yet, keyed
    /// by block index. Bounded by the number of blocks in flight.
    pending: std::collections::HashMap<usize, Sha256Hash>,
}

impl MerkleTree {
    /// Creates a tree with only the root materialized (from the metainfo's
    /// `pieces root` of the file).
    pub fn new(
        num_blocks: usize,
        blocks_per_piece: usize,
        root: Sha256Hash,
    ) -> Self {
        debug_assert!(blocks_per_piece.is_power_of_two());
        let leafs = num_leafs(num_blocks);
        let node_count = num_nodes(leafs);
        let mut nodes = vec![[0; 32]; node_count];
        nodes[0] = root;
        let mut verified = bitvec![Msb0, u8; 0; node_count];
        verified.set(0, true);
        Self {
            num_blocks,
            blocks_per_piece,
            nodes,
            verified,
            pending: Default::default(),
        }
    }

    pub fn root(&self) -> &Sha256Hash {
        &self.nodes[0]
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    fn num_leafs(&self) -> usize {
        num_leafs(self.num_blocks)
    }

    fn num_layers(&self) -> usize {
        num_layers(self.num_leafs())
    }

    /// The layer (counted up from the leaves) at which one node covers
    /// exactly one piece. Clamped to the root for files smaller than one
    /// piece.
    pub fn piece_layer(&self) -> usize {
        num_layers(self.blocks_per_piece).min(self.num_layers())
    }

    /// The number of pieces this file spans.
    pub fn num_pieces(&self) -> usize {
        (self.num_blocks + self.blocks_per_piece - 1) / self.blocks_per_piece
    }

    /// The node index of `offset` within `layer` (layers counted up from the
    /// leaves: layer 0 is the leaf layer).
    fn node_index(&self, layer: usize, offset: usize) -> usize {
        let width = self.num_leafs() >> layer;
        debug_assert!(offset < width);
        width - 1 + offset
    }

    /// Whether the node holds a value verified against the root.
    pub fn has_node(&self, node: usize) -> bool {
        self.verified[node]
    }

    /// The verified value of a node, if any. Nodes of all-padding subtrees
    /// have a defined value and count as verified.
    pub fn node_value(&self, node: usize) -> Option<Sha256Hash> {
        if self.verified[node] {
            return Some(self.nodes[node]);
        }
        self.pad_value(node)
    }

    /// If the subtree under `node` consists entirely of padding leaves, its
    /// defined (all-zeros derived) value.
    fn pad_value(&self, node: usize) -> Option<Sha256Hash> {
        let (layer, offset) = self.coords(node);
        let first_covered_leaf = offset << layer;
        if first_covered_leaf >= self.num_blocks {
            Some(pad_hash(layer))
        } else {
            None
        }
    }

    /// Returns `(layer, offset)` of a node index.
    fn coords(&self, node: usize) -> (usize, usize) {
        let mut width = self.num_leafs();
        let mut layer = 0;
        loop {
            let start = width - 1;
            if node >= start {
                return (layer, node - start);
            }
            width >>= 1;
            layer += 1;
        }
    }

    /// The verified hash of the piece-layer node of the given piece within
    /// this file, if present.
    pub fn piece_root(&self, piece: usize) -> Option<Sha256Hash> {
        let layer = self.piece_layer();
        if piece >= self.num_leafs() >> layer {
            return None;
        }
        self.node_value(self.node_index(layer, piece))
    }

    /// Loads a full tree (all `num_nodes` hashes in heap order), verifying
    /// it bottom-up against the root. On any mismatch nothing is changed and
    /// false is returned. Padding leaves are not marked verified; their
    /// values are defined anyway.
    pub fn load_tree(&mut self, hashes: &[Sha256Hash]) -> bool {
        if hashes.len() != self.nodes.len() {
            return false;
        }
        if &hashes[0] != self.root() {
            return false;
        }
        for node in 0..first_leaf(self.num_leafs()) {
            let computed = combine(
                &hashes[left_child(node)],
                &hashes[right_child(node)],
            );
            if computed != hashes[node] {
                return false;
            }
        }
        self.nodes.copy_from_slice(hashes);
        // with the root matching and every combine checked, all values are
        // pinned; only the pad leaves stay unmarked (their value is defined,
        // not stored)
        let fl = first_leaf(self.num_leafs());
        for node in 0..self.nodes.len() {
            self.verified.set(node, node < fl + self.num_blocks);
        }
        true
    }

    /// Loads a sparse tree: `hashes` holds the values of exactly the nodes
    /// flagged in `mask`, in index order. The loaded set must be internally
    /// consistent and consistent with the root, otherwise nothing is kept.
    pub fn load_sparse_tree(
        &mut self,
        hashes: &[Sha256Hash],
        mask: &[bool],
    ) -> bool {
        if mask.len() != self.nodes.len() {
            return false;
        }
        if mask.iter().filter(|b| **b).count() != hashes.len() {
            return false;
        }

        let mut nodes = self.nodes.clone();
        let mut hashes = hashes.iter();
        for (node, flagged) in mask.iter().enumerate() {
            if *flagged {
                nodes[node] = *hashes.next().expect("count checked above");
            }
        }
        if mask[0] && &nodes[0] != self.root() {
            return false;
        }

        // Every flagged node must chain up to the root through flagged (or
        // pad) siblings; otherwise its value is unverifiable and the whole
        // load is rejected.
        for (node, flagged) in mask.iter().enumerate() {
            if !*flagged || node == 0 {
                continue;
            }
            let sib = sibling(node);
            let sib_value = if mask[sib] {
                nodes[sib]
            } else if let Some(pad) = self.pad_value(sib) {
                pad
            } else {
                return false;
            };
            let (left, right) = if node < sib {
                (nodes[node], sib_value)
            } else {
                (sib_value, nodes[node])
            };
            let up = parent(node);
            if !mask[up] && self.pad_value(up).is_none() {
                return false;
            }
            let expected = if mask[up] { nodes[up] } else { self.nodes[up] };
            if combine(&left, &right) != expected {
                return false;
            }
        }

        self.nodes = nodes;
        for (node, flagged) in mask.iter().enumerate() {
            if *flagged {
                self.verified.set(node, true);
            }
        }
        self.verified.set(0, true);
        true
    }

    /// Serializes the verified node set as `(hashes, mask)`, the inverse of
    /// [`load_sparse_tree`].
    pub fn to_sparse(&self) -> (Vec<Sha256Hash>, Vec<bool>) {
        let mask: Vec<bool> =
            (0..self.nodes.len()).map(|n| self.verified[n]).collect();
        let hashes = mask
            .iter()
            .enumerate()
            .filter(|(_, flagged)| **flagged)
            .map(|(node, _)| self.nodes[node])
            .collect();
        (hashes, mask)
    }

    /// Imports the file's entry of the metainfo's `piece layers` dictionary:
    /// one hash per piece. The layer is padded with all-pad subtree hashes,
    /// folded to the root and only accepted if it matches.
    pub fn import_piece_layer(&mut self, layer: &[Sha256Hash]) -> bool {
        let piece_layer = self.piece_layer();
        if layer.len() != self.num_pieces() {
            return false;
        }
        let width = self.num_leafs() >> piece_layer;
        let pad = pad_hash(piece_layer);
        let root = root_from_leaves(layer, &pad);
        if &root != self.root() {
            return false;
        }

        // materialize the piece layer and everything above it
        let mut offset_hashes: Vec<Sha256Hash> = Vec::with_capacity(width);
        offset_hashes.extend_from_slice(layer);
        offset_hashes.resize(width, pad);
        let mut current_layer = piece_layer;
        while current_layer <= self.num_layers() {
            for (offset, hash) in offset_hashes.iter().enumerate() {
                let node = self.node_index(current_layer, offset);
                if self.pad_value(node).is_none() {
                    self.nodes[node] = *hash;
                    self.verified.set(node, true);
                }
            }
            if offset_hashes.len() == 1 {
                break;
            }
            offset_hashes = offset_hashes
                .chunks(2)
                .map(|pair| combine(&pair[0], &pair[1]))
                .collect();
            current_layer += 1;
        }
        true
    }

    /// Returns the piece layer (one verified hash per piece) for writing
    /// back into a torrent file or resume data, if fully present.
    pub fn piece_layer_hashes(&self) -> Option<Vec<Sha256Hash>> {
        let layer = self.piece_layer();
        (0..self.num_pieces())
            .map(|piece| self.node_value(self.node_index(layer, piece)))
            .collect()
    }

    /// Adds a run of `hashes` at `layer` starting at `offset`, accompanied
    /// by `proofs`: sibling hashes of the covering subtree root, ascending.
    /// The run length must be a power of two and aligned to it. The batch is
    /// accepted only if it hashes up to a verified ancestor; on mismatch (or
    /// if it can't reach one) nothing is mutated.
    pub fn add_hashes(
        &mut self,
        layer: usize,
        offset: usize,
        hashes: &[Sha256Hash],
        proofs: &[Sha256Hash],
    ) -> bool {
        if hashes.is_empty()
            || !hashes.len().is_power_of_two()
            || offset % hashes.len() != 0
        {
            return false;
        }
        let layer_width = self.num_leafs() >> layer;
        if layer > self.num_layers() || offset + hashes.len() > layer_width {
            return false;
        }

        // fold the run into its own subtree, keeping every intermediate
        // layer so it can be materialized on success
        let mut layers: Vec<Vec<Sha256Hash>> = vec![hashes.to_vec()];
        while layers.last().expect("nonempty").len() > 1 {
            let prev = layers.last().expect("nonempty");
            let next: Vec<Sha256Hash> = prev
                .chunks(2)
                .map(|pair| combine(&pair[0], &pair[1]))
                .collect();
            layers.push(next);
        }

        let subtree_root_layer = layer + layers.len() - 1;
        let mut node =
            self.node_index(subtree_root_layer, offset >> (layers.len() - 1));
        let mut current = *layers.last().expect("nonempty").first().unwrap();
        let mut used_proofs = Vec::new();

        // ascend to a verified ancestor, consuming proofs as siblings
        let mut proofs = proofs.iter();
        loop {
            if self.verified[node] {
                if self.nodes[node] != current {
                    return false;
                }
                break;
            }
            let sib = sibling(node);
            let sib_value = if let Some(value) = self.node_value(sib) {
                value
            } else if let Some(proof) = proofs.next() {
                *proof
            } else {
                // can't connect the batch to anything we trust
                return false;
            };
            used_proofs.push((sib, sib_value));
            let (left, right) = if node < sib {
                (current, sib_value)
            } else {
                (sib_value, current)
            };
            current = combine(&left, &right);
            node = parent(node);
            used_proofs.push((node, current));
        }

        // verified: materialize the run, its folded layers, and the proof
        // path
        for (i, layer_hashes) in layers.iter().enumerate() {
            let l = layer + i;
            for (j, hash) in layer_hashes.iter().enumerate() {
                let n = self.node_index(l, (offset >> i) + j);
                if self.pad_value(n).is_none() {
                    self.nodes[n] = *hash;
                    self.verified.set(n, true);
                }
            }
        }
        for (n, value) in used_proofs {
            if self.pad_value(n).is_none() {
                self.nodes[n] = value;
                self.verified.set(n, true);
            }
        }
        true
    }

    /// Returns `count` hashes at `layer` starting at `offset`, followed by
    /// the sibling hashes of the covering subtree root ascending
    /// `proof_layers` levels. `None` if any requested node is missing.
    pub fn get_hashes(
        &self,
        layer: usize,
        offset: usize,
        count: usize,
        proof_layers: usize,
    ) -> Option<Vec<Sha256Hash>> {
        if count == 0 || !count.is_power_of_two() || offset % count != 0 {
            return None;
        }
        if layer > self.num_layers()
            || offset + count > self.num_leafs() >> layer
        {
            return None;
        }

        let mut out = Vec::with_capacity(count + proof_layers);
        for i in 0..count {
            out.push(self.node_value(self.node_index(layer, offset + i))?);
        }

        let subtree_layers = num_layers(count);
        let mut node =
            self.node_index(layer + subtree_layers, offset >> subtree_layers);
        for _ in 0..proof_layers {
            if node == 0 {
                break;
            }
            out.push(self.node_value(sibling(node))?);
            node = parent(node);
        }
        Some(out)
    }

    /// Offers a single block's leaf hash. See [`BlockHashResult`].
    ///
    /// Verification happens at the granularity of the subtree under the
    /// nearest verified ancestor (normally the piece-layer node): once every
    /// leaf under it is known, the subtree is folded and compared.
    pub fn set_block_hash(
        &mut self,
        block: usize,
        hash: Sha256Hash,
    ) -> BlockHashResult {
        debug_assert!(block < self.num_blocks);
        if block >= self.num_blocks {
            return BlockHashResult::Unknown;
        }

        let leaf = self.node_index(0, block);
        if self.verified[leaf] {
            // already known; agreeing is a no-op success, disagreeing means
            // this download of the block is corrupt
            return if self.nodes[leaf] == hash {
                BlockHashResult::Success
            } else {
                BlockHashResult::BlockHashFailed
            };
        }

        // the nearest verified ancestor; the root is always verified so
        // this terminates
        let mut ancestor = leaf;
        while !self.verified[ancestor] {
            ancestor = parent(ancestor);
        }
        let (anc_layer, anc_offset) = self.coords(ancestor);
        let covered = anc_offset << anc_layer..(anc_offset + 1) << anc_layer;

        // collect every leaf under the ancestor: verified, pad, pending, or
        // the one being offered; if any is missing we can't verify yet
        let mut leaves = Vec::with_capacity(covered.len());
        let mut other_pending_used = false;
        for i in covered.clone() {
            if i == block {
                leaves.push(hash);
                continue;
            }
            let node = self.node_index(0, i);
            if let Some(value) = self.node_value(node) {
                leaves.push(value);
            } else if let Some(value) = self.pending.get(&i) {
                other_pending_used = true;
                leaves.push(*value);
            } else {
                self.pending.insert(block, hash);
                return BlockHashResult::Unknown;
            }
        }

        // fold the subtree, keeping each layer for materialization
        let mut layers: Vec<Vec<Sha256Hash>> = vec![leaves];
        while layers.last().expect("nonempty").len() > 1 {
            let next: Vec<Sha256Hash> = layers
                .last()
                .expect("nonempty")
                .chunks(2)
                .map(|pair| combine(&pair[0], &pair[1]))
                .collect();
            layers.push(next);
        }

        if layers.last().expect("nonempty")[0] == self.nodes[ancestor] {
            // the subtree checks out: the offered leaf, every pending leaf
            // used, and all intermediate nodes are now verified
            for (l, layer_hashes) in layers.iter().enumerate() {
                for (j, value) in layer_hashes.iter().enumerate() {
                    let n = self.node_index(l, (anc_offset << anc_layer >> l) + j);
                    if self.pad_value(n).is_none() {
                        self.nodes[n] = *value;
                        self.verified.set(n, true);
                    }
                }
            }
            self.pending.retain(|b, _| !covered.contains(b));
            BlockHashResult::Success
        } else if !other_pending_used {
            // every other input was trusted, so this block is the culprit;
            // nothing else changes
            self.pending.remove(&block);
            BlockHashResult::BlockHashFailed
        } else {
            // an unverified sibling may be the liar: drop all pending
            // leaves under the ancestor and have the range re-fetched
            self.pending.retain(|b, _| !covered.contains(b));
            BlockHashResult::PieceHashFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds the full reference tree for `num_blocks` blocks where leaf `i`
    /// is SHA-256 of the block index as a little endian u32 (arbitrary but
    /// deterministic content).
    fn build_tree(num_blocks: usize) -> Vec<Sha256Hash> {
        let leafs = num_leafs(num_blocks);
        let mut nodes = vec![[0; 32]; num_nodes(leafs)];
        for i in 0..leafs {
            let node = first_leaf(leafs) + i;
            if i < num_blocks {
                let mut hasher = Sha256::new();
                hasher.update(&(i as u32).to_le_bytes());
                nodes[node].copy_from_slice(&hasher.finalize());
            }
            // pad leaves stay all zero
        }
        for node in (0..first_leaf(leafs)).rev() {
            nodes[node] = combine(
                &nodes[left_child(node)],
                &nodes[right_child(node)],
            );
        }
        nodes
    }

    #[test]
    fn test_tree_math() {
        assert_eq!(num_leafs(1), 1);
        assert_eq!(num_leafs(5), 8);
        assert_eq!(num_leafs(260), 512);
        assert_eq!(num_nodes(512), 1023);
        assert_eq!(num_layers(8), 3);
        assert_eq!(first_leaf(8), 7);
        assert_eq!(parent(1), 0);
        assert_eq!(parent(2), 0);
        assert_eq!(sibling(1), 2);
        assert_eq!(sibling(2), 1);
        assert_eq!(sibling(5), 6);
        assert_eq!(left_child(0), 1);
        assert_eq!(right_child(0), 2);
    }

    #[test]
    fn test_pad_hash() {
        assert_eq!(pad_hash(0), [0; 32]);
        assert_eq!(pad_hash(1), combine(&[0; 32], &[0; 32]));
        assert_eq!(pad_hash(2), combine(&pad_hash(1), &pad_hash(1)));
    }

    #[test]
    fn test_load_tree() {
        let num_blocks = 260;
        let f = build_tree(num_blocks);
        let leafs = num_leafs(num_blocks);
        let pad_leafs = leafs - num_blocks;

        // valid root: everything except pad leaves becomes verified
        let mut t = MerkleTree::new(num_blocks, 1, f[0]);
        assert!(t.load_tree(&f));
        for node in 0..num_nodes(leafs) - pad_leafs {
            assert!(t.has_node(node));
            assert_eq!(t.node_value(node), Some(f[node]));
        }
        for node in num_nodes(leafs) - pad_leafs..num_nodes(leafs) {
            assert!(!t.has_node(node));
            // defined pad value regardless
            assert_eq!(t.node_value(node), Some([0; 32]));
        }

        // mismatching root: nothing loads
        let mut t = MerkleTree::new(num_blocks, 1, [7; 32]);
        assert!(!t.load_tree(&f));
        assert!(t.has_node(0));
        for node in 1..num_nodes(leafs) {
            assert!(!t.has_node(node));
        }

        // mismatching size: nothing loads
        let mut t = MerkleTree::new(num_blocks, 1, f[0]);
        assert!(!t.load_tree(&f[..f.len() - 1]));
        for node in 1..num_nodes(leafs) {
            assert!(!t.has_node(node));
        }
    }

    #[test]
    fn test_sparse_round_trip() {
        let num_blocks = 260;
        let f = build_tree(num_blocks);
        let mut t = MerkleTree::new(num_blocks, 4, f[0]);
        assert!(t.load_tree(&f));

        let (hashes, mask) = t.to_sparse();
        let mut loaded = MerkleTree::new(num_blocks, 4, f[0]);
        assert!(loaded.load_sparse_tree(&hashes, &mask));

        let (hashes2, mask2) = loaded.to_sparse();
        assert_eq!(hashes, hashes2);
        assert_eq!(mask, mask2);
        for node in 0..num_nodes(num_leafs(num_blocks)) {
            assert_eq!(t.has_node(node), loaded.has_node(node));
            assert_eq!(t.node_value(node), loaded.node_value(node));
        }
    }

    #[test]
    fn test_sparse_rejects_unverifiable() {
        let num_blocks = 4;
        let f = build_tree(num_blocks);

        // nodes 1 and 2 under a root they don't hash to
        let mut t = MerkleTree::new(num_blocks, 1, [7; 32]);
        let mut mask = vec![false; f.len()];
        mask[1] = true;
        mask[2] = true;
        assert!(!t.load_sparse_tree(&[f[1], f[2]], &mask));
        assert!(t.has_node(0));
        assert!(!t.has_node(1));

        // a lone leaf with no path to the root
        let mut t = MerkleTree::new(num_blocks, 1, f[0]);
        let mut mask = vec![false; f.len()];
        mask[3] = true;
        assert!(!t.load_sparse_tree(&[f[3]], &mask));
        assert!(!t.has_node(3));
    }

    #[test]
    fn test_import_piece_layer() {
        // 16 blocks, 4 blocks per piece -> 4 piece hashes at layer 2
        let num_blocks = 16;
        let f = build_tree(num_blocks);
        let piece_layer: Vec<Sha256Hash> = (3..7).map(|n| f[n]).collect();

        let mut t = MerkleTree::new(num_blocks, 4, f[0]);
        assert!(t.import_piece_layer(&piece_layer));
        for piece in 0..4 {
            assert_eq!(t.piece_root(piece), Some(f[3 + piece]));
        }
        // layers above the piece layer are filled in
        assert!(t.has_node(1));
        assert!(t.has_node(2));
        // leaves are not
        assert!(!t.has_node(first_leaf(16)));

        assert_eq!(t.piece_layer_hashes(), Some(piece_layer));

        // a corrupted layer is rejected wholesale
        let mut bad = vec![f[3], f[4], f[5], [9; 32]];
        bad.swap(0, 1);
        let mut t = MerkleTree::new(num_blocks, 4, f[0]);
        assert!(!t.import_piece_layer(&bad));
        assert!(!t.has_node(3));
    }

    #[test]
    fn test_import_piece_layer_uneven() {
        // 6 blocks, 4 per piece -> 2 pieces, piece layer padded to 2 nodes
        let num_blocks = 6;
        let f = build_tree(num_blocks);
        let piece_layer = vec![f[1], f[2]];
        let mut t = MerkleTree::new(num_blocks, 4, f[0]);
        assert!(t.import_piece_layer(&piece_layer));
        assert_eq!(t.piece_root(0), Some(f[1]));
        assert_eq!(t.piece_root(1), Some(f[2]));
    }

    #[test]
    fn test_set_block_hash_success_and_unknown() {
        let num_blocks = 8;
        let f = build_tree(num_blocks);
        let mut t = MerkleTree::new(num_blocks, 4, f[0]);
        // piece layer known (layer 2, nodes 1 and 2)
        assert!(t.import_piece_layer(&[f[1], f[2]]));

        let leaf = |i: usize| f[first_leaf(8) + i];

        // first block of piece 0: siblings unknown
        assert_eq!(
            t.set_block_hash(0, leaf(0)),
            BlockHashResult::Unknown
        );
        assert_eq!(
            t.set_block_hash(1, leaf(1)),
            BlockHashResult::Unknown
        );
        assert_eq!(
            t.set_block_hash(2, leaf(2)),
            BlockHashResult::Unknown
        );
        // the last sibling closes the piece subtree and verifies the lot
        assert_eq!(
            t.set_block_hash(3, leaf(3)),
            BlockHashResult::Success
        );
        for i in 0..4 {
            assert!(t.has_node(first_leaf(8) + i));
        }
        // intermediate nodes under the piece root are in too
        assert!(t.has_node(3));
        assert!(t.has_node(4));
    }

    #[test]
    fn test_set_block_hash_piece_vs_block_failure() {
        let num_blocks = 8;
        let f = build_tree(num_blocks);
        let leaf = |i: usize| f[first_leaf(8) + i];

        // piece failure: a corrupt leaf mixed into pending siblings; the
        // final offer computes a bad piece root and can't pinpoint blame
        let mut t = MerkleTree::new(num_blocks, 4, f[0]);
        assert!(t.import_piece_layer(&[f[1], f[2]]));
        assert_eq!(t.set_block_hash(0, [6; 32]), BlockHashResult::Unknown);
        assert_eq!(t.set_block_hash(1, leaf(1)), BlockHashResult::Unknown);
        assert_eq!(t.set_block_hash(2, leaf(2)), BlockHashResult::Unknown);
        assert_eq!(
            t.set_block_hash(3, leaf(3)),
            BlockHashResult::PieceHashFailed
        );
        // pending leaves under the piece were dropped: re-offering the same
        // good ones starts over
        assert_eq!(t.set_block_hash(1, leaf(1)), BlockHashResult::Unknown);

        // block failure: all siblings verified, one corrupt re-download
        let mut t = MerkleTree::new(num_blocks, 4, f[0]);
        assert!(t.import_piece_layer(&[f[1], f[2]]));
        for i in 0..3 {
            t.set_block_hash(i, leaf(i));
        }
        assert_eq!(t.set_block_hash(3, leaf(3)), BlockHashResult::Success);
        // now all four leaves are verified; a bad value for block 2 is
        // attributable to block 2 alone
        assert_eq!(
            t.set_block_hash(2, [6; 32]),
            BlockHashResult::BlockHashFailed
        );
        // and nothing else changed
        assert!(t.has_node(first_leaf(8) + 1));
        assert_eq!(t.node_value(first_leaf(8) + 2), Some(leaf(2)));
    }

    #[test]
    fn test_get_hashes_add_hashes_round_trip() {
        let num_blocks = 16;
        let f = build_tree(num_blocks);
        let mut full = MerkleTree::new(num_blocks, 4, f[0]);
        assert!(full.load_tree(&f));

        // ask the full tree for piece 1's leaf hashes plus proofs to the
        // root, then feed them to a fresh tree that only knows the root
        let proof_layers = num_layers(16) - num_layers(4);
        let hashes = full.get_hashes(0, 4, 4, proof_layers).unwrap();
        assert_eq!(hashes.len(), 4 + 2);

        let mut fresh = MerkleTree::new(num_blocks, 4, f[0]);
        assert!(fresh.add_hashes(0, 4, &hashes[..4], &hashes[4..]));
        for i in 4..8 {
            assert_eq!(
                fresh.node_value(first_leaf(16) + i),
                Some(f[first_leaf(16) + i])
            );
        }
        // the proof siblings were verified in passing
        assert!(fresh.has_node(3));

        // corrupting one hash rejects the whole batch without mutation
        let mut fresh = MerkleTree::new(num_blocks, 4, f[0]);
        let mut bad = hashes.clone();
        bad[0] = [9; 32];
        assert!(!fresh.add_hashes(0, 4, &bad[..4], &bad[4..]));
        for node in 1..num_nodes(16) {
            assert!(!fresh.has_node(node));
        }
    }

    #[test]
    fn test_root_from_leaves() {
        let f = build_tree(4);
        let leaves: Vec<Sha256Hash> =
            (0..4).map(|i| f[first_leaf(4) + i]).collect();
        assert_eq!(root_from_leaves(&leaves, &pad_hash(0)), f[0]);

        // padding fills the run to a power of two
        let f = build_tree(3);
        let leaves: Vec<Sha256Hash> =
            (0..3).map(|i| f[first_leaf(4) + i]).collect();
        assert_eq!(root_from_leaves(&leaves, &pad_hash(0)), f[0]);
    }
}
