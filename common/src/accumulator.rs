//! Merkle vector accumulator shared by the device core and the host.
//!
//! The host (prover) stores the vector and commits to it with a single root
//! hash; the device (verifier) holds only the root and authenticates each
//! element it retrieves against an inclusion proof. Leaves are hashed with a
//! `0x00` domain prefix and internal nodes with `0x01`, so a leaf can never be
//! confused with an internal node.
//!
//! The tree shape is the implicit complete binary tree over `2n - 1` nodes:
//! node `i` has children `2i + 1` and `2i + 2`, leaves occupy positions
//! `n - 1 .. 2n - 1`.

use alloc::{vec, vec::Vec};
use core::marker::PhantomData;

/// A cryptographic hasher with a fixed-size output.
pub trait Hasher<const OUTPUT_SIZE: usize>: Sized {
    fn new() -> Self;

    fn update(&mut self, data: &[u8]) -> &mut Self;

    fn digest(self, out: &mut [u8; OUTPUT_SIZE]);

    fn finalize(self) -> [u8; OUTPUT_SIZE] {
        let mut out = [0u8; OUTPUT_SIZE];
        self.digest(&mut out);
        out
    }

    /// Hashes `data` in a single step.
    fn hash(data: &[u8]) -> [u8; OUTPUT_SIZE] {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }
}

pub fn hash_leaf<H: Hasher<N>, const N: usize>(data: &[u8]) -> [u8; N] {
    let mut hasher = H::new();
    hasher.update(&[0x00]);
    hasher.update(data);
    hasher.finalize()
}

pub fn hash_node<H: Hasher<N>, const N: usize>(left: &[u8; N], right: &[u8; N]) -> [u8; N] {
    let mut hasher = H::new();
    hasher.update(&[0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize()
}

/// Prover side: owns the element bytes and the full node array.
pub struct MerkleTree<H: Hasher<N>, const N: usize> {
    leaves: Vec<Vec<u8>>,
    nodes: Vec<[u8; N]>,
    _marker: PhantomData<H>,
}

impl<H: Hasher<N>, const N: usize> MerkleTree<H, N> {
    pub fn new(leaves: Vec<Vec<u8>>) -> Self {
        let n = leaves.len();
        let mut nodes = vec![[0u8; N]; if n == 0 { 0 } else { 2 * n - 1 }];
        for (i, leaf) in leaves.iter().enumerate() {
            nodes[n - 1 + i] = hash_leaf::<H, N>(leaf);
        }
        for i in (0..n.saturating_sub(1)).rev() {
            nodes[i] = hash_node::<H, N>(&nodes[2 * i + 1], &nodes[2 * i + 2]);
        }
        Self {
            leaves,
            nodes,
            _marker: PhantomData,
        }
    }

    pub fn size(&self) -> usize {
        self.leaves.len()
    }

    /// The committed root; an empty tree commits to the all-zero hash.
    pub fn root(&self) -> [u8; N] {
        self.nodes.first().copied().unwrap_or([0u8; N])
    }

    pub fn leaf(&self, index: usize) -> Option<&[u8]> {
        self.leaves.get(index).map(|l| l.as_slice())
    }

    pub fn leaf_hash(&self, index: usize) -> Option<[u8; N]> {
        if index >= self.leaves.len() {
            return None;
        }
        Some(self.nodes[self.leaves.len() - 1 + index])
    }

    /// Inclusion proof for the leaf at `index`: the sibling hashes on the path
    /// to the root, leaf side first. Empty for a single-leaf tree.
    pub fn prove(&self, index: usize) -> Option<Vec<[u8; N]>> {
        let n = self.leaves.len();
        if index >= n {
            return None;
        }
        let mut proof = Vec::new();
        let mut pos = n - 1 + index;
        while pos > 0 {
            let sibling = if pos % 2 == 0 { pos - 1 } else { pos + 1 };
            proof.push(self.nodes[sibling]);
            pos = (pos - 1) / 2;
        }
        Some(proof)
    }
}

/// Verifier side: consumes proof elements one at a time so the caller never
/// needs the whole proof in memory at once.
pub struct InclusionVerifier<H: Hasher<N>, const N: usize> {
    current: [u8; N],
    pos: usize,
    root: [u8; N],
    ok: bool,
    _marker: PhantomData<H>,
}

impl<H: Hasher<N>, const N: usize> InclusionVerifier<H, N> {
    pub fn begin(root: &[u8; N], leaf_hash: &[u8; N], index: usize, size: usize) -> Self {
        if size == 0 || index >= size {
            return Self {
                current: [0u8; N],
                pos: 0,
                root: *root,
                ok: false,
                _marker: PhantomData,
            };
        }
        Self {
            current: *leaf_hash,
            pos: size - 1 + index,
            root: *root,
            // a zero-length proof (single-leaf tree) is valid only if the
            // leaf hash already equals the root
            ok: size == 1 && leaf_hash == root,
            _marker: PhantomData,
        }
    }

    pub fn feed(&mut self, sibling: &[u8; N]) {
        if self.pos == 0 {
            // already at the root; extra elements invalidate the proof
            self.ok = false;
            return;
        }
        let (left, right) = if self.pos % 2 == 0 {
            (sibling, &self.current)
        } else {
            (&self.current, sibling)
        };
        self.current = hash_node::<H, N>(left, right);
        self.pos = (self.pos - 1) / 2;
        if self.pos == 0 {
            self.ok = self.current == self.root;
        }
    }

    pub fn verified(&self) -> bool {
        self.ok
    }
}

/// Verifies a complete inclusion proof in one call.
pub fn verify_inclusion<H: Hasher<N>, const N: usize>(
    root: &[u8; N],
    proof: &[[u8; N]],
    leaf_hash: &[u8; N],
    index: usize,
    size: usize,
) -> bool {
    let mut verifier = InclusionVerifier::<H, N>::begin(root, leaf_hash, index, size);
    for element in proof {
        verifier.feed(element);
    }
    verifier.verified()
}
