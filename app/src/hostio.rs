//! The device/host boundary for merkleized data.
//!
//! The host owns the bulky data (PSBT maps, previous transactions) and the
//! device pulls it piecewise: a leaf hash with its inclusion proof, then the
//! leaf's preimage in chunks. Everything the host returns is untrusted until
//! it has been checked against a root the device already holds.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use common::accumulator::{hash_leaf, MerkleTree};
use common::errors::Error;
use common::psbt::{MapCommitment, MerkleRoot};

use crate::hash::Ripemd160;

/// A leaf hash together with its inclusion proof, exactly as the host
/// supplies them. Unverified.
pub struct LeafProof {
    pub leaf_hash: MerkleRoot,
    pub proof: Vec<MerkleRoot>,
}

/// What the device needs from its host.
///
/// Implementations answer from whatever storage they have; the device never
/// trusts the answers directly. Any transport or lookup failure surfaces as
/// [`Error::HostIo`].
pub trait HostIo {
    /// The leaf hash at `index` of the tree committed to by `root`, with its
    /// inclusion proof.
    fn get_merkle_leaf(
        &self,
        root: &MerkleRoot,
        size: usize,
        index: usize,
    ) -> Result<LeafProof, Error>;

    /// Byte length of the preimage whose leaf hash is `leaf_hash`.
    fn get_preimage_len(&self, leaf_hash: &MerkleRoot) -> Result<usize, Error>;

    /// Copies preimage bytes `[offset, offset + out.len())` into `out`.
    fn get_preimage_chunk(
        &self,
        leaf_hash: &MerkleRoot,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), Error>;
}

/// In-process host backed by full Merkle trees. The reference prover, used
/// by tests and by callers that already hold the data locally.
#[derive(Default)]
pub struct MemoryHost {
    trees: Vec<MerkleTree<Ripemd160, 20>>,
    preimages: BTreeMap<MerkleRoot, Vec<u8>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a preimage so the device can fetch it by leaf hash.
    pub fn add_preimage(&mut self, data: &[u8]) -> MerkleRoot {
        let leaf_hash = hash_leaf::<Ripemd160, 20>(data);
        self.preimages.insert(leaf_hash, data.to_vec());
        leaf_hash
    }

    /// Builds a tree over `leaves`, keeping every leaf retrievable as a
    /// preimage too. Returns the root.
    pub fn add_tree(&mut self, leaves: Vec<Vec<u8>>) -> MerkleRoot {
        for leaf in &leaves {
            self.add_preimage(leaf);
        }
        let tree = MerkleTree::new(leaves);
        let root = tree.root();
        self.trees.push(tree);
        root
    }

    /// Commits to a key/value map: entries are sorted by key and split into
    /// the parallel keys and values trees.
    pub fn commit_map(&mut self, entries: &[(Vec<u8>, Vec<u8>)]) -> MapCommitment {
        let mut sorted: Vec<(Vec<u8>, Vec<u8>)> = entries.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let keys: Vec<Vec<u8>> = sorted.iter().map(|(k, _)| k.clone()).collect();
        let values: Vec<Vec<u8>> = sorted.iter().map(|(_, v)| v.clone()).collect();
        MapCommitment {
            size: sorted.len(),
            keys_root: self.add_tree(keys),
            values_root: self.add_tree(values),
        }
    }

    fn find_tree(&self, root: &MerkleRoot, size: usize) -> Result<&MerkleTree<Ripemd160, 20>, Error> {
        self.trees
            .iter()
            .find(|t| &t.root() == root && t.size() == size)
            .ok_or(Error::HostIo)
    }
}

impl HostIo for MemoryHost {
    fn get_merkle_leaf(
        &self,
        root: &MerkleRoot,
        size: usize,
        index: usize,
    ) -> Result<LeafProof, Error> {
        let tree = self.find_tree(root, size)?;
        let leaf_hash = tree.leaf_hash(index).ok_or(Error::HostIo)?;
        let proof = tree.prove(index).ok_or(Error::HostIo)?;
        Ok(LeafProof { leaf_hash, proof })
    }

    fn get_preimage_len(&self, leaf_hash: &MerkleRoot) -> Result<usize, Error> {
        Ok(self.preimages.get(leaf_hash).ok_or(Error::HostIo)?.len())
    }

    fn get_preimage_chunk(
        &self,
        leaf_hash: &MerkleRoot,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), Error> {
        let data = self.preimages.get(leaf_hash).ok_or(Error::HostIo)?;
        let end = offset.checked_add(out.len()).ok_or(Error::HostIo)?;
        if end > data.len() {
            return Err(Error::HostIo);
        }
        out.copy_from_slice(&data[offset..end]);
        Ok(())
    }
}
