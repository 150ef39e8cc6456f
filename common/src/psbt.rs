//! PSBT key types (BIP-174) and the commitment format for a merkleized
//! key/value map.
//!
//! A map is never transferred whole: the host commits to it with two parallel
//! Merkle trees of equal size, one over the key bytes and one over the value
//! bytes, index-aligned and sorted by key. The device holds only this
//! commitment and authenticates every entry it reads.

use alloc::vec::Vec;

use crate::cursor::{encode_compact_size, Cursor};
use crate::errors::Error;

pub const PSBT_GLOBAL_UNSIGNED_TX: u8 = 0x00;

pub const PSBT_IN_NON_WITNESS_UTXO: u8 = 0x00;
pub const PSBT_IN_WITNESS_UTXO: u8 = 0x01;
pub const PSBT_IN_SIGHASH_TYPE: u8 = 0x03;
pub const PSBT_IN_REDEEM_SCRIPT: u8 = 0x04;
pub const PSBT_IN_BIP32_DERIVATION: u8 = 0x06;

/// Length in bytes of a Merkle root (160-bit).
pub const MERKLE_ROOT_LEN: usize = 20;

pub type MerkleRoot = [u8; MERKLE_ROOT_LEN];

/// Largest count that fits in a single-byte compact-size integer; the wire
/// format bounds every map/input/output count by this.
pub const MAX_VARINT_252: u64 = 252;

/// Commitment to one merkleized key/value map.
///
/// Serialized as `varint(size) || keys_root || values_root`; this is both the
/// layout of each block of the signing request and the leaf content of the
/// per-input and per-output descriptor trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapCommitment {
    pub size: usize,
    pub keys_root: MerkleRoot,
    pub values_root: MerkleRoot,
}

impl MapCommitment {
    /// Parses a commitment from a descriptor-tree leaf. The whole buffer must
    /// be consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut cur = Cursor::new(bytes);
        let commitment = Self::read(&mut cur).map_err(|_| Error::MalformedField)?;
        if !cur.is_empty() {
            return Err(Error::MalformedField);
        }
        Ok(commitment)
    }

    /// Reads a commitment block at the cursor position, enforcing the
    /// single-byte varint bound on the entry count.
    pub fn read(cur: &mut Cursor<'_>) -> Result<Self, Error> {
        let size = cur.read_varint()?;
        if size > MAX_VARINT_252 {
            return Err(Error::CountOutOfRange);
        }
        Ok(Self {
            size: size as usize,
            keys_root: cur.read_array()?,
            values_root: cur.read_array()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 2 * MERKLE_ROOT_LEN);
        let mut varint = [0u8; 9];
        let n = encode_compact_size(self.size as u64, &mut varint);
        out.extend_from_slice(&varint[..n]);
        out.extend_from_slice(&self.keys_root);
        out.extend_from_slice(&self.values_root);
        out
    }
}
