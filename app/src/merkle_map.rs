//! Device-side access to a merkleized key/value map.
//!
//! Every byte that crosses the host boundary is authenticated before use:
//! leaf hashes against the map's committed roots, preimage bytes against
//! their leaf hash. A [`PreimageReader`] hands out bytes as it fetches them,
//! so a consumer may start parsing before authentication completes, but
//! [`PreimageReader::finish`] must succeed before anything derived from those
//! bytes is acted upon.

use alloc::vec;
use alloc::vec::Vec;

use subtle::ConstantTimeEq;

use common::accumulator::{hash_leaf, verify_inclusion, Hasher};
use common::errors::Error;
use common::psbt::{MapCommitment, MerkleRoot};

use crate::constants::{MAX_MERKLE_KEY_LEN, PREIMAGE_CHUNK_LEN};
use crate::hash::Ripemd160;
use crate::hostio::HostIo;

/// Fetches the leaf hash at `index` of the tree committed to by `root` and
/// verifies its inclusion proof.
pub fn fetch_leaf<H: HostIo>(
    host: &H,
    root: &MerkleRoot,
    size: usize,
    index: usize,
) -> Result<MerkleRoot, Error> {
    let lp = host.get_merkle_leaf(root, size, index)?;
    if !verify_inclusion::<Ripemd160, 20>(root, &lp.proof, &lp.leaf_hash, index, size) {
        return Err(Error::InvalidProof);
    }
    Ok(lp.leaf_hash)
}

/// Streams the preimage of an authenticated leaf hash from the host.
///
/// Bytes are fetched in [`PREIMAGE_CHUNK_LEN`] chunks and fed into a running
/// hash; [`Self::finish`] drains whatever was not read and fails with
/// [`Error::PreimageMismatch`] unless the accumulated hash equals the leaf
/// hash.
pub struct PreimageReader<'a, H: HostIo> {
    host: &'a H,
    leaf_hash: MerkleRoot,
    len: usize,
    fetched: usize,
    chunk: Vec<u8>,
    chunk_pos: usize,
    hasher: Ripemd160,
}

impl<'a, H: HostIo> PreimageReader<'a, H> {
    pub fn new(host: &'a H, leaf_hash: MerkleRoot) -> Result<Self, Error> {
        let len = host.get_preimage_len(&leaf_hash)?;
        let mut hasher = <Ripemd160 as Hasher<20>>::new();
        hasher.update(&[0x00]);
        Ok(Self {
            host,
            leaf_hash,
            len,
            fetched: 0,
            chunk: Vec::new(),
            chunk_pos: 0,
            hasher,
        })
    }

    /// Total preimage length as claimed by the host.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Bytes not yet handed to the consumer.
    pub fn remaining(&self) -> usize {
        self.len - self.fetched + (self.chunk.len() - self.chunk_pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn refill(&mut self) -> Result<(), Error> {
        let take = core::cmp::min(PREIMAGE_CHUNK_LEN, self.len - self.fetched);
        if take == 0 {
            return Err(Error::MalformedField);
        }
        let mut buf = vec![0u8; take];
        self.host
            .get_preimage_chunk(&self.leaf_hash, self.fetched, &mut buf)?;
        self.hasher.update(&buf);
        self.fetched += take;
        self.chunk = buf;
        self.chunk_pos = 0;
        Ok(())
    }

    /// The next byte, without consuming it.
    pub fn peek_u8(&mut self) -> Result<u8, Error> {
        if self.chunk_pos == self.chunk.len() {
            self.refill()?;
        }
        Ok(self.chunk[self.chunk_pos])
    }

    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<(), Error> {
        let mut written = 0;
        while written < out.len() {
            if self.chunk_pos == self.chunk.len() {
                self.refill()?;
            }
            let available = self.chunk.len() - self.chunk_pos;
            let take = core::cmp::min(available, out.len() - written);
            out[written..written + take]
                .copy_from_slice(&self.chunk[self.chunk_pos..self.chunk_pos + take]);
            self.chunk_pos += take;
            written += take;
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    pub fn read_u32_le(&mut self) -> Result<u32, Error> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, Error> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    /// Bitcoin compact-size integer.
    pub fn read_varint(&mut self) -> Result<u64, Error> {
        match self.read_u8()? {
            n @ 0x00..=0xfc => Ok(n as u64),
            0xfd => {
                let mut b = [0u8; 2];
                self.read_exact(&mut b)?;
                Ok(u16::from_le_bytes(b) as u64)
            }
            0xfe => Ok(self.read_u32_le()? as u64),
            0xff => self.read_u64_le(),
        }
    }

    /// Reads the rest of the preimage into a vector.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, Error> {
        let mut out = vec![0u8; self.remaining()];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    /// Consumes and discards `n` bytes.
    pub fn skip(&mut self, mut n: usize) -> Result<(), Error> {
        let mut scratch = [0u8; 32];
        while n > 0 {
            let take = core::cmp::min(n, scratch.len());
            self.read_exact(&mut scratch[..take])?;
            n -= take;
        }
        Ok(())
    }

    /// Drains any unread bytes and checks the accumulated hash against the
    /// leaf hash. Nothing read from this stream may be trusted until this
    /// returns `Ok`.
    pub fn finish(mut self) -> Result<(), Error> {
        while self.fetched < self.len {
            self.refill()?;
        }
        let computed = self.hasher.finalize();
        if bool::from(computed.as_slice().ct_eq(self.leaf_hash.as_slice())) {
            Ok(())
        } else {
            Err(Error::PreimageMismatch)
        }
    }
}

/// A merkleized key/value map, seen from the device side.
pub struct MerkleizedMap {
    commitment: MapCommitment,
}

impl MerkleizedMap {
    pub fn new(commitment: MapCommitment) -> Self {
        Self { commitment }
    }

    pub fn size(&self) -> usize {
        self.commitment.size
    }

    pub fn commitment(&self) -> &MapCommitment {
        &self.commitment
    }

    /// Retrieves and authenticates every key, enforcing the strictly
    /// increasing lexicographic order the commitment format requires.
    pub fn scan_keys<H: HostIo>(&self, host: &H) -> Result<Vec<Vec<u8>>, Error> {
        let mut keys = Vec::with_capacity(self.commitment.size);
        for index in 0..self.commitment.size {
            let key = self.key_at(host, index)?;
            if let Some(prev) = keys.last() {
                if key <= *prev {
                    return Err(Error::UnsortedKeys);
                }
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// The authenticated key at `index`.
    pub fn key_at<H: HostIo>(&self, host: &H, index: usize) -> Result<Vec<u8>, Error> {
        let leaf_hash = fetch_leaf(host, &self.commitment.keys_root, self.commitment.size, index)?;
        let mut reader = PreimageReader::new(host, leaf_hash)?;
        if reader.len() > MAX_MERKLE_KEY_LEN {
            return Err(Error::KeyTooLong);
        }
        let key = reader.read_to_end()?;
        reader.finish()?;
        Ok(key)
    }

    /// Index of `key`, if present. Comparison is by leaf hash, so only proofs
    /// are transferred.
    pub fn find_key<H: HostIo>(&self, host: &H, key: &[u8]) -> Result<Option<usize>, Error> {
        let wanted = hash_leaf::<Ripemd160, 20>(key);
        for index in 0..self.commitment.size {
            let leaf_hash =
                fetch_leaf(host, &self.commitment.keys_root, self.commitment.size, index)?;
            if leaf_hash == wanted {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Streaming reader over the value at `index`.
    pub fn value_reader_at<'a, H: HostIo>(
        &self,
        host: &'a H,
        index: usize,
    ) -> Result<PreimageReader<'a, H>, Error> {
        if index >= self.commitment.size {
            return Err(Error::MalformedField);
        }
        let leaf_hash =
            fetch_leaf(host, &self.commitment.values_root, self.commitment.size, index)?;
        PreimageReader::new(host, leaf_hash)
    }

    /// The full value at `index`, bounded by `max_len`.
    pub fn value_at<H: HostIo>(
        &self,
        host: &H,
        index: usize,
        max_len: usize,
    ) -> Result<Vec<u8>, Error> {
        let mut reader = self.value_reader_at(host, index)?;
        if reader.len() > max_len {
            return Err(Error::ValueTooLong);
        }
        let value = reader.read_to_end()?;
        reader.finish()?;
        Ok(value)
    }

    /// Looks up `key` and returns its value, if present.
    pub fn get<H: HostIo>(
        &self,
        host: &H,
        key: &[u8],
        max_len: usize,
    ) -> Result<Option<Vec<u8>>, Error> {
        match self.find_key(host, key)? {
            Some(index) => Ok(Some(self.value_at(host, index, max_len)?)),
            None => Ok(None),
        }
    }
}
