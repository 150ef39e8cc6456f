//! Concrete hashers behind the shared [`Hasher`] trait, plus the digest
//! helpers the signing flow uses.

pub use common::accumulator::Hasher;

use ripemd::Ripemd160 as Ripemd160Inner;
use sha2::{Digest, Sha256 as Sha256Inner};

#[derive(Clone, Debug)]
pub struct Sha256 {
    inner: Sha256Inner,
}

impl Hasher<32> for Sha256 {
    fn new() -> Self {
        Self {
            inner: Sha256Inner::new(),
        }
    }

    fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    fn digest(self, out: &mut [u8; 32]) {
        out.copy_from_slice(&self.inner.finalize());
    }
}

impl Default for Sha256 {
    fn default() -> Self {
        <Self as Hasher<32>>::new()
    }
}

#[derive(Clone, Debug)]
pub struct Ripemd160 {
    inner: Ripemd160Inner,
}

impl Hasher<20> for Ripemd160 {
    fn new() -> Self {
        Self {
            inner: Ripemd160Inner::new(),
        }
    }

    fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    fn digest(self, out: &mut [u8; 20]) {
        out.copy_from_slice(&self.inner.finalize());
    }
}

/// Finalizes an accumulated SHA-256 stream and hashes the digest once more
/// (the double-hash convention used for txids and sighashes).
pub fn finalize_sha256d(hasher: Sha256) -> [u8; 32] {
    Sha256::hash(&hasher.finalize())
}

/// RIPEMD160(SHA256(data)), the script-hash construction.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::hash(&Sha256::hash(data))
}
