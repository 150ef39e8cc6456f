//! BIP32 key derivation and deterministic ECDSA signing.
//!
//! Derived key material is a scoped resource: it lives in [`zeroize::Zeroizing`]
//! storage inside [`DerivedKey`], so the secret is overwritten on every exit
//! path, including when the signing primitive itself fails.

use alloc::vec::Vec;

use bip32::{ChildNumber, XPrv};
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use zeroize::Zeroizing;

use common::errors::Error;

use crate::constants::{MAX_BIP32_PATH_STEPS, MAX_DER_SIG_LEN};

/// The device's master secret and everything derived from it.
pub struct KeyVault {
    seed: Zeroizing<Vec<u8>>,
}

impl KeyVault {
    /// Wraps a BIP32 master seed (16 to 64 bytes).
    pub fn new(seed: &[u8]) -> Result<Self, Error> {
        if seed.len() < 16 || seed.len() > 64 {
            return Err(Error::KeyDerivationFailed);
        }
        Ok(Self {
            seed: Zeroizing::new(seed.to_vec()),
        })
    }

    fn root(&self) -> Result<XPrv, Error> {
        XPrv::new(self.seed.as_slice()).map_err(|_| Error::KeyDerivationFailed)
    }

    /// BIP32 fingerprint of the master key, as stored in PSBT key-origin
    /// fields.
    pub fn master_fingerprint(&self) -> Result<[u8; 4], Error> {
        Ok(self.root()?.public_key().fingerprint())
    }

    /// Derives the key at `path` (hardened steps carry the top bit).
    pub fn derive(&self, path: &[u32]) -> Result<DerivedKey, Error> {
        if path.len() > MAX_BIP32_PATH_STEPS {
            return Err(Error::KeyDerivationFailed);
        }
        let mut node = self.root()?;
        for &step in path {
            node = node
                .derive_child(ChildNumber(step))
                .map_err(|_| Error::KeyDerivationFailed)?;
        }
        let secret: [u8; 32] = node.private_key().to_bytes().into();
        Ok(DerivedKey {
            secret: Zeroizing::new(secret),
        })
    }
}

/// A derived private key, erased on drop.
pub struct DerivedKey {
    secret: Zeroizing<[u8; 32]>,
}

impl DerivedKey {
    /// The compressed SEC1 encoding of the corresponding public key.
    pub fn public_key(&self) -> Result<[u8; 33], Error> {
        let signing_key =
            SigningKey::from_slice(self.secret.as_slice()).map_err(|_| Error::SignatureFailure)?;
        let point = signing_key.verifying_key().to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(point.as_bytes());
        Ok(out)
    }

    /// Signs a 32-byte digest with deterministic (RFC 6979) ECDSA, returning
    /// the DER encoding. Low-S normalized, as consensus rules require.
    pub fn sign_ecdsa(&self, digest: &[u8; 32]) -> Result<Vec<u8>, Error> {
        let signing_key =
            SigningKey::from_slice(self.secret.as_slice()).map_err(|_| Error::SignatureFailure)?;
        let signature: Signature = signing_key
            .sign_prehash(digest)
            .map_err(|_| Error::SignatureFailure)?;
        let signature = signature.normalize_s().unwrap_or(signature);
        let der = signature.to_der();
        if der.as_bytes().len() > MAX_DER_SIG_LEN {
            return Err(Error::SignatureFailure);
        }
        Ok(der.as_bytes().to_vec())
    }
}
