/// Largest previous-output script the signing core will copy into session
/// state; enough for any standard script type.
pub const MAX_PREVOUT_SCRIPTPUBKEY_LEN: usize = 83;

/// Upper bound on a DER-encoded ECDSA signature over secp256k1.
pub const MAX_DER_SIG_LEN: usize = 72;

/// Largest PSBT map key we accept (type byte plus key data; the longest
/// standard key is a BIP32-derivation key carrying a 33-byte pubkey).
pub const MAX_MERKLE_KEY_LEN: usize = 64;

/// Chunk size for pulling preimage bytes from the host.
pub const PREIMAGE_CHUNK_LEN: usize = 64;

/// Maximum number of derivation steps in a signing path.
pub const MAX_BIP32_PATH_STEPS: usize = 10;

/// Byte length of a P2SH scriptPubKey: OP_HASH160, push-20, hash, OP_EQUAL.
pub const P2SH_SCRIPT_LEN: usize = 23;

pub const OP_HASH160: u8 = 0xa9;
pub const OP_PUSH_20: u8 = 0x14;
pub const OP_EQUAL: u8 = 0x87;
