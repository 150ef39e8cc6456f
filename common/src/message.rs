use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// Wire status reported for a completed command. Values follow the APDU
/// status-word conventions of the original device protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum StatusWord {
    Ok = 0x9000,
    WrongDataLength = 0x6700,
    SecurityStatusNotSatisfied = 0x6982,
    IncorrectData = 0x6A80,
    WrongP1P2 = 0x6A86,
    BadState = 0xB007,
    SignatureFail = 0xB008,
}

impl StatusWord {
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}

/// One produced signature. The `signature` field is DER-encoded with the
/// sighash-type byte appended, ready to be placed in a PSBT partial-signature
/// entry keyed by `pubkey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignature {
    pub input_index: u32,
    pub signature: Vec<u8>,
    pub pubkey: Vec<u8>,
}

/// Transport-level response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    PsbtSigned(Vec<PartialSignature>),
    Failure(u16),
}
