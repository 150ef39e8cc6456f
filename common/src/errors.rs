use core::fmt;

use crate::message::StatusWord;

// Central error type used across the signing core; every fallible step of the
// session returns one of these, and the command terminates on the first error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // Request shape
    UnsupportedParameters,
    DeviceLocked,
    MalformedRequest,
    CountOutOfRange,

    // Merkle / map integrity
    InvalidProof,
    UnsortedKeys,
    PreimageMismatch,
    KeyTooLong,
    ValueTooLong,
    MalformedField,

    // Transaction structure and integrity
    TransactionParse,
    StructuralMismatch,
    MissingRequiredField,
    PrevoutMismatch,
    RedeemScriptMismatch,

    // Capacity
    ScriptTooLong,

    // Unsupported paths
    UnsupportedOperation,

    // Cryptographic primitives
    KeyDerivationFailed,
    SignatureFailure,

    // The host returned something that violates its own protocol
    HostIo,
}

impl Error {
    /// The wire status reported for this error. Integrity failures all
    /// collapse to `IncorrectData`; the in-crate variant stays distinct so
    /// logs and tests can tell them apart.
    pub fn status_word(&self) -> StatusWord {
        use Error::*;
        match self {
            UnsupportedParameters => StatusWord::WrongP1P2,
            DeviceLocked => StatusWord::SecurityStatusNotSatisfied,
            MalformedRequest => StatusWord::WrongDataLength,
            CountOutOfRange | InvalidProof | UnsortedKeys | PreimageMismatch | KeyTooLong
            | ValueTooLong | MalformedField | TransactionParse | StructuralMismatch
            | MissingRequiredField | PrevoutMismatch | RedeemScriptMismatch | HostIo => {
                StatusWord::IncorrectData
            }
            UnsupportedOperation => StatusWord::BadState,
            ScriptTooLong | KeyDerivationFailed | SignatureFailure => StatusWord::SignatureFail,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            UnsupportedParameters => write!(f, "Unsupported P1/P2 parameters"),
            DeviceLocked => write!(f, "Device is locked"),
            MalformedRequest => write!(f, "Malformed request payload"),
            CountOutOfRange => write!(f, "Count exceeds the single-byte varint range"),

            InvalidProof => write!(f, "Merkle inclusion proof did not verify"),
            UnsortedKeys => write!(f, "Map keys are not in strictly ascending order"),
            PreimageMismatch => write!(f, "Streamed preimage does not match its leaf hash"),
            KeyTooLong => write!(f, "Map key exceeds the supported length"),
            ValueTooLong => write!(f, "Map value exceeds the supported length"),
            MalformedField => write!(f, "Field has an unexpected encoding or length"),

            TransactionParse => write!(f, "Failed to parse the serialized transaction"),
            StructuralMismatch => write!(f, "Declared counts do not match the unsigned transaction"),
            MissingRequiredField => write!(f, "A required PSBT field is missing"),
            PrevoutMismatch => {
                write!(f, "Previous transaction hash does not match the prevout reference")
            }
            RedeemScriptMismatch => {
                write!(f, "Redeem script does not match the previous output's script")
            }

            ScriptTooLong => write!(f, "Previous output's script exceeds the supported length"),

            UnsupportedOperation => write!(f, "Operation not supported"),

            KeyDerivationFailed => write!(f, "Failed to derive key for the given path"),
            SignatureFailure => write!(f, "Failed to produce signature"),

            HostIo => write!(f, "Host violated the transport contract"),
        }
    }
}
