//! Streaming parser for serialized Bitcoin transactions.
//!
//! A transaction is never held in memory whole. The extractor walks the
//! serialization once, from a [`PreimageReader`], and does three jobs
//! depending on mode:
//!
//! * [`ParseMode::Identify`]: validate structure, compute the txid over the
//!   witness-stripped serialization, and capture a requested input's prevout
//!   reference or a requested output.
//! * [`ParseMode::LegacyPass1`] / [`ParseMode::LegacyPass2`]: feed the two
//!   halves of a pre-segwit signature-hash preimage into a caller-supplied
//!   hasher. Pass 1 stops after the signed input's prevout so the caller can
//!   insert the script code; pass 2 resumes at that input's sequence number.
//!
//! In every mode the whole preimage is consumed, so leaf authentication can
//! always complete even when only a prefix contributes to the output.

use alloc::vec::Vec;

use common::cursor::encode_compact_size;
use common::errors::Error;
use common::psbt::MAX_VARINT_252;

use crate::constants::MAX_PREVOUT_SCRIPTPUBKEY_LEN;
use crate::hash::{finalize_sha256d, Hasher, Sha256};
use crate::hostio::HostIo;
use crate::merkle_map::PreimageReader;

#[derive(Clone, Copy)]
pub enum ParseMode {
    Identify,
    LegacyPass1 { input_index: usize },
    LegacyPass2 { input_index: usize },
}

/// An input's reference to the output it spends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prevout {
    /// Raw digest order, as serialized on the wire.
    pub txid: [u8; 32],
    pub vout: u32,
}

/// A captured transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// What one extraction pass learned about the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFields {
    pub version: u32,
    pub lock_time: u32,
    pub n_inputs: usize,
    pub n_outputs: usize,
    /// Double-SHA256 of the witness-stripped serialization; only computed in
    /// identify mode.
    pub txid: Option<[u8; 32]>,
    pub input_prevout: Option<Prevout>,
    pub output: Option<TxOut>,
}

pub struct TxExtractor<'h> {
    mode: ParseMode,
    sighash: Option<&'h mut Sha256>,
    capture_input: Option<usize>,
    capture_output: Option<usize>,
}

impl<'h> TxExtractor<'h> {
    pub fn identify() -> Self {
        Self {
            mode: ParseMode::Identify,
            sighash: None,
            capture_input: None,
            capture_output: None,
        }
    }

    pub fn legacy_pass1(input_index: usize, sighash: &'h mut Sha256) -> Self {
        Self {
            mode: ParseMode::LegacyPass1 { input_index },
            sighash: Some(sighash),
            capture_input: None,
            capture_output: None,
        }
    }

    pub fn legacy_pass2(input_index: usize, sighash: &'h mut Sha256) -> Self {
        Self {
            mode: ParseMode::LegacyPass2 { input_index },
            sighash: Some(sighash),
            capture_input: None,
            capture_output: None,
        }
    }

    /// Capture the prevout reference of input `index` (identify mode).
    pub fn capture_input(mut self, index: usize) -> Self {
        self.capture_input = Some(index);
        self
    }

    /// Capture output `index` (identify mode).
    pub fn capture_output(mut self, index: usize) -> Self {
        self.capture_output = Some(index);
        self
    }

    fn emit(&mut self, data: &[u8]) {
        if let Some(h) = self.sighash.as_deref_mut() {
            h.update(data);
        }
    }

    fn emit_varint(&mut self, value: u64) {
        let mut buf = [0u8; 9];
        let n = encode_compact_size(value, &mut buf);
        self.emit(&buf[..n]);
    }

    /// Runs the pass over `reader`, consuming the serialization to its end.
    pub fn run<H: HostIo>(mut self, reader: &mut PreimageReader<'_, H>) -> Result<TxFields, Error> {
        let mut txid_hasher = match self.mode {
            ParseMode::Identify => Some(<Sha256 as Hasher<32>>::new()),
            _ => None,
        };
        let mut id = |h: &mut Option<Sha256>, data: &[u8]| {
            if let Some(h) = h.as_mut() {
                h.update(data);
            }
        };

        let version_bytes: [u8; 4] = reader.read_array()?;
        let version = u32::from_le_bytes(version_bytes);
        id(&mut txid_hasher, &version_bytes);
        if matches!(self.mode, ParseMode::LegacyPass1 { .. }) {
            self.emit(&version_bytes);
        }

        // segwit serialization starts with a 0x00 marker where the input
        // count would otherwise be
        let mut segwit = false;
        if reader.peek_u8()? == 0x00 {
            reader.read_u8()?;
            if reader.read_u8()? != 0x01 {
                return Err(Error::TransactionParse);
            }
            segwit = true;
        }

        let n_inputs = reader.read_varint()?;
        if n_inputs == 0 {
            return Err(Error::TransactionParse);
        }
        if n_inputs > MAX_VARINT_252 {
            return Err(Error::CountOutOfRange);
        }
        let n_inputs = n_inputs as usize;
        {
            let mut buf = [0u8; 9];
            let n = encode_compact_size(n_inputs as u64, &mut buf);
            id(&mut txid_hasher, &buf[..n]);
        }
        match self.mode {
            ParseMode::LegacyPass1 { input_index } | ParseMode::LegacyPass2 { input_index } => {
                if input_index >= n_inputs {
                    return Err(Error::StructuralMismatch);
                }
            }
            ParseMode::Identify => {}
        }
        if matches!(self.mode, ParseMode::LegacyPass1 { .. }) {
            self.emit_varint(n_inputs as u64);
        }

        let mut input_prevout = None;
        for i in 0..n_inputs {
            let prevout_bytes: [u8; 36] = reader.read_array()?;
            let script_len = reader.read_varint()? as usize;
            id(&mut txid_hasher, &prevout_bytes);
            {
                let mut buf = [0u8; 9];
                let n = encode_compact_size(script_len as u64, &mut buf);
                id(&mut txid_hasher, &buf[..n]);
            }
            // script_sig: streamed through, captured nowhere
            self.consume_with(reader, script_len, &mut txid_hasher, false)?;
            let sequence_bytes: [u8; 4] = reader.read_array()?;
            id(&mut txid_hasher, &sequence_bytes);

            if self.capture_input == Some(i) {
                let mut txid = [0u8; 32];
                txid.copy_from_slice(&prevout_bytes[..32]);
                let vout = u32::from_le_bytes([
                    prevout_bytes[32],
                    prevout_bytes[33],
                    prevout_bytes[34],
                    prevout_bytes[35],
                ]);
                input_prevout = Some(Prevout { txid, vout });
            }

            match self.mode {
                ParseMode::LegacyPass1 { input_index } => {
                    if i < input_index {
                        // other inputs sign with an empty script
                        self.emit(&prevout_bytes);
                        self.emit(&[0x00]);
                        self.emit(&sequence_bytes);
                    } else if i == input_index {
                        // stop after the prevout; the caller inserts the
                        // script code next
                        self.emit(&prevout_bytes);
                    }
                }
                ParseMode::LegacyPass2 { input_index } => {
                    if i == input_index {
                        self.emit(&sequence_bytes);
                    } else if i > input_index {
                        self.emit(&prevout_bytes);
                        self.emit(&[0x00]);
                        self.emit(&sequence_bytes);
                    }
                }
                ParseMode::Identify => {}
            }
        }

        let n_outputs = reader.read_varint()?;
        if n_outputs > MAX_VARINT_252 {
            return Err(Error::CountOutOfRange);
        }
        let n_outputs = n_outputs as usize;
        {
            let mut buf = [0u8; 9];
            let n = encode_compact_size(n_outputs as u64, &mut buf);
            id(&mut txid_hasher, &buf[..n]);
        }
        if matches!(self.mode, ParseMode::LegacyPass2 { .. }) {
            self.emit_varint(n_outputs as u64);
        }

        let mut output = None;
        for o in 0..n_outputs {
            let value_bytes: [u8; 8] = reader.read_array()?;
            let script_len = reader.read_varint()? as usize;
            id(&mut txid_hasher, &value_bytes);
            {
                let mut buf = [0u8; 9];
                let n = encode_compact_size(script_len as u64, &mut buf);
                id(&mut txid_hasher, &buf[..n]);
            }
            if matches!(self.mode, ParseMode::LegacyPass2 { .. }) {
                self.emit(&value_bytes);
                self.emit_varint(script_len as u64);
            }
            if self.capture_output == Some(o) {
                if script_len > MAX_PREVOUT_SCRIPTPUBKEY_LEN {
                    return Err(Error::ScriptTooLong);
                }
                let mut script_pubkey = alloc::vec![0u8; script_len];
                reader.read_exact(&mut script_pubkey)?;
                id(&mut txid_hasher, &script_pubkey);
                output = Some(TxOut {
                    value: u64::from_le_bytes(value_bytes),
                    script_pubkey,
                });
            } else {
                let feed_sighash = matches!(self.mode, ParseMode::LegacyPass2 { .. });
                self.consume_with(reader, script_len, &mut txid_hasher, feed_sighash)?;
            }
        }

        if segwit {
            // witness stacks are authenticated with the rest of the preimage
            // but contribute to neither the txid nor a legacy sighash
            for _ in 0..n_inputs {
                let n_items = reader.read_varint()?;
                for _ in 0..n_items {
                    let item_len = reader.read_varint()? as usize;
                    reader.skip(item_len)?;
                }
            }
        }

        let lock_time_bytes: [u8; 4] = reader.read_array()?;
        let lock_time = u32::from_le_bytes(lock_time_bytes);
        id(&mut txid_hasher, &lock_time_bytes);
        if matches!(self.mode, ParseMode::LegacyPass2 { .. }) {
            self.emit(&lock_time_bytes);
        }

        if !reader.is_empty() {
            return Err(Error::TransactionParse);
        }

        if self.capture_input.is_some() && input_prevout.is_none() {
            return Err(Error::StructuralMismatch);
        }
        if self.capture_output.is_some() && output.is_none() {
            return Err(Error::PrevoutMismatch);
        }

        Ok(TxFields {
            version,
            lock_time,
            n_inputs,
            n_outputs,
            txid: txid_hasher.map(finalize_sha256d),
            input_prevout,
            output,
        })
    }

    /// Streams `len` bytes through, updating the txid hasher and, when
    /// `feed_sighash` is set, the sighash hasher.
    fn consume_with<H: HostIo>(
        &mut self,
        reader: &mut PreimageReader<'_, H>,
        mut len: usize,
        txid_hasher: &mut Option<Sha256>,
        feed_sighash: bool,
    ) -> Result<(), Error> {
        let mut scratch = [0u8; 64];
        while len > 0 {
            let take = core::cmp::min(len, scratch.len());
            reader.read_exact(&mut scratch[..take])?;
            if let Some(h) = txid_hasher.as_mut() {
                h.update(&scratch[..take]);
            }
            if feed_sighash {
                self.emit(&scratch[..take]);
            }
            len -= take;
        }
        Ok(())
    }
}
