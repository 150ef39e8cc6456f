//! The PSBT signing command.
//!
//! The PSBT itself stays on the host; the request carries only Merkle
//! commitments to its maps. The session walks the inputs in ascending order
//! and, for each one, re-derives the signature hash by streaming the unsigned
//! transaction twice (the script code is only known after the input's own map
//! has been read, so the hash is built as prefix, script code, suffix). Every
//! byte that contributes to a signature has been authenticated against a
//! committed root by the time the signature is produced.
//!
//! The first failing step aborts the whole command; no partial results are
//! returned.

use alloc::vec::Vec;

use subtle::ConstantTimeEq;

use common::cursor::{encode_compact_size, Cursor};
use common::errors::Error;
use common::message::{PartialSignature, Response};
use common::psbt::{
    MapCommitment, MerkleRoot, MAX_VARINT_252, PSBT_GLOBAL_UNSIGNED_TX, PSBT_IN_BIP32_DERIVATION,
    PSBT_IN_NON_WITNESS_UTXO, PSBT_IN_REDEEM_SCRIPT, PSBT_IN_SIGHASH_TYPE, PSBT_IN_WITNESS_UTXO,
};

use crate::constants::{
    MAX_BIP32_PATH_STEPS, OP_EQUAL, OP_HASH160, OP_PUSH_20, P2SH_SCRIPT_LEN,
};
use crate::device::Device;
use crate::hash::{finalize_sha256d, Hasher, Ripemd160, Sha256};
use crate::hostio::HostIo;
use crate::merkle_map::{fetch_leaf, MerkleizedMap, PreimageReader};
use crate::rawtx::TxExtractor;

/// Decoded command payload: the three map commitments, nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignPsbtRequest {
    pub global_map: MapCommitment,
    pub n_inputs: usize,
    pub inputs_root: MerkleRoot,
    pub n_outputs: usize,
    pub outputs_root: MerkleRoot,
}

impl SignPsbtRequest {
    /// Parses and bounds-checks the raw payload. P1/P2 are reserved and must
    /// be zero.
    pub fn decode(p1: u8, p2: u8, payload: &[u8]) -> Result<Self, Error> {
        if p1 != 0 || p2 != 0 {
            return Err(Error::UnsupportedParameters);
        }
        let mut cur = Cursor::new(payload);
        let global_map = MapCommitment::read(&mut cur)?;
        let n_inputs = read_count(&mut cur)?;
        let inputs_root = cur.read_array()?;
        let n_outputs = read_count(&mut cur)?;
        let outputs_root = cur.read_array()?;
        if !cur.is_empty() {
            return Err(Error::MalformedRequest);
        }
        Ok(Self {
            global_map,
            n_inputs,
            inputs_root,
            n_outputs,
            outputs_root,
        })
    }
}

fn read_count(cur: &mut Cursor<'_>) -> Result<usize, Error> {
    let n = cur.read_varint()?;
    if n > MAX_VARINT_252 {
        return Err(Error::CountOutOfRange);
    }
    Ok(n as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    CheckGlobalMap,
    IdentifyInput,
    ScanInputMap,
    FetchSighashType,
    CheckPrevout,
    LegacyPass1,
    LegacyScriptCode,
    LegacyPass2,
    LegacySign,
    SignSegwit,
    Done,
}

/// One signing command in flight. Holds at most one input's worth of state;
/// everything per-input is reset before the cursor advances.
pub struct SigningSession<'a, H: HostIo> {
    host: &'a H,
    request: SignPsbtRequest,
    master_fingerprint: [u8; 4],
    stage: Stage,
    global_map: MerkleizedMap,
    unsigned_tx_index: usize,

    cur_input_index: usize,
    cur_prevout_hash: [u8; 32],
    cur_prevout_n: u32,
    cur_input_map: Option<MerkleizedMap>,
    witness_utxo_index: Option<usize>,
    non_witness_utxo_index: Option<usize>,
    redeem_script_index: Option<usize>,
    sighash_type_index: Option<usize>,
    derivation_candidates: Vec<(usize, [u8; 33])>,
    cur_sighash_type: u32,
    prevout_script: Vec<u8>,
    hash_context: Sha256,

    signatures: Vec<PartialSignature>,
    device: &'a Device,
}

impl<'a, H: HostIo> SigningSession<'a, H> {
    /// Accepts a decoded request: checks the lock state and derives the
    /// master fingerprint once.
    pub fn new(device: &'a Device, host: &'a H, request: SignPsbtRequest) -> Result<Self, Error> {
        let master_fingerprint = device.vault()?.master_fingerprint()?;
        let global_map = MerkleizedMap::new(request.global_map);
        log::debug!(
            "sign_psbt: {} inputs, {} outputs, {} global entries",
            request.n_inputs,
            request.n_outputs,
            request.global_map.size
        );
        Ok(Self {
            host,
            request,
            master_fingerprint,
            stage: Stage::CheckGlobalMap,
            global_map,
            unsigned_tx_index: 0,
            cur_input_index: 0,
            cur_prevout_hash: [0u8; 32],
            cur_prevout_n: 0,
            cur_input_map: None,
            witness_utxo_index: None,
            non_witness_utxo_index: None,
            redeem_script_index: None,
            sighash_type_index: None,
            derivation_candidates: Vec::new(),
            cur_sighash_type: 0,
            prevout_script: Vec::new(),
            hash_context: Sha256::default(),
            signatures: Vec::new(),
            device,
        })
    }

    /// Drives the session to completion.
    pub fn run(mut self) -> Result<Vec<PartialSignature>, Error> {
        while self.stage != Stage::Done {
            self.step()?;
        }
        Ok(self.signatures)
    }

    /// Executes exactly one stage and transitions. Any host round-trips the
    /// stage needs happen inside the collaborator calls.
    fn step(&mut self) -> Result<(), Error> {
        log::trace!("input {}: {:?}", self.cur_input_index, self.stage);
        match self.stage {
            Stage::CheckGlobalMap => self.check_global_map(),
            Stage::IdentifyInput => self.identify_input(),
            Stage::ScanInputMap => self.scan_input_map(),
            Stage::FetchSighashType => self.fetch_sighash_type(),
            Stage::CheckPrevout => self.check_prevout(),
            Stage::LegacyPass1 => self.legacy_pass1(),
            Stage::LegacyScriptCode => self.legacy_script_code(),
            Stage::LegacyPass2 => self.legacy_pass2(),
            Stage::LegacySign => self.legacy_sign(),
            Stage::SignSegwit => Err(Error::UnsupportedOperation),
            Stage::Done => Ok(()),
        }
    }

    /// Scans the global map (authenticating every key and enforcing sorted
    /// order), locates the unsigned transaction, and cross-checks the declared
    /// input/output counts against it.
    fn check_global_map(&mut self) -> Result<(), Error> {
        let keys = self.global_map.scan_keys(self.host)?;
        self.unsigned_tx_index = keys
            .iter()
            .position(|k| k.as_slice() == [PSBT_GLOBAL_UNSIGNED_TX].as_slice())
            .ok_or(Error::MissingRequiredField)?;

        let mut reader = self
            .global_map
            .value_reader_at(self.host, self.unsigned_tx_index)?;
        let fields = TxExtractor::identify().run(&mut reader)?;
        reader.finish()?;
        if fields.n_inputs != self.request.n_inputs || fields.n_outputs != self.request.n_outputs {
            return Err(Error::StructuralMismatch);
        }

        self.stage = Stage::IdentifyInput;
        Ok(())
    }

    /// Re-streams the unsigned transaction to capture the current input's
    /// prevout reference. Only one prevout is ever resident.
    fn identify_input(&mut self) -> Result<(), Error> {
        if self.cur_input_index == self.request.n_inputs {
            log::debug!("sign_psbt: {} signatures produced", self.signatures.len());
            self.stage = Stage::Done;
            return Ok(());
        }
        let mut reader = self
            .global_map
            .value_reader_at(self.host, self.unsigned_tx_index)?;
        let fields = TxExtractor::identify()
            .capture_input(self.cur_input_index)
            .run(&mut reader)?;
        reader.finish()?;
        let prevout = fields.input_prevout.ok_or(Error::StructuralMismatch)?;
        self.cur_prevout_hash = prevout.txid;
        self.cur_prevout_n = prevout.vout;
        self.stage = Stage::ScanInputMap;
        Ok(())
    }

    /// Obtains the current input's map commitment from the inputs tree and
    /// classifies its keys in a single authenticated scan. Only the type tags
    /// are inspected; no value is fetched yet.
    fn scan_input_map(&mut self) -> Result<(), Error> {
        let leaf_hash = fetch_leaf(
            self.host,
            &self.request.inputs_root,
            self.request.n_inputs,
            self.cur_input_index,
        )?;
        let mut reader = PreimageReader::new(self.host, leaf_hash)?;
        let descriptor = reader.read_to_end()?;
        reader.finish()?;
        let map = MerkleizedMap::new(MapCommitment::from_bytes(&descriptor)?);

        for (index, key) in map.scan_keys(self.host)?.iter().enumerate() {
            match key.as_slice() {
                [] => return Err(Error::MalformedField),
                [PSBT_IN_NON_WITNESS_UTXO] => self.non_witness_utxo_index = Some(index),
                [PSBT_IN_WITNESS_UTXO] => self.witness_utxo_index = Some(index),
                [PSBT_IN_SIGHASH_TYPE] => self.sighash_type_index = Some(index),
                [PSBT_IN_REDEEM_SCRIPT] => self.redeem_script_index = Some(index),
                [PSBT_IN_BIP32_DERIVATION, pubkey @ ..] if pubkey.len() == 33 => {
                    let mut pk = [0u8; 33];
                    pk.copy_from_slice(pubkey);
                    self.derivation_candidates.push((index, pk));
                }
                _ => {}
            }
        }

        self.cur_input_map = Some(map);
        self.stage = Stage::FetchSighashType;
        Ok(())
    }

    fn input_map(&self) -> Result<&MerkleizedMap, Error> {
        self.cur_input_map.as_ref().ok_or(Error::HostIo)
    }

    /// The sighash type is mandatory for every input.
    fn fetch_sighash_type(&mut self) -> Result<(), Error> {
        let index = self.sighash_type_index.ok_or(Error::MissingRequiredField)?;
        let value = self.input_map()?.value_at(self.host, index, 4)?;
        if value.len() != 4 {
            return Err(Error::MalformedField);
        }
        self.cur_sighash_type = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
        self.stage = Stage::CheckPrevout;
        Ok(())
    }

    /// Streams the claimed previous transaction, checks its double hash
    /// against the prevout reference captured from the unsigned transaction,
    /// and captures the spent output's script. This is the check that ties
    /// the script about to be signed to the transaction being authorized.
    fn check_prevout(&mut self) -> Result<(), Error> {
        if self.witness_utxo_index.is_some() {
            self.stage = Stage::SignSegwit;
            return Ok(());
        }
        let index = self
            .non_witness_utxo_index
            .ok_or(Error::MissingRequiredField)?;
        let mut reader = self.input_map()?.value_reader_at(self.host, index)?;
        let fields = TxExtractor::identify()
            .capture_output(self.cur_prevout_n as usize)
            .run(&mut reader)?;
        reader.finish()?;

        let txid = fields.txid.ok_or(Error::HostIo)?;
        if !bool::from(txid.as_slice().ct_eq(self.cur_prevout_hash.as_slice())) {
            log::debug!(
                "input {}: previous tx hashes to {}, prevout says {}",
                self.cur_input_index,
                hex::encode(txid),
                hex::encode(self.cur_prevout_hash)
            );
            return Err(Error::PrevoutMismatch);
        }
        let output = fields.output.ok_or(Error::PrevoutMismatch)?;
        self.prevout_script = output.script_pubkey;
        self.stage = Stage::LegacyPass1;
        Ok(())
    }

    /// Sighash pass 1: version and every input up to and including the signed
    /// input's prevout, other inputs' scripts replaced by an empty field.
    fn legacy_pass1(&mut self) -> Result<(), Error> {
        self.hash_context = <Sha256 as Hasher<32>>::new();
        let mut reader = self
            .global_map
            .value_reader_at(self.host, self.unsigned_tx_index)?;
        TxExtractor::legacy_pass1(self.cur_input_index, &mut self.hash_context)
            .run(&mut reader)?;
        reader.finish()?;
        self.stage = Stage::LegacyScriptCode;
        Ok(())
    }

    /// Inserts the script code between the two passes: the validated
    /// scriptPubKey itself (P2PKH), or the redeem script while reconstructing
    /// and checking the script-hash wrapper it must hash to (P2SH).
    fn legacy_script_code(&mut self) -> Result<(), Error> {
        match self.redeem_script_index {
            None => {
                let mut buf = [0u8; 9];
                let n = encode_compact_size(self.prevout_script.len() as u64, &mut buf);
                self.hash_context.update(&buf[..n]);
                self.hash_context.update(&self.prevout_script);
            }
            Some(index) => {
                let mut reader = self.input_map()?.value_reader_at(self.host, index)?;
                let len = reader.len();
                let mut buf = [0u8; 9];
                let n = encode_compact_size(len as u64, &mut buf);
                self.hash_context.update(&buf[..n]);

                let mut script_hasher = <Sha256 as Hasher<32>>::new();
                let mut remaining = len;
                let mut scratch = [0u8; 64];
                while remaining > 0 {
                    let take = core::cmp::min(remaining, scratch.len());
                    reader.read_exact(&mut scratch[..take])?;
                    self.hash_context.update(&scratch[..take]);
                    script_hasher.update(&scratch[..take]);
                    remaining -= take;
                }
                reader.finish()?;

                let script_hash = Ripemd160::hash(&script_hasher.finalize());
                let mut expected = [0u8; P2SH_SCRIPT_LEN];
                expected[0] = OP_HASH160;
                expected[1] = OP_PUSH_20;
                expected[2..22].copy_from_slice(&script_hash);
                expected[22] = OP_EQUAL;
                if self.prevout_script.as_slice() != expected.as_slice() {
                    return Err(Error::RedeemScriptMismatch);
                }
            }
        }
        self.stage = Stage::LegacyPass2;
        Ok(())
    }

    /// Sighash pass 2: the signed input's sequence, the remaining inputs,
    /// all outputs and the locktime, into the same hash context.
    fn legacy_pass2(&mut self) -> Result<(), Error> {
        let mut reader = self
            .global_map
            .value_reader_at(self.host, self.unsigned_tx_index)?;
        TxExtractor::legacy_pass2(self.cur_input_index, &mut self.hash_context)
            .run(&mut reader)?;
        reader.finish()?;
        self.stage = Stage::LegacySign;
        Ok(())
    }

    /// Finalizes the sighash, resolves the signing path from the input's
    /// key-origin entries, signs, and advances to the next input.
    fn legacy_sign(&mut self) -> Result<(), Error> {
        let mut hash_context = core::mem::take(&mut self.hash_context);
        hash_context.update(&self.cur_sighash_type.to_le_bytes());
        let sighash = finalize_sha256d(hash_context);

        let (path, pubkey) = self.resolve_signing_path()?;
        let vault = self.device.vault()?;
        let key = vault.derive(&path)?;
        if key.public_key()? != pubkey {
            return Err(Error::MalformedField);
        }
        let mut signature = key.sign_ecdsa(&sighash)?;
        signature.push(self.cur_sighash_type as u8);
        log::debug!(
            "input {}: signed, {} byte signature",
            self.cur_input_index,
            signature.len()
        );
        self.signatures.push(PartialSignature {
            input_index: self.cur_input_index as u32,
            signature,
            pubkey: pubkey.to_vec(),
        });

        self.reset_input_state();
        self.cur_input_index += 1;
        self.stage = Stage::IdentifyInput;
        Ok(())
    }

    /// Picks the signing path from the input's BIP32 key-origin entries: the
    /// first one whose fingerprint matches this device's master key.
    fn resolve_signing_path(&self) -> Result<(Vec<u32>, [u8; 33]), Error> {
        let map = self.input_map()?;
        for &(index, pubkey) in &self.derivation_candidates {
            let value =
                map.value_at(self.host, index, 4 + 4 * MAX_BIP32_PATH_STEPS)?;
            if value.len() < 4 || (value.len() - 4) % 4 != 0 {
                return Err(Error::MalformedField);
            }
            if value[..4] != self.master_fingerprint {
                continue;
            }
            let path: Vec<u32> = value[4..]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            return Ok((path, pubkey));
        }
        Err(Error::MissingRequiredField)
    }

    fn reset_input_state(&mut self) {
        self.cur_prevout_hash = [0u8; 32];
        self.cur_prevout_n = 0;
        self.cur_input_map = None;
        self.witness_utxo_index = None;
        self.non_witness_utxo_index = None;
        self.redeem_script_index = None;
        self.sighash_type_index = None;
        self.derivation_candidates.clear();
        self.cur_sighash_type = 0;
        self.prevout_script.clear();
    }
}

/// Command entry point: decode, validate, drive the session, map the outcome
/// onto the wire response.
pub fn handle_sign_psbt<H: HostIo>(
    device: &Device,
    host: &H,
    p1: u8,
    p2: u8,
    payload: &[u8],
) -> Response {
    let outcome = SignPsbtRequest::decode(p1, p2, payload)
        .and_then(|request| SigningSession::new(device, host, request))
        .and_then(SigningSession::run);
    match outcome {
        Ok(signatures) => Response::PsbtSigned(signatures),
        Err(e) => {
            log::debug!("sign_psbt failed: {}", e);
            Response::Failure(e.status_word().as_u16())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash160;
    use crate::hostio::MemoryHost;
    use crate::keys::KeyVault;
    use bitcoin::absolute::LockTime;
    use bitcoin::consensus::encode::serialize;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, Txid, Witness};
    use common::message::StatusWord;
    use hex_literal::hex;
    use k256::ecdsa::signature::hazmat::PrehashVerifier;
    use k256::ecdsa::{Signature, VerifyingKey};

    const SEED: [u8; 16] = hex!("000102030405060708090a0b0c0d0e0f");
    const PATH: [u32; 5] = [0x8000002c, 0x80000001, 0x80000000, 0, 0];

    fn unlocked_device() -> Device {
        let mut device = Device::new(KeyVault::new(&SEED).unwrap());
        device.unlock();
        device
    }

    fn signer_pubkey(device: &Device) -> [u8; 33] {
        device.vault().unwrap().derive(&PATH).unwrap().public_key().unwrap()
    }

    fn p2pkh_script(pubkey: &[u8; 33]) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&hash160(pubkey));
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    fn derivation_value(device: &Device, path: &[u32]) -> Vec<u8> {
        let mut value = device.vault().unwrap().master_fingerprint().unwrap().to_vec();
        for step in path {
            value.extend_from_slice(&step.to_le_bytes());
        }
        value
    }

    /// A previous transaction with one output paying `script_pubkey`.
    fn prev_tx(script_pubkey: &[u8], value: u64) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([0x33; 32]),
                    vout: 7,
                },
                script_sig: ScriptBuf::from_bytes(vec![0x00]),
                sequence: Sequence(0xffffffff),
                witness: Witness::new(),
            }],
            output: vec![bitcoin::TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::from_bytes(script_pubkey.to_vec()),
            }],
        }
    }

    fn unsigned_tx(prevs: &[(&Transaction, u32)]) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: prevs
                .iter()
                .map(|(tx, vout)| TxIn {
                    previous_output: OutPoint {
                        txid: tx.compute_txid(),
                        vout: *vout,
                    },
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence(0xfffffffd),
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![bitcoin::TxOut {
                value: Amount::from_sat(90_000),
                script_pubkey: ScriptBuf::from_bytes(
                    hex!("76a914751e76e8199196d454941c45d1b3a323f1433bd688ac").to_vec(),
                ),
            }],
        }
    }

    /// Commits all maps and assembles the request payload.
    fn build_payload(
        host: &mut MemoryHost,
        unsigned: &Transaction,
        input_maps: Vec<Vec<(Vec<u8>, Vec<u8>)>>,
        n_outputs: usize,
    ) -> Vec<u8> {
        build_payload_with_counts(
            host,
            unsigned,
            input_maps.len(),
            input_maps,
            n_outputs,
        )
    }

    fn build_payload_with_counts(
        host: &mut MemoryHost,
        unsigned: &Transaction,
        n_inputs: usize,
        input_maps: Vec<Vec<(Vec<u8>, Vec<u8>)>>,
        n_outputs: usize,
    ) -> Vec<u8> {
        let global = host.commit_map(&[(
            vec![PSBT_GLOBAL_UNSIGNED_TX],
            serialize(unsigned),
        )]);
        let input_leaves: Vec<Vec<u8>> = input_maps
            .iter()
            .map(|entries| host.commit_map(entries).encode())
            .collect();
        let inputs_root = host.add_tree(input_leaves);
        let output_leaves: Vec<Vec<u8>> = (0..n_outputs)
            .map(|_| host.commit_map(&[]).encode())
            .collect();
        let outputs_root = host.add_tree(output_leaves);

        let mut payload = global.encode();
        let mut buf = [0u8; 9];
        let n = encode_compact_size(n_inputs as u64, &mut buf);
        payload.extend_from_slice(&buf[..n]);
        payload.extend_from_slice(&inputs_root);
        let n = encode_compact_size(n_outputs as u64, &mut buf);
        payload.extend_from_slice(&buf[..n]);
        payload.extend_from_slice(&outputs_root);
        payload
    }

    fn p2pkh_input_map(device: &Device, prev: &Transaction) -> Vec<(Vec<u8>, Vec<u8>)> {
        let pubkey = signer_pubkey(device);
        let mut derivation_key = vec![PSBT_IN_BIP32_DERIVATION];
        derivation_key.extend_from_slice(&pubkey);
        vec![
            (vec![PSBT_IN_NON_WITNESS_UTXO], serialize(prev)),
            (vec![PSBT_IN_SIGHASH_TYPE], 1u32.to_le_bytes().to_vec()),
            (derivation_key, derivation_value(device, &PATH)),
        ]
    }

    fn expect_failure(response: Response, status: StatusWord) {
        assert_eq!(response, Response::Failure(status.as_u16()));
    }

    #[test]
    fn p2pkh_spend_produces_verifiable_signature() {
        let device = unlocked_device();
        let pubkey = signer_pubkey(&device);
        let script = p2pkh_script(&pubkey);
        let prev = prev_tx(&script, 100_000);
        let unsigned = unsigned_tx(&[(&prev, 0)]);

        let mut host = MemoryHost::new();
        let payload = build_payload(
            &mut host,
            &unsigned,
            vec![p2pkh_input_map(&device, &prev)],
            1,
        );

        let response = handle_sign_psbt(&device, &host, 0, 0, &payload);
        let signatures = match response {
            Response::PsbtSigned(s) => s,
            other => panic!("unexpected response: {:?}", other),
        };
        assert_eq!(signatures.len(), 1);
        let sig = &signatures[0];
        assert_eq!(sig.input_index, 0);
        assert_eq!(sig.pubkey, pubkey.to_vec());
        assert_eq!(*sig.signature.last().unwrap(), 0x01);

        let expected_sighash = bitcoin::sighash::SighashCache::new(&unsigned)
            .legacy_signature_hash(0, &ScriptBuf::from_bytes(script), 1)
            .unwrap();
        let verifying_key = VerifyingKey::from_sec1_bytes(&sig.pubkey).unwrap();
        let der = &sig.signature[..sig.signature.len() - 1];
        let signature = Signature::from_der(der).unwrap();
        verifying_key
            .verify_prehash(&expected_sighash.to_byte_array(), &signature)
            .unwrap();
    }

    #[test]
    fn two_inputs_are_signed_in_order() {
        let device = unlocked_device();
        let pubkey = signer_pubkey(&device);
        let script = p2pkh_script(&pubkey);
        let prev_a = prev_tx(&script, 60_000);
        let prev_b = prev_tx(&script, 40_000);
        let unsigned = unsigned_tx(&[(&prev_a, 0), (&prev_b, 0)]);

        let mut host = MemoryHost::new();
        let payload = build_payload(
            &mut host,
            &unsigned,
            vec![
                p2pkh_input_map(&device, &prev_a),
                p2pkh_input_map(&device, &prev_b),
            ],
            1,
        );

        let signatures = match handle_sign_psbt(&device, &host, 0, 0, &payload) {
            Response::PsbtSigned(s) => s,
            other => panic!("unexpected response: {:?}", other),
        };
        assert_eq!(signatures.len(), 2);
        let cache = bitcoin::sighash::SighashCache::new(&unsigned);
        for (i, sig) in signatures.iter().enumerate() {
            assert_eq!(sig.input_index, i as u32);
            let expected = cache
                .legacy_signature_hash(i, &ScriptBuf::from_bytes(script.clone()), 1)
                .unwrap();
            let verifying_key = VerifyingKey::from_sec1_bytes(&sig.pubkey).unwrap();
            let der = Signature::from_der(&sig.signature[..sig.signature.len() - 1]).unwrap();
            verifying_key
                .verify_prehash(&expected.to_byte_array(), &der)
                .unwrap();
        }
    }

    #[test]
    fn p2sh_spend_signs_with_redeem_script() {
        let device = unlocked_device();
        let pubkey = signer_pubkey(&device);
        // redeem script: the p2pkh pattern, wrapped in p2sh
        let redeem = p2pkh_script(&pubkey);
        let mut script = vec![0xa9, 0x14];
        script.extend_from_slice(&hash160(&redeem));
        script.push(0x87);
        let prev = prev_tx(&script, 100_000);
        let unsigned = unsigned_tx(&[(&prev, 0)]);

        let mut input_map = p2pkh_input_map(&device, &prev);
        input_map.push((vec![PSBT_IN_REDEEM_SCRIPT], redeem.clone()));

        let mut host = MemoryHost::new();
        let payload = build_payload(&mut host, &unsigned, vec![input_map], 1);

        let signatures = match handle_sign_psbt(&device, &host, 0, 0, &payload) {
            Response::PsbtSigned(s) => s,
            other => panic!("unexpected response: {:?}", other),
        };
        // for p2sh the redeem script is the script code
        let expected = bitcoin::sighash::SighashCache::new(&unsigned)
            .legacy_signature_hash(0, &ScriptBuf::from_bytes(redeem), 1)
            .unwrap();
        let sig = &signatures[0];
        let verifying_key = VerifyingKey::from_sec1_bytes(&sig.pubkey).unwrap();
        let der = Signature::from_der(&sig.signature[..sig.signature.len() - 1]).unwrap();
        verifying_key
            .verify_prehash(&expected.to_byte_array(), &der)
            .unwrap();
    }

    #[test]
    fn wrong_redeem_script_is_rejected_before_signing() {
        let device = unlocked_device();
        let pubkey = signer_pubkey(&device);
        let redeem = p2pkh_script(&pubkey);
        // script hash does not match the redeem script
        let mut script = vec![0xa9, 0x14];
        script.extend_from_slice(&[0x5a; 20]);
        script.push(0x87);
        let prev = prev_tx(&script, 100_000);
        let unsigned = unsigned_tx(&[(&prev, 0)]);

        let mut input_map = p2pkh_input_map(&device, &prev);
        input_map.push((vec![PSBT_IN_REDEEM_SCRIPT], redeem));

        let mut host = MemoryHost::new();
        let payload = build_payload(&mut host, &unsigned, vec![input_map], 1);

        let request = SignPsbtRequest::decode(0, 0, &payload).unwrap();
        let session = SigningSession::new(&device, &host, request).unwrap();
        assert_eq!(session.run(), Err(Error::RedeemScriptMismatch));
    }

    #[test]
    fn tampered_previous_transaction_is_detected() {
        let device = unlocked_device();
        let pubkey = signer_pubkey(&device);
        let script = p2pkh_script(&pubkey);
        let prev = prev_tx(&script, 100_000);
        let unsigned = unsigned_tx(&[(&prev, 0)]);

        // commit a previous transaction with one byte changed (the output
        // value), so its hash no longer matches the prevout reference
        let mut tampered = prev.clone();
        tampered.output[0].value = Amount::from_sat(100_001);
        let mut input_map = p2pkh_input_map(&device, &prev);
        input_map[0].1 = serialize(&tampered);

        let mut host = MemoryHost::new();
        let payload = build_payload(&mut host, &unsigned, vec![input_map], 1);

        let request = SignPsbtRequest::decode(0, 0, &payload).unwrap();
        let session = SigningSession::new(&device, &host, request).unwrap();
        assert_eq!(session.run(), Err(Error::PrevoutMismatch));
    }

    #[test]
    fn missing_sighash_type_aborts() {
        let device = unlocked_device();
        let pubkey = signer_pubkey(&device);
        let script = p2pkh_script(&pubkey);
        let prev = prev_tx(&script, 100_000);
        let unsigned = unsigned_tx(&[(&prev, 0)]);

        let mut input_map = p2pkh_input_map(&device, &prev);
        input_map.retain(|(k, _)| k != &vec![PSBT_IN_SIGHASH_TYPE]);

        let mut host = MemoryHost::new();
        let payload = build_payload(&mut host, &unsigned, vec![input_map], 1);

        let request = SignPsbtRequest::decode(0, 0, &payload).unwrap();
        let session = SigningSession::new(&device, &host, request).unwrap();
        assert_eq!(session.run(), Err(Error::MissingRequiredField));
    }

    #[test]
    fn witness_utxo_input_is_unsupported() {
        let device = unlocked_device();
        let pubkey = signer_pubkey(&device);
        let script = p2pkh_script(&pubkey);
        let prev = prev_tx(&script, 100_000);
        let unsigned = unsigned_tx(&[(&prev, 0)]);

        let mut input_map = p2pkh_input_map(&device, &prev);
        input_map.push((vec![PSBT_IN_WITNESS_UTXO], vec![0u8; 30]));

        let mut host = MemoryHost::new();
        let payload = build_payload(&mut host, &unsigned, vec![input_map], 1);

        expect_failure(
            handle_sign_psbt(&device, &host, 0, 0, &payload),
            StatusWord::BadState,
        );
    }

    #[test]
    fn count_mismatch_fails_before_signing() {
        let device = unlocked_device();
        let pubkey = signer_pubkey(&device);
        let script = p2pkh_script(&pubkey);
        let prev = prev_tx(&script, 100_000);
        let unsigned = unsigned_tx(&[(&prev, 0)]);

        let mut host = MemoryHost::new();
        // declare two inputs while the transaction has one
        let payload = build_payload_with_counts(
            &mut host,
            &unsigned,
            2,
            vec![
                p2pkh_input_map(&device, &prev),
                p2pkh_input_map(&device, &prev),
            ],
            1,
        );

        let request = SignPsbtRequest::decode(0, 0, &payload).unwrap();
        let session = SigningSession::new(&device, &host, request).unwrap();
        assert_eq!(session.run(), Err(Error::StructuralMismatch));
    }

    #[test]
    fn foreign_fingerprint_means_no_signing_path() {
        let device = unlocked_device();
        let pubkey = signer_pubkey(&device);
        let script = p2pkh_script(&pubkey);
        let prev = prev_tx(&script, 100_000);
        let unsigned = unsigned_tx(&[(&prev, 0)]);

        let mut input_map = p2pkh_input_map(&device, &prev);
        // corrupt the key-origin fingerprint
        for entry in &mut input_map {
            if entry.0.first() == Some(&PSBT_IN_BIP32_DERIVATION) {
                entry.1[0] ^= 0xff;
            }
        }

        let mut host = MemoryHost::new();
        let payload = build_payload(&mut host, &unsigned, vec![input_map], 1);

        let request = SignPsbtRequest::decode(0, 0, &payload).unwrap();
        let session = SigningSession::new(&device, &host, request).unwrap();
        assert_eq!(session.run(), Err(Error::MissingRequiredField));
    }

    #[test]
    fn locked_device_refuses_to_sign() {
        let device = Device::new(KeyVault::new(&SEED).unwrap());
        let host = MemoryHost::new();
        let payload = [0u8; 83];
        expect_failure(
            handle_sign_psbt(&device, &host, 0, 0, &payload),
            StatusWord::SecurityStatusNotSatisfied,
        );
    }

    #[test]
    fn nonzero_p1_p2_is_rejected() {
        let device = unlocked_device();
        let host = MemoryHost::new();
        expect_failure(
            handle_sign_psbt(&device, &host, 1, 0, &[]),
            StatusWord::WrongP1P2,
        );
        expect_failure(
            handle_sign_psbt(&device, &host, 0, 2, &[]),
            StatusWord::WrongP1P2,
        );
    }

    #[test]
    fn truncated_or_padded_payload_is_rejected() {
        let device = unlocked_device();
        let host = MemoryHost::new();
        expect_failure(
            handle_sign_psbt(&device, &host, 0, 0, &[0u8; 10]),
            StatusWord::WrongDataLength,
        );
        expect_failure(
            handle_sign_psbt(&device, &host, 0, 0, &[0u8; 84]),
            StatusWord::WrongDataLength,
        );
    }

    #[test]
    fn count_boundary_at_252() {
        // decode-level boundary check: 252 parses, 253 is out of range
        let mut payload = Vec::new();
        payload.push(252u8);
        payload.extend_from_slice(&[0u8; 40]);
        payload.push(252u8);
        payload.extend_from_slice(&[0u8; 20]);
        payload.push(252u8);
        payload.extend_from_slice(&[0u8; 20]);
        let request = SignPsbtRequest::decode(0, 0, &payload).unwrap();
        assert_eq!(request.global_map.size, 252);
        assert_eq!(request.n_inputs, 252);
        assert_eq!(request.n_outputs, 252);

        let mut payload = Vec::new();
        payload.extend_from_slice(&[0xfd, 253, 0]);
        payload.extend_from_slice(&[0u8; 40]);
        payload.push(1u8);
        payload.extend_from_slice(&[0u8; 20]);
        payload.push(1u8);
        payload.extend_from_slice(&[0u8; 20]);
        assert_eq!(
            SignPsbtRequest::decode(0, 0, &payload),
            Err(Error::CountOutOfRange)
        );
    }

    #[test]
    fn identical_runs_produce_identical_signatures() {
        let device = unlocked_device();
        let pubkey = signer_pubkey(&device);
        let script = p2pkh_script(&pubkey);
        let prev = prev_tx(&script, 100_000);
        let unsigned = unsigned_tx(&[(&prev, 0)]);

        let mut host = MemoryHost::new();
        let payload = build_payload(
            &mut host,
            &unsigned,
            vec![p2pkh_input_map(&device, &prev)],
            1,
        );

        let first = handle_sign_psbt(&device, &host, 0, 0, &payload);
        let second = handle_sign_psbt(&device, &host, 0, 0, &payload);
        assert!(matches!(first, Response::PsbtSigned(_)));
        assert_eq!(first, second);
    }
}
