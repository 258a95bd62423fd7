//! Building, signing and reading the transactions that carry chat payloads.

use crate::backend::{BackendKind, ChainBackend, Utxo};
use crate::codec;
use crate::error::{ChatError, Result};
use crate::fees::{self, Selection, DUST_LIMIT};
use crate::keys::{self, ChainParams, KeyPair};
use bitcoin::script::{Instruction, PushBytesBuf};
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message as SighashMessage, PublicKey, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{absolute, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use std::str::FromStr;

/// What an input commits to about the output it spends.
#[derive(Debug, Clone)]
pub enum PrevoutSource {
    /// Script and value given inline (indexer backends).
    WitnessOutput(TxOut),
    /// The whole funding transaction (legacy node).
    FullTransaction(Transaction),
}

#[derive(Debug, Clone)]
pub struct SpendInput {
    pub utxo: Utxo,
    pub source: PrevoutSource,
}

impl SpendInput {
    /// The spent output, checked against the UTXO it claims to be.
    pub fn prevout(&self) -> Result<TxOut> {
        match &self.source {
            PrevoutSource::WitnessOutput(out) => Ok(out.clone()),
            PrevoutSource::FullTransaction(tx) => {
                let txid = tx.compute_txid().to_string();
                if txid != self.utxo.txid {
                    return Err(ChatError::Signing(format!(
                        "funding transaction {txid} does not match input {}",
                        self.utxo.txid
                    )));
                }
                tx.output.get(self.utxo.vout as usize).cloned().ok_or_else(|| {
                    ChatError::Signing(format!("output {}:{} does not exist", self.utxo.txid, self.utxo.vout))
                })
            }
        }
    }
}

/// Parameters of one chat send.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub recipient_hex: String,
    pub text: String,
    pub payment: Amount,
    pub fee_rate: u64,
}

/// What a successful broadcast produced.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub txid: String,
    pub fee: Amount,
    pub recipient_amount: Amount,
    pub total_spent: Amount,
    pub change: Option<Amount>,
    pub raw: Vec<u8>,
}

pub struct TransactionBuilder<'a> {
    keys: &'a KeyPair,
    chain: &'a ChainParams,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(keys: &'a KeyPair, chain: &'a ChainParams) -> Self {
        Self { keys, chain }
    }

    pub fn own_script(&self) -> ScriptBuf {
        keys::p2wpkh_script(self.keys.public_key())
    }

    /// Outputs in fixed order: data carrier, recipient, then change if any.
    pub fn build_unsigned(
        &self,
        inputs: &[SpendInput],
        payload: &[u8],
        recipient: &PublicKey,
        recipient_amount: Amount,
        change: Option<Amount>,
    ) -> Result<Transaction> {
        let push = PushBytesBuf::try_from(payload.to_vec())
            .map_err(|_| ChatError::Signing("payload too large for a data output".into()))?;

        let mut output = vec![
            TxOut { value: Amount::ZERO, script_pubkey: ScriptBuf::new_op_return(push) },
            TxOut { value: recipient_amount.max(DUST_LIMIT), script_pubkey: keys::p2wpkh_script(recipient) },
        ];
        if let Some(change) = change.filter(|c| *c > DUST_LIMIT) {
            output.push(TxOut { value: change, script_pubkey: self.own_script() });
        }

        let input = inputs
            .iter()
            .map(|i| {
                let txid = Txid::from_str(&i.utxo.txid)
                    .map_err(|e| ChatError::Signing(format!("bad input txid {}: {e}", i.utxo.txid)))?;
                Ok(TxIn {
                    previous_output: OutPoint::new(txid, i.utxo.vout),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Transaction { version: Version::TWO, lock_time: absolute::LockTime::ZERO, input, output })
    }

    /// BIP143 SIGHASH_ALL over every input, finalized as `[signature, pubkey]` witnesses.
    pub fn sign(&self, tx: &mut Transaction, inputs: &[SpendInput]) -> Result<()> {
        if tx.input.len() != inputs.len() {
            return Err(ChatError::Signing("input count mismatch".into()));
        }
        let own = self.own_script();
        let secp = Secp256k1::signing_only();

        let mut witnesses = Vec::with_capacity(inputs.len());
        {
            let mut cache = SighashCache::new(&*tx);
            for (index, input) in inputs.iter().enumerate() {
                let prevout = input.prevout()?;
                if prevout.script_pubkey != own {
                    return Err(ChatError::Signing(format!(
                        "input {}:{} is not locked to this key",
                        input.utxo.txid, input.utxo.vout
                    )));
                }
                let sighash = cache
                    .p2wpkh_signature_hash(index, &prevout.script_pubkey, prevout.value, EcdsaSighashType::All)
                    .map_err(|e| ChatError::Signing(e.to_string()))?;
                let msg = SighashMessage::from_digest(sighash.to_byte_array());
                let signature = bitcoin::ecdsa::Signature {
                    signature: secp.sign_ecdsa(&msg, self.keys.secret_key()),
                    sighash_type: EcdsaSighashType::All,
                };

                let mut witness = Witness::new();
                witness.push(signature.to_vec());
                witness.push(self.keys.public_key().serialize());
                witnesses.push(witness);
            }
        }

        for (txin, witness) in tx.input.iter_mut().zip(witnesses) {
            txin.witness = witness;
        }
        Ok(())
    }

    /// Look up what each selected input spends, the way the backend requires.
    pub async fn resolve_inputs(&self, backend: &dyn ChainBackend, utxos: &[Utxo]) -> Result<Vec<SpendInput>> {
        let own = self.own_script();
        let mut out = Vec::with_capacity(utxos.len());
        for utxo in utxos {
            let source = match backend.kind() {
                BackendKind::Indexer => {
                    PrevoutSource::WitnessOutput(TxOut { value: utxo.amount, script_pubkey: own.clone() })
                }
                BackendKind::Legacy => {
                    let raw = backend.get_raw_transaction(&utxo.txid).await?;
                    let tx: Transaction = encode::deserialize(&raw)
                        .map_err(|e| ChatError::Decode(format!("funding transaction {}: {e}", utxo.txid)))?;
                    PrevoutSource::FullTransaction(tx)
                }
            };
            out.push(SpendInput { utxo: utxo.clone(), source });
        }
        Ok(out)
    }

    /// Encrypt, select, build, sign and broadcast one message.
    pub async fn send(&self, backend: &dyn ChainBackend, candidates: &[Utxo], req: &SendRequest) -> Result<SendReceipt> {
        let recipient = keys::parse_public_key(&req.recipient_hex)?;
        let envelope = codec::encrypt(&req.text, req.recipient_hex.trim(), self.keys.secret_key())?;
        let payload = codec::encode_envelope(&self.chain.message_tag, &envelope);

        let recipient_amount = req.payment.max(DUST_LIMIT);
        let selection: Selection = fees::select(candidates, recipient_amount, payload.len(), req.fee_rate)?;
        tracing::debug!(
            "🧮 Selected {} input(s) totalling {} sat, fee {} sat (~{} vB)",
            selection.inputs.len(),
            selection.input_total.to_sat(),
            selection.fee.to_sat(),
            selection.vbytes
        );

        let inputs = self.resolve_inputs(backend, &selection.inputs).await?;
        let mut tx = self.build_unsigned(&inputs, &payload, &recipient, recipient_amount, selection.change)?;
        self.sign(&mut tx, &inputs)?;

        let raw = encode::serialize(&tx);
        let txid = backend.broadcast(&raw).await?;
        tracing::info!("📤 Broadcast message transaction {txid}");

        Ok(SendReceipt {
            txid,
            fee: selection.fee,
            recipient_amount,
            total_spent: recipient_amount + selection.fee,
            change: selection.change,
            raw,
        })
    }
}

/// The chat payload carried by a transaction, if any. The last data output wins.
pub fn extract_payload(tx: &Transaction, tag: &[u8; 4]) -> Option<String> {
    let mut found = None;
    for out in tx.output.iter().filter(|o| o.script_pubkey.is_op_return()) {
        let push = out.script_pubkey.instructions().nth(1);
        if let Some(Ok(Instruction::PushBytes(bytes))) = push {
            let text = codec::parse_envelope(tag, bytes.as_bytes());
            if !text.is_empty() {
                found = Some(text);
            }
        }
    }
    found
}

/// Sender key from input 0: the witness pubkey for segwit spends, else the last scriptSig push.
pub fn recover_sender(tx: &Transaction) -> Option<String> {
    let input = tx.input.first()?;
    let candidate: Vec<u8> = if input.witness.len() == 2 {
        input.witness.nth(1)?.to_vec()
    } else {
        match input.script_sig.instructions().last()? {
            Ok(Instruction::PushBytes(bytes)) => bytes.as_bytes().to_vec(),
            _ => return None,
        }
    };
    keys::is_valid_point(&candidate).then(|| hex::encode(candidate))
}

/// First standard output not paying `own_address`, with all outputs to that same address summed.
pub fn recipient_output_info(tx: &Transaction, own_address: &str, chain: &ChainParams) -> Option<(String, Amount)> {
    let mut recipient: Option<(String, Amount)> = None;
    for out in tx.output.iter().filter(|o| !o.script_pubkey.is_op_return()) {
        let Some(addr) = keys::address_from_script(&out.script_pubkey, chain) else { continue };
        if let Some((known, total)) = recipient.as_mut() {
            if *known == addr {
                *total += out.value;
            }
        } else if addr != own_address {
            recipient = Some((addr, out.value));
        }
    }
    recipient
}

/// Total paid to `own_script`, or `None` if nothing is.
pub fn received_amount(tx: &Transaction, own_script: &ScriptBuf) -> Option<Amount> {
    let mut paid = None;
    for out in tx.output.iter().filter(|o| &o.script_pubkey == own_script) {
        paid = Some(paid.unwrap_or(Amount::ZERO).checked_add(out.value).unwrap_or(Amount::MAX));
    }
    paid
}

/// Amounts at or below dust are the carrier floor, not a payment.
pub fn reportable_amount(amount: Amount) -> Option<Amount> {
    (amount > DUST_LIMIT).then_some(amount)
}

pub fn decode_transaction(raw: &[u8]) -> Result<Transaction> {
    encode::deserialize(raw).map_err(|e| ChatError::Decode(format!("transaction: {e}")))
}
