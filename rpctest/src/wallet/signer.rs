//! P2PKH input signing and verification.
//!
//! Only `SIGHASH_ALL` signatures are produced. Verification understands the
//! `<sig> <pubkey>` script_sig form and nothing else, which is all the harness
//! wallet and the in-memory node exchange.

use dashcore::blockdata::script::{Builder, Instruction, PushBytes, ScriptBuf};
use dashcore::hashes::Hash;
use dashcore::sighash::{EcdsaSighashType, SighashCache};
use dashcore::Transaction;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, Signing, Verification, ecdsa};
use thiserror::Error;

/// Errors while producing or checking an input signature.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("input index {index} out of bounds, transaction has {inputs} inputs")]
    InputOutOfBounds {
        index: usize,
        inputs: usize,
    },

    #[error("sighash: {0}")]
    Sighash(String),

    #[error("script_sig is not <sig> <pubkey>")]
    MalformedScriptSig,

    #[error("public key does not match the previous output")]
    PubkeyMismatch,

    #[error("secp256k1: {0}")]
    Secp256k1(#[from] secp256k1::Error),
}

fn signature_hash(
    tx: &Transaction,
    index: usize,
    script_pubkey: &ScriptBuf,
    sighash_type: u32,
) -> Result<Message, SignatureError> {
    if index >= tx.input.len() {
        return Err(SignatureError::InputOutOfBounds {
            index,
            inputs: tx.input.len(),
        });
    }
    let sighash = SighashCache::new(tx)
        .legacy_signature_hash(index, script_pubkey, sighash_type)
        .map_err(|e| SignatureError::Sighash(e.to_string()))?;
    Ok(Message::from_digest(*sighash.as_byte_array()))
}

/// Produces the `<sig> <pubkey>` script_sig for input `index` spending `script_pubkey`.
pub fn sign_input<C: Signing>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    index: usize,
    script_pubkey: &ScriptBuf,
    secret_key: &SecretKey,
) -> Result<ScriptBuf, SignatureError> {
    let message = signature_hash(tx, index, script_pubkey, EcdsaSighashType::All.to_u32())?;
    let signature = secp.sign_ecdsa(&message, secret_key);

    let mut sig_bytes = signature.serialize_der().to_vec();
    sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);
    let pubkey = PublicKey::from_secret_key(secp, secret_key);

    let sig_push = <&PushBytes>::try_from(sig_bytes.as_slice())
        .map_err(|_| SignatureError::MalformedScriptSig)?;
    Ok(Builder::new().push_slice(sig_push).push_slice(pubkey.serialize()).into_script())
}

/// Checks input `index`'s script_sig against the P2PKH output it spends.
pub fn verify_input<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    index: usize,
    script_pubkey: &ScriptBuf,
) -> Result<(), SignatureError> {
    let input = tx.input.get(index).ok_or(SignatureError::InputOutOfBounds {
        index,
        inputs: tx.input.len(),
    })?;

    let mut pushes = Vec::with_capacity(2);
    for instruction in input.script_sig.instructions() {
        match instruction {
            Ok(Instruction::PushBytes(bytes)) => pushes.push(bytes.as_bytes()),
            _ => return Err(SignatureError::MalformedScriptSig),
        }
    }
    let [sig_with_type, pubkey_bytes] = pushes.as_slice() else {
        return Err(SignatureError::MalformedScriptSig);
    };
    let (sighash_byte, der) =
        sig_with_type.split_last().ok_or(SignatureError::MalformedScriptSig)?;

    let pubkey = PublicKey::from_slice(pubkey_bytes)?;
    let expected = ScriptBuf::new_p2pkh(&dashcore::PublicKey::new(pubkey).pubkey_hash());
    if expected != *script_pubkey {
        return Err(SignatureError::PubkeyMismatch);
    }

    let signature = ecdsa::Signature::from_der(der)?;
    let message = signature_hash(tx, index, script_pubkey, u32::from(*sighash_byte))?;
    secp.verify_ecdsa(&message, &signature, &pubkey)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashcore::{OutPoint, TxIn, TxOut, Txid, Witness};

    fn input(txid: &[u8], vout: u32) -> TxIn {
        TxIn {
            previous_output: OutPoint::new(Txid::hash(txid), vout),
            script_sig: ScriptBuf::new(),
            sequence: 0xffffffff,
            witness: Witness::default(),
        }
    }

    fn two_input_tx() -> Transaction {
        Transaction {
            version: 2,
            lock_time: 0,
            input: vec![input(b"a", 0), input(b"b", 3)],
            output: vec![TxOut {
                value: 1_000,
                script_pubkey: ScriptBuf::new(),
            }],
            special_transaction_payload: None,
        }
    }

    fn p2pkh_script(secp: &Secp256k1<secp256k1::All>, key: &SecretKey) -> ScriptBuf {
        let pubkey = dashcore::PublicKey::new(PublicKey::from_secret_key(secp, key));
        ScriptBuf::new_p2pkh(&pubkey.pubkey_hash())
    }

    #[test]
    fn sign_then_verify() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let prev_script = p2pkh_script(&secp, &key);

        let mut tx = two_input_tx();
        tx.input[1].script_sig = sign_input(&secp, &tx, 1, &prev_script, &key).unwrap();
        verify_input(&secp, &tx, 1, &prev_script).unwrap();

        // Signature commits to the outputs.
        tx.output[0].value += 1;
        assert!(verify_input(&secp, &tx, 1, &prev_script).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let other = SecretKey::from_slice(&[0x33; 32]).unwrap();
        let prev_script = p2pkh_script(&secp, &other);

        let mut tx = two_input_tx();
        tx.input[0].script_sig = sign_input(&secp, &tx, 0, &prev_script, &key).unwrap();
        assert_eq!(
            verify_input(&secp, &tx, 0, &prev_script),
            Err(SignatureError::PubkeyMismatch)
        );
    }

    #[test]
    fn unsigned_and_out_of_bounds_inputs() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x44; 32]).unwrap();
        let prev_script = p2pkh_script(&secp, &key);
        let tx = two_input_tx();

        assert_eq!(
            verify_input(&secp, &tx, 0, &prev_script),
            Err(SignatureError::MalformedScriptSig)
        );
        assert_eq!(
            sign_input(&secp, &tx, 5, &prev_script, &key),
            Err(SignatureError::InputOutOfBounds {
                index: 5,
                inputs: 2
            })
        );
    }
}
