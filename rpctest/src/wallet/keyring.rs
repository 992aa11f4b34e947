//! Deterministic key derivation for the harness wallet.
//!
//! Keys are BIP32 non-hardened children of the master key derived from the
//! seed (`m/i`). Derivation is pure: the same `(seed, index)` always yields
//! the same key, so the only state kept here is the next unused index and the
//! address -> index lookup table.

use std::collections::HashMap;
use std::fmt;

use dashcore::Address;
use dashcore::hashes::{Hash, sha256d};
use key_wallet::bip32::{ChildNumber, DerivationPath, ExtendedPrivKey};
use secp256k1::{All, PublicKey, Secp256k1, SecretKey};

use crate::chain_params::ChainParams;
use crate::error::{WalletError, WalletResult};

/// Length of a harness seed: a fixed 32-byte secret followed by the harness id.
pub const SEED_LEN: usize = 36;

/// Master secret owned by a [`KeyRing`].
#[derive(Clone, PartialEq, Eq)]
pub struct Seed([u8; SEED_LEN]);

impl Seed {
    pub fn from_slice(bytes: &[u8]) -> WalletResult<Self> {
        let array: [u8; SEED_LEN] = bytes.try_into().map_err(|_| WalletError::InvalidSeed {
            expected: SEED_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    /// The deterministic seed of harness number `id`.
    ///
    /// Distinct harnesses get distinct key spaces while every run of the same
    /// test reproduces the same addresses.
    pub fn for_harness(id: u32) -> Self {
        let fixed = sha256d::Hash::hash(b"dashcore-rpctest harness seed").to_byte_array();
        let mut seed = [0u8; SEED_LEN];
        seed[..32].copy_from_slice(&fixed);
        seed[32..].copy_from_slice(&id.to_be_bytes());
        Self(seed)
    }

    pub fn as_bytes(&self) -> &[u8; SEED_LEN] {
        &self.0
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(..)")
    }
}

/// A key pair derived at a fixed index.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DerivedKey {
    pub index: u32,
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("index", &self.index)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Deterministic key and address allocator.
pub struct KeyRing {
    secp: Secp256k1<All>,
    master_key: ExtendedPrivKey,
    params: ChainParams,
    next_index: u32,
    addresses: HashMap<Address, u32>,
}

impl KeyRing {
    /// Derives the master key from `seed`. Fails only if the seed maps to an invalid scalar.
    pub fn new(seed: &Seed, params: ChainParams) -> WalletResult<Self> {
        let master_key = ExtendedPrivKey::new_master(params.network, seed.as_bytes()).map_err(
            |e| WalletError::KeyDerivation {
                index: 0,
                reason: format!("invalid master key: {e}"),
            },
        )?;

        Ok(Self {
            secp: Secp256k1::new(),
            master_key,
            params,
            next_index: 0,
            addresses: HashMap::new(),
        })
    }

    /// Allocates the next unused index and returns its address.
    pub fn new_address(&mut self) -> WalletResult<Address> {
        let index = self.next_index;
        let address = self.address_at(index)?;
        self.addresses.insert(address.clone(), index);
        self.next_index += 1;
        tracing::trace!("derived address {} at index {}", address, index);
        Ok(address)
    }

    /// The address the next [`KeyRing::new_address`] call will return, without allocating it.
    pub fn peek_next_address(&self) -> WalletResult<Address> {
        self.address_at(self.next_index)
    }

    /// Re-derives the key behind an address this key ring produced.
    pub fn private_key_for(&self, address: &Address) -> WalletResult<DerivedKey> {
        let index = *self
            .addresses
            .get(address)
            .ok_or_else(|| WalletError::UnknownAddress(address.clone()))?;
        self.derive(index)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.addresses.contains_key(address)
    }

    /// Every address issued so far, in index order.
    pub fn addresses(&self) -> Vec<Address> {
        let mut issued: Vec<(u32, &Address)> =
            self.addresses.iter().map(|(address, index)| (*index, address)).collect();
        issued.sort_unstable_by_key(|(index, _)| *index);
        issued.into_iter().map(|(_, address)| address.clone()).collect()
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    fn address_at(&self, index: u32) -> WalletResult<Address> {
        let key = self.derive(index)?;
        Ok(Address::p2pkh(&dashcore::PublicKey::new(key.public_key), self.params.network))
    }

    /// Non-hardened child `m/index` of the master key.
    fn derive(&self, index: u32) -> WalletResult<DerivedKey> {
        let derivation_error = |reason: String| WalletError::KeyDerivation {
            index,
            reason,
        };
        let child = ChildNumber::from_normal_idx(index)
            .map_err(|e| derivation_error(format!("non-hardened index space exhausted: {e}")))?;
        let path = DerivationPath::from(vec![child]);
        let secret_key = self
            .master_key
            .derive_priv(&self.secp, &path)
            .map_err(|e| derivation_error(e.to_string()))?
            .private_key;

        Ok(DerivedKey {
            index,
            secret_key,
            public_key: PublicKey::from_secret_key(&self.secp, &secret_key),
        })
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("network", &self.params.name)
            .field("next_index", &self.next_index)
            .finish_non_exhaustive()
    }
}
