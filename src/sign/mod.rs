// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Provides keys to the channel and defines the identifiers of the coins it creates and spends.
//!
//! The channel never stores blinding factors. Every coin is described by a [`CoinId`], and its
//! key is re-derived from the wallet's [`KeyDerivation`] whenever it's needed.

use crate::io;

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

use crate::chain::transaction::Commitment;
use crate::ln::msgs::DecodeError;
use crate::util::ser::{Readable, Writeable, Writer};

use core::fmt;

/// The purpose of a coin, which is mixed into its key derivation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyType {
	/// A plain wallet output, e.g. our side of a channel withdrawal.
	Regular,
	/// Change returned to the wallet when funding the channel.
	Change,
	/// Our share of a multisig output, whose full blinding factor is split between both parties.
	ChannelMultisig,
}

impl KeyType {
	fn to_u8(&self) -> u8 {
		match self {
			KeyType::Regular => 0,
			KeyType::Change => 1,
			KeyType::ChannelMultisig => 2,
		}
	}
}

/// Identifies a coin (or our share of a multisig coin) in the wallet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CoinId {
	/// The derivation index, allocated by the wallet.
	pub idx: u64,
	/// The value of the coin.
	pub value: u64,
	/// What the coin is used for.
	pub key_type: KeyType,
}

impl CoinId {
	/// Creates a new coin id.
	pub fn new(idx: u64, value: u64, key_type: KeyType) -> Self {
		CoinId { idx, value, key_type }
	}
}

impl fmt::Display for CoinId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{:?}:{} ({})", self.key_type, self.idx, self.value)
	}
}

impl Writeable for CoinId {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.idx.write(w)?;
		self.value.write(w)?;
		self.key_type.to_u8().write(w)
	}
}

impl Readable for CoinId {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, DecodeError> {
		let idx = Readable::read(r)?;
		let value = Readable::read(r)?;
		let key_type = match <u8 as Readable>::read(r)? {
			0 => KeyType::Regular,
			1 => KeyType::Change,
			2 => KeyType::ChannelMultisig,
			_ => return Err(DecodeError::InvalidValue),
		};
		Ok(CoinId { idx, value, key_type })
	}
}

/// A source of coin keys.
pub trait KeyDerivation {
	/// Gets the blinding factor of the given coin. Must always return the same key for the same
	/// id.
	fn derive_coin_key(&self, coin: &CoinId) -> SecretKey;

	/// Gets the commitment of the given coin.
	fn coin_commitment(&self, coin: &CoinId) -> Commitment {
		let secp_ctx = Secp256k1::signing_only();
		Commitment(PublicKey::from_secret_key(&secp_ctx, &self.derive_coin_key(coin)))
	}
}

/// A simple [`KeyDerivation`] which hashes a 32-byte seed together with the coin id.
///
/// The seed MUST be backed up safely prior to use so that the keys can be re-created, losing it
/// means losing the channel's funds.
pub struct InMemoryKeys {
	seed: [u8; 32],
}

impl InMemoryKeys {
	/// Constructs the key source from its seed.
	pub fn new(seed: [u8; 32]) -> Self {
		InMemoryKeys { seed }
	}
}

impl KeyDerivation for InMemoryKeys {
	fn derive_coin_key(&self, coin: &CoinId) -> SecretKey {
		let mut counter: u32 = 0;
		loop {
			let mut sha = Sha256::engine();
			sha.input(&self.seed);
			sha.input(&coin.encode());
			sha.input(&counter.to_be_bytes());
			let res = Sha256::from_engine(sha).to_byte_array();
			// Only fails for zero or values above the curve order, which a hash practically never
			// yields.
			if let Ok(key) = SecretKey::from_slice(&res) {
				return key;
			}
			counter += 1;
		}
	}
}
