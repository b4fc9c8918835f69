// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Types describing the chain's transactions as far as the channel needs to see them.
//!
//! Transactions consist of inputs and outputs, which are identified purely by their
//! commitments, and kernels, which carry the fee, the validity height range, an optional relative
//! lock and a signature by the transaction's excess. Kernels are what gets queried on-chain to
//! prove that a transaction was mined.

use crate::io;

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::secp256k1::schnorr::Signature;
use bitcoin::secp256k1::{self, Keypair, Message, PublicKey, Secp256k1, SecretKey};

use crate::chain::{Height, HeightRange};
use crate::ln::msgs::DecodeError;
use crate::prelude::*;
use crate::util::ser::{Readable, Writeable, Writer};

use core::fmt;

/// A commitment to an output's value and blinding factor.
///
/// The value part is opaque to the channel, so we identify a commitment by its curve point.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Commitment(pub PublicKey);

impl Commitment {
	/// The commitment whose blinding factor is `key`.
	pub fn from_key<C: secp256k1::Signing>(secp_ctx: &Secp256k1<C>, key: &SecretKey) -> Self {
		Commitment(PublicKey::from_secret_key(secp_ctx, key))
	}

	/// The commitment to the sum of both blinding factors, as used by multisig outputs whose
	/// blinding is shared between both parties.
	pub fn combine(&self, other: &Commitment) -> Option<Commitment> {
		self.0.combine(&other.0).ok().map(Commitment)
	}
}

impl Writeable for Commitment {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.0.write(w)
	}
}

impl Readable for Commitment {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Commitment(Readable::read(r)?))
	}
}

/// The hash identifying a [`TxKernel`] on-chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct KernelId(pub [u8; 32]);

impl fmt::Display for KernelId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		crate::util::logger::DebugBytes(&self.0).fmt(f)
	}
}

impl Writeable for KernelId {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.0.write(w)
	}
}

impl Readable for KernelId {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(KernelId(Readable::read(r)?))
	}
}

/// Requires the referenced kernel to be buried `lock_height` blocks deep before the locking
/// kernel may be mined.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RelativeLock {
	/// The kernel which must be mined first.
	pub kernel_id: KernelId,
	/// How many blocks must pass after the referenced kernel was mined.
	pub lock_height: Height,
}

/// The signed part of a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxKernel {
	/// The fee paid by the transaction.
	pub fee: u64,
	/// The heights in which the kernel may be mined.
	pub height: HeightRange,
	/// An optional relative time-lock against another kernel.
	pub relative_lock: Option<RelativeLock>,
	/// The public excess, which must balance inputs against outputs and the offset.
	pub excess: PublicKey,
	/// A signature over [`TxKernel::id`] by `excess`.
	pub signature: Option<Signature>,
}

impl TxKernel {
	/// Builds an unsigned kernel with `excess` as its public excess.
	pub fn new(fee: u64, height: HeightRange, excess: PublicKey) -> Self {
		TxKernel { fee, height, relative_lock: None, excess, signature: None }
	}

	/// The kernel id commits to everything but the signature.
	pub fn id(&self) -> KernelId {
		let mut sha = Sha256::engine();
		sha.input(&self.fee.encode());
		sha.input(&self.height.encode());
		match self.relative_lock {
			Some(ref lock) => {
				sha.input(&[1]);
				sha.input(&lock.kernel_id.0);
				sha.input(&lock.lock_height.encode());
			},
			None => sha.input(&[0]),
		}
		sha.input(&self.excess.serialize());
		KernelId(Sha256::from_engine(sha).to_byte_array())
	}

	/// Sets the excess to `excess_key` and signs the kernel with it. `aux_rand` re-randomizes the
	/// nonce, it must never repeat for the same key.
	pub fn sign<C: secp256k1::Signing>(
		&mut self, secp_ctx: &Secp256k1<C>, excess_key: &SecretKey, aux_rand: &[u8; 32],
	) {
		self.excess = PublicKey::from_secret_key(secp_ctx, excess_key);
		let msg = Message::from_digest(self.id().0);
		let keypair = Keypair::from_secret_key(secp_ctx, excess_key);
		self.signature = Some(secp_ctx.sign_schnorr_with_aux_rand(&msg, &keypair, aux_rand));
	}

	/// Checks the signature against the excess.
	pub fn verify<C: secp256k1::Verification>(&self, secp_ctx: &Secp256k1<C>) -> bool {
		match self.signature {
			Some(ref sig) => {
				let msg = Message::from_digest(self.id().0);
				let (xonly, _parity) = self.excess.x_only_public_key();
				secp_ctx.verify_schnorr(sig, &msg, &xonly).is_ok()
			},
			None => false,
		}
	}
}

impl Writeable for TxKernel {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.fee.write(w)?;
		self.height.write(w)?;
		match self.relative_lock {
			Some(ref lock) => {
				1u8.write(w)?;
				lock.kernel_id.write(w)?;
				lock.lock_height.write(w)?;
			},
			None => 0u8.write(w)?,
		}
		self.excess.write(w)?;
		self.signature.write(w)
	}
}

impl Readable for TxKernel {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, DecodeError> {
		let fee = Readable::read(r)?;
		let height = Readable::read(r)?;
		let relative_lock = match <u8 as Readable>::read(r)? {
			0 => None,
			1 => Some(RelativeLock {
				kernel_id: Readable::read(r)?,
				lock_height: Readable::read(r)?,
			}),
			_ => return Err(DecodeError::InvalidValue),
		};
		Ok(TxKernel {
			fee,
			height,
			relative_lock,
			excess: Readable::read(r)?,
			signature: Readable::read(r)?,
		})
	}
}

/// A transaction input, spending the output with the given commitment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Input {
	/// The commitment of the spent output.
	pub commitment: Commitment,
}

/// A transaction output.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Output {
	/// The commitment of the created output.
	pub commitment: Commitment,
}

/// A (possibly partial) transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
	/// The spent outputs.
	pub inputs: Vec<Input>,
	/// The created outputs.
	pub outputs: Vec<Output>,
	/// The kernels. Channel transactions carry exactly one.
	pub kernels: Vec<TxKernel>,
	/// The blinding offset, as a raw scalar since it may legitimately be zero.
	pub offset: [u8; 32],
}

impl Transaction {
	/// Whether the transaction carries no kernel, i.e. it hasn't been built yet.
	pub fn is_empty(&self) -> bool {
		self.kernels.is_empty()
	}

	/// The id of the first kernel, which identifies channel transactions on-chain.
	pub fn kernel_id(&self) -> Option<KernelId> {
		self.kernels.first().map(|krn| krn.id())
	}
}

impl Writeable for Transaction {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		let inputs: Vec<Commitment> = self.inputs.iter().map(|i| i.commitment).collect();
		let outputs: Vec<Commitment> = self.outputs.iter().map(|o| o.commitment).collect();
		inputs.write(w)?;
		outputs.write(w)?;
		self.kernels.write(w)?;
		self.offset.write(w)
	}
}

impl Readable for Transaction {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, DecodeError> {
		let inputs: Vec<Commitment> = Readable::read(r)?;
		let outputs: Vec<Commitment> = Readable::read(r)?;
		Ok(Transaction {
			inputs: inputs.into_iter().map(|commitment| Input { commitment }).collect(),
			outputs: outputs.into_iter().map(|commitment| Output { commitment }).collect(),
			kernels: Readable::read(r)?,
			offset: Readable::read(r)?,
		})
	}
}
