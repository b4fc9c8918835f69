// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire messages exchanged between the two channel parties.
//!
//! A message is a flat [`FieldMap`] of code → byte-blob fields. Every message carries the
//! sender's revision number under [`codes::REVISION`], the rest are either channel-level fields
//! (open parameters, transfer amounts) or fields of the negotiation engine which is currently
//! building transactions. The transport is assumed to be reliable but may reorder messages,
//! ordering is enforced through the revision number.

use crate::io;

use crate::prelude::*;
use crate::util::ser::{decode_exact, Readable, Writeable, Writer};

use core::fmt;

/// An error in decoding a message or struct.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
	/// Value was invalid, eg a byte which was supposed to be a bool was something other than a 0
	/// or 1, a public key/private key/signature was invalid, or there were trailing bytes.
	InvalidValue,
	/// Buffer too short
	ShortRead,
	/// Error from [`crate::io`]
	Io(io::ErrorKind),
}

impl From<io::Error> for DecodeError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e.kind())
		}
	}
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			DecodeError::InvalidValue => f.write_str("Nonsense bytes didn't map to the type they were interpreted as"),
			DecodeError::ShortRead => f.write_str("Packet extended beyond the provided bytes"),
			DecodeError::Io(ref e) => fmt::Debug::fmt(e, f),
		}
	}
}

/// Well-known field codes.
///
/// Codes below [`PRIVATE`] are never sent nor accepted from the peer, negotiation engines use
/// them for local bookkeeping in their store. Negotiation engines allocate their wire fields from
/// [`ENGINE`] upwards.
pub mod codes {
	/// Codes below this value are local-only.
	pub const PRIVATE: u32 = 1 << 16;
	/// The sender's revision number. `0` requests the channel to be closed.
	pub const REVISION: u32 = PRIVATE;
	/// The time-lock between the two withdrawal phases.
	pub const H_LOCK_TIME: u32 = PRIVATE + 1;
	/// The reserve kept before a revision's kernels expire.
	pub const H_POST_LOCK_RESERVE: u32 = PRIVATE + 2;
	/// The lifetime of a revision's withdrawal kernels.
	pub const H_REVISION_MAX_LIFE_TIME: u32 = PRIVATE + 3;
	/// The per-transaction fee.
	pub const FEE: u32 = PRIVATE + 4;
	/// The value the sender puts into the channel.
	pub const VALUE_MY: u32 = PRIVATE + 5;
	/// The value the sender expects the receiver to put into the channel.
	pub const VALUE_PEER: u32 = PRIVATE + 6;
	/// Lower bound of the heights the opening transaction may be mined in.
	pub const H_OPEN_MIN: u32 = PRIVATE + 7;
	/// Upper bound of the heights the opening transaction may be mined in.
	pub const H_OPEN_MAX: u32 = PRIVATE + 8;
	/// The value the sender transfers to the receiver.
	pub const VALUE_TRANSFER: u32 = PRIVATE + 9;
	/// The height the new revision is based on.
	pub const H_REFERENCE: u32 = PRIVATE + 10;
	/// Set when the update is a graceful close rather than a transfer.
	pub const CLOSE_GRACEFUL: u32 = PRIVATE + 11;
	/// First code available to negotiation engines.
	pub const ENGINE: u32 = PRIVATE + 0x100;
}

/// A key/value store of encoded fields, used both for peer messages and for the private store of
/// a negotiation engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMap {
	fields: BTreeMap<u32, Vec<u8>>,
}

impl FieldMap {
	/// Creates an empty map.
	pub fn new() -> Self {
		FieldMap { fields: BTreeMap::new() }
	}

	/// Sets `code` to the encoding of `value`, replacing any previous value.
	pub fn set<T: Writeable>(&mut self, code: u32, value: &T) {
		self.fields.insert(code, value.encode());
	}

	/// Sets `code` to the raw bytes `value`.
	pub fn set_raw(&mut self, code: u32, value: Vec<u8>) {
		self.fields.insert(code, value);
	}

	/// Decodes the field `code`. Returns `Ok(None)` if the field is absent.
	pub fn get<T: Readable>(&self, code: u32) -> Result<Option<T>, DecodeError> {
		match self.fields.get(&code) {
			Some(bytes) => decode_exact(bytes).map(Some),
			None => Ok(None),
		}
	}

	/// Gets the raw bytes of field `code`.
	pub fn get_raw(&self, code: u32) -> Option<&[u8]> {
		self.fields.get(&code).map(|v| &v[..])
	}

	/// Whether `code` is present.
	pub fn contains(&self, code: u32) -> bool {
		self.fields.contains_key(&code)
	}

	/// The number of fields.
	pub fn len(&self) -> usize {
		self.fields.len()
	}

	/// Whether there are no fields at all.
	pub fn is_empty(&self) -> bool {
		self.fields.is_empty()
	}

	/// Merges fields received from the peer. Local-only codes are skipped and a field which is
	/// already present is never overwritten. Returns the number of fields taken.
	pub fn absorb_peer_fields(&mut self, peer: &FieldMap) -> usize {
		let mut taken = 0;
		for (code, value) in peer.fields.range(codes::PRIVATE..) {
			if let btree_map::Entry::Vacant(e) = self.fields.entry(*code) {
				e.insert(value.clone());
				taken += 1;
			}
		}
		taken
	}
}

impl Writeable for FieldMap {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		(self.fields.len() as u32).write(w)?;
		for (code, value) in self.fields.iter() {
			code.write(w)?;
			value.write(w)?;
		}
		Ok(())
	}
}

impl Readable for FieldMap {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, DecodeError> {
		let count: u32 = Readable::read(r)?;
		let mut fields = BTreeMap::new();
		for _ in 0..count {
			let code: u32 = Readable::read(r)?;
			let value: Vec<u8> = Readable::read(r)?;
			if fields.insert(code, value).is_some() {
				return Err(DecodeError::InvalidValue);
			}
		}
		Ok(FieldMap { fields })
	}
}
