// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Structs and traits which allow the channel to interact with the blockchain.

use crate::io;

use crate::ln::msgs::DecodeError;
use crate::util::ser::{Readable, Writeable, Writer};

pub mod chaininterface;
pub mod transaction;

/// A block height.
pub type Height = u64;

/// An inclusive range of block heights, e.g. the heights in which a kernel may be mined.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HeightRange {
	/// The lowest height of the range.
	pub min: Height,
	/// The highest height of the range.
	pub max: Height,
}

impl HeightRange {
	/// The range covering every height.
	pub const MAX: HeightRange = HeightRange { min: 0, max: Height::MAX };

	/// Creates a new range from its bounds.
	pub fn new(min: Height, max: Height) -> Self {
		HeightRange { min, max }
	}

	/// Creates the range `[min, min + dh]`, saturating at [`Height::MAX`].
	pub fn with_span(min: Height, dh: Height) -> Self {
		HeightRange { min, max: min.saturating_add(dh) }
	}

	/// Whether no height fits in this range.
	pub fn is_empty(&self) -> bool {
		self.min > self.max
	}

	/// Whether `h` lies within this range.
	pub fn is_in_range(&self, h: Height) -> bool {
		h >= self.min && h <= self.max
	}

	/// Narrows the range to the intersection with `other`.
	pub fn intersect(&mut self, other: &HeightRange) {
		self.min = core::cmp::max(self.min, other.min);
		self.max = core::cmp::min(self.max, other.max);
	}
}

impl Writeable for HeightRange {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.min.write(w)?;
		self.max.write(w)
	}
}

impl Readable for HeightRange {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(HeightRange { min: Readable::read(r)?, max: Readable::read(r)? })
	}
}
