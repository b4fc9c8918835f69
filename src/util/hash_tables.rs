//! Generally we use `std`'s `HashMap`s, however when the `hashbrown` feature is set we use
//! `hashbrown`'s `HashMap`s with the `std` `RandomState`.
//!
//! This module simply re-exports the `HashMap` used in this crate for public consumption.

#[cfg(not(feature = "hashbrown"))]
mod std_hashtables {
	pub use std::collections::hash_map::RandomState;
	pub use std::collections::HashMap;

	/// Builds a new [`HashMap`].
	pub fn new_hash_map<K, V>() -> HashMap<K, V> {
		HashMap::new()
	}
}
#[cfg(not(feature = "hashbrown"))]
pub use std_hashtables::*;

#[cfg(feature = "hashbrown")]
mod hashbrown_tables {
	pub use std::collections::hash_map::RandomState;

	/// The HashMap type used in this crate.
	pub type HashMap<K, V> = hashbrown::HashMap<K, V, RandomState>;

	/// Builds a new [`HashMap`].
	pub fn new_hash_map<K, V>() -> HashMap<K, V> {
		HashMap::with_hasher(RandomState::new())
	}
}
#[cfg(feature = "hashbrown")]
pub use hashbrown_tables::*;
