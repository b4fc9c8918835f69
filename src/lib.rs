// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

#![crate_name = "lightning_channel"]

//! A two-party payment channel for Mimblewimble-style chains.
//!
//! A [`Channel`] is anchored by one on-chain multisig output. Both parties then exchange
//! successive revisions of the balance split off-chain, each of which can be withdrawn through a
//! two-phase (time-locked) path. Broadcasting a stale revision lets the counterparty seize the
//! cheater's whole balance.
//!
//! The crate leaves the cryptographic construction of transactions to an external negotiation
//! engine (see [`ln::negotiator`]), the chain access to a [`chain::chaininterface::ChainClient`]
//! and the wallet to a [`ln::channel::ChannelHost`]. The channel itself is a single-threaded
//! reactive state machine: feed it peer messages via [`Channel::on_peer_data`], chain tips via
//! [`Channel::update`], reorgs via [`Channel::on_rolled_back`] and chain query results via
//! [`Channel::on_request_complete`].
//!
//! [`Channel`]: crate::ln::channel::Channel
//! [`Channel::on_peer_data`]: crate::ln::channel::Channel::on_peer_data
//! [`Channel::update`]: crate::ln::channel::Channel::update
//! [`Channel::on_rolled_back`]: crate::ln::channel::Channel::on_rolled_back
//! [`Channel::on_request_complete`]: crate::ln::channel::Channel::on_request_complete

#![cfg_attr(not(test), warn(missing_docs))]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

extern crate bitcoin;
#[cfg(test)]
extern crate regex;

#[macro_use]
pub mod util;
pub mod chain;
pub mod ln;
pub mod sign;

/// Re-export of `std::io`, which all serialization goes through.
pub mod io {
	pub use std::io::*;
}

#[allow(unused_imports)]
mod prelude {
	pub use std::boxed::Box;
	pub use std::collections::{btree_map, BTreeMap, BTreeSet, VecDeque};
	pub use std::string::{String, ToString};
	pub use std::vec;
	pub use std::vec::Vec;

	pub use std::borrow::ToOwned;

	pub use crate::util::hash_tables::*;
}
