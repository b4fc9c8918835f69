// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Traits and constants for the channel's view of the blockchain client.
//!
//! The channel never blocks on the chain. It posts typed requests tagged with a [`RequestId`] and
//! is handed the matching [`ChainResponse`] later via
//! [`Channel::on_request_complete`]. A channel has at most one query and one broadcast in flight,
//! posting a new one cancels the previous.
//!
//! [`Channel::on_request_complete`]: crate::ln::channel::Channel::on_request_complete

use crate::chain::transaction::{Commitment, KernelId, Transaction};
use crate::chain::Height;
use crate::prelude::*;

use core::fmt;

/// Identifies an outstanding chain request.
///
/// Ids are allocated from a per-channel counter which only ever increases, so a completion
/// carrying an id which is no longer pending is stale and gets dropped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// A query or broadcast to be performed by the [`ChainClient`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainRequest {
	/// Locate an unspent output.
	Utxo {
		/// The commitment of the output.
		commitment: Commitment,
	},
	/// Find the height at which a kernel was mined.
	Kernel {
		/// The kernel to look for.
		id: KernelId,
	},
	/// Broadcast a transaction.
	Transaction {
		/// The transaction to hand to the network.
		tx: Transaction,
	},
}

/// A proof that an output is in the UTXO set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoProof {
	/// The height the output was created at.
	pub height: Height,
}

/// The answer to a [`ChainRequest`], in the same variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainResponse {
	/// Proofs of the requested output being unspent. Empty if it's spent or never existed.
	Utxo {
		/// The proofs, one per matching output.
		proofs: Vec<UtxoProof>,
	},
	/// The height a kernel was mined at, or 0 if it's not on-chain.
	Kernel {
		/// The confirmation height.
		height: Height,
	},
	/// Whether the network accepted a broadcast transaction.
	Transaction {
		/// Whether the transaction was accepted into the mempool.
		accepted: bool,
	},
}

/// An interface to a blockchain client which answers queries asynchronously.
///
/// Implementations must eventually answer every request which wasn't cancelled, in any order, by
/// calling back into the channel which posted it.
pub trait ChainClient {
	/// Posts a new request. Its response must be delivered with the same `id`.
	fn post_request(&self, id: RequestId, request: ChainRequest);

	/// Cancels a previously posted request. A response delivered anyway is ignored by the channel.
	fn cancel_request(&self, id: RequestId);
}
