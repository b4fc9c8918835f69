// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Reacting to what the chain tells us about the channel's transactions: confirmation of the
//! opening, the search for whichever withdrawal spent the channel and punishing a peer which
//! withdrew an outdated revision.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::secp256k1::{Scalar, SecretKey};

use crate::chain::chaininterface::{ChainRequest, ChainResponse, RequestId};
use crate::chain::transaction::{Commitment, Input, Output, Transaction, TxKernel};
use crate::chain::{Height, HeightRange};
use crate::ln::channel::{Channel, ChannelHost, CoinState, QueryKind, RevisionType};
use crate::sign::{CoinId, KeyType};
use crate::util::logger::{Logger, WithContext};

use crate::prelude::*;
use core::ops::Deref;

impl<H: Deref, L: Deref> Channel<H, L>
where
	H::Target: ChannelHost,
	L::Target: Logger,
{
	/// Handles the response to a request we posted. Responses to requests which were since
	/// replaced or cancelled are ignored.
	pub fn on_request_complete(&mut self, id: RequestId, response: ChainResponse) {
		if self.pending_tx == Some(id) {
			self.pending_tx = None;
			match response {
				ChainResponse::Transaction { accepted: true } => {
					log_trace!(chan_logger!(self), "Broadcast {} accepted", id);
				},
				_ => {
					log_debug!(chan_logger!(self), "Broadcast {} was not accepted", id);
				},
			}
			return;
		}
		let kind = match self.pending_query {
			Some(query) if query.id == id => query.kind,
			_ => {
				log_trace!(chan_logger!(self), "Ignoring stale chain response {}", id);
				return;
			},
		};
		self.pending_query = None;

		match (kind, response) {
			(QueryKind::OpenKernel, ChainResponse::Kernel { height }) => self.on_open_kernel(height),
			(QueryKind::MuSig, ChainResponse::Utxo { proofs }) => {
				if proofs.is_empty() {
					log_info!(chan_logger!(self), "Channel output was spent, looking for the withdrawal");
					match self.latest_two_phase() {
						Some(n) => self.search_withdrawal(n, true),
						None => {
							log_error!(chan_logger!(self), "Channel output was spent without any withdrawal path");
						},
					}
				}
			},
			(QueryKind::KernelSearch { revision, ours }, ChainResponse::Kernel { height }) => {
				self.on_request_complete_in_search(revision, ours, height)
			},
			(QueryKind::Phase2, ChainResponse::Kernel { height }) => self.on_phase2_kernel(height),
			(QueryKind::DirectKernel, ChainResponse::Kernel { height }) => self.on_direct_kernel(height),
			(kind, response) => {
				log_error!(chan_logger!(self), "Response {:?} doesn't match query {:?}", response, kind);
			},
		}
	}

	fn on_open_kernel(&mut self, height: Height) {
		if height == 0 {
			return;
		}
		let (inputs, change) = match self.open {
			Some(ref mut open) if open.h_confirmed == 0 => {
				open.h_confirmed = height;
				(open.inputs.clone(), open.change)
			},
			_ => return,
		};
		for coin in inputs.iter() {
			self.host.on_coin(coin, height, CoinState::Spent, false);
		}
		if let Some(ref coin) = change {
			self.host.on_coin(coin, height, CoinState::Confirmed, false);
		}
		log_info!(chan_logger!(self), "Channel opened at height {}", height);
	}

	fn on_direct_kernel(&mut self, height: Height) {
		if height == 0 {
			return;
		}
		let outp = match self.revisions.back() {
			Some(upd) if upd.kind == RevisionType::Direct => upd.outp,
			_ => return,
		};
		self.state.close.path = Some(self.revision);
		self.state.close.initiated_by_us = true;
		self.state.close.h_phase1 = height;
		self.state.close.h_phase2 = height;
		self.host.on_coin(&outp, height, CoinState::Confirmed, false);
		log_info!(chan_logger!(self), "Channel closed gracefully at height {}", height);
	}

	fn on_phase2_kernel(&mut self, height: Height) {
		if height == 0 || self.state.close.h_phase2 != 0 {
			return;
		}
		self.state.close.h_phase2 = height;
		if let Some(coin) = self.phase2_coin() {
			self.host.on_coin(&coin, height, CoinState::Confirmed, false);
		}
		log_info!(chan_logger!(self), "Channel closed at height {}", height);
	}

	/// Our output of the withdrawal which closed (or is closing) the channel.
	pub(super) fn phase2_coin(&self) -> Option<CoinId> {
		let upd = self.state.close.path.and_then(|n| self.get_revision(n))?;
		if upd.kind == RevisionType::Punishment && !self.state.close.initiated_by_us {
			return upd.punishment_out;
		}
		Some(upd.outp)
	}

	/// Queries the phase-1 kernel of `revision`, ours or the peer's, moving on to older
	/// candidates if it doesn't have one.
	fn search_withdrawal(&mut self, mut revision: u64, mut ours: bool) {
		loop {
			let kid = match self.get_revision(revision) {
				Some(upd) if upd.is_two_phase() => if ours { upd.tx1.kernel_id() } else { upd.kid_peer1 },
				_ => None,
			};
			if let Some(id) = kid {
				self.post_query(QueryKind::KernelSearch { revision, ours }, ChainRequest::Kernel { id });
				return;
			}
			match self.next_search_candidate(revision, ours) {
				Some((r, o)) => {
					revision = r;
					ours = o;
				},
				None => {
					self.on_search_exhausted();
					return;
				},
			}
		}
	}

	/// Newest first, and ours before the peer's for the same revision.
	fn next_search_candidate(&self, revision: u64, ours: bool) -> Option<(u64, bool)> {
		if ours {
			return Some((revision, false));
		}
		self.prev_two_phase(revision).map(|r| (r, true))
	}

	fn on_search_exhausted(&mut self) {
		log_warn!(chan_logger!(self), "Channel output is spent but none of the known withdrawals is mined");
		// Looked at again once the tip moves
		self.state.h_query_last = self.host.get_tip();
	}

	/// Handles the result of looking up the phase-1 kernel of `revision`. `height` is `0` if the
	/// kernel isn't mined.
	pub(crate) fn on_request_complete_in_search(&mut self, revision: u64, ours: bool, height: Height) {
		if height == 0 {
			match self.next_search_candidate(revision, ours) {
				Some((r, o)) => self.search_withdrawal(r, o),
				None => self.on_search_exhausted(),
			}
			return;
		}

		log_info!(chan_logger!(self), "Found {} withdrawal of revision {} at height {}",
			if ours { "our" } else { "the peer's" }, revision, height);
		self.state.close.path = Some(revision);
		self.state.close.initiated_by_us = ours;
		self.state.close.h_phase1 = height;
		self.state.terminate = true;

		if !ours {
			let outdated = self.get_revision(revision).map_or(false, |upd| upd.kind == RevisionType::TimeLocked);
			let key_known = self.get_revision(revision + 1).map_or(false, |upd| upd.peer_key_valid());
			if outdated && key_known {
				log_warn!(chan_logger!(self), "Peer withdrew outdated revision {}, punishing", revision);
				self.create_punishment_tx(revision);
			}
		}
		self.update();
	}

	/// Builds a transaction which takes the whole output of the peer's phase-1 withdrawal of
	/// `revision`, using the key the peer disclosed when the next revision was negotiated. Must
	/// be mined before the peer's own phase-2 unlocks.
	pub(super) fn create_punishment_tx(&mut self, revision: u64) -> bool {
		let (ms_peer, comm_in) = match self.get_revision(revision) {
			Some(upd) => match upd.comm_peer1 {
				Some(comm) => (upd.ms_peer, comm),
				None => return false,
			},
			None => return false,
		};
		let peer_key = match self.get_revision(revision + 1).and_then(|upd| upd.peer_key) {
			Some(key) => key,
			None => return false,
		};

		let my_key = self.host.keys().derive_coin_key(&ms_peer);
		let sk_in = match my_key.add_tweak(&Scalar::from(peer_key)) {
			Ok(key) => key,
			Err(_) => {
				log_error!(chan_logger!(self), "Disclosed key of revision {} is invalid", revision);
				return false;
			},
		};
		if Commitment::from_key(&self.secp_ctx, &sk_in) != comm_in {
			log_error!(chan_logger!(self), "Disclosed key doesn't open the withdrawal output of revision {}", revision);
			return false;
		}

		let outp = CoinId::new(self.host.alloc_coin_idx(), self.value_total(), KeyType::Regular);
		let sk_out = self.host.keys().derive_coin_key(&outp);
		let kernel_key = punishment_kernel_key(&sk_in, &sk_out);

		// outputs - inputs = excess + offset
		let offset = sk_out
			.add_tweak(&Scalar::from(sk_in.negate()))
			.and_then(|key| key.add_tweak(&Scalar::from(kernel_key.negate())));
		let offset = match offset {
			Ok(key) => key.secret_bytes(),
			Err(_) => {
				log_error!(chan_logger!(self), "Degenerate punishment keys for revision {}", revision);
				return false;
			},
		};

		let mut aux = Sha256::engine();
		aux.input(&kernel_key.secret_bytes());
		aux.input(&comm_in.0.serialize());
		let aux = Sha256::from_engine(aux).to_byte_array();

		let h = HeightRange::with_span(self.state.close.h_phase1, self.config.rules.max_kernel_validity_dh);
		let mut kernel = TxKernel::new(self.params.fee, h, comm_in.0);
		kernel.sign(&self.secp_ctx, &kernel_key, &aux);
		let tx = Transaction {
			inputs: vec![Input { commitment: comm_in }],
			outputs: vec![Output { commitment: Commitment::from_key(&self.secp_ctx, &sk_out) }],
			kernels: vec![kernel],
			offset,
		};

		log_debug!(chan_logger!(self), "Built punishment {}", log_tx!(tx));
		if let Some(upd) = self.get_revision_mut(revision) {
			upd.tx_peer2 = tx;
			upd.kind = RevisionType::Punishment;
			upd.punishment_out = Some(outp);
		}
		true
	}
}

/// A kernel key only we can know, derived from the keys of the punishment's input and output.
fn punishment_kernel_key(sk_in: &SecretKey, sk_out: &SecretKey) -> SecretKey {
	let mut counter: u32 = 0;
	loop {
		let mut sha = Sha256::engine();
		sha.input(b"punishment");
		sha.input(&sk_in.secret_bytes());
		sha.input(&sk_out.secret_bytes());
		sha.input(&counter.to_be_bytes());
		if let Ok(key) = SecretKey::from_slice(&Sha256::from_engine(sha).to_byte_array()) {
			return key;
		}
		counter += 1;
	}
}
