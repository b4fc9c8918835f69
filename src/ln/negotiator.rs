// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The contract between a [`Channel`] and the negotiation engines which build its transactions.
//!
//! Building a channel transaction is a multi-round protocol between both parties: blinding
//! factors of the shared multisig outputs are split between them, and kernels are signed jointly.
//! The channel doesn't take part in any of this. It creates an engine through its
//! [`ChannelHost`], forwards peer fields into the engine's store, calls [`Negotiator::update`]
//! and sends whatever the engine wrote into its output back to the peer. Once the engine reports
//! parts as done (see [`DoneParts`]), the channel pulls the produced transactions out.
//!
//! [`Channel`]: crate::ln::channel::Channel
//! [`ChannelHost`]: crate::ln::channel::ChannelHost

use bitcoin::secp256k1::SecretKey;

use crate::chain::transaction::{Commitment, KernelId, Transaction};
use crate::chain::{Height, HeightRange};
use crate::ln::msgs::FieldMap;
use crate::prelude::*;
use crate::sign::CoinId;

use core::ops::BitOr;

/// Which side of the channel we are on. The opener is the initiator for the whole lifetime of the
/// channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
	/// The party which opened the channel.
	Initiator,
	/// The party which accepted the channel.
	Responder,
}

/// The outcome of driving a negotiation one step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
	/// More rounds with the peer are needed.
	Pending,
	/// Everything was built and both parties have confirmed it.
	Success,
	/// The negotiation failed with an engine-specific code.
	Error(u32),
}

/// A bitmask of the parts of a negotiation which have been completed. Parts never become undone.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DoneParts(u32);

impl DoneParts {
	/// Nothing is done yet.
	pub const NONE: DoneParts = DoneParts(0);
	/// The main transactions (our own withdrawal path, or the opening/closing transaction) are
	/// fully built.
	pub const MAIN: DoneParts = DoneParts(1);
	/// The peer's withdrawal path is fully built, so we hold its phase-2 transaction.
	pub const PEER_WITHDRAWAL: DoneParts = DoneParts(1 << 1);
	/// The peer disclosed its key of the previous revision.
	pub const KEY_DISCLOSED: DoneParts = DoneParts(1 << 2);

	/// Whether all the parts in `other` are done.
	pub fn contains(&self, other: DoneParts) -> bool {
		self.0 & other.0 == other.0
	}

	/// Whether the parts in `other` are done now, but weren't in `before`.
	pub fn newly_done(&self, before: DoneParts, other: DoneParts) -> bool {
		self.contains(other) && !before.contains(other)
	}
}

impl BitOr for DoneParts {
	type Output = DoneParts;
	fn bitor(self, rhs: DoneParts) -> DoneParts {
		DoneParts(self.0 | rhs.0)
	}
}

/// Parameters of one revision's two-phase withdrawal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawalSetup {
	/// Our share of the multisig our own phase-1 transaction pays into.
	pub ms_my: CoinId,
	/// Our share of the multisig the peer's phase-1 transaction pays into.
	pub ms_peer: CoinId,
	/// Our output of either phase-2 transaction.
	pub outp: CoinId,
	/// Our value in this revision.
	pub value_my: u64,
	/// The peer's value in this revision.
	pub value_peer: u64,
	/// Fee of each withdrawal transaction.
	pub fee: u64,
	/// The heights in which the phase-1 transactions may be mined.
	pub h: HeightRange,
	/// The relative lock of phase-2 transactions against their phase-1.
	pub h_lock_time: Height,
}

/// Parameters of the negotiation which opens a channel and builds its first revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenSetup {
	/// Our side of the channel.
	pub role: Role,
	/// The height the negotiation starts at.
	pub scheme_height: Height,
	/// Our inputs to the opening transaction.
	pub inputs: Vec<CoinId>,
	/// Our change output of the opening transaction, if any.
	pub change: Option<CoinId>,
	/// Our share of the channel's root multisig output.
	pub ms0: CoinId,
	/// Fee of the opening transaction.
	pub fee: u64,
	/// The heights in which the opening transaction may be mined.
	pub h_open: HeightRange,
	/// The first revision's withdrawal.
	pub withdrawal: WithdrawalSetup,
}

/// Parameters of the negotiation which builds a new revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateSetup {
	/// Our side of the channel.
	pub role: Role,
	/// The height the negotiation starts at.
	pub scheme_height: Height,
	/// Our share of the channel's root multisig output.
	pub ms0: CoinId,
	/// The commitment of the root multisig output.
	pub comm0: Commitment,
	/// Our share of the previous revision's own-path multisig, disclosed to the peer once our
	/// new withdrawal path is complete.
	pub prev_ms_my: CoinId,
	/// Our share of the previous revision's peer-path multisig.
	pub prev_ms_peer: CoinId,
	/// The commitment of the previous revision's peer-path multisig, used to check the key the
	/// peer discloses.
	pub prev_comm_peer1: Commitment,
	/// The new revision's withdrawal.
	pub withdrawal: WithdrawalSetup,
}

/// Parameters of the negotiation which closes the channel in a single phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseSetup {
	/// Our side of the channel.
	pub role: Role,
	/// The height the negotiation starts at.
	pub scheme_height: Height,
	/// Our share of the channel's root multisig output.
	pub ms0: CoinId,
	/// The commitment of the root multisig output.
	pub comm0: Commitment,
	/// Our output of the closing transaction.
	pub outp: CoinId,
	/// Our value.
	pub value_my: u64,
	/// The peer's value.
	pub value_peer: u64,
	/// Fee of the closing transaction.
	pub fee: u64,
	/// The heights in which the closing transaction may be mined.
	pub h: HeightRange,
}

/// The opening transaction and the channel's root output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenResult {
	/// The commitment of the root multisig output.
	pub ms0_commitment: Commitment,
	/// The fully signed opening transaction.
	pub tx_open: Transaction,
}

/// The transactions of one revision's withdrawal paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawalResult {
	/// Our phase-1 transaction, spending the root output into our own-path multisig.
	pub tx1: Transaction,
	/// Our phase-2 transaction, splitting our own-path multisig after the time-lock.
	pub tx2: Transaction,
	/// The peer's phase-2 transaction, splitting its own-path multisig.
	pub tx_peer2: Transaction,
	/// The kernel id of the peer's phase-1 transaction.
	pub kid_peer1: KernelId,
	/// The output of the peer's phase-1 transaction.
	pub comm_peer1: Commitment,
}

/// A negotiation engine, driven one step at a time.
pub trait Negotiator {
	/// Advances the negotiation with whatever is in the store, writing fields to be sent to the
	/// peer into `out`.
	fn update(&mut self, out: &mut FieldMap) -> Status;

	/// The parts done so far.
	fn done_parts(&self) -> DoneParts;

	/// The engine's store, into which peer fields are merged.
	fn storage_mut(&mut self) -> &mut FieldMap;
}

/// Builds the opening transaction and the first revision.
pub trait OpenNegotiator: Negotiator {
	/// Available once [`DoneParts::MAIN`] is done.
	fn open_result(&self) -> Option<OpenResult>;
	/// Available once [`DoneParts::MAIN`] is done.
	fn withdrawal_result(&self) -> Option<WithdrawalResult>;
}

/// Builds a new revision and exchanges the keys of the previous one.
pub trait UpdateNegotiator: Negotiator {
	/// Available once both [`DoneParts::MAIN`] and [`DoneParts::PEER_WITHDRAWAL`] are done.
	fn withdrawal_result(&self) -> Option<WithdrawalResult>;
	/// The peer's share of the previous revision's peer-path multisig, available once
	/// [`DoneParts::KEY_DISCLOSED`] is done.
	fn peer_key(&self) -> Option<SecretKey>;
}

/// Builds the single-phase closing transaction.
pub trait CloseNegotiator: Negotiator {
	/// Available once [`DoneParts::MAIN`] is done.
	fn close_tx(&self) -> Option<Transaction>;
}
