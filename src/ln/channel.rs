// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The channel state machine.
//!
//! A [`Channel`] owns the channel's opening descriptor ([`DataOpen`]), the list of revisions
//! ([`DataUpdate`]) and at most one in-flight negotiation. It is driven by four kinds of events:
//! peer messages ([`Channel::on_peer_data`]), chain tips ([`Channel::update`]), reorgs
//! ([`Channel::on_rolled_back`]) and chain query results ([`Channel::on_request_complete`]). All
//! of these must be delivered from a single thread.

use bitcoin::secp256k1::{self, Secp256k1, SecretKey};

use crate::chain::chaininterface::{ChainClient, ChainRequest, RequestId};
use crate::chain::transaction::{Commitment, KernelId, Transaction};
use crate::chain::{Height, HeightRange};
use crate::ln::channel_id::ChannelId;
use crate::ln::msgs::{codes, FieldMap};
use crate::ln::negotiator::{
	CloseNegotiator, CloseSetup, DoneParts, OpenNegotiator, OpenResult, OpenSetup, Role, Status,
	UpdateNegotiator, UpdateSetup, WithdrawalResult, WithdrawalSetup,
};
use crate::sign::{CoinId, KeyDerivation, KeyType};
use crate::util::config::{
	ChannelConfig, ChannelParams, MAX_BLACKOUT_TIME, RESPONDER_EXTRA_LAG, TX_RESEND_PERIOD,
};
use crate::util::errors::APIError;
use crate::util::logger::{Logger, WithContext};
use crate::util::ser::Readable;

use crate::prelude::*;
use core::{cmp, fmt};
use core::ops::Deref;

/// Wraps the channel's logger so every record carries the channel id.
macro_rules! chan_logger {
	($self: ident) => {
		WithContext::from(&$self.logger, Some($self.channel_id))
	};
}

/// What happened to a wallet coin, reported through [`ChannelHost::on_coin`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CoinState {
	/// The coin is reserved as an input of the opening transaction.
	Locked,
	/// The coin was spent on-chain.
	Spent,
	/// The coin was created on-chain.
	Confirmed,
}

/// The application side of a channel: wallet, chain access, transport and the factories of
/// negotiation engines.
pub trait ChannelHost {
	/// The current chain tip.
	fn get_tip(&self) -> Height;
	/// The blockchain client requests are posted to.
	fn chain(&self) -> &dyn ChainClient;
	/// The source of coin keys.
	fn keys(&self) -> &dyn KeyDerivation;
	/// Allocates a fresh, never used coin derivation index.
	fn alloc_coin_idx(&self) -> u64;
	/// Selects wallet coins worth at least `value`. Returns whatever is available if the wallet
	/// can't cover it, the channel checks the sum.
	fn select_inputs(&self, value: u64) -> Vec<CoinId>;
	/// Sends a message to the peer.
	fn send_peer(&self, msg: FieldMap);
	/// Reports a coin event at height `h`. `reverse` undoes a previously reported event, e.g.
	/// after a reorg.
	fn on_coin(&self, coin: &CoinId, h: Height, state: CoinState, reverse: bool);
	/// Creates the engine negotiating the channel opening.
	fn new_open_negotiator(&self, setup: OpenSetup) -> Box<dyn OpenNegotiator>;
	/// Creates the engine negotiating a new revision.
	fn new_update_negotiator(&self, setup: UpdateSetup) -> Box<dyn UpdateNegotiator>;
	/// Creates the engine negotiating a graceful close.
	fn new_close_negotiator(&self, setup: CloseSetup) -> Box<dyn CloseNegotiator>;
}

/// How a revision may be withdrawn.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RevisionType {
	/// The withdrawal transactions are not built yet.
	None,
	/// Two-phase withdrawal, the second phase time-locked against the first.
	TimeLocked,
	/// The peer broadcast this (outdated) revision and we hold a transaction seizing its output.
	Punishment,
	/// Single-phase graceful close.
	Direct,
}

/// One revision of the channel's balance split.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataUpdate {
	/// Our share of the multisig our own phase-1 transaction pays into.
	pub ms_my: CoinId,
	/// Our share of the multisig the peer's phase-1 transaction pays into.
	pub ms_peer: CoinId,
	/// Our output of the phase-2 (or closing) transaction.
	pub outp: CoinId,
	/// How this revision may be withdrawn.
	pub kind: RevisionType,
	/// The peer's share of the previous revision's peer-path multisig, disclosed while this
	/// revision was negotiated. Only ever set once this revision has a withdrawal path.
	pub peer_key: Option<SecretKey>,
	/// Our phase-1 transaction, or the closing transaction of a [`RevisionType::Direct`] one.
	pub tx1: Transaction,
	/// Our phase-2 transaction.
	pub tx2: Transaction,
	/// The peer's phase-2 transaction, replaced by the punishment transaction if we catch the
	/// peer broadcasting this revision after it was superseded.
	pub tx_peer2: Transaction,
	/// The kernel of the peer's phase-1 transaction.
	pub kid_peer1: Option<KernelId>,
	/// The output of the peer's phase-1 transaction.
	pub comm_peer1: Option<Commitment>,
	/// The heights in which the phase-1 transactions may be mined.
	pub h: HeightRange,
	/// The output of the punishment transaction, if one was built.
	pub punishment_out: Option<CoinId>,
}

impl DataUpdate {
	fn new(ms_my: CoinId, ms_peer: CoinId, outp: CoinId, h: HeightRange) -> Self {
		DataUpdate {
			ms_my,
			ms_peer,
			outp,
			kind: RevisionType::None,
			peer_key: None,
			tx1: Transaction::default(),
			tx2: Transaction::default(),
			tx_peer2: Transaction::default(),
			kid_peer1: None,
			comm_peer1: None,
			h,
			punishment_out: None,
		}
	}

	/// Whether the peer has disclosed its key of the previous revision.
	pub fn peer_key_valid(&self) -> bool {
		self.peer_key.is_some()
	}

	/// Whether this revision can be withdrawn in two phases.
	pub fn is_two_phase(&self) -> bool {
		matches!(self.kind, RevisionType::TimeLocked | RevisionType::Punishment)
	}

	fn check_type(&mut self) {
		if self.kind == RevisionType::None && !self.tx1.is_empty() && !self.tx2.is_empty() {
			self.kind = RevisionType::TimeLocked;
		}
	}

	fn apply_withdrawal(&mut self, res: WithdrawalResult) {
		self.tx1 = res.tx1;
		self.tx2 = res.tx2;
		self.tx_peer2 = res.tx_peer2;
		self.kid_peer1 = Some(res.kid_peer1);
		self.comm_peer1 = Some(res.comm_peer1);
		self.check_type();
	}
}

/// The channel-opening transaction and its on-chain status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataOpen {
	/// Our share of the channel's root multisig output.
	pub ms0: CoinId,
	/// The root multisig output, known once the opening is negotiated.
	pub comm0: Option<Commitment>,
	/// The opening transaction, empty until negotiated.
	pub tx_open: Transaction,
	/// The kernel of the opening transaction.
	pub kid_open: Option<KernelId>,
	/// The heights in which the opening transaction may be mined.
	pub h_open: HeightRange,
	/// The height the opening transaction was mined at, `0` until then.
	pub h_confirmed: Height,
	/// The height our inputs were locked at.
	pub h_locked: Height,
	/// Our inputs to the opening transaction.
	pub inputs: Vec<CoinId>,
	/// Our change output of the opening transaction.
	pub change: Option<CoinId>,
}

/// How the channel is being closed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloseState {
	/// The revision whose withdrawal was found on-chain.
	pub path: Option<u64>,
	/// Whether the found withdrawal was broadcast by us.
	pub initiated_by_us: bool,
	/// The height the phase-1 (or closing) transaction was mined at.
	pub h_phase1: Height,
	/// The height the phase-2 (or closing) transaction was mined at.
	pub h_phase2: Height,
	/// Whether a graceful close was negotiated.
	pub graceful: bool,
}

/// Transient protocol state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelState {
	/// The tip at which the chain was last queried.
	pub h_query_last: Height,
	/// The tip at which a transaction was last broadcast.
	pub h_tx_sent_last: Height,
	/// The kernel of the last broadcast transaction.
	pub kid_sent_last: Option<KernelId>,
	/// Set once the channel must be closed. Never cleared until the channel is forgotten.
	pub terminate: bool,
	/// Closing bookkeeping.
	pub close: CloseState,
}

/// The negotiation in flight, together with the engine running it.
pub(super) enum NegotiationContext {
	Open(Box<dyn OpenNegotiator>),
	Update(Box<dyn UpdateNegotiator>),
	Close { engine: Box<dyn CloseNegotiator>, initiator: bool },
}

impl NegotiationContext {
	fn update(&mut self, out: &mut FieldMap) -> Status {
		match self {
			NegotiationContext::Open(engine) => engine.update(out),
			NegotiationContext::Update(engine) => engine.update(out),
			NegotiationContext::Close { engine, .. } => engine.update(out),
		}
	}

	fn done_parts(&self) -> DoneParts {
		match self {
			NegotiationContext::Open(engine) => engine.done_parts(),
			NegotiationContext::Update(engine) => engine.done_parts(),
			NegotiationContext::Close { engine, .. } => engine.done_parts(),
		}
	}

	fn storage_mut(&mut self) -> &mut FieldMap {
		match self {
			NegotiationContext::Open(engine) => engine.storage_mut(),
			NegotiationContext::Update(engine) => engine.storage_mut(),
			NegotiationContext::Close { engine, .. } => engine.storage_mut(),
		}
	}
}

/// The chain query currently in flight.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum QueryKind {
	/// Is the opening kernel mined?
	OpenKernel,
	/// Is the root multisig still unspent?
	MuSig,
	/// Is this phase-1 kernel mined? Part of the search for the withdrawal which spent the root.
	KernelSearch { revision: u64, ours: bool },
	/// Is the phase-2 kernel of the found withdrawal mined?
	Phase2,
	/// Is the graceful closing kernel mined?
	DirectKernel,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) struct PendingQuery {
	pub id: RequestId,
	pub kind: QueryKind,
}

/// The phase of a channel, derived from its data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum State {
	/// Nothing was opened.
	None,
	/// The opening is being negotiated and nothing irrevocable has happened yet.
	Opening0,
	/// The first withdrawal path exists, the opening is still being negotiated.
	Opening1,
	/// The opening is negotiated, waiting for the opening transaction to be mined.
	Opening2,
	/// The opening transaction wasn't mined in its height range.
	OpenFailed,
	/// Usable for transfers.
	Open,
	/// A new revision is being negotiated.
	Updating,
	/// Closing, no withdrawal found on-chain yet.
	Closing1,
	/// A phase-1 withdrawal is mined, waiting for phase-2.
	Closing2,
	/// The channel is closed.
	Closed,
	/// The latest revision is about to expire.
	Expired,
}

/// An error handling a peer message or a negotiation step.
pub(super) enum ChannelError {
	/// The message is stale or malformed. Dropped without further consequences.
	Ignore(String),
	/// The channel can't continue and must be closed.
	Close(String),
}

impl fmt::Debug for ChannelError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			&ChannelError::Ignore(ref e) => write!(f, "Ignore : {}", e),
			&ChannelError::Close(ref e) => write!(f, "Close : {}", e),
		}
	}
}

impl fmt::Display for ChannelError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			&ChannelError::Ignore(ref e) => write!(f, "{}", e),
			&ChannelError::Close(ref e) => write!(f, "{}", e),
		}
	}
}

fn get_field<T: Readable>(data: &FieldMap, code: u32, name: &str) -> Result<T, ChannelError> {
	match data.get(code) {
		Ok(Some(v)) => Ok(v),
		Ok(None) => Err(ChannelError::Ignore(format!("Missing {} field", name))),
		Err(e) => Err(ChannelError::Ignore(format!("Malformed {} field: {}", name, e))),
	}
}

/// Our share of a fee which is split between both parties. The responder pays the odd unit.
fn split_fee(role: Role, fee: u64) -> u64 {
	match role {
		Role::Initiator => fee / 2,
		Role::Responder => fee - fee / 2,
	}
}

/// A bidirectional payment channel with a single peer.
pub struct Channel<H: Deref, L: Deref>
where
	H::Target: ChannelHost,
	L::Target: Logger,
{
	pub(super) channel_id: ChannelId,
	pub(super) host: H,
	pub(super) logger: L,
	pub(super) config: ChannelConfig,
	/// The parameters in force, ours if we opened the channel, the peer's otherwise.
	pub(super) params: ChannelParams,
	pub(super) role: Role,
	pub(super) secp_ctx: Secp256k1<secp256k1::All>,

	pub(super) open: Option<DataOpen>,
	/// Revisions still kept, the last one being number `revision`.
	pub(super) revisions: VecDeque<DataUpdate>,
	pub(super) revision: u64,
	pub(super) negotiation: Option<NegotiationContext>,
	pub(super) state: ChannelState,

	pub(super) next_request_id: u64,
	pub(super) pending_query: Option<PendingQuery>,
	pub(super) pending_tx: Option<RequestId>,

	#[cfg(any(test, feature = "unsafe_revoked_tx_broadcast"))]
	pub(super) withdrawal_path_override: Option<u64>,
}

impl<H: Deref, L: Deref> Channel<H, L>
where
	H::Target: ChannelHost,
	L::Target: Logger,
{
	/// Creates a channel which was neither opened nor accepted yet.
	pub fn new(channel_id: ChannelId, host: H, logger: L, config: ChannelConfig) -> Self {
		Channel {
			channel_id,
			host,
			logger,
			config,
			params: config.params,
			role: Role::Initiator,
			secp_ctx: Secp256k1::new(),
			open: None,
			revisions: VecDeque::new(),
			revision: 0,
			negotiation: None,
			state: ChannelState::default(),
			next_request_id: 0,
			pending_query: None,
			pending_tx: None,
			#[cfg(any(test, feature = "unsafe_revoked_tx_broadcast"))]
			withdrawal_path_override: None,
		}
	}

	/// The id used to tag log records.
	pub fn channel_id(&self) -> ChannelId {
		self.channel_id
	}

	/// Our side of the channel.
	pub fn role(&self) -> Role {
		self.role
	}

	/// The parameters in force.
	pub fn params(&self) -> &ChannelParams {
		&self.params
	}

	/// The number of revisions created so far.
	pub fn revision(&self) -> u64 {
		self.revision
	}

	/// Gets revision `n`, if it's still kept.
	pub fn get_revision(&self, n: u64) -> Option<&DataUpdate> {
		let first = self.first_revision();
		if n < first || n > self.revision {
			return None;
		}
		self.revisions.get((n - first) as usize)
	}

	pub(super) fn get_revision_mut(&mut self, n: u64) -> Option<&mut DataUpdate> {
		let first = self.first_revision();
		if n < first || n > self.revision {
			return None;
		}
		self.revisions.get_mut((n - first) as usize)
	}

	/// The opening descriptor.
	pub fn get_data_open(&self) -> Option<&DataOpen> {
		self.open.as_ref()
	}

	/// The transient protocol state.
	pub fn get_channel_state(&self) -> &ChannelState {
		&self.state
	}

	/// Our value in the latest revision which can be withdrawn.
	pub fn value_my(&self) -> u64 {
		self.latest_two_phase().and_then(|n| self.get_revision(n)).map_or(0, |upd| upd.outp.value)
	}

	/// The peer's value in the latest revision which can be withdrawn.
	pub fn value_peer(&self) -> u64 {
		self.value_total().saturating_sub(self.value_my())
	}

	pub(super) fn value_total(&self) -> u64 {
		match self.open {
			Some(ref open) => open.ms0.value.saturating_sub(self.params.fee.saturating_mul(2)),
			None => 0,
		}
	}

	pub(super) fn first_revision(&self) -> u64 {
		self.revision + 1 - self.revisions.len() as u64
	}

	/// The newest revision which can be withdrawn in two phases.
	pub(super) fn latest_two_phase(&self) -> Option<u64> {
		let first = self.first_revision();
		self.revisions
			.iter()
			.enumerate()
			.rev()
			.find(|(_, upd)| upd.is_two_phase())
			.map(|(idx, _)| first + idx as u64)
	}

	/// The newest two-phase revision older than `n`.
	pub(super) fn prev_two_phase(&self, n: u64) -> Option<u64> {
		let first = self.first_revision();
		(first..n).rev().find(|r| self.get_revision(*r).map_or(false, |upd| upd.is_two_phase()))
	}

	/// Derives the phase of the channel. Has no side effects.
	///
	/// [`Self::update`] forces an expiring channel closed at the same tip it records, so it reports
	/// [`State::Closing1`] from then on. [`State::Expired`] only shows for a channel whose recorded
	/// query height reached the post-lock reserve before `update` acted on it.
	pub fn get_state(&self) -> State {
		let open = match self.open {
			Some(ref open) => open,
			None => return State::None,
		};
		if self.state.close.h_phase2 != 0 {
			return State::Closed;
		}
		if open.h_confirmed == 0 {
			if self.state.h_query_last > open.h_open.max {
				return State::OpenFailed;
			}
			match self.revisions.front() {
				Some(upd) if upd.kind != RevisionType::None => {},
				_ => return State::Opening0,
			}
			if let Some(NegotiationContext::Open(_)) = self.negotiation {
				return State::Opening1;
			}
			return State::Opening2;
		}
		if self.state.close.h_phase1 != 0 {
			return State::Closing2;
		}
		if self.state.terminate || self.state.close.graceful {
			return State::Closing1;
		}
		if let Some(upd) = self.latest_two_phase().and_then(|n| self.get_revision(n)) {
			if self.state.h_query_last.saturating_add(self.params.h_post_lock_reserve) >= upd.h.max {
				return State::Expired;
			}
		}
		if self.negotiation.is_some() {
			return State::Updating;
		}
		State::Open
	}

	/// Opens a channel in which we put `value_my` and the peer `value_peer`. The opening
	/// transaction must be mined within `h_open`.
	///
	/// On error nothing was changed. On success the first message was sent to the peer, the
	/// channel progresses as the peer answers.
	pub fn open(&mut self, value_my: u64, value_peer: u64, h_open: HeightRange) -> Result<(), APIError> {
		if self.open.is_some() {
			return Err(APIError::ChannelUnavailable { err: "Channel was already opened".to_owned() });
		}
		let params = self.config.params;
		self.open_internal(Role::Initiator, value_my, value_peer, h_open, params)?;

		let mut out = FieldMap::new();
		out.set(codes::H_LOCK_TIME, &params.h_lock_time);
		out.set(codes::H_POST_LOCK_RESERVE, &params.h_post_lock_reserve);
		out.set(codes::H_REVISION_MAX_LIFE_TIME, &params.h_revision_max_life_time);
		out.set(codes::FEE, &params.fee);
		out.set(codes::VALUE_MY, &value_my);
		out.set(codes::VALUE_PEER, &value_peer);
		out.set(codes::H_OPEN_MIN, &h_open.min);
		out.set(codes::H_OPEN_MAX, &h_open.max);
		match self.update_negotiator(&mut out) {
			Ok(()) => self.send_peer_internal(out),
			Err(e) => self.handle_channel_error(e),
		}
		Ok(())
	}

	fn open_internal(
		&mut self, role: Role, value_my: u64, value_peer: u64, h_open: HeightRange,
		params: ChannelParams,
	) -> Result<(), APIError> {
		if h_open.is_empty() {
			return Err(APIError::InvalidParameters { err: "Empty opening height range".to_owned() });
		}
		if (h_open.max - h_open.min).saturating_mul(2) > params.h_revision_max_life_time {
			return Err(APIError::InvalidParameters {
				err: "Opening height range is too wide for the revision lifetime".to_owned(),
			});
		}
		let h_window = params
			.h_lock_time
			.checked_add(params.h_post_lock_reserve)
			.and_then(|h| h.checked_add(params.h_revision_max_life_time));
		match h_window {
			Some(h) if h <= self.config.rules.max_kernel_validity_dh => {},
			_ => {
				return Err(APIError::InvalidParameters {
					err: "Withdrawal window exceeds the maximum kernel validity".to_owned(),
				})
			},
		}
		let ms_value = value_my
			.checked_add(value_peer)
			.and_then(|v| params.fee.checked_mul(2).and_then(|f| v.checked_add(f)));
		let ms_value = match ms_value {
			Some(v) => v,
			None => return Err(APIError::InvalidParameters { err: "Channel value overflow".to_owned() }),
		};

		// Our half of the opening fee and of both withdrawal phases
		let my_fee = split_fee(role, params.fee);
		let required = match my_fee.checked_mul(3).and_then(|f| f.checked_add(value_my)) {
			Some(v) => v,
			None => return Err(APIError::InvalidParameters { err: "Channel value overflow".to_owned() }),
		};
		let inputs = self.host.select_inputs(required);
		let available = inputs.iter().fold(0u64, |acc, coin| acc.saturating_add(coin.value));
		if available < required {
			return Err(APIError::InsufficientFunds {
				err: "Not enough funds to open the channel".to_owned(),
				available,
				requested: required,
			});
		}

		let tip = self.host.get_tip();
		let change = if available > required {
			Some(CoinId::new(self.host.alloc_coin_idx(), available - required, KeyType::Change))
		} else {
			None
		};
		for coin in inputs.iter() {
			self.host.on_coin(coin, tip, CoinState::Locked, false);
		}
		let ms0 = CoinId::new(self.host.alloc_coin_idx(), ms_value, KeyType::ChannelMultisig);

		self.role = role;
		self.params = params;
		self.open = Some(DataOpen {
			ms0,
			comm0: None,
			tx_open: Transaction::default(),
			kid_open: None,
			h_open,
			h_confirmed: 0,
			h_locked: tip,
			inputs: inputs.clone(),
			change,
		});

		let h = HeightRange::with_span(h_open.min, params.h_revision_max_life_time);
		let withdrawal = self.create_update_point(value_my, value_peer, h, false);
		let setup = OpenSetup {
			role,
			scheme_height: tip,
			inputs,
			change,
			ms0,
			fee: params.fee,
			h_open,
			withdrawal,
		};
		self.negotiation = Some(NegotiationContext::Open(self.host.new_open_negotiator(setup)));

		log_info!(chan_logger!(self), "Opening channel as {:?}: {} mine, {} theirs, opening in {}..={}",
			role, value_my, value_peer, h_open.min, h_open.max);
		Ok(())
	}

	/// Appends a new revision. For a `direct` (closing) revision our output also gets back our
	/// share of the withdrawal fee which won't be paid.
	fn create_update_point(
		&mut self, value_my: u64, value_peer: u64, h: HeightRange, direct: bool,
	) -> WithdrawalSetup {
		let fee = self.params.fee;
		let ms_value = value_my.saturating_add(value_peer).saturating_add(fee);
		let outp_value =
			if direct { value_my.saturating_add(split_fee(self.role, fee)) } else { value_my };

		let ms_my = CoinId::new(self.host.alloc_coin_idx(), ms_value, KeyType::ChannelMultisig);
		let ms_peer = CoinId::new(self.host.alloc_coin_idx(), ms_value, KeyType::ChannelMultisig);
		let outp = CoinId::new(self.host.alloc_coin_idx(), outp_value, KeyType::Regular);
		self.revisions.push_back(DataUpdate::new(ms_my, ms_peer, outp, h));
		self.revision += 1;

		WithdrawalSetup {
			ms_my,
			ms_peer,
			outp,
			value_my,
			value_peer,
			fee,
			h,
			h_lock_time: self.params.h_lock_time,
		}
	}

	/// Transfers `value` to the peer. With `graceful_close` the new split is instead paid out by
	/// a single closing transaction.
	pub fn transfer(&mut self, value: u64, graceful_close: bool) -> Result<(), APIError> {
		let state = self.get_state();
		if state != State::Open {
			return Err(APIError::ChannelUnavailable {
				err: format!("Channel is {:?}, it can't be updated", state),
			});
		}
		let value_my = self.value_my();
		if value > value_my {
			return Err(APIError::InsufficientFunds {
				err: "Not enough funds in the channel".to_owned(),
				available: value_my,
				requested: value,
			});
		}
		let tip = self.host.get_tip();
		self.transfer_internal(value_my - value, tip, graceful_close, true)?;

		let mut out = FieldMap::new();
		out.set(codes::VALUE_TRANSFER, &value);
		out.set(codes::H_REFERENCE, &tip);
		if graceful_close {
			out.set(codes::CLOSE_GRACEFUL, &true);
		}
		match self.update_negotiator(&mut out) {
			Ok(()) => self.send_peer_internal(out),
			Err(e) => self.handle_channel_error(e),
		}
		Ok(())
	}

	fn transfer_internal(
		&mut self, value_my: u64, h0: Height, graceful: bool, initiator: bool,
	) -> Result<(), APIError> {
		let (ms0, comm0) = match self.open {
			Some(DataOpen { ms0, comm0: Some(comm0), .. }) => (ms0, comm0),
			_ => return Err(APIError::APIMisuseError { err: "Channel opening wasn't negotiated".to_owned() }),
		};
		let prev = match self.latest_two_phase().and_then(|n| self.get_revision(n)) {
			Some(DataUpdate { ms_my, ms_peer, comm_peer1: Some(comm), .. }) => (*ms_my, *ms_peer, *comm),
			_ => return Err(APIError::APIMisuseError { err: "No revision to build upon".to_owned() }),
		};
		let total = self.value_total();
		if value_my > total {
			return Err(APIError::InvalidParameters { err: "Value exceeds the channel capacity".to_owned() });
		}
		let value_peer = total - value_my;
		let h = HeightRange::with_span(h0, self.params.h_revision_max_life_time);
		let tip = self.host.get_tip();
		let role = self.role;
		let fee = self.params.fee;

		if graceful {
			let withdrawal = self.create_update_point(value_my, value_peer, h, true);
			let setup = CloseSetup {
				role,
				scheme_height: tip,
				ms0,
				comm0,
				outp: withdrawal.outp,
				value_my: withdrawal.outp.value,
				value_peer: value_peer.saturating_add(fee - split_fee(role, fee)),
				fee,
				h,
			};
			let engine = self.host.new_close_negotiator(setup);
			self.negotiation = Some(NegotiationContext::Close { engine, initiator });
			self.state.close.graceful = true;
			log_info!(chan_logger!(self), "Negotiating graceful close as revision {}, {} mine", self.revision, value_my);
		} else {
			let withdrawal = self.create_update_point(value_my, value_peer, h, false);
			let setup = UpdateSetup {
				role,
				scheme_height: tip,
				ms0,
				comm0,
				prev_ms_my: prev.0,
				prev_ms_peer: prev.1,
				prev_comm_peer1: prev.2,
				withdrawal,
			};
			self.negotiation = Some(NegotiationContext::Update(self.host.new_update_negotiator(setup)));
			log_info!(chan_logger!(self), "Negotiating revision {}, {} mine, {} theirs", self.revision, value_my, value_peer);
		}
		Ok(())
	}

	/// Handles a message from the peer.
	pub fn on_peer_data(&mut self, data_in: &FieldMap) {
		if let Err(e) = self.handle_peer_data(data_in) {
			self.handle_channel_error(e);
		}
	}

	fn handle_channel_error(&mut self, e: ChannelError) {
		match e {
			ChannelError::Ignore(msg) => {
				log_debug!(chan_logger!(self), "Ignoring peer message: {}", msg);
			},
			ChannelError::Close(msg) => {
				log_warn!(chan_logger!(self), "Closing channel: {}", msg);
				self.close();
			},
		}
	}

	fn handle_peer_data(&mut self, data_in: &FieldMap) -> Result<(), ChannelError> {
		let rev: u64 = get_field(data_in, codes::REVISION, "revision")?;
		if rev == 0 {
			log_info!(chan_logger!(self), "Peer requested to close the channel");
			self.close();
			return Ok(());
		}
		if rev < self.revision {
			return Err(ChannelError::Ignore(format!("Stale revision {}, ours is {}", rev, self.revision)));
		}
		if rev > self.revision + 1 {
			return Err(ChannelError::Ignore(format!("Out of order revision {}, ours is {}", rev, self.revision)));
		}

		if rev > self.revision {
			if self.negotiation.is_some() {
				return Err(ChannelError::Ignore("A negotiation is already in progress".to_owned()));
			}
			if self.state.terminate {
				return Err(ChannelError::Ignore("Channel is closing".to_owned()));
			}
			if self.revision == 0 {
				self.on_peer_open(data_in)?;
			} else {
				self.on_peer_transfer(data_in)?;
			}
		} else {
			let peer_graceful: Option<bool> = data_in.get(codes::CLOSE_GRACEFUL).unwrap_or(None);
			let our_close = matches!(self.negotiation, Some(NegotiationContext::Close { initiator: true, .. }));
			if rev > 1 && peer_graceful == Some(true) && our_close {
				// Both of us proposed a graceful close at the same revision. Both drop theirs and
				// the side that didn't open the channel proposes again.
				log_debug!(chan_logger!(self), "Graceful close collision at revision {}", rev);
				self.negotiation = None;
				self.state.close.graceful = false;
				self.discard_last_revision();
				if self.role == Role::Responder {
					let value_my = self.value_my();
					let tip = self.host.get_tip();
					self.transfer_internal(value_my, tip, true, true)
						.map_err(|e| ChannelError::Close(format!("Can't propose close again: {:?}", e)))?;
					let mut out = FieldMap::new();
					out.set(codes::VALUE_TRANSFER, &0u64);
					out.set(codes::H_REFERENCE, &tip);
					out.set(codes::CLOSE_GRACEFUL, &true);
					self.update_negotiator(&mut out)?;
					self.send_peer_internal(out);
				}
				return Ok(());
			}
			if self.negotiation.is_none() && self.get_state() == State::Opening0 {
				// The peer hasn't moved past the opening either, so neither of us can complete it
				// anymore. Stop waiting for it.
				let tip = self.host.get_tip();
				if let Some(ref mut open) = self.open {
					open.h_open.max = cmp::min(open.h_open.max, tip);
				}
				return Ok(());
			}
		}

		if let Some(negotiation) = self.negotiation.as_mut() {
			negotiation.storage_mut().absorb_peer_fields(data_in);
			let mut out = FieldMap::new();
			self.update_negotiator(&mut out)?;
			self.send_peer_internal(out);
		}
		Ok(())
	}

	fn on_peer_open(&mut self, data_in: &FieldMap) -> Result<(), ChannelError> {
		let params = ChannelParams {
			h_lock_time: get_field(data_in, codes::H_LOCK_TIME, "lock time")?,
			h_post_lock_reserve: get_field(data_in, codes::H_POST_LOCK_RESERVE, "post-lock reserve")?,
			h_revision_max_life_time: get_field(data_in, codes::H_REVISION_MAX_LIFE_TIME, "revision lifetime")?,
			fee: get_field(data_in, codes::FEE, "fee")?,
		};
		// The peer's view is mirrored
		let value_peer: u64 = get_field(data_in, codes::VALUE_MY, "opener value")?;
		let value_my: u64 = get_field(data_in, codes::VALUE_PEER, "acceptor value")?;
		let h_open = HeightRange::new(
			get_field(data_in, codes::H_OPEN_MIN, "opening range")?,
			get_field(data_in, codes::H_OPEN_MAX, "opening range")?,
		);
		self.open_internal(Role::Responder, value_my, value_peer, h_open, params)
			.map_err(|e| ChannelError::Ignore(format!("Can't accept channel: {:?}", e)))
	}

	fn on_peer_transfer(&mut self, data_in: &FieldMap) -> Result<(), ChannelError> {
		let value: u64 = get_field(data_in, codes::VALUE_TRANSFER, "transfer value")?;
		let h_ref: Height = get_field(data_in, codes::H_REFERENCE, "reference height")?;
		let graceful: bool = data_in.get(codes::CLOSE_GRACEFUL)
			.map_err(|e| ChannelError::Ignore(format!("Malformed close flag: {}", e)))?
			.unwrap_or(false);

		match self.open {
			Some(ref open) if open.h_confirmed != 0 => {},
			_ => return Err(ChannelError::Ignore("Channel opening isn't confirmed".to_owned())),
		}
		let h_base = match self.latest_two_phase().and_then(|n| self.get_revision(n)) {
			Some(upd) => upd.h.min,
			None => return Err(ChannelError::Ignore("No revision to build upon".to_owned())),
		};
		if h_ref < h_base {
			return Err(ChannelError::Ignore(format!("Reference height {} precedes the current revision at {}", h_ref, h_base)));
		}
		let tip = self.host.get_tip();
		if h_ref.saturating_add(MAX_BLACKOUT_TIME) < tip {
			return Err(ChannelError::Ignore(format!("Reference height {} is too old, tip is at {}", h_ref, tip)));
		}
		let value_my = match self.value_my().checked_add(value) {
			Some(v) => v,
			None => return Err(ChannelError::Ignore("Transfer value overflow".to_owned())),
		};
		self.transfer_internal(value_my, h_ref, graceful, false)
			.map_err(|e| ChannelError::Ignore(format!("Can't accept transfer: {:?}", e)))
	}

	/// Drives the active negotiation one step and captures whatever it newly produced. On success
	/// the negotiation is discarded and the chain is looked at again.
	fn update_negotiator(&mut self, out: &mut FieldMap) -> Result<(), ChannelError> {
		let mut open_res: Option<Option<OpenResult>> = None;
		let mut withdrawal: Option<Option<WithdrawalResult>> = None;
		let mut peer_key = None;
		let mut close_tx: Option<Option<Transaction>> = None;

		let status = {
			let negotiation = match self.negotiation.as_mut() {
				Some(negotiation) => negotiation,
				None => return Ok(()),
			};
			let before = negotiation.done_parts();
			let status = negotiation.update(out);
			let now = negotiation.done_parts();
			match negotiation {
				NegotiationContext::Open(engine) => {
					if now.newly_done(before, DoneParts::MAIN) {
						open_res = Some(engine.open_result());
						withdrawal = Some(engine.withdrawal_result());
					}
				},
				NegotiationContext::Update(engine) => {
					if now.newly_done(before, DoneParts::MAIN | DoneParts::PEER_WITHDRAWAL) {
						withdrawal = Some(engine.withdrawal_result());
					}
					if now.newly_done(before, DoneParts::KEY_DISCLOSED) {
						peer_key = engine.peer_key();
					}
				},
				NegotiationContext::Close { engine, .. } => {
					if status == Status::Success {
						close_tx = Some(engine.close_tx());
					}
				},
			}
			status
		};

		if let Some(res) = open_res {
			let res = res.ok_or_else(|| ChannelError::Close("Opening done without a result".to_owned()))?;
			if let Some(ref mut open) = self.open {
				open.kid_open = res.tx_open.kernel_id();
				open.comm0 = Some(res.ms0_commitment);
				open.tx_open = res.tx_open;
			}
			if let Some(ref open) = self.open {
				log_debug!(chan_logger!(self), "Opening transaction negotiated: {}", log_tx!(open.tx_open));
			}
		}
		if let Some(res) = withdrawal {
			let res = res.ok_or_else(|| ChannelError::Close("Withdrawal done without a result".to_owned()))?;
			let revision = self.revision;
			if let Some(upd) = self.revisions.back_mut() {
				upd.apply_withdrawal(res);
				log_debug!(chan_logger!(self), "Withdrawal path built for {}", log_revision!(upd, revision));
			}
		}
		if let Some(key) = peer_key {
			let prev = self.revision.saturating_sub(1);
			if let Some(upd) = self.revisions.back_mut() {
				if upd.kind != RevisionType::None {
					upd.peer_key = Some(key);
					log_debug!(chan_logger!(self), "Peer gave up its withdrawal of revision {}", prev);
				}
			}
		}
		if let Some(tx) = close_tx {
			let tx = tx.ok_or_else(|| ChannelError::Close("Close done without a transaction".to_owned()))?;
			if let Some(upd) = self.revisions.back_mut() {
				upd.tx1 = tx;
				upd.kind = RevisionType::Direct;
			}
		}

		match status {
			Status::Pending => Ok(()),
			Status::Success => {
				log_info!(chan_logger!(self), "Negotiation of revision {} complete", self.revision);
				self.negotiation = None;
				self.update();
				Ok(())
			},
			Status::Error(code) => Err(ChannelError::Close(format!("Negotiation failed with code {}", code))),
		}
	}

	fn send_peer_internal(&self, mut out: FieldMap) {
		if out.is_empty() {
			return;
		}
		out.set(codes::REVISION, &self.revision);
		log_gossip!(chan_logger!(self), "Sending {} fields to peer at revision {}", out.len(), self.revision);
		self.host.send_peer(out);
	}

	/// Forces the channel closed: any negotiation is abandoned and the latest withdrawal path is
	/// broadcast. The peer is told the first time. Calling this again has no further effect.
	pub fn close(&mut self) {
		if self.open.is_none() {
			return;
		}
		if !self.state.terminate {
			log_info!(chan_logger!(self), "Closing channel at revision {}", self.revision);
			self.state.terminate = true;
			let mut msg = FieldMap::new();
			msg.set(codes::REVISION, &0u64);
			self.host.send_peer(msg);
		}
		if self.negotiation.take().is_some() {
			log_debug!(chan_logger!(self), "Abandoned negotiation of revision {}", self.revision);
			self.discard_unfinished_revision();
		}
		self.update();
	}

	fn discard_unfinished_revision(&mut self) {
		let unfinished = self.revisions.back().map_or(false, |upd| upd.kind == RevisionType::None);
		if self.revision > 1 && unfinished {
			self.discard_last_revision();
		}
	}

	/// Drops the newest revision, whose negotiation was abandoned.
	pub(super) fn discard_last_revision(&mut self) {
		if self.revisions.pop_back().is_some() {
			log_debug!(chan_logger!(self), "Discarding revision {}", self.revision);
			self.revision -= 1;
		}
	}

	/// The revision we withdraw if we have to close unilaterally.
	pub(super) fn select_withdrawal_path(&self) -> Option<u64> {
		#[cfg(any(test, feature = "unsafe_revoked_tx_broadcast"))]
		{
			if let Some(n) = self.withdrawal_path_override {
				return Some(n);
			}
		}
		self.latest_two_phase()
	}

	/// Makes us withdraw revision `n` (or the latest one again on `None`) if we close
	/// unilaterally, even if `n` is outdated. Only useful to test the punishment of a cheating
	/// peer.
	#[cfg(any(test, feature = "unsafe_revoked_tx_broadcast"))]
	pub fn set_withdrawal_path_override(&mut self, n: Option<u64>) {
		self.withdrawal_path_override = n;
	}

	/// Reacts to the current chain tip: queries confirmations, broadcasts transactions and forces
	/// the channel closed if its latest revision is about to expire. Calling it again at the same
	/// tip has no further effect.
	pub fn update(&mut self) {
		let tip = self.host.get_tip();
		let (h_confirmed, h_open, kid_open, comm0) = match self.open {
			Some(ref open) => (open.h_confirmed, open.h_open, open.kid_open, open.comm0),
			None => return,
		};

		if h_confirmed == 0 {
			let past_barrier = self.revisions.front().map_or(false, |upd| upd.kind != RevisionType::None);
			if !past_barrier {
				self.state.h_query_last = tip;
				return;
			}
			if h_open.is_in_range(tip.saturating_add(1)) {
				let tx = self.open.as_ref().map(|open| open.tx_open.clone()).unwrap_or_default();
				self.send_tx_no_spam(tx, tip);
			}
			if let Some(id) = kid_open {
				self.query_if_due(tip, QueryKind::OpenKernel, ChainRequest::Kernel { id });
			}
			return;
		}

		if self.state.close.h_phase2 != 0 {
			return;
		}

		if self.state.close.h_phase1 != 0 {
			let h_unlock = self.state.close.h_phase1.saturating_add(self.params.h_lock_time);
			let initiated_by_us = self.state.close.initiated_by_us;
			let tx = match self.state.close.path.and_then(|n| self.get_revision(n)) {
				Some(upd) if initiated_by_us => upd.tx2.clone(),
				Some(upd) => upd.tx_peer2.clone(),
				None => return,
			};
			let punishment = !initiated_by_us
				&& self.state.close.path.and_then(|n| self.get_revision(n))
					.map_or(false, |upd| upd.kind == RevisionType::Punishment);
			if punishment || tip.saturating_add(1) >= h_unlock {
				if let Some(id) = tx.kernel_id() {
					self.send_tx_no_spam(tx, tip);
					self.query_if_due(tip, QueryKind::Phase2, ChainRequest::Kernel { id });
				}
			}
			return;
		}

		let direct_kid = match self.revisions.back() {
			Some(upd) if upd.kind == RevisionType::Direct => upd.tx1.kernel_id(),
			_ => None,
		};
		match (direct_kid, comm0) {
			(Some(id), _) => self.query_if_due(tip, QueryKind::DirectKernel, ChainRequest::Kernel { id }),
			(None, Some(commitment)) => self.query_if_due(tip, QueryKind::MuSig, ChainRequest::Utxo { commitment }),
			(None, None) => {
				log_error!(chan_logger!(self), "Confirmed channel without a root output");
			},
		}

		let path = self.select_withdrawal_path();
		if let Some(h_max) = path.and_then(|n| self.get_revision(n)).map(|upd| upd.h.max) {
			let lag = if self.role == Role::Responder { RESPONDER_EXTRA_LAG } else { 0 };
			let h_trigger = tip.saturating_add(self.params.h_post_lock_reserve).saturating_add(lag);
			if h_trigger >= h_max && !self.state.terminate {
				log_info!(chan_logger!(self), "Revision {:?} expires at {}, closing channel", path, h_max);
				self.state.terminate = true;
			}
		}

		if self.state.terminate {
			if let Some(tx) = path.and_then(|n| self.get_revision(n)).map(|upd| upd.tx1.clone()) {
				self.send_tx_no_spam(tx, tip);
			}
		} else {
			if let Some(tx) = self.revisions.back().filter(|upd| upd.kind == RevisionType::Direct).map(|upd| upd.tx1.clone()) {
				self.send_tx_no_spam(tx, tip);
			}
			if self.negotiation.is_none() {
				self.forget_outdated_revisions(tip);
			}
		}
	}

	/// Broadcasts `tx` unless the same kernel was broadcast less than [`TX_RESEND_PERIOD`] blocks
	/// ago.
	pub(super) fn send_tx_no_spam(&mut self, tx: Transaction, tip: Height) {
		let kid = match tx.kernel_id() {
			Some(kid) => kid,
			None => return,
		};
		if self.state.kid_sent_last == Some(kid)
			&& tip < self.state.h_tx_sent_last.saturating_add(TX_RESEND_PERIOD)
		{
			return;
		}
		self.state.h_tx_sent_last = tip;
		self.state.kid_sent_last = Some(kid);

		if let Some(old) = self.pending_tx.take() {
			self.host.chain().cancel_request(old);
		}
		let id = self.alloc_request_id();
		self.pending_tx = Some(id);
		log_trace!(chan_logger!(self), "Broadcasting {} as {}", log_tx!(tx), id);
		self.host.chain().post_request(id, ChainRequest::Transaction { tx });
	}

	fn query_if_due(&mut self, tip: Height, kind: QueryKind, request: ChainRequest) {
		if self.state.h_query_last >= tip {
			return;
		}
		self.state.h_query_last = tip;
		self.post_query(kind, request);
	}

	/// Posts a chain query, replacing the one in flight.
	pub(super) fn post_query(&mut self, kind: QueryKind, request: ChainRequest) {
		if let Some(old) = self.pending_query.take() {
			self.host.chain().cancel_request(old.id);
		}
		let id = self.alloc_request_id();
		self.pending_query = Some(PendingQuery { id, kind });
		log_trace!(chan_logger!(self), "Querying {:?} as {}", kind, id);
		self.host.chain().post_request(id, request);
	}

	fn alloc_request_id(&mut self) -> RequestId {
		self.next_request_id += 1;
		RequestId(self.next_request_id)
	}

	fn cancel_requests(&mut self) {
		if let Some(query) = self.pending_query.take() {
			self.host.chain().cancel_request(query.id);
		}
		if let Some(id) = self.pending_tx.take() {
			self.host.chain().cancel_request(id);
		}
	}

	/// Drops revisions which can't be mined anymore, keeping the latest two-phase one.
	fn forget_outdated_revisions(&mut self, tip: Height) {
		let keep = match self.latest_two_phase() {
			Some(n) => n,
			None => return,
		};
		loop {
			let h_max = match self.revisions.front() {
				Some(upd) => upd.h.max,
				None => break,
			};
			let n = self.first_revision();
			if n >= keep || h_max.saturating_add(self.config.rules.max_rollback) >= tip {
				break;
			}
			self.revisions.pop_front();
			log_debug!(chan_logger!(self), "Forgot outdated revision {}", n);
		}
	}

	/// Handles a chain reorganization, the new tip being whatever the host reports. Must be called
	/// before [`Channel::update`] is called for the new chain.
	pub fn on_rolled_back(&mut self) {
		let tip = self.host.get_tip();
		self.cancel_requests();

		if self.state.close.h_phase2 > tip {
			let h = self.state.close.h_phase2;
			self.state.close.h_phase2 = 0;
			if let Some(coin) = self.phase2_coin() {
				self.host.on_coin(&coin, h, CoinState::Confirmed, true);
			}
			log_info!(chan_logger!(self), "Closing at height {} was rolled back", h);
		}
		if self.state.close.h_phase1 > tip {
			log_info!(chan_logger!(self), "Withdrawal at height {} was rolled back", self.state.close.h_phase1);
			self.state.close.h_phase1 = 0;
			self.state.close.path = None;
			self.state.close.initiated_by_us = false;
		}
		let unconfirmed = match self.open {
			Some(ref mut open) if open.h_confirmed > tip => {
				let h = open.h_confirmed;
				open.h_confirmed = 0;
				Some((h, open.inputs.clone(), open.change))
			},
			_ => None,
		};
		if let Some((h, inputs, change)) = unconfirmed {
			for coin in inputs.iter() {
				self.host.on_coin(coin, h, CoinState::Spent, true);
			}
			if let Some(ref coin) = change {
				self.host.on_coin(coin, h, CoinState::Confirmed, true);
			}
			log_info!(chan_logger!(self), "Channel opening at height {} was rolled back", h);
		}

		self.state.h_query_last = cmp::min(self.state.h_query_last, tip);
		self.state.h_tx_sent_last = cmp::min(self.state.h_tx_sent_last, tip);
		self.state.kid_sent_last = None;
	}

	/// Whether the channel can be forgotten without risking funds: it never opened and its
	/// opening can't be mined anymore, or it closed and that can't be rolled back anymore.
	pub fn is_safe_to_forget(&self) -> bool {
		let open = match self.open {
			Some(ref open) => open,
			None => return true,
		};
		let tip = self.host.get_tip();
		let max_rollback = self.config.rules.max_rollback;
		if open.h_confirmed == 0 {
			return tip >= open.h_open.max.saturating_add(max_rollback);
		}
		self.state.close.h_phase2 != 0 && tip >= self.state.close.h_phase2.saturating_add(max_rollback)
	}

	/// Releases the locked inputs if the channel never opened and resets the channel. This is
	/// irreversible.
	pub fn forget(&mut self) {
		if !self.is_safe_to_forget() {
			log_warn!(chan_logger!(self), "Forgetting a channel which isn't safe to forget");
		}
		self.cancel_requests();
		if let Some(open) = self.open.take() {
			if open.h_confirmed == 0 {
				for coin in open.inputs.iter() {
					self.host.on_coin(coin, open.h_locked, CoinState::Locked, true);
				}
			}
			log_info!(chan_logger!(self), "Forgot channel after {} revisions", self.revision);
		}
		self.revisions.clear();
		self.revision = 0;
		self.negotiation = None;
		self.state = ChannelState::default();
		self.role = Role::Initiator;
		self.params = self.config.params;
	}

	/// Whether the peer closed the channel by broadcasting a revision which was already
	/// superseded.
	pub fn is_unfair_peer_closed(&self) -> bool {
		if self.state.close.h_phase1 == 0 || self.state.close.initiated_by_us {
			return false;
		}
		match (self.state.close.path, self.latest_two_phase()) {
			(Some(path), Some(latest)) => path < latest,
			_ => false,
		}
	}
}
