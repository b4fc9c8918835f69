// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various user-configurable channel parameters and the chain rules the channel must respect.

use crate::chain::Height;

/// The maximum number of blocks the reference height of an incoming transfer may lag behind our
/// tip. Older proposals are ignored.
pub const MAX_BLACKOUT_TIME: Height = 15;

/// A channel transaction with a given kernel is rebroadcast at most once per this many blocks.
pub const TX_RESEND_PERIOD: Height = 10;

/// The responder gives up on an expiring revision this many blocks earlier than the initiator, so
/// both don't race to broadcast their withdrawals at the same height.
pub const RESPONDER_EXTRA_LAG: Height = 5;

/// Constants of the underlying chain which bound what a channel may do.
///
/// These are fixed for a given network and are threaded into every [`Channel`] at construction,
/// there is no global instance.
///
/// [`Channel`]: crate::ln::channel::Channel
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChainRules {
	/// The deepest reorganization the chain may undergo. Anything buried deeper than this is
	/// considered final.
	///
	/// Default value: 60.
	pub max_rollback: Height,
	/// The maximum span of a kernel's validity height range.
	///
	/// Default value: 43200 (roughly 30 days of one-minute blocks).
	pub max_kernel_validity_dh: Height,
}

impl Default for ChainRules {
	fn default() -> Self {
		ChainRules { max_rollback: 60, max_kernel_validity_dh: 1440 * 30 }
	}
}

/// Per-channel parameters. The opener proposes them in its first message and the responder
/// adopts them once they pass validation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelParams {
	/// Number of blocks a unilateral withdrawal is locked between its first and second phase.
	///
	/// This is the window in which the counterparty may punish us (or we it) for broadcasting
	/// an outdated revision. We MUST see the chain at least once every `h_lock_time` blocks.
	///
	/// Default value: 1440.
	pub h_lock_time: Height,
	/// Blocks reserved before a revision's kernels expire, so that its first withdrawal phase can
	/// still be mined. Once the tip gets this close to the end of the validity window, the
	/// channel is force-closed.
	///
	/// Default value: 720.
	pub h_post_lock_reserve: Height,
	/// Lifetime of a single revision's withdrawal kernels. Channels which are not updated within
	/// this period are closed.
	///
	/// Default value: 20160.
	pub h_revision_max_life_time: Height,
	/// Fee paid by every channel transaction, split evenly between both parties.
	///
	/// Default value: 100.
	pub fee: u64,
}

impl Default for ChannelParams {
	fn default() -> Self {
		ChannelParams {
			h_lock_time: 1440,
			h_post_lock_reserve: 720,
			h_revision_max_life_time: 1440 * 14,
			fee: 100,
		}
	}
}

/// Top-level config which holds both the chain rules and the parameters we propose on channels
/// we open.
///
/// `Default::default()` provides sane defaults for most configurations.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelConfig {
	/// Chain-wide constants.
	pub rules: ChainRules,
	/// Parameters used when we open a channel. Ignored for inbound channels, which use the
	/// opener's parameters.
	pub params: ChannelParams,
}
