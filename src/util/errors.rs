// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Error types live here.

#[allow(unused_imports)]
use crate::prelude::*;

use core::fmt;

/// Indicates an error on the client's part (usually some variant of attempting to use too-low or
/// too-high values). Whenever a channel method returns one of these, the channel's state has not
/// been touched.
#[derive(Clone, PartialEq, Eq)]
pub enum APIError {
	/// Indicates the API was wholly misused (see err for more). Cases where these can be returned
	/// are documented, but generally indicates some precondition of a function was violated.
	APIMisuseError {
		/// A human-readable error message
		err: String,
	},
	/// The channel parameters (height windows, lock times, fees) are inconsistent or exceed what
	/// the chain allows.
	InvalidParameters {
		/// A human-readable error message
		err: String,
	},
	/// We were unable to complete the request as the channel is in a state which does not allow
	/// it, e.g. it is still opening, a negotiation is already in flight or it is closing.
	ChannelUnavailable {
		/// A human-readable error message
		err: String,
	},
	/// The wallet or the channel balance can't cover the requested value plus fees.
	InsufficientFunds {
		/// A human-readable error message
		err: String,
		/// The value available to us.
		available: u64,
		/// The value which was requested, fees included.
		requested: u64,
	},
}

impl fmt::Debug for APIError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			APIError::APIMisuseError { ref err } => write!(f, "Misuse error: {}", err),
			APIError::InvalidParameters { ref err } => write!(f, "Invalid parameters: {}", err),
			APIError::ChannelUnavailable { ref err } => write!(f, "Channel unavailable: {}", err),
			APIError::InsufficientFunds { ref err, available, requested } => {
				write!(f, "{} (available: {}, requested: {})", err, available, requested)
			},
		}
	}
}

impl fmt::Display for APIError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}
