// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The channel and everything it exchanges with its peer.
//!
//! You probably want to create a [`channel::Channel`] with a [`channel::ChannelHost`] giving it
//! access to your wallet, your chain client and your transport to the peer. Then feed it peer
//! messages and chain events as they arrive.

pub mod channel_id;
pub mod msgs;
pub mod negotiator;

#[macro_use]
pub mod channel;
mod onchain;

#[cfg(test)]
#[macro_use]
mod functional_test_utils;
