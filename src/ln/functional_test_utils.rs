// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A bunch of useful utilities for building a pair of channel endpoints on a shared test chain
//! and exchanging messages between them for functional tests.

use crate::chain::chaininterface::ChainRequest;
use crate::chain::{Height, HeightRange};
use crate::ln::channel::{Channel, State};
use crate::ln::channel_id::ChannelId;
use crate::ln::msgs::FieldMap;
use crate::util::config::{ChainRules, ChannelConfig, ChannelParams};
use crate::util::ser::{decode_exact, Writeable};
use crate::util::test_utils::{TestChainSource, TestHost, TestLogger};

use std::sync::Arc;

use crate::prelude::*;

macro_rules! check_states {
	($nodes: expr, $a: expr, $b: expr) => {{
		assert_eq!($nodes[0].chan.get_state(), $a);
		assert_eq!($nodes[1].chan.get_state(), $b);
	}};
}

pub const START_HEIGHT: Height = 1000;

/// Short lifetimes so tests can walk a revision to its expiry.
pub fn test_config() -> ChannelConfig {
	ChannelConfig {
		rules: ChainRules { max_rollback: 8, max_kernel_validity_dh: 1000 },
		params: ChannelParams {
			h_lock_time: 20,
			h_post_lock_reserve: 10,
			h_revision_max_life_time: 200,
			fee: 100,
		},
	}
}

pub struct NodeCfg {
	pub host: TestHost,
	pub logger: TestLogger,
}

pub type TestChannel<'a> = Channel<&'a TestHost, &'a TestLogger>;

pub struct Node<'a> {
	pub host: &'a TestHost,
	pub logger: &'a TestLogger,
	pub chan: TestChannel<'a>,
}

pub fn create_chain() -> Arc<TestChainSource> {
	Arc::new(TestChainSource::new(START_HEIGHT))
}

pub fn create_node_cfgs(chain: &Arc<TestChainSource>) -> Vec<NodeCfg> {
	(0..2u8)
		.map(|i| NodeCfg {
			host: TestHost::new(i + 1, Arc::clone(chain)),
			logger: TestLogger::with_id(format!("node {}", i)),
		})
		.collect()
}

pub fn create_network<'a>(cfgs: &'a [NodeCfg]) -> Vec<Node<'a>> {
	let channel_id = ChannelId::from_node_ids(&[2; 33], &[3; 33]);
	cfgs.iter()
		.map(|cfg| Node {
			host: &cfg.host,
			logger: &cfg.logger,
			chan: Channel::new(channel_id, &cfg.host, &cfg.logger, test_config()),
		})
		.collect()
}

/// Answers the node's chain requests until it posts no more.
pub fn process_chain_requests(node: &mut Node) {
	loop {
		let requests = node.host.take_chain_requests();
		if requests.is_empty() {
			break;
		}
		for (id, request) in requests {
			let response = node.host.chain.respond(&request);
			node.chan.on_request_complete(id, response);
		}
	}
}

/// Takes the node's chain requests and counts the broadcasts among them, answering all of them.
pub fn count_broadcasts(node: &mut Node) -> usize {
	let mut count = 0;
	loop {
		let requests = node.host.take_chain_requests();
		if requests.is_empty() {
			return count;
		}
		for (id, request) in requests {
			if let ChainRequest::Transaction { .. } = request {
				count += 1;
			}
			let response = node.host.chain.respond(&request);
			node.chan.on_request_complete(id, response);
		}
	}
}

fn through_wire(msg: &FieldMap) -> FieldMap {
	decode_exact(&msg.encode()).unwrap()
}

/// Delivers messages both ways until both nodes are quiet. Returns how many were delivered.
pub fn deliver_messages(nodes: &mut [Node]) -> usize {
	let mut delivered = 0;
	loop {
		let from_a = nodes[0].host.take_peer_messages();
		let from_b = nodes[1].host.take_peer_messages();
		if from_a.is_empty() && from_b.is_empty() {
			return delivered;
		}
		for msg in from_a.iter() {
			nodes[1].chan.on_peer_data(&through_wire(msg));
			delivered += 1;
		}
		for msg in from_b.iter() {
			nodes[0].chan.on_peer_data(&through_wire(msg));
			delivered += 1;
		}
		for node in nodes.iter_mut() {
			process_chain_requests(node);
		}
	}
}

pub fn update_nodes(nodes: &mut [Node]) {
	for node in nodes.iter_mut() {
		node.chan.update();
		process_chain_requests(node);
	}
	deliver_messages(nodes);
}

pub fn mine_blocks(chain: &TestChainSource, nodes: &mut [Node], count: usize) {
	for _ in 0..count {
		chain.mine_block();
		update_nodes(nodes);
	}
}

/// Mines until the tip reaches `height`.
pub fn mine_to(chain: &TestChainSource, nodes: &mut [Node], height: Height) {
	while chain.tip() < height {
		mine_blocks(chain, nodes, 1);
	}
}

pub fn disconnect_blocks(chain: &TestChainSource, nodes: &mut [Node], count: usize) {
	chain.disconnect_blocks(count);
	for node in nodes.iter_mut() {
		node.chan.on_rolled_back();
	}
}

/// Opens a channel from `nodes[0]` and confirms it. Returns the confirmation height.
pub fn open_channel(chain: &TestChainSource, nodes: &mut [Node], value_a: u64, value_b: u64) -> Height {
	let tip = chain.tip();
	nodes[0].chan.open(value_a, value_b, HeightRange::new(tip, tip + 50)).unwrap();
	deliver_messages(nodes);
	check_states!(nodes, State::Opening2, State::Opening2);
	mine_blocks(chain, nodes, 1);
	check_states!(nodes, State::Open, State::Open);
	chain.tip()
}

/// Transfers `value` from `nodes[from]` to the other node and completes the negotiation.
pub fn transfer(nodes: &mut [Node], from: usize, value: u64) {
	let revision = nodes[from].chan.revision();
	nodes[from].chan.transfer(value, false).unwrap();
	deliver_messages(nodes);
	check_states!(nodes, State::Open, State::Open);
	assert_eq!(nodes[0].chan.revision(), revision + 1);
	assert_eq!(nodes[1].chan.revision(), revision + 1);
}
