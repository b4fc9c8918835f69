// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use crate::chain::chaininterface::{ChainClient, ChainRequest, ChainResponse, RequestId, UtxoProof};
use crate::chain::transaction::{Commitment, KernelId, RelativeLock, Transaction, TxKernel, Input, Output};
use crate::chain::{Height, HeightRange};
use crate::ln::channel::{ChannelHost, CoinState};
use crate::ln::channel_id::ChannelId;
use crate::ln::msgs::{codes, FieldMap};
use crate::ln::negotiator::{
	CloseNegotiator, CloseSetup, DoneParts, Negotiator, OpenNegotiator, OpenResult, OpenSetup, Role,
	Status, UpdateNegotiator, UpdateSetup, WithdrawalResult, WithdrawalSetup,
};
use crate::sign::{CoinId, InMemoryKeys, KeyDerivation, KeyType};
use crate::util::logger::{Level, Logger, Record};
use crate::util::ser::Readable;

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::secp256k1::{self, PublicKey, Scalar, Secp256k1, SecretKey};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::prelude::*;

pub struct TestLogger {
	level: Level,
	id: String,
	pub lines: Mutex<HashMap<(String, String), usize>>,
	pub channel_ids: Mutex<Vec<Option<ChannelId>>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		Self::with_id("".to_owned())
	}
	pub fn with_id(id: String) -> TestLogger {
		TestLogger {
			level: Level::Trace,
			id,
			lines: Mutex::new(new_hash_map()),
			channel_ids: Mutex::new(Vec::new()),
		}
	}
	pub fn enable(&mut self, level: Level) {
		self.level = level;
	}

	/// Search for the number of occurrence of the logged lines which
	/// 1. belongs to the specified module and
	/// 2. contains `line` in it.
	/// And asserts if the number of occurrences is the same with the given `count`
	pub fn assert_log_contains(&self, module: &str, line: &str, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		let l: usize = log_entries
			.iter()
			.filter(|&(&(ref m, ref l), _c)| m == module && l.contains(line))
			.map(|(_, c)| c)
			.sum();
		assert_eq!(l, count)
	}

	/// Search for the number of occurrences of logged lines which
	/// 1. belong to the specified module and
	/// 2. match the given regex pattern.
	/// Assert that the number of occurrences equals the given `count`
	pub fn assert_log_regex(&self, module: &str, pattern: regex::Regex, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		let l: usize = log_entries
			.iter()
			.filter(|&(&(ref m, ref l), _c)| m == module && pattern.is_match(&l))
			.map(|(_, c)| c)
			.sum();
		assert_eq!(l, count)
	}
}

impl Logger for TestLogger {
	fn log(&self, record: Record) {
		*self
			.lines
			.lock()
			.unwrap()
			.entry((record.module_path.to_string(), format!("{}", record.args)))
			.or_insert(0) += 1;
		self.channel_ids.lock().unwrap().push(record.channel_id);
		if record.level >= self.level {
			println!("{:<5} {} [{} : {}] {}", record.level.to_string(), self.id, record.module_path, record.line, record.args);
		}
	}
}

struct BlockUndo {
	spent: Vec<(Commitment, Height)>,
	created: Vec<Commitment>,
	kernels: Vec<KernelId>,
}

pub struct ChainState {
	pub tip: Height,
	pub kernels: HashMap<KernelId, Height>,
	pub utxos: HashMap<Commitment, Height>,
	pub mempool: Vec<Transaction>,
	/// Whether broadcast transactions are accepted into the mempool.
	pub accept_txs: bool,
	blocks: Vec<BlockUndo>,
}

/// A minimal chain which checks kernel signatures, heights and relative locks as well as input
/// existence. It doesn't check that transactions balance.
pub struct TestChainSource {
	pub state: Mutex<ChainState>,
}

impl TestChainSource {
	pub fn new(tip: Height) -> TestChainSource {
		TestChainSource {
			state: Mutex::new(ChainState {
				tip,
				kernels: new_hash_map(),
				utxos: new_hash_map(),
				mempool: Vec::new(),
				accept_txs: true,
				blocks: Vec::new(),
			}),
		}
	}

	pub fn tip(&self) -> Height {
		self.state.lock().unwrap().tip
	}

	pub fn add_utxo(&self, commitment: Commitment) {
		let mut state = self.state.lock().unwrap();
		let tip = state.tip;
		state.utxos.insert(commitment, tip);
	}

	pub fn set_accept_txs(&self, accept: bool) {
		self.state.lock().unwrap().accept_txs = accept;
	}

	pub fn kernel_height(&self, id: &KernelId) -> Height {
		self.state.lock().unwrap().kernels.get(id).cloned().unwrap_or(0)
	}

	pub fn is_unspent(&self, commitment: &Commitment) -> bool {
		self.state.lock().unwrap().utxos.contains_key(commitment)
	}

	pub fn submit(&self, tx: &Transaction) -> bool {
		let secp_ctx = Secp256k1::verification_only();
		let mut state = self.state.lock().unwrap();
		if !state.accept_txs || tx.kernels.is_empty() {
			return false;
		}
		for krn in tx.kernels.iter() {
			if !krn.verify(&secp_ctx) {
				return false;
			}
			let id = krn.id();
			if state.kernels.contains_key(&id) {
				return false;
			}
			if state.mempool.iter().any(|other| other.kernels.iter().any(|k| k.id() == id)) {
				return false;
			}
		}
		state.mempool.push(tx.clone());
		true
	}

	pub fn respond(&self, request: &ChainRequest) -> ChainResponse {
		match request {
			ChainRequest::Utxo { commitment } => {
				let state = self.state.lock().unwrap();
				let proofs = state.utxos.get(commitment).map(|h| UtxoProof { height: *h }).into_iter().collect();
				ChainResponse::Utxo { proofs }
			},
			ChainRequest::Kernel { id } => ChainResponse::Kernel { height: self.kernel_height(id) },
			ChainRequest::Transaction { tx } => ChainResponse::Transaction { accepted: self.submit(tx) },
		}
	}

	/// Mines the next block out of whatever mempool transactions are valid at its height.
	pub fn mine_block(&self) {
		let mut state = self.state.lock().unwrap();
		let h = state.tip + 1;
		let mut undo = BlockUndo { spent: Vec::new(), created: Vec::new(), kernels: Vec::new() };
		let mempool = core::mem::take(&mut state.mempool);
		for tx in mempool.into_iter() {
			if tx.kernels.iter().any(|krn| krn.height.max < h) {
				continue;
			}
			let valid = tx.kernels.iter().all(|krn| {
				let lock_ok = match krn.relative_lock {
					Some(RelativeLock { kernel_id, lock_height }) => match state.kernels.get(&kernel_id) {
						Some(h0) => h >= h0 + lock_height,
						None => false,
					},
					None => true,
				};
				krn.height.is_in_range(h) && lock_ok
			}) && tx.inputs.iter().all(|inp| state.utxos.contains_key(&inp.commitment));
			if !valid {
				state.mempool.push(tx);
				continue;
			}
			for inp in tx.inputs.iter() {
				if let Some(h_created) = state.utxos.remove(&inp.commitment) {
					undo.spent.push((inp.commitment, h_created));
				}
			}
			for outp in tx.outputs.iter() {
				state.utxos.insert(outp.commitment, h);
				undo.created.push(outp.commitment);
			}
			for krn in tx.kernels.iter() {
				state.kernels.insert(krn.id(), h);
				undo.kernels.push(krn.id());
			}
		}
		state.blocks.push(undo);
		state.tip = h;
	}

	/// Disconnects the last `count` blocks. Their transactions are dropped.
	pub fn disconnect_blocks(&self, count: usize) {
		let mut state = self.state.lock().unwrap();
		for _ in 0..count {
			let undo = state.blocks.pop().unwrap();
			for comm in undo.created.iter() {
				state.utxos.remove(comm);
			}
			for (comm, h) in undo.spent.iter() {
				state.utxos.insert(*comm, *h);
			}
			for id in undo.kernels.iter() {
				state.kernels.remove(id);
			}
			state.tip -= 1;
		}
	}
}

pub struct TestHost {
	pub seed: [u8; 32],
	pub keys: InMemoryKeys,
	pub chain: Arc<TestChainSource>,
	next_coin_idx: AtomicU64,
	/// Caps the value `select_inputs` hands out.
	pub wallet_balance: Mutex<u64>,
	pub requests: Mutex<Vec<(RequestId, ChainRequest)>>,
	pub cancelled: Mutex<Vec<RequestId>>,
	pub peer_messages: Mutex<Vec<FieldMap>>,
	pub coin_events: Mutex<Vec<(CoinId, Height, CoinState, bool)>>,
	/// Makes the next negotiation engine fail on its first step.
	pub fail_next_negotiation: Mutex<bool>,
}

impl TestHost {
	pub fn new(seed: u8, chain: Arc<TestChainSource>) -> TestHost {
		TestHost {
			seed: [seed; 32],
			keys: InMemoryKeys::new([seed; 32]),
			chain,
			next_coin_idx: AtomicU64::new(1),
			wallet_balance: Mutex::new(u64::MAX),
			requests: Mutex::new(Vec::new()),
			cancelled: Mutex::new(Vec::new()),
			peer_messages: Mutex::new(Vec::new()),
			coin_events: Mutex::new(Vec::new()),
			fail_next_negotiation: Mutex::new(false),
		}
	}

	pub fn take_peer_messages(&self) -> Vec<FieldMap> {
		core::mem::take(&mut *self.peer_messages.lock().unwrap())
	}

	pub fn take_chain_requests(&self) -> Vec<(RequestId, ChainRequest)> {
		core::mem::take(&mut *self.requests.lock().unwrap())
	}

	pub fn take_coin_events(&self) -> Vec<(CoinId, Height, CoinState, bool)> {
		core::mem::take(&mut *self.coin_events.lock().unwrap())
	}

	fn take_fail_flag(&self) -> bool {
		core::mem::replace(&mut *self.fail_next_negotiation.lock().unwrap(), false)
	}

	fn engine(&self, role: Role, nonce_src: &CoinId) -> MockEngine {
		MockEngine::new(self.seed, role, nonce_src, self.take_fail_flag())
	}
}

impl ChainClient for TestHost {
	fn post_request(&self, id: RequestId, request: ChainRequest) {
		self.requests.lock().unwrap().push((id, request));
	}

	fn cancel_request(&self, id: RequestId) {
		self.requests.lock().unwrap().retain(|(req_id, _)| *req_id != id);
		self.cancelled.lock().unwrap().push(id);
	}
}

impl ChannelHost for TestHost {
	fn get_tip(&self) -> Height {
		self.chain.tip()
	}

	fn chain(&self) -> &dyn ChainClient {
		self
	}

	fn keys(&self) -> &dyn KeyDerivation {
		&self.keys
	}

	fn alloc_coin_idx(&self) -> u64 {
		self.next_coin_idx.fetch_add(1, Ordering::AcqRel)
	}

	fn select_inputs(&self, value: u64) -> Vec<CoinId> {
		let balance = *self.wallet_balance.lock().unwrap();
		let coin_value = if balance < value { balance } else { value.saturating_add(1000) };
		if coin_value == 0 {
			return Vec::new();
		}
		let coin = CoinId::new(self.alloc_coin_idx(), coin_value, KeyType::Regular);
		self.chain.add_utxo(self.keys.coin_commitment(&coin));
		vec![coin]
	}

	fn send_peer(&self, msg: FieldMap) {
		self.peer_messages.lock().unwrap().push(msg);
	}

	fn on_coin(&self, coin: &CoinId, h: Height, state: CoinState, reverse: bool) {
		self.coin_events.lock().unwrap().push((*coin, h, state, reverse));
	}

	fn new_open_negotiator(&self, setup: OpenSetup) -> Box<dyn OpenNegotiator> {
		let base = self.engine(setup.role, &setup.withdrawal.ms_my);
		Box::new(TestOpenNegotiator { base, setup, open_result: None, withdrawal: None })
	}

	fn new_update_negotiator(&self, setup: UpdateSetup) -> Box<dyn UpdateNegotiator> {
		let base = self.engine(setup.role, &setup.withdrawal.ms_my);
		Box::new(TestUpdateNegotiator { base, setup, withdrawal: None, peer_key: None })
	}

	fn new_close_negotiator(&self, setup: CloseSetup) -> Box<dyn CloseNegotiator> {
		let base = self.engine(setup.role, &setup.outp);
		Box::new(TestCloseNegotiator { base, setup, close_tx: None })
	}
}

/// Fields the mock engines exchange.
pub mod engine_codes {
	use crate::ln::msgs::codes::ENGINE;

	pub const NONCE: u32 = ENGINE + 1;
	pub const PK_MS0: u32 = ENGINE + 2;
	pub const PK_MS_MY: u32 = ENGINE + 3;
	pub const PK_MS_PEER: u32 = ENGINE + 4;
	pub const OUTP: u32 = ENGINE + 5;
	pub const INPUTS: u32 = ENGINE + 6;
	pub const CHANGE: u32 = ENGINE + 7;
	pub const ACK: u32 = ENGINE + 8;
	pub const KEY: u32 = ENGINE + 9;
}

fn other_role(role: Role) -> Role {
	match role {
		Role::Initiator => Role::Responder,
		Role::Responder => Role::Initiator,
	}
}

/// Distinguishes both sides' kernels of the same shared transaction template.
fn role_index(role: Role) -> u8 {
	match role {
		Role::Initiator => 0,
		Role::Responder => 1,
	}
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
	let mut sha = Sha256::engine();
	for part in parts {
		sha.input(part);
	}
	Sha256::from_engine(sha).to_byte_array()
}

/// A kernel key both parties derive from their joint seed, so that either can sign any of the
/// shared kernels. Real engines would co-sign instead.
fn shared_kernel_key(joint: &[u8; 32], label: &[u8], idx: u8) -> SecretKey {
	let mut counter: u32 = 0;
	loop {
		if let Ok(key) = SecretKey::from_slice(&sha256(&[joint, label, &[idx], &counter.to_be_bytes()])) {
			return key;
		}
		counter += 1;
	}
}

fn signed_kernel(
	secp_ctx: &Secp256k1<secp256k1::All>, key: &SecretKey, fee: u64, h: HeightRange,
	relative_lock: Option<RelativeLock>,
) -> TxKernel {
	let mut krn = TxKernel::new(fee, h, PublicKey::from_secret_key(secp_ctx, key));
	krn.relative_lock = relative_lock;
	krn.sign(secp_ctx, key, &[0; 32]);
	krn
}

/// Outputs of shared transactions are ordered initiator first.
fn ordered(role: Role, mine: Commitment, peer: Commitment) -> Vec<Output> {
	let (a, b) = match role {
		Role::Initiator => (mine, peer),
		Role::Responder => (peer, mine),
	};
	vec![Output { commitment: a }, Output { commitment: b }]
}

struct MockEngine {
	keys: InMemoryKeys,
	secp_ctx: Secp256k1<secp256k1::All>,
	role: Role,
	nonce: [u8; 32],
	store: FieldMap,
	sent_own: bool,
	sent_ack: bool,
	fail: bool,
	done: DoneParts,
}

impl MockEngine {
	fn new(seed: [u8; 32], role: Role, nonce_src: &CoinId, fail: bool) -> Self {
		use crate::util::ser::Writeable;
		MockEngine {
			keys: InMemoryKeys::new(seed),
			secp_ctx: Secp256k1::new(),
			role,
			nonce: sha256(&[&seed, b"nonce", &nonce_src.encode()]),
			store: FieldMap::new(),
			sent_own: false,
			sent_ack: false,
			fail,
			done: DoneParts::NONE,
		}
	}

	fn peer<T: Readable>(&self, code: u32) -> Option<T> {
		self.store.get(code).ok().flatten()
	}

	fn joint_seed(&self) -> Option<[u8; 32]> {
		let peer: [u8; 32] = self.peer(engine_codes::NONCE)?;
		Some(match self.role {
			Role::Initiator => sha256(&[&self.nonce, &peer]),
			Role::Responder => sha256(&[&peer, &self.nonce]),
		})
	}

	fn commit(&self, coin: &CoinId) -> Commitment {
		self.keys.coin_commitment(coin)
	}

	fn send_own_withdrawal(&self, setup: &WithdrawalSetup, out: &mut FieldMap) {
		out.set(engine_codes::NONCE, &self.nonce);
		out.set(engine_codes::PK_MS_MY, &self.commit(&setup.ms_my));
		out.set(engine_codes::PK_MS_PEER, &self.commit(&setup.ms_peer));
		out.set(engine_codes::OUTP, &self.commit(&setup.outp));
	}

	fn phase1_tx(&self, joint: &[u8; 32], comm0: Commitment, output: Commitment, idx: u8, setup: &WithdrawalSetup) -> Transaction {
		let key = shared_kernel_key(joint, b"tx1", idx);
		Transaction {
			inputs: vec![Input { commitment: comm0 }],
			outputs: vec![Output { commitment: output }],
			kernels: vec![signed_kernel(&self.secp_ctx, &key, setup.fee, setup.h, None)],
			offset: [0; 32],
		}
	}

	fn phase2_tx(&self, joint: &[u8; 32], tx1: &Transaction, idx: u8, outputs: Vec<Output>, setup: &WithdrawalSetup) -> Option<Transaction> {
		let key = shared_kernel_key(joint, b"tx2", idx);
		let lock = RelativeLock { kernel_id: tx1.kernel_id()?, lock_height: setup.h_lock_time };
		let h = HeightRange::new(setup.h.min, setup.h.max.saturating_add(setup.h_lock_time.saturating_mul(2)));
		Some(Transaction {
			inputs: vec![Input { commitment: tx1.outputs.first()?.commitment }],
			outputs,
			kernels: vec![signed_kernel(&self.secp_ctx, &key, setup.fee, h, Some(lock))],
			offset: [0; 32],
		})
	}

	fn build_withdrawal(&self, comm0: Commitment, setup: &WithdrawalSetup) -> Option<WithdrawalResult> {
		let joint = self.joint_seed()?;
		let peer_ms_my: Commitment = self.peer(engine_codes::PK_MS_MY)?;
		let peer_ms_peer: Commitment = self.peer(engine_codes::PK_MS_PEER)?;
		let peer_outp: Commitment = self.peer(engine_codes::OUTP)?;

		let comm_my1 = self.commit(&setup.ms_my).combine(&peer_ms_peer)?;
		let comm_peer1 = self.commit(&setup.ms_peer).combine(&peer_ms_my)?;
		let my_idx = role_index(self.role);
		let peer_idx = role_index(other_role(self.role));

		let tx1 = self.phase1_tx(&joint, comm0, comm_my1, my_idx, setup);
		let tx_peer1 = self.phase1_tx(&joint, comm0, comm_peer1, peer_idx, setup);
		let outputs = ordered(self.role, self.commit(&setup.outp), peer_outp);
		let tx2 = self.phase2_tx(&joint, &tx1, my_idx, outputs.clone(), setup)?;
		let tx_peer2 = self.phase2_tx(&joint, &tx_peer1, peer_idx, outputs, setup)?;
		Some(WithdrawalResult { kid_peer1: tx_peer1.kernel_id()?, tx1, tx2, tx_peer2, comm_peer1 })
	}
}

pub struct TestOpenNegotiator {
	base: MockEngine,
	setup: OpenSetup,
	open_result: Option<OpenResult>,
	withdrawal: Option<WithdrawalResult>,
}

impl TestOpenNegotiator {
	fn try_build(&mut self) -> Option<()> {
		let base = &self.base;
		let joint = base.joint_seed()?;
		let peer_ms0: Commitment = base.peer(engine_codes::PK_MS0)?;
		let peer_inputs: Vec<Commitment> = base.peer(engine_codes::INPUTS)?;
		let peer_change: Option<Commitment> = base.peer(engine_codes::CHANGE)?;

		let comm0 = base.commit(&self.setup.ms0).combine(&peer_ms0)?;
		let my_inputs: Vec<Commitment> = self.setup.inputs.iter().map(|c| base.commit(c)).collect();
		let my_change = self.setup.change.map(|c| base.commit(&c));
		let (inputs, changes) = match self.setup.role {
			Role::Initiator => ([my_inputs, peer_inputs].concat(), [my_change, peer_change]),
			Role::Responder => ([peer_inputs, my_inputs].concat(), [peer_change, my_change]),
		};
		let mut outputs = vec![Output { commitment: comm0 }];
		outputs.extend(changes.iter().filter_map(|c| c.map(|commitment| Output { commitment })));
		let key = shared_kernel_key(&joint, b"open", 0);
		let tx_open = Transaction {
			inputs: inputs.into_iter().map(|commitment| Input { commitment }).collect(),
			outputs,
			kernels: vec![signed_kernel(&base.secp_ctx, &key, self.setup.fee, self.setup.h_open, None)],
			offset: [0; 32],
		};
		let withdrawal = base.build_withdrawal(comm0, &self.setup.withdrawal)?;
		self.open_result = Some(OpenResult { ms0_commitment: comm0, tx_open });
		self.withdrawal = Some(withdrawal);
		self.base.done = DoneParts::MAIN | DoneParts::PEER_WITHDRAWAL;
		Some(())
	}
}

impl Negotiator for TestOpenNegotiator {
	fn update(&mut self, out: &mut FieldMap) -> Status {
		if self.base.fail {
			return Status::Error(1);
		}
		if !self.base.sent_own {
			self.base.send_own_withdrawal(&self.setup.withdrawal, out);
			out.set(engine_codes::PK_MS0, &self.base.commit(&self.setup.ms0));
			let inputs: Vec<Commitment> = self.setup.inputs.iter().map(|c| self.base.commit(c)).collect();
			out.set(engine_codes::INPUTS, &inputs);
			out.set(engine_codes::CHANGE, &self.setup.change.map(|c| self.base.commit(&c)));
			self.base.sent_own = true;
		}
		if self.open_result.is_none() {
			self.try_build();
		}
		if self.open_result.is_none() {
			return Status::Pending;
		}
		if !self.base.sent_ack {
			out.set(engine_codes::ACK, &true);
			self.base.sent_ack = true;
		}
		if self.base.store.contains(engine_codes::ACK) { Status::Success } else { Status::Pending }
	}

	fn done_parts(&self) -> DoneParts {
		self.base.done
	}

	fn storage_mut(&mut self) -> &mut FieldMap {
		&mut self.base.store
	}
}

impl OpenNegotiator for TestOpenNegotiator {
	fn open_result(&self) -> Option<OpenResult> {
		self.open_result.clone()
	}

	fn withdrawal_result(&self) -> Option<WithdrawalResult> {
		self.withdrawal.clone()
	}
}

pub struct TestUpdateNegotiator {
	base: MockEngine,
	setup: UpdateSetup,
	withdrawal: Option<WithdrawalResult>,
	peer_key: Option<SecretKey>,
}

impl Negotiator for TestUpdateNegotiator {
	fn update(&mut self, out: &mut FieldMap) -> Status {
		if self.base.fail {
			return Status::Error(1);
		}
		if !self.base.sent_own {
			self.base.send_own_withdrawal(&self.setup.withdrawal, out);
			self.base.sent_own = true;
		}
		if self.withdrawal.is_none() {
			self.withdrawal = self.base.build_withdrawal(self.setup.comm0, &self.setup.withdrawal);
			if self.withdrawal.is_none() {
				return Status::Pending;
			}
			self.base.done = DoneParts::MAIN | DoneParts::PEER_WITHDRAWAL;
		}
		if !self.base.sent_ack {
			// Our new withdrawal path is safe, give up the previous one
			let key = self.base.keys.derive_coin_key(&self.setup.prev_ms_my);
			out.set(engine_codes::KEY, &key);
			self.base.sent_ack = true;
		}
		let peer_key: SecretKey = match self.base.peer(engine_codes::KEY) {
			Some(key) => key,
			None => return Status::Pending,
		};
		let my_key = self.base.keys.derive_coin_key(&self.setup.prev_ms_peer);
		match my_key.add_tweak(&Scalar::from(peer_key)) {
			Ok(sk) if Commitment::from_key(&self.base.secp_ctx, &sk) == self.setup.prev_comm_peer1 => {
				self.peer_key = Some(peer_key);
				self.base.done = self.base.done | DoneParts::KEY_DISCLOSED;
				Status::Success
			},
			_ => Status::Error(2),
		}
	}

	fn done_parts(&self) -> DoneParts {
		self.base.done
	}

	fn storage_mut(&mut self) -> &mut FieldMap {
		&mut self.base.store
	}
}

impl UpdateNegotiator for TestUpdateNegotiator {
	fn withdrawal_result(&self) -> Option<WithdrawalResult> {
		self.withdrawal.clone()
	}

	fn peer_key(&self) -> Option<SecretKey> {
		self.peer_key
	}
}

pub struct TestCloseNegotiator {
	base: MockEngine,
	setup: CloseSetup,
	close_tx: Option<Transaction>,
}

impl Negotiator for TestCloseNegotiator {
	fn update(&mut self, out: &mut FieldMap) -> Status {
		if self.base.fail {
			return Status::Error(1);
		}
		if !self.base.sent_own {
			out.set(engine_codes::NONCE, &self.base.nonce);
			out.set(engine_codes::OUTP, &self.base.commit(&self.setup.outp));
			self.base.sent_own = true;
		}
		if self.close_tx.is_none() {
			let joint = match self.base.joint_seed() {
				Some(joint) => joint,
				None => return Status::Pending,
			};
			let peer_outp: Commitment = match self.base.peer(engine_codes::OUTP) {
				Some(comm) => comm,
				None => return Status::Pending,
			};
			let key = shared_kernel_key(&joint, b"close", 0);
			self.close_tx = Some(Transaction {
				inputs: vec![Input { commitment: self.setup.comm0 }],
				outputs: ordered(self.setup.role, self.base.commit(&self.setup.outp), peer_outp),
				kernels: vec![signed_kernel(&self.base.secp_ctx, &key, self.setup.fee, self.setup.h, None)],
				offset: [0; 32],
			});
			self.base.done = DoneParts::MAIN;
		}
		if !self.base.sent_ack {
			out.set(engine_codes::ACK, &true);
			self.base.sent_ack = true;
		}
		if self.base.store.contains(engine_codes::ACK) { Status::Success } else { Status::Pending }
	}

	fn done_parts(&self) -> DoneParts {
		self.base.done
	}

	fn storage_mut(&mut self) -> &mut FieldMap {
		&mut self.base.store
	}
}

impl CloseNegotiator for TestCloseNegotiator {
	fn close_tx(&self) -> Option<Transaction> {
		self.close_tx.clone()
	}
}

/// A message as the peer would send it, carrying only channel-level fields.
pub fn peer_message(revision: u64, fields: &[(u32, u64)]) -> FieldMap {
	let mut msg = FieldMap::new();
	msg.set(codes::REVISION, &revision);
	for (code, value) in fields {
		msg.set(*code, value);
	}
	msg
}
