//! Storage module for the orders service.
//!
//! This module provides the abstraction over the remote key-value store that
//! holds order records and the order index. Backends expose a small set of
//! primitives (conditional set, delete, get, set membership, incremental set
//! scan, batch get) plus atomic execution of a queued transaction.

use async_trait::async_trait;
use orders_types::{ConfigSchema, ImplementationRegistry};
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod memory;
	pub mod redis;
}

/// Errors that can occur while talking to a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
	/// The backend could not be reached or the connection dropped.
	#[error("Connection error: {0}")]
	Connection(String),
	/// The backend rejected a command.
	#[error("Command error: {0}")]
	Command(String),
	/// The backend answered with a reply of an unexpected shape.
	#[error("Protocol error: {0}")]
	Protocol(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Condition attached to a SET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
	/// Unconditional write.
	Always,
	/// Only write if the key does not exist (NX).
	IfAbsent,
	/// Only write if the key already exists (XX).
	IfExists,
}

/// A write command that can be queued in a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Set {
		key: String,
		value: Vec<u8>,
		condition: SetCondition,
	},
	Del {
		key: String,
	},
	SAdd {
		set: String,
		member: String,
	},
	SRem {
		set: String,
		member: String,
	},
}

/// A queued sequence of commands applied atomically by [`StoreInterface::exec`].
///
/// Keys listed with [`Transaction::require_exists`] are checked atomically
/// with the commit: if any of them is missing, nothing is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
	required: Vec<String>,
	commands: Vec<Command>,
}

impl Transaction {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn require_exists(&mut self, key: impl Into<String>) {
		self.required.push(key.into());
	}

	pub fn push(&mut self, command: Command) {
		self.commands.push(command);
	}

	/// Keys that must exist for the transaction to apply.
	pub fn required(&self) -> &[String] {
		&self.required
	}

	pub fn commands(&self) -> &[Command] {
		&self.commands
	}

	pub fn is_empty(&self) -> bool {
		self.commands.is_empty()
	}
}

/// Result of executing a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
	/// All commands were applied. One flag per command, in queue order:
	/// whether a SET was applied, whether a DEL found its key, whether a
	/// SADD/SREM changed the set.
	Committed(Vec<bool>),
	/// A required key was missing, so nothing was applied.
	Discarded { key: String },
	/// The store aborted the commit because a watched key changed.
	Aborted,
}

/// One batch of an incremental set scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
	/// Position to resume from. 0 means the scan is complete.
	pub cursor: u64,
	pub members: Vec<String>,
}

/// Trait defining the low-level interface for store backends.
///
/// Every method is a single round trip to the store. Implementations must
/// be safe to share between tasks; consistency between callers comes from
/// [`StoreInterface::exec`], not from locking in the caller.
#[async_trait]
pub trait StoreInterface: Send + Sync {
	/// Returns the value stored at `key`, or `None` if the key is absent.
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

	/// Writes `value` at `key` subject to `condition`.
	/// Returns whether the write was applied.
	async fn set(
		&self,
		key: &str,
		value: Vec<u8>,
		condition: SetCondition,
	) -> Result<bool, StoreError>;

	/// Deletes `key`. Returns whether the key existed.
	async fn del(&self, key: &str) -> Result<bool, StoreError>;

	async fn exists(&self, key: &str) -> Result<bool, StoreError>;

	/// Adds `member` to `set`. Returns whether it was newly added.
	async fn sadd(&self, set: &str, member: &str) -> Result<bool, StoreError>;

	/// Removes `member` from `set`. Returns whether it was present.
	async fn srem(&self, set: &str, member: &str) -> Result<bool, StoreError>;

	async fn sismember(&self, set: &str, member: &str) -> Result<bool, StoreError>;

	/// Returns up to roughly `count` members of `set` matching `pattern`,
	/// resuming from `cursor`. Coverage is complete across repeated calls but
	/// members added or removed during a scan may or may not be returned.
	async fn sscan(
		&self,
		set: &str,
		cursor: u64,
		pattern: &str,
		count: u64,
	) -> Result<ScanPage, StoreError>;

	/// Fetches all `keys` in one round trip. One slot per key, in input order.
	async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError>;

	/// Applies a queued transaction atomically.
	async fn exec(&self, transaction: Transaction) -> Result<TransactionOutcome, StoreError>;

	/// Checks that the store is reachable.
	async fn ping(&self) -> Result<(), StoreError>;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;
}

/// Type alias for store factory functions.
pub type StoreFactory = fn(&toml::Value) -> Result<Box<dyn StoreInterface>, StoreError>;

/// Registry trait for store implementations.
pub trait StoreRegistry: ImplementationRegistry<Factory = StoreFactory> {}

/// Get all registered store implementations as (name, factory) pairs.
pub fn get_all_implementations() -> Vec<(&'static str, StoreFactory)> {
	use implementations::{memory, redis};

	vec![
		(memory::Registry::NAME, memory::Registry::factory()),
		(redis::Registry::NAME, redis::Registry::factory()),
	]
}

/// Shared handle to a store backend.
///
/// The service owns the backend for the life of the process and hands out
/// scoped transactions through [`StoreService::transaction`].
pub struct StoreService {
	/// The underlying store backend implementation.
	backend: Box<dyn StoreInterface>,
}

impl StoreService {
	/// Creates a new StoreService with the specified backend.
	pub fn new(backend: Box<dyn StoreInterface>) -> Self {
		Self { backend }
	}

	/// Begins a transaction. Commands are queued locally until
	/// [`PendingTransaction::commit`]; dropping the handle discards them.
	pub fn transaction(&self) -> PendingTransaction<'_> {
		PendingTransaction {
			backend: self.backend.as_ref(),
			transaction: Transaction::new(),
			finished: false,
		}
	}

	pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		self.backend.get(key).await
	}

	pub async fn set(
		&self,
		key: &str,
		value: Vec<u8>,
		condition: SetCondition,
	) -> Result<bool, StoreError> {
		self.backend.set(key, value, condition).await
	}

	pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
		self.backend.exists(key).await
	}

	pub async fn sismember(&self, set: &str, member: &str) -> Result<bool, StoreError> {
		self.backend.sismember(set, member).await
	}

	pub async fn sscan(
		&self,
		set: &str,
		cursor: u64,
		pattern: &str,
		count: u64,
	) -> Result<ScanPage, StoreError> {
		self.backend.sscan(set, cursor, pattern, count).await
	}

	pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
		self.backend.mget(keys).await
	}

	pub async fn ping(&self) -> Result<(), StoreError> {
		self.backend.ping().await
	}
}

/// A transaction being assembled against a store.
///
/// Consumed by [`commit`](Self::commit) or [`discard`](Self::discard).
/// If neither happens, for example because an error was returned early or
/// the future was cancelled, the queued commands are dropped unapplied.
pub struct PendingTransaction<'a> {
	backend: &'a dyn StoreInterface,
	transaction: Transaction,
	finished: bool,
}

impl PendingTransaction<'_> {
	/// Makes the commit conditional on `key` existing at commit time.
	pub fn require_exists(&mut self, key: impl Into<String>) -> &mut Self {
		self.transaction.require_exists(key);
		self
	}

	pub fn set(
		&mut self,
		key: impl Into<String>,
		value: Vec<u8>,
		condition: SetCondition,
	) -> &mut Self {
		self.transaction.push(Command::Set {
			key: key.into(),
			value,
			condition,
		});
		self
	}

	pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
		self.transaction.push(Command::Del { key: key.into() });
		self
	}

	pub fn sadd(&mut self, set: impl Into<String>, member: impl Into<String>) -> &mut Self {
		self.transaction.push(Command::SAdd {
			set: set.into(),
			member: member.into(),
		});
		self
	}

	pub fn srem(&mut self, set: impl Into<String>, member: impl Into<String>) -> &mut Self {
		self.transaction.push(Command::SRem {
			set: set.into(),
			member: member.into(),
		});
		self
	}

	/// Number of queued commands.
	pub fn len(&self) -> usize {
		self.transaction.commands().len()
	}

	pub fn is_empty(&self) -> bool {
		self.transaction.is_empty()
	}

	/// Sends the queued commands to the store for atomic execution.
	pub async fn commit(mut self) -> Result<TransactionOutcome, StoreError> {
		self.finished = true;
		let transaction = std::mem::take(&mut self.transaction);
		self.backend.exec(transaction).await
	}

	/// Drops the queued commands without sending anything to the store.
	pub fn discard(mut self) {
		self.finished = true;
		tracing::debug!(queued = self.len(), "Discarded transaction");
	}
}

impl Drop for PendingTransaction<'_> {
	fn drop(&mut self) {
		if !self.finished && !self.transaction.is_empty() {
			tracing::debug!(
				queued = self.transaction.commands().len(),
				"Uncommitted transaction dropped, discarding queued commands"
			);
		}
	}
}
