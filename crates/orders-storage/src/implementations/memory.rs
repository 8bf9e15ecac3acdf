//! In-memory store backend.
//!
//! This module provides a process-local implementation of the StoreInterface
//! trait with the same observable semantics as the networked backend. It is
//! useful for tests and for running the service without a store server.

use crate::{
	Command, ScanPage, SetCondition, StoreError, StoreFactory, StoreInterface, StoreRegistry,
	Transaction, TransactionOutcome,
};
use async_trait::async_trait;
use orders_types::{ConfigSchema, ImplementationRegistry, Schema, ValidationError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
	strings: HashMap<String, Vec<u8>>,
	sets: HashMap<String, BTreeSet<String>>,
}

impl MemoryState {
	fn set(&mut self, key: &str, value: Vec<u8>, condition: SetCondition) -> bool {
		let exists = self.strings.contains_key(key);
		let applies = match condition {
			SetCondition::Always => true,
			SetCondition::IfAbsent => !exists,
			SetCondition::IfExists => exists,
		};
		if applies {
			self.strings.insert(key.to_string(), value);
		}
		applies
	}

	fn del(&mut self, key: &str) -> bool {
		self.strings.remove(key).is_some()
	}

	fn sadd(&mut self, set: &str, member: &str) -> bool {
		self.sets
			.entry(set.to_string())
			.or_default()
			.insert(member.to_string())
	}

	fn srem(&mut self, set: &str, member: &str) -> bool {
		let Some(members) = self.sets.get_mut(set) else {
			return false;
		};
		let removed = members.remove(member);
		if members.is_empty() {
			self.sets.remove(set);
		}
		removed
	}

	fn apply(&mut self, command: Command) -> bool {
		match command {
			Command::Set {
				key,
				value,
				condition,
			} => self.set(&key, value, condition),
			Command::Del { key } => self.del(&key),
			Command::SAdd { set, member } => self.sadd(&set, &member),
			Command::SRem { set, member } => self.srem(&set, &member),
		}
	}
}

/// In-memory store implementation.
///
/// Strings live in a HashMap and sets in ordered BTreeSets so that scans
/// walk members in a stable order. A scan cursor is the offset of the next
/// member to return; members inserted or removed before that offset during
/// a scan shift what the remaining calls see, matching the weak guarantees
/// of a real incremental scan.
pub struct MemoryStore {
	state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self {
			state: Arc::new(RwLock::new(MemoryState::default())),
		}
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

/// Matches a scan pattern: `*`, `prefix*`, or an exact member.
fn pattern_matches(pattern: &str, member: &str) -> bool {
	match pattern.strip_suffix('*') {
		Some(prefix) => member.starts_with(prefix),
		None => pattern == member,
	}
}

#[async_trait]
impl StoreInterface for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		let state = self.state.read().await;
		Ok(state.strings.get(key).cloned())
	}

	async fn set(
		&self,
		key: &str,
		value: Vec<u8>,
		condition: SetCondition,
	) -> Result<bool, StoreError> {
		let mut state = self.state.write().await;
		Ok(state.set(key, value, condition))
	}

	async fn del(&self, key: &str) -> Result<bool, StoreError> {
		let mut state = self.state.write().await;
		Ok(state.del(key))
	}

	async fn exists(&self, key: &str) -> Result<bool, StoreError> {
		let state = self.state.read().await;
		Ok(state.strings.contains_key(key))
	}

	async fn sadd(&self, set: &str, member: &str) -> Result<bool, StoreError> {
		let mut state = self.state.write().await;
		Ok(state.sadd(set, member))
	}

	async fn srem(&self, set: &str, member: &str) -> Result<bool, StoreError> {
		let mut state = self.state.write().await;
		Ok(state.srem(set, member))
	}

	async fn sismember(&self, set: &str, member: &str) -> Result<bool, StoreError> {
		let state = self.state.read().await;
		Ok(state
			.sets
			.get(set)
			.is_some_and(|members| members.contains(member)))
	}

	async fn sscan(
		&self,
		set: &str,
		cursor: u64,
		pattern: &str,
		count: u64,
	) -> Result<ScanPage, StoreError> {
		if count == 0 {
			return Err(StoreError::Command("COUNT must be positive".into()));
		}

		let state = self.state.read().await;
		let Some(members) = state.sets.get(set) else {
			return Ok(ScanPage::default());
		};

		let start = usize::try_from(cursor).unwrap_or(usize::MAX);
		let count = usize::try_from(count).unwrap_or(usize::MAX);
		let end = start.saturating_add(count);

		let members_page = members
			.iter()
			.skip(start)
			.take(count)
			.filter(|member| pattern_matches(pattern, member))
			.cloned()
			.collect();

		let cursor = if end >= members.len() { 0 } else { end as u64 };

		Ok(ScanPage {
			cursor,
			members: members_page,
		})
	}

	async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
		let state = self.state.read().await;
		Ok(keys
			.iter()
			.map(|key| state.strings.get(key).cloned())
			.collect())
	}

	async fn exec(&self, transaction: Transaction) -> Result<TransactionOutcome, StoreError> {
		// One write lock for the guard check and every command.
		let mut state = self.state.write().await;

		if let Some(missing) = transaction
			.required()
			.iter()
			.find(|key| !state.strings.contains_key(key.as_str()))
		{
			return Ok(TransactionOutcome::Discarded {
				key: missing.clone(),
			});
		}

		let replies = transaction
			.commands()
			.iter()
			.cloned()
			.map(|command| state.apply(command))
			.collect();

		Ok(TransactionOutcome::Committed(replies))
	}

	async fn ping(&self) -> Result<(), StoreError> {
		Ok(())
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStoreSchema)
	}
}

/// Configuration schema for MemoryStore.
pub struct MemoryStoreSchema;

impl ConfigSchema for MemoryStoreSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		// Memory store has no configuration
		Schema::new(vec![], vec![]).validate(config)
	}
}

/// Factory function to create a memory store backend.
///
/// The memory store takes no settings; the table is checked against
/// [`MemoryStoreSchema`] by the caller.
pub fn create_storage(_config: &toml::Value) -> Result<Box<dyn StoreInterface>, StoreError> {
	Ok(Box::new(MemoryStore::new()))
}

/// Registry for the memory store implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = StoreFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StoreRegistry for Registry {}
