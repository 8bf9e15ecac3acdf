//! Order repository.
//!
//! Each order is stored as a JSON record under `order:<id>`, and its key is a
//! member of the `orders` set. Insert and delete change both in a single
//! store transaction so that, once committed, a record exists exactly when
//! its key is indexed. Reads are not isolated from concurrent writers.

use crate::error::RepositoryError;
use orders_storage::{SetCondition, StoreService, TransactionOutcome};
use orders_types::{order_key, Order, StorageKey};
use std::sync::Arc;
use tracing::instrument;

/// Scan pattern matching every index member.
const MATCH_ALL: &str = "*";

/// Position and size of a page requested from [`OrderRepository::find_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindAllPage {
	/// Upper bound on orders returned, must be positive.
	pub size: u64,
	/// Cursor returned by the previous page, 0 to start a scan.
	pub cursor: u64,
}

/// One page of orders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindResult {
	pub orders: Vec<Order>,
	/// Cursor for the next call. 0 means the scan is complete.
	pub cursor: u64,
}

/// Persists orders and the index used to enumerate them.
///
/// Holds no state besides the store handle, so it can be shared freely
/// between concurrent callers.
pub struct OrderRepository {
	store: Arc<StoreService>,
}

fn encode(key: &str, order: &Order) -> Result<Vec<u8>, RepositoryError> {
	serde_json::to_vec(order).map_err(|source| RepositoryError::Encode {
		key: key.to_string(),
		source,
	})
}

fn decode(key: &str, bytes: &[u8]) -> Result<Order, RepositoryError> {
	serde_json::from_slice(bytes).map_err(|source| RepositoryError::Decode {
		key: key.to_string(),
		source,
	})
}

impl OrderRepository {
	pub fn new(store: Arc<StoreService>) -> Self {
		Self { store }
	}

	/// Stores a new order and adds it to the index.
	///
	/// Fails with [`RepositoryError::AlreadyExists`] if an order with the
	/// same id is already stored, in which case nothing changes.
	#[instrument(skip_all, fields(order_id = order.order_id))]
	pub async fn insert(&self, order: &Order) -> Result<(), RepositoryError> {
		let key = order_key(order.order_id);
		let data = encode(&key, order)?;

		let mut txn = self.store.transaction();
		txn.set(key.as_str(), data, SetCondition::IfAbsent)
			.sadd(StorageKey::OrderIndex.as_str(), key.as_str());

		let outcome = txn
			.commit()
			.await
			.map_err(|e| RepositoryError::commit_failed("insert", &key, e))?;

		match outcome {
			// A refused NX write leaves the record untouched; the key was
			// already indexed, so the SADD changed nothing either.
			TransactionOutcome::Committed(replies) if replies.first() == Some(&true) => {
				tracing::debug!("Inserted order");
				Ok(())
			},
			TransactionOutcome::Committed(_) => Err(RepositoryError::AlreadyExists { key }),
			TransactionOutcome::Aborted => Err(RepositoryError::TransactionFailed {
				operation: "insert",
				key,
				reason: "aborted by store".into(),
			}),
			TransactionOutcome::Discarded { key: missing } => {
				Err(RepositoryError::TransactionFailed {
					operation: "insert",
					key,
					reason: format!("unexpected precondition failure on {}", missing),
				})
			},
		}
	}

	/// Loads a single order.
	#[instrument(skip_all, fields(order_id = order_id))]
	pub async fn find_by_id(&self, order_id: u64) -> Result<Order, RepositoryError> {
		let key = order_key(order_id);

		let bytes = self
			.store
			.get(&key)
			.await
			.map_err(|e| RepositoryError::unavailable("find_by_id", &key, e))?
			.ok_or_else(|| RepositoryError::NotFound { key: key.clone() })?;

		decode(&key, &bytes)
	}

	/// Replaces the stored record of an existing order.
	///
	/// The write only applies if the record exists; otherwise the call fails
	/// with [`RepositoryError::NotFound`] and nothing is created. The index
	/// is not touched.
	#[instrument(skip_all, fields(order_id = order.order_id))]
	pub async fn update(&self, order: &Order) -> Result<(), RepositoryError> {
		let key = order_key(order.order_id);
		let data = encode(&key, order)?;

		let applied = self
			.store
			.set(&key, data, SetCondition::IfExists)
			.await
			.map_err(|e| RepositoryError::unavailable("update", &key, e))?;

		if !applied {
			return Err(RepositoryError::NotFound { key });
		}

		tracing::debug!("Updated order");
		Ok(())
	}

	/// Removes an order and its index entry.
	///
	/// Existence is checked as part of the transaction, so a missing order
	/// is reported as [`RepositoryError::NotFound`] without anything being
	/// applied, and a concurrent delete of the same order succeeds at most
	/// once.
	#[instrument(skip_all, fields(order_id = order_id))]
	pub async fn delete_by_id(&self, order_id: u64) -> Result<(), RepositoryError> {
		let key = order_key(order_id);

		let mut txn = self.store.transaction();
		txn.require_exists(key.as_str())
			.del(key.as_str())
			.srem(StorageKey::OrderIndex.as_str(), key.as_str());

		let outcome = txn
			.commit()
			.await
			.map_err(|e| RepositoryError::commit_failed("delete_by_id", &key, e))?;

		match outcome {
			TransactionOutcome::Committed(replies) if replies.first() == Some(&true) => {
				tracing::debug!("Deleted order");
				Ok(())
			},
			TransactionOutcome::Committed(_) | TransactionOutcome::Discarded { .. } => {
				Err(RepositoryError::NotFound { key })
			},
			TransactionOutcome::Aborted => Err(RepositoryError::TransactionFailed {
				operation: "delete_by_id",
				key,
				reason: "order changed during delete".into(),
			}),
		}
	}

	/// Returns one page of stored orders.
	///
	/// Scans the index from `page.cursor` and fetches all matched records in
	/// one batch, keeping scan order. A record that fails to decode fails the
	/// whole page. A record deleted between the scan and the fetch is left
	/// out of the page.
	#[instrument(skip_all, fields(cursor = page.cursor, size = page.size))]
	pub async fn find_all(&self, page: FindAllPage) -> Result<FindResult, RepositoryError> {
		if page.size == 0 {
			return Err(RepositoryError::InvalidPage(
				"page size must be positive".into(),
			));
		}

		let index = StorageKey::OrderIndex.as_str();
		let scan = self
			.store
			.sscan(index, page.cursor, MATCH_ALL, page.size)
			.await
			.map_err(|e| RepositoryError::unavailable("find_all", index, e))?;

		if scan.members.is_empty() {
			return Ok(FindResult {
				orders: Vec::new(),
				cursor: scan.cursor,
			});
		}

		let values = self
			.store
			.mget(&scan.members)
			.await
			.map_err(|e| RepositoryError::unavailable("find_all", index, e))?;

		let mut orders = Vec::with_capacity(values.len());
		for (key, value) in scan.members.iter().zip(values) {
			match value {
				Some(bytes) => orders.push(decode(key, &bytes)?),
				None => tracing::debug!(key = %key, "Indexed order missing, skipping"),
			}
		}

		Ok(FindResult {
			orders,
			cursor: scan.cursor,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use chrono::{TimeZone, Utc};
	use orders_storage::implementations::memory::MemoryStore;
	use orders_storage::implementations::redis::RedisStore;
	use orders_storage::{ScanPage, StoreError, StoreInterface, Transaction};
	use orders_types::{ConfigSchema, LineItem};
	use std::collections::HashSet;
	use uuid::Uuid;

	fn order(order_id: u64) -> Order {
		Order {
			order_id,
			customer_id: Uuid::from_u128(0x6f1c1e52_4d0b_4c9e_9a52_3f1f0d6b2a11),
			line_items: vec![
				LineItem {
					item_id: Uuid::from_u128(1),
					quantity: 2,
					price: 1500,
				},
				LineItem {
					item_id: Uuid::from_u128(2),
					quantity: 1,
					price: 99,
				},
			],
			created_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
			shipped_at: None,
			completed_at: None,
		}
	}

	fn setup() -> (Arc<StoreService>, OrderRepository) {
		let store = Arc::new(StoreService::new(Box::new(MemoryStore::new())));
		let repository = OrderRepository::new(Arc::clone(&store));
		(store, repository)
	}

	async fn assert_indexed_iff_stored(store: &StoreService, order_id: u64) {
		let key = order_key(order_id);
		assert_eq!(
			store.exists(&key).await.unwrap(),
			store
				.sismember(StorageKey::OrderIndex.as_str(), &key)
				.await
				.unwrap(),
			"record and index disagree for {}",
			key
		);
	}

	#[tokio::test]
	async fn test_insert_find_delete_scenario() {
		let (store, repository) = setup();
		let original = order(42);

		repository.insert(&original).await.unwrap();
		assert!(store.exists("order:42").await.unwrap());
		assert!(store.sismember("orders", "order:42").await.unwrap());

		let found = repository.find_by_id(42).await.unwrap();
		assert_eq!(found, original);
		assert_eq!(found.line_items.len(), 2);
		assert!(found.shipped_at.is_none());
		assert!(found.completed_at.is_none());

		repository.delete_by_id(42).await.unwrap();
		assert!(repository.find_by_id(42).await.unwrap_err().is_not_found());
		assert!(!store.sismember("orders", "order:42").await.unwrap());
	}

	#[tokio::test]
	async fn test_round_trip_minimal_order() {
		let (_, repository) = setup();
		let minimal = Order::new(0, Uuid::nil(), vec![]);

		repository.insert(&minimal).await.unwrap();
		assert_eq!(repository.find_by_id(0).await.unwrap(), minimal);
	}

	#[tokio::test]
	async fn test_double_insert_keeps_first_value() {
		let (store, repository) = setup();
		let first = order(7);
		let mut second = order(7);
		second.line_items.clear();

		repository.insert(&first).await.unwrap();
		let err = repository.insert(&second).await.unwrap_err();
		assert!(
			matches!(err, RepositoryError::AlreadyExists { ref key } if key == "order:7"),
			"unexpected error: {err}"
		);

		assert_eq!(repository.find_by_id(7).await.unwrap(), first);
		assert_indexed_iff_stored(&store, 7).await;
	}

	#[tokio::test]
	async fn test_update_requires_existing_order() {
		let (store, repository) = setup();

		let err = repository.update(&order(5)).await.unwrap_err();
		assert!(err.is_not_found());
		assert!(!store.exists("order:5").await.unwrap());
		assert!(!store.sismember("orders", "order:5").await.unwrap());
	}

	#[tokio::test]
	async fn test_update_replaces_record() {
		let (store, repository) = setup();
		repository.insert(&order(5)).await.unwrap();

		let mut shipped = order(5);
		shipped.shipped_at = Some(Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap());
		repository.update(&shipped).await.unwrap();

		assert_eq!(repository.find_by_id(5).await.unwrap(), shipped);
		assert_indexed_iff_stored(&store, 5).await;
	}

	#[tokio::test]
	async fn test_delete_is_observable_once() {
		let (store, repository) = setup();
		repository.insert(&order(3)).await.unwrap();

		repository.delete_by_id(3).await.unwrap();
		let err = repository.delete_by_id(3).await.unwrap_err();
		assert!(err.is_not_found());
		assert_indexed_iff_stored(&store, 3).await;
	}

	#[tokio::test]
	async fn test_index_consistency_across_mutations() {
		let (store, repository) = setup();

		for id in 0..12 {
			repository.insert(&order(id)).await.unwrap();
		}
		for id in (0..12).step_by(3) {
			repository.delete_by_id(id).await.unwrap();
		}
		let _ = repository.insert(&order(4)).await;
		let _ = repository.delete_by_id(100).await;
		repository.insert(&order(3)).await.unwrap();

		for id in 0..12 {
			assert_indexed_iff_stored(&store, id).await;
		}
		assert_indexed_iff_stored(&store, 100).await;
	}

	#[tokio::test]
	async fn test_empty_store_returns_empty_page() {
		let (_, repository) = setup();
		let result = repository
			.find_all(FindAllPage { size: 10, cursor: 0 })
			.await
			.unwrap();

		assert!(result.orders.is_empty());
		assert_eq!(result.cursor, 0);
	}

	#[tokio::test]
	async fn test_pagination_is_complete_without_duplicates() {
		let (_, repository) = setup();
		for id in 0..25 {
			repository.insert(&order(id)).await.unwrap();
		}

		let mut collected = Vec::new();
		let mut cursor = 0;
		loop {
			let page = repository
				.find_all(FindAllPage { size: 7, cursor })
				.await
				.unwrap();
			assert!(page.orders.len() <= 7);
			collected.extend(page.orders.into_iter().map(|o| o.order_id));
			cursor = page.cursor;
			if cursor == 0 {
				break;
			}
		}

		let unique: HashSet<u64> = collected.iter().copied().collect();
		assert_eq!(collected.len(), 25);
		assert_eq!(unique, (0..25).collect::<HashSet<u64>>());
	}

	#[tokio::test]
	async fn test_zero_page_size_is_rejected() {
		let (_, repository) = setup();
		let err = repository
			.find_all(FindAllPage { size: 0, cursor: 0 })
			.await
			.unwrap_err();
		assert!(matches!(err, RepositoryError::InvalidPage(_)));
	}

	#[tokio::test]
	async fn test_corrupt_record_fails_reads() {
		let (store, repository) = setup();
		repository.insert(&order(1)).await.unwrap();

		let mut txn = store.transaction();
		txn.set("order:2", b"{not json".to_vec(), SetCondition::Always)
			.sadd("orders", "order:2");
		txn.commit().await.unwrap();

		assert!(matches!(
			repository.find_by_id(2).await,
			Err(RepositoryError::Decode { ref key, .. }) if key == "order:2"
		));
		assert!(matches!(
			repository
				.find_all(FindAllPage { size: 10, cursor: 0 })
				.await,
			Err(RepositoryError::Decode { .. })
		));
	}

	#[tokio::test]
	async fn test_page_skips_record_missing_at_fetch() {
		let (store, repository) = setup();
		repository.insert(&order(1)).await.unwrap();

		// Index entry without a record, as seen mid-way through a concurrent delete.
		let mut txn = store.transaction();
		txn.sadd("orders", "order:2");
		txn.commit().await.unwrap();

		let page = repository
			.find_all(FindAllPage { size: 10, cursor: 0 })
			.await
			.unwrap();
		assert_eq!(page.orders, vec![order(1)]);
	}

	/// Failure injected by [`FaultyStore`].
	#[derive(Clone, Copy)]
	enum Fault {
		ExecAborted,
		ExecRejected,
		ConnectionLost,
	}

	/// Memory store whose transactions and reads can be made to fail.
	struct FaultyStore {
		inner: MemoryStore,
		fault: Fault,
	}

	impl FaultyStore {
		fn repository(fault: Fault) -> OrderRepository {
			let store = FaultyStore {
				inner: MemoryStore::new(),
				fault,
			};
			OrderRepository::new(Arc::new(StoreService::new(Box::new(store))))
		}

		fn read_fault(&self) -> Result<(), StoreError> {
			match self.fault {
				Fault::ConnectionLost => Err(StoreError::Connection("connection reset".into())),
				_ => Ok(()),
			}
		}
	}

	#[async_trait]
	impl StoreInterface for FaultyStore {
		async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
			self.read_fault()?;
			self.inner.get(key).await
		}

		async fn set(
			&self,
			key: &str,
			value: Vec<u8>,
			condition: SetCondition,
		) -> Result<bool, StoreError> {
			self.read_fault()?;
			self.inner.set(key, value, condition).await
		}

		async fn del(&self, key: &str) -> Result<bool, StoreError> {
			self.inner.del(key).await
		}

		async fn exists(&self, key: &str) -> Result<bool, StoreError> {
			self.inner.exists(key).await
		}

		async fn sadd(&self, set: &str, member: &str) -> Result<bool, StoreError> {
			self.inner.sadd(set, member).await
		}

		async fn srem(&self, set: &str, member: &str) -> Result<bool, StoreError> {
			self.inner.srem(set, member).await
		}

		async fn sismember(&self, set: &str, member: &str) -> Result<bool, StoreError> {
			self.inner.sismember(set, member).await
		}

		async fn sscan(
			&self,
			set: &str,
			cursor: u64,
			pattern: &str,
			count: u64,
		) -> Result<ScanPage, StoreError> {
			self.read_fault()?;
			self.inner.sscan(set, cursor, pattern, count).await
		}

		async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
			self.inner.mget(keys).await
		}

		async fn exec(&self, _transaction: Transaction) -> Result<TransactionOutcome, StoreError> {
			match self.fault {
				Fault::ExecAborted => Ok(TransactionOutcome::Aborted),
				Fault::ExecRejected => Err(StoreError::Command("EXECABORT".into())),
				Fault::ConnectionLost => Err(StoreError::Connection("broken pipe".into())),
			}
		}

		async fn ping(&self) -> Result<(), StoreError> {
			self.read_fault()
		}

		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			self.inner.config_schema()
		}
	}

	#[tokio::test]
	async fn test_aborted_commit_is_reported() {
		let repository = FaultyStore::repository(Fault::ExecAborted);

		let err = repository.insert(&order(1)).await.unwrap_err();
		assert!(matches!(
			err,
			RepositoryError::TransactionFailed {
				operation: "insert",
				..
			}
		));

		let err = repository.delete_by_id(1).await.unwrap_err();
		assert!(matches!(
			err,
			RepositoryError::TransactionFailed {
				operation: "delete_by_id",
				..
			}
		));
	}

	#[tokio::test]
	async fn test_rejected_commit_is_reported() {
		let repository = FaultyStore::repository(Fault::ExecRejected);
		let err = repository.insert(&order(1)).await.unwrap_err();
		assert!(matches!(err, RepositoryError::TransactionFailed { ref reason, .. } if reason.contains("EXECABORT")));
	}

	#[tokio::test]
	async fn test_connection_loss_is_store_unavailable() {
		let repository = FaultyStore::repository(Fault::ConnectionLost);

		for err in [
			repository.insert(&order(1)).await.unwrap_err(),
			repository.find_by_id(1).await.unwrap_err(),
			repository.update(&order(1)).await.unwrap_err(),
			repository.delete_by_id(1).await.unwrap_err(),
			repository
				.find_all(FindAllPage { size: 5, cursor: 0 })
				.await
				.unwrap_err(),
		] {
			match err {
				RepositoryError::StoreUnavailable { source, .. } => {
					assert!(matches!(source, StoreError::Connection(_)));
				},
				other => panic!("expected StoreUnavailable, got {other}"),
			}
		}
	}

	// Repository scenarios against a live server, run with
	// `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.

	fn redis_repository() -> OrderRepository {
		let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
		let backend = RedisStore::new(&url).unwrap();
		OrderRepository::new(Arc::new(StoreService::new(Box::new(backend))))
	}

	fn fresh_id() -> u64 {
		Uuid::new_v4().as_u64_pair().0
	}

	#[tokio::test]
	#[ignore = "requires a redis server at REDIS_URL"]
	async fn test_redis_double_insert_is_rejected() {
		let repository = redis_repository();
		let id = fresh_id();
		let first = order(id);
		let mut second = order(id);
		second.line_items.clear();

		repository.insert(&first).await.unwrap();
		let err = repository.insert(&second).await.unwrap_err();
		assert!(matches!(err, RepositoryError::AlreadyExists { .. }));
		assert_eq!(repository.find_by_id(id).await.unwrap(), first);

		repository.delete_by_id(id).await.unwrap();
	}

	#[tokio::test]
	#[ignore = "requires a redis server at REDIS_URL"]
	async fn test_redis_delete_and_update_of_missing_order() {
		let repository = redis_repository();
		let id = fresh_id();

		assert!(repository.delete_by_id(id).await.unwrap_err().is_not_found());
		assert!(repository.update(&order(id)).await.unwrap_err().is_not_found());
		assert!(repository.find_by_id(id).await.unwrap_err().is_not_found());

		repository.insert(&order(id)).await.unwrap();
		repository.delete_by_id(id).await.unwrap();
		assert!(repository.delete_by_id(id).await.unwrap_err().is_not_found());
	}

	#[tokio::test]
	#[ignore = "requires a redis server at REDIS_URL"]
	async fn test_redis_pagination_reaches_every_order() {
		let repository = redis_repository();
		let ids: HashSet<u64> = (0..25).map(|_| fresh_id()).collect();
		for id in &ids {
			repository.insert(&order(*id)).await.unwrap();
		}

		// The index may hold orders from other runs, so only check inclusion
		let mut collected = HashSet::new();
		let mut cursor = 0;
		loop {
			let page = repository
				.find_all(FindAllPage { size: 7, cursor })
				.await
				.unwrap();
			collected.extend(page.orders.into_iter().map(|o| o.order_id));
			cursor = page.cursor;
			if cursor == 0 {
				break;
			}
		}
		assert!(ids.is_subset(&collected));

		for id in &ids {
			repository.delete_by_id(*id).await.unwrap();
		}
	}
}
