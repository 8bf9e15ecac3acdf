//! Redis store backend.
//!
//! Plain commands go through a lazily established [`ConnectionManager`],
//! which multiplexes requests and reconnects on its own. Guarded
//! transactions need WATCH, which is scoped to a connection, so they run on
//! a dedicated connection that is closed once the transaction finishes.

use crate::{
	Command, ScanPage, SetCondition, StoreError, StoreFactory, StoreInterface, StoreRegistry,
	Transaction, TransactionOutcome,
};
use async_trait::async_trait;
use orders_types::{ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, ValidationError};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, RedisError, Value};
use tokio::sync::OnceCell;

/// Store backed by a Redis server.
pub struct RedisStore {
	client: Client,
	manager: OnceCell<ConnectionManager>,
}

impl RedisStore {
	/// Creates a store for the given `redis://`, `rediss://` or `unix://` URL.
	///
	/// No connection is opened until the first command.
	pub fn new(url: &str) -> Result<Self, StoreError> {
		let client = Client::open(url).map_err(|e| StoreError::Configuration(e.to_string()))?;
		Ok(Self {
			client,
			manager: OnceCell::new(),
		})
	}

	async fn connection(&self) -> Result<ConnectionManager, StoreError> {
		let manager = self
			.manager
			.get_or_try_init(|| async {
				tracing::debug!("Connecting to redis");
				ConnectionManager::new(self.client.clone()).await
			})
			.await
			.map_err(map_redis_error)?;
		Ok(manager.clone())
	}

	async fn exec_guarded(
		&self,
		transaction: &Transaction,
		pipe: &redis::Pipeline,
	) -> Result<TransactionOutcome, StoreError> {
		let mut conn = self
			.client
			.get_multiplexed_async_connection()
			.await
			.map_err(map_redis_error)?;

		let _: () = redis::cmd("WATCH")
			.arg(transaction.required())
			.query_async(&mut conn)
			.await
			.map_err(map_redis_error)?;

		for key in transaction.required() {
			let exists: i64 = match redis::cmd("EXISTS").arg(key).query_async(&mut conn).await {
				Ok(exists) => exists,
				Err(e) => {
					unwatch(&mut conn).await;
					return Err(map_redis_error(e));
				},
			};
			if exists == 0 {
				unwatch(&mut conn).await;
				return Ok(TransactionOutcome::Discarded { key: key.clone() });
			}
		}

		// EXEC clears the watch whether it commits or aborts.
		let replies: Option<Vec<Value>> =
			pipe.query_async(&mut conn).await.map_err(map_redis_error)?;
		committed(replies, transaction.commands().len())
	}
}

async fn unwatch(conn: &mut MultiplexedConnection) {
	let result: Result<(), RedisError> = redis::cmd("UNWATCH").query_async(conn).await;
	if let Err(e) = result {
		tracing::debug!("UNWATCH failed, connection will be dropped: {}", e);
	}
}

/// Classifies a client error as a connection or command failure.
fn map_redis_error(e: RedisError) -> StoreError {
	if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
	{
		StoreError::Connection(e.to_string())
	} else if e.kind() == redis::ErrorKind::TypeError {
		StoreError::Protocol(e.to_string())
	} else {
		StoreError::Command(e.to_string())
	}
}

/// Interprets a command reply as an applied/changed flag.
///
/// SET answers OK or nil, DEL/SADD/SREM/SISMEMBER answer a count.
fn reply_flag(value: &Value) -> Result<bool, StoreError> {
	match value {
		Value::Nil => Ok(false),
		Value::Okay => Ok(true),
		Value::SimpleString(s) if s == "OK" => Ok(true),
		Value::Int(n) => Ok(*n > 0),
		Value::Boolean(b) => Ok(*b),
		other => Err(StoreError::Protocol(format!(
			"unexpected reply: {:?}",
			other
		))),
	}
}

fn committed(
	replies: Option<Vec<Value>>,
	expected: usize,
) -> Result<TransactionOutcome, StoreError> {
	let Some(replies) = replies else {
		return Ok(TransactionOutcome::Aborted);
	};
	if replies.len() != expected {
		return Err(StoreError::Protocol(format!(
			"EXEC returned {} replies for {} commands",
			replies.len(),
			expected
		)));
	}
	let flags = replies.iter().map(reply_flag).collect::<Result<_, _>>()?;
	Ok(TransactionOutcome::Committed(flags))
}

fn push_command(pipe: &mut redis::Pipeline, command: &Command) {
	match command {
		Command::Set {
			key,
			value,
			condition,
		} => {
			pipe.cmd("SET").arg(key).arg(value.as_slice());
			match condition {
				SetCondition::Always => {},
				SetCondition::IfAbsent => {
					pipe.arg("NX");
				},
				SetCondition::IfExists => {
					pipe.arg("XX");
				},
			}
		},
		Command::Del { key } => {
			pipe.cmd("DEL").arg(key);
		},
		Command::SAdd { set, member } => {
			pipe.cmd("SADD").arg(set).arg(member);
		},
		Command::SRem { set, member } => {
			pipe.cmd("SREM").arg(set).arg(member);
		},
	}
}

#[async_trait]
impl StoreInterface for RedisStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		let mut conn = self.connection().await?;
		redis::cmd("GET")
			.arg(key)
			.query_async(&mut conn)
			.await
			.map_err(map_redis_error)
	}

	async fn set(
		&self,
		key: &str,
		value: Vec<u8>,
		condition: SetCondition,
	) -> Result<bool, StoreError> {
		let mut cmd = redis::cmd("SET");
		cmd.arg(key).arg(value);
		match condition {
			SetCondition::Always => {},
			SetCondition::IfAbsent => {
				cmd.arg("NX");
			},
			SetCondition::IfExists => {
				cmd.arg("XX");
			},
		}

		let mut conn = self.connection().await?;
		let reply: Value = cmd.query_async(&mut conn).await.map_err(map_redis_error)?;
		reply_flag(&reply)
	}

	async fn del(&self, key: &str) -> Result<bool, StoreError> {
		let mut conn = self.connection().await?;
		let removed: i64 = redis::cmd("DEL")
			.arg(key)
			.query_async(&mut conn)
			.await
			.map_err(map_redis_error)?;
		Ok(removed > 0)
	}

	async fn exists(&self, key: &str) -> Result<bool, StoreError> {
		let mut conn = self.connection().await?;
		let count: i64 = redis::cmd("EXISTS")
			.arg(key)
			.query_async(&mut conn)
			.await
			.map_err(map_redis_error)?;
		Ok(count > 0)
	}

	async fn sadd(&self, set: &str, member: &str) -> Result<bool, StoreError> {
		let mut conn = self.connection().await?;
		let added: i64 = redis::cmd("SADD")
			.arg(set)
			.arg(member)
			.query_async(&mut conn)
			.await
			.map_err(map_redis_error)?;
		Ok(added > 0)
	}

	async fn srem(&self, set: &str, member: &str) -> Result<bool, StoreError> {
		let mut conn = self.connection().await?;
		let removed: i64 = redis::cmd("SREM")
			.arg(set)
			.arg(member)
			.query_async(&mut conn)
			.await
			.map_err(map_redis_error)?;
		Ok(removed > 0)
	}

	async fn sismember(&self, set: &str, member: &str) -> Result<bool, StoreError> {
		let mut conn = self.connection().await?;
		let reply: Value = redis::cmd("SISMEMBER")
			.arg(set)
			.arg(member)
			.query_async(&mut conn)
			.await
			.map_err(map_redis_error)?;
		reply_flag(&reply)
	}

	async fn sscan(
		&self,
		set: &str,
		cursor: u64,
		pattern: &str,
		count: u64,
	) -> Result<ScanPage, StoreError> {
		let mut conn = self.connection().await?;
		let (cursor, members): (u64, Vec<String>) = redis::cmd("SSCAN")
			.arg(set)
			.arg(cursor)
			.arg("MATCH")
			.arg(pattern)
			.arg("COUNT")
			.arg(count)
			.query_async(&mut conn)
			.await
			.map_err(map_redis_error)?;
		Ok(ScanPage { cursor, members })
	}

	async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
		// MGET with no keys is a syntax error on the server.
		if keys.is_empty() {
			return Ok(Vec::new());
		}

		let mut conn = self.connection().await?;
		let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
			.arg(keys)
			.query_async(&mut conn)
			.await
			.map_err(map_redis_error)?;

		if values.len() != keys.len() {
			return Err(StoreError::Protocol(format!(
				"MGET returned {} values for {} keys",
				values.len(),
				keys.len()
			)));
		}
		Ok(values)
	}

	async fn exec(&self, transaction: Transaction) -> Result<TransactionOutcome, StoreError> {
		let mut pipe = redis::pipe();
		pipe.atomic();
		for command in transaction.commands() {
			push_command(&mut pipe, command);
		}

		if !transaction.required().is_empty() {
			return self.exec_guarded(&transaction, &pipe).await;
		}

		let mut conn = self.connection().await?;
		let replies: Option<Vec<Value>> =
			pipe.query_async(&mut conn).await.map_err(map_redis_error)?;
		committed(replies, transaction.commands().len())
	}

	async fn ping(&self) -> Result<(), StoreError> {
		let mut conn = self.connection().await?;
		let _: String = redis::cmd("PING")
			.query_async(&mut conn)
			.await
			.map_err(map_redis_error)?;
		Ok(())
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(RedisStoreSchema)
	}
}

/// Configuration schema for RedisStore.
pub struct RedisStoreSchema;

impl ConfigSchema for RedisStoreSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("url", FieldType::String).with_validator(|value| {
				let url = value.as_str().unwrap_or_default();
				if ["redis://", "rediss://", "unix://"]
					.iter()
					.any(|scheme| url.starts_with(scheme))
				{
					Ok(())
				} else {
					Err(format!("unsupported URL scheme in '{}'", url))
				}
			})],
			vec![],
		);
		schema.validate(config)
	}
}

/// Factory function to create a Redis store backend from configuration.
///
/// Configuration parameters:
/// - `url`: server address, e.g. `redis://127.0.0.1:6379/0`
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StoreInterface>, StoreError> {
	RedisStoreSchema
		.validate(config)
		.map_err(|e| StoreError::Configuration(e.to_string()))?;

	let url = config
		.get("url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| StoreError::Configuration("url is required".into()))?;

	Ok(Box::new(RedisStore::new(url)?))
}

/// Registry for the Redis store implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "redis";
	type Factory = StoreFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StoreRegistry for Registry {}
