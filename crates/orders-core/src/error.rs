//! Errors returned by the order repository.

use orders_storage::StoreError;
use thiserror::Error;

/// Errors that can occur during repository operations.
///
/// Every variant carries the key it concerns, and store failures also carry
/// the operation, so a caller can report the failure without consulting logs.
#[derive(Debug, Error)]
pub enum RepositoryError {
	/// The order does not exist.
	#[error("Order not found: {key}")]
	NotFound { key: String },
	/// An insert targeted a key that is already taken.
	#[error("Order already exists: {key}")]
	AlreadyExists { key: String },
	#[error("Failed to encode order {key}: {source}")]
	Encode {
		key: String,
		#[source]
		source: serde_json::Error,
	},
	/// A stored record could not be decoded.
	#[error("Failed to decode order {key}: {source}")]
	Decode {
		key: String,
		#[source]
		source: serde_json::Error,
	},
	/// The store could not be reached or answered unexpectedly.
	#[error("Store unavailable during {operation} of {key}: {source}")]
	StoreUnavailable {
		operation: &'static str,
		key: String,
		#[source]
		source: StoreError,
	},
	/// A transaction was rejected or aborted at commit time.
	#[error("Transaction for {operation} of {key} failed: {reason}")]
	TransactionFailed {
		operation: &'static str,
		key: String,
		reason: String,
	},
	#[error("Invalid page request: {0}")]
	InvalidPage(String),
}

impl RepositoryError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, RepositoryError::NotFound { .. })
	}

	pub(crate) fn unavailable(operation: &'static str, key: &str, source: StoreError) -> Self {
		RepositoryError::StoreUnavailable {
			operation,
			key: key.to_string(),
			source,
		}
	}

	/// Classifies a commit failure: lost connections make the store
	/// unavailable, anything else means the transaction itself failed.
	pub(crate) fn commit_failed(operation: &'static str, key: &str, source: StoreError) -> Self {
		match source {
			StoreError::Connection(_) => Self::unavailable(operation, key, source),
			other => RepositoryError::TransactionFailed {
				operation,
				key: key.to_string(),
				reason: other.to_string(),
			},
		}
	}
}
