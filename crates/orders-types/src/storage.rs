//! Storage-related types for the orders service.
//!
//! Key names are part of the on-disk contract: records written by any
//! earlier deployment use exactly these strings.

/// Storage keys for the persisted collections.
///
/// This enum provides type safety for storage operations by replacing
/// string literals with strongly typed variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Namespace of primary order records (`order:<id>`).
	Order,
	/// Set holding the primary key of every stored order.
	OrderIndex,
}

impl StorageKey {
	/// Returns the string representation of the storage key.
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::Order => "order",
			StorageKey::OrderIndex => "orders",
		}
	}
}

/// Builds the primary key for an order, e.g. `order:42`.
pub fn order_key(order_id: u64) -> String {
	format!("{}:{}", StorageKey::Order.as_str(), order_id)
}
