//! Order entity persisted by the repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A customer order.
///
/// The `order_id` is chosen by the caller and never changes once the order
/// has been inserted. Lifecycle timestamps are optional: an absent
/// `shipped_at` means the order has not shipped yet, and absent values are
/// omitted from the encoded record rather than written as a zero date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
	/// Caller-assigned identifier, also the suffix of the primary key.
	pub order_id: u64,
	/// Customer that placed the order.
	pub customer_id: Uuid,
	/// Items in the order, in the order they were added.
	#[serde(default)]
	pub line_items: Vec<LineItem>,
	/// When the order was created. Stored as `create_at` for compatibility
	/// with records written by earlier versions of the service.
	#[serde(
		rename = "create_at",
		alias = "created_at",
		default,
		skip_serializing_if = "Option::is_none"
	)]
	pub created_at: Option<DateTime<Utc>>,
	/// When the order shipped.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub shipped_at: Option<DateTime<Utc>>,
	/// When the order was completed.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<DateTime<Utc>>,
}

impl Order {
	/// Creates an order with no lifecycle timestamps set.
	pub fn new(order_id: u64, customer_id: Uuid, line_items: Vec<LineItem>) -> Self {
		Self {
			order_id,
			customer_id,
			line_items,
			created_at: None,
			shipped_at: None,
			completed_at: None,
		}
	}

	/// Total price of all line items in minor currency units.
	///
	/// Returns `None` if the total overflows.
	pub fn total(&self) -> Option<u64> {
		self.line_items.iter().try_fold(0u64, |acc, item| {
			item.quantity
				.checked_mul(item.price)
				.and_then(|line| acc.checked_add(line))
		})
	}
}

/// A single line of an order. Has no identity beyond its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
	pub item_id: Uuid,
	pub quantity: u64,
	/// Unit price in minor currency units.
	pub price: u64,
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	fn sample_order() -> Order {
		Order::new(
			42,
			Uuid::parse_str("6f1c1e52-4d0b-4c9e-9a52-3f1f0d6b2a11").unwrap(),
			vec![
				LineItem {
					item_id: Uuid::parse_str("0b7a3f5e-9a1d-4f07-8f4e-bb2d1c7f3e01").unwrap(),
					quantity: 2,
					price: 1500,
				},
				LineItem {
					item_id: Uuid::parse_str("0b7a3f5e-9a1d-4f07-8f4e-bb2d1c7f3e01").unwrap(),
					quantity: 1,
					price: 250,
				},
			],
		)
	}

	#[test]
	fn test_absent_timestamps_are_omitted() {
		let order = sample_order();
		let json = serde_json::to_value(&order).unwrap();
		let object = json.as_object().unwrap();

		assert!(!object.contains_key("create_at"));
		assert!(!object.contains_key("shipped_at"));
		assert!(!object.contains_key("completed_at"));
		assert_eq!(object["order_id"], 42);
		assert_eq!(object["line_items"].as_array().unwrap().len(), 2);
	}

	#[test]
	fn test_null_timestamps_decode_as_absent() {
		let json = r#"{
			"order_id": 7,
			"customer_id": "6f1c1e52-4d0b-4c9e-9a52-3f1f0d6b2a11",
			"line_items": [],
			"create_at": "2024-03-01T10:00:00Z",
			"shipped_at": null,
			"completed_at": null
		}"#;

		let order: Order = serde_json::from_str(json).unwrap();
		assert_eq!(order.order_id, 7);
		assert_eq!(
			order.created_at,
			Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap())
		);
		assert_eq!(order.shipped_at, None);
		assert_eq!(order.completed_at, None);
	}

	#[test]
	fn test_created_at_alias_is_accepted() {
		let json = r#"{
			"order_id": 8,
			"customer_id": "6f1c1e52-4d0b-4c9e-9a52-3f1f0d6b2a11",
			"created_at": "2024-03-01T10:00:00Z"
		}"#;

		let order: Order = serde_json::from_str(json).unwrap();
		assert!(order.created_at.is_some());
		assert!(order.line_items.is_empty());
	}

	#[test]
	fn test_timestamps_survive_encoding() {
		let mut order = sample_order();
		order.created_at = Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
		order.shipped_at = Some(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());

		let bytes = serde_json::to_vec(&order).unwrap();
		let decoded: Order = serde_json::from_slice(&bytes).unwrap();

		assert_eq!(decoded, order);
		assert!(decoded.completed_at.is_none());
	}

	#[test]
	fn test_total() {
		assert_eq!(sample_order().total(), Some(3250));

		let mut order = sample_order();
		order.line_items[0].quantity = u64::MAX;
		assert_eq!(order.total(), None);
	}
}
