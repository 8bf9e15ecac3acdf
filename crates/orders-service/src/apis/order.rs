//! Order API handlers.
//!
//! Each handler translates an HTTP request into one or two repository calls
//! and maps [`RepositoryError`] onto the structured [`APIError`] responses.

use crate::server::AppState;
use axum::{
	extract::{
		rejection::{JsonRejection, QueryRejection},
		Path, Query, State,
	},
	http::StatusCode,
	response::Json,
};
use chrono::{DateTime, Utc};
use orders_core::{FindAllPage, RepositoryError};
use orders_types::{
	APIError, CreateOrderRequest, ListOrdersQuery, ListOrdersResponse, Order, OrderStatus,
	UpdateOrderRequest,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Attempts at drawing a fresh order id before giving up.
const MAX_ID_ATTEMPTS: usize = 3;

/// Seconds a client should wait after the store is reported unavailable.
const RETRY_AFTER_SECONDS: u64 = 1;

fn bad_request(error_type: &str, message: impl Into<String>) -> APIError {
	APIError::BadRequest {
		error_type: error_type.to_string(),
		message: message.into(),
		details: None,
	}
}

/// Maps a repository failure onto the HTTP error surface.
pub fn api_error(err: RepositoryError) -> APIError {
	match &err {
		RepositoryError::NotFound { .. } => APIError::NotFound {
			error_type: "ORDER_NOT_FOUND".to_string(),
			message: err.to_string(),
		},
		RepositoryError::AlreadyExists { .. } => bad_request("ORDER_EXISTS", err.to_string()),
		RepositoryError::InvalidPage(_) => bad_request("INVALID_PAGE", err.to_string()),
		RepositoryError::StoreUnavailable { .. } => {
			warn!("Store unavailable: {}", err);
			APIError::ServiceUnavailable {
				error_type: "STORE_UNAVAILABLE".to_string(),
				message: err.to_string(),
				retry_after: Some(RETRY_AFTER_SECONDS),
			}
		},
		RepositoryError::Encode { .. }
		| RepositoryError::Decode { .. }
		| RepositoryError::TransactionFailed { .. } => {
			warn!("Order request failed: {}", err);
			APIError::InternalServerError {
				error_type: "INTERNAL_ERROR".to_string(),
				message: err.to_string(),
			}
		},
	}
}

fn parse_order_id(id: &str) -> Result<u64, APIError> {
	id.parse().map_err(|_| {
		bad_request(
			"INVALID_ORDER_ID",
			format!("Order ID must be an unsigned integer: {}", id),
		)
	})
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, APIError> {
	body.map(|Json(value)| value)
		.map_err(|rejection| bad_request("INVALID_BODY", rejection.body_text()))
}

/// Moves an order to `status`, stamping the transition with `now`.
///
/// An order ships once and completes once, and only after it has shipped.
pub fn apply_status(
	order: &mut Order,
	status: OrderStatus,
	now: DateTime<Utc>,
) -> Result<(), APIError> {
	match status {
		OrderStatus::Shipped => {
			if order.shipped_at.is_some() {
				return Err(bad_request("INVALID_TRANSITION", "Order has already shipped"));
			}
			order.shipped_at = Some(now);
		},
		OrderStatus::Completed => {
			if order.shipped_at.is_none() {
				return Err(bad_request(
					"INVALID_TRANSITION",
					"Order cannot complete before it ships",
				));
			}
			if order.completed_at.is_some() {
				return Err(bad_request("INVALID_TRANSITION", "Order has already completed"));
			}
			order.completed_at = Some(now);
		},
	}
	Ok(())
}

/// Handles POST /orders requests.
pub async fn create_order(
	State(state): State<AppState>,
	body: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Order>), APIError> {
	let request = json_body(body)?;

	let draft = Order::new(0, request.customer_id, request.line_items);
	if draft.total().is_none() {
		return Err(bad_request(
			"INVALID_LINE_ITEMS",
			"Order total exceeds the representable amount",
		));
	}

	for _ in 0..MAX_ID_ATTEMPTS {
		let (order_id, _) = Uuid::new_v4().as_u64_pair();
		let order = Order {
			order_id,
			created_at: Some(Utc::now()),
			..draft.clone()
		};

		match state.repository.insert(&order).await {
			Ok(()) => {
				info!(order_id, "Created order");
				return Ok((StatusCode::CREATED, Json(order)));
			},
			// Collision on a random id, draw again
			Err(RepositoryError::AlreadyExists { .. }) => continue,
			Err(e) => return Err(api_error(e)),
		}
	}

	Err(APIError::InternalServerError {
		error_type: "ID_EXHAUSTED".to_string(),
		message: "Could not allocate an unused order ID".to_string(),
	})
}

/// Handles GET /orders requests.
///
/// An explicit size above the configured maximum is rejected, while the
/// default size is capped at the maximum.
pub async fn list_orders(
	State(state): State<AppState>,
	query: Result<Query<ListOrdersQuery>, QueryRejection>,
) -> Result<Json<ListOrdersResponse>, APIError> {
	let Query(query) =
		query.map_err(|rejection| bad_request("INVALID_QUERY", rejection.body_text()))?;

	let size = match query.size {
		Some(size) if size > state.max_page_size => {
			return Err(bad_request(
				"INVALID_PAGE",
				format!("Page size {} exceeds the maximum of {}", size, state.max_page_size),
			));
		},
		Some(size) => size,
		None => state.default_page_size.min(state.max_page_size),
	};

	let page = FindAllPage {
		size,
		cursor: query.cursor.unwrap_or(0),
	};
	let result = state.repository.find_all(page).await.map_err(api_error)?;

	Ok(Json(ListOrdersResponse {
		items: result.orders,
		next: result.cursor,
	}))
}

/// Handles GET /orders/{id} requests.
pub async fn get_order(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> Result<Json<Order>, APIError> {
	let order_id = parse_order_id(&id)?;
	let order = state
		.repository
		.find_by_id(order_id)
		.await
		.map_err(api_error)?;
	Ok(Json(order))
}

/// Handles PUT /orders/{id} requests.
///
/// Reads the order, applies the status transition and writes it back.
/// An order deleted in between is reported as not found.
pub async fn update_order(
	State(state): State<AppState>,
	Path(id): Path<String>,
	body: Result<Json<UpdateOrderRequest>, JsonRejection>,
) -> Result<Json<Order>, APIError> {
	let order_id = parse_order_id(&id)?;
	let request = json_body(body)?;
	let status: OrderStatus = request.status.parse()?;

	let mut order = state
		.repository
		.find_by_id(order_id)
		.await
		.map_err(api_error)?;
	// The write goes to the key named by the record, so it must match the path
	if order.order_id != order_id {
		warn!(order_id, stored_id = order.order_id, "Stored order has a mismatched id");
		return Err(APIError::InternalServerError {
			error_type: "ORDER_ID_MISMATCH".to_string(),
			message: format!(
				"Order stored under id {} carries id {}",
				order_id, order.order_id
			),
		});
	}
	apply_status(&mut order, status, Utc::now())?;
	state.repository.update(&order).await.map_err(api_error)?;

	info!(order_id, ?status, "Updated order");
	Ok(Json(order))
}

/// Handles DELETE /orders/{id} requests.
pub async fn delete_order(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> Result<StatusCode, APIError> {
	let order_id = parse_order_id(&id)?;
	state
		.repository
		.delete_by_id(order_id)
		.await
		.map_err(api_error)?;

	info!(order_id, "Deleted order");
	Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	fn order() -> Order {
		Order::new(7, Uuid::from_u128(1), Vec::new())
	}

	fn at(hour: u32) -> DateTime<Utc> {
		Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
	}

	#[test]
	fn test_ship_then_complete() {
		let mut order = order();
		apply_status(&mut order, OrderStatus::Shipped, at(1)).unwrap();
		assert_eq!(order.shipped_at, Some(at(1)));

		apply_status(&mut order, OrderStatus::Completed, at(2)).unwrap();
		assert_eq!(order.completed_at, Some(at(2)));
	}

	#[test]
	fn test_invalid_transitions_rejected() {
		let mut order = order();
		let err = apply_status(&mut order, OrderStatus::Completed, at(1)).unwrap_err();
		assert_eq!(err.status_code(), 400);
		assert_eq!(order.completed_at, None);

		apply_status(&mut order, OrderStatus::Shipped, at(1)).unwrap();
		assert!(apply_status(&mut order, OrderStatus::Shipped, at(2)).is_err());
		assert_eq!(order.shipped_at, Some(at(1)));

		apply_status(&mut order, OrderStatus::Completed, at(3)).unwrap();
		assert!(apply_status(&mut order, OrderStatus::Completed, at(4)).is_err());
		assert_eq!(order.completed_at, Some(at(3)));
	}

	#[test]
	fn test_parse_order_id() {
		assert_eq!(parse_order_id("42").unwrap(), 42);
		assert_eq!(parse_order_id("18446744073709551615").unwrap(), u64::MAX);
		assert_eq!(parse_order_id("abc").unwrap_err().status_code(), 400);
		assert_eq!(parse_order_id("-1").unwrap_err().status_code(), 400);
	}

	#[test]
	fn test_error_mapping() {
		let not_found = RepositoryError::NotFound {
			key: "order:1".into(),
		};
		assert_eq!(api_error(not_found).status_code(), 404);

		let exists = RepositoryError::AlreadyExists {
			key: "order:1".into(),
		};
		assert_eq!(api_error(exists).status_code(), 400);

		let page = RepositoryError::InvalidPage("page size must be positive".into());
		assert_eq!(api_error(page).status_code(), 400);

		let unavailable = RepositoryError::StoreUnavailable {
			operation: "find_by_id",
			key: "order:1".into(),
			source: orders_storage::StoreError::Connection("refused".into()),
		};
		let err = api_error(unavailable);
		assert_eq!(err.status_code(), 503);
		assert_eq!(err.to_error_response().retry_after, Some(RETRY_AFTER_SECONDS));

		let failed = RepositoryError::TransactionFailed {
			operation: "delete_by_id",
			key: "order:1".into(),
			reason: "aborted".into(),
		};
		assert_eq!(api_error(failed).status_code(), 500);
	}
}
