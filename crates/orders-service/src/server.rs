//! HTTP server for the orders API.
//!
//! This module wires the order handlers into a router, attaches the shared
//! middleware, and runs the server until the process is interrupted.

use crate::apis::order;
use axum::{extract::State, response::Json, routing::get, Router};
use orders_config::ApiConfig;
use orders_core::OrderRepository;
use orders_storage::StoreService;
use orders_types::APIError;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	/// Repository backing every order endpoint.
	pub repository: Arc<OrderRepository>,
	/// Store handle, used by the health check.
	pub store: Arc<StoreService>,
	pub default_page_size: u64,
	pub max_page_size: u64,
}

impl AppState {
	pub fn new(store: Arc<StoreService>, api_config: &ApiConfig) -> Self {
		Self {
			repository: Arc::new(OrderRepository::new(Arc::clone(&store))),
			store,
			default_page_size: api_config.default_page_size,
			max_page_size: api_config.max_page_size,
		}
	}
}

/// Builds the router with every order route and the shared middleware.
pub fn build_router(state: AppState) -> Router {
	Router::new()
		.route("/", get(handle_health))
		.route(
			"/orders",
			get(order::list_orders).post(order::create_order),
		)
		.route(
			"/orders/{id}",
			get(order::get_order)
				.put(order::update_order)
				.delete(order::delete_order),
		)
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(CorsLayer::permissive()),
		)
		.with_state(state)
}

/// Starts the HTTP server for the API.
///
/// Serves until Ctrl+C, then stops accepting connections and lets
/// in-flight requests finish.
pub async fn start_server(
	api_config: ApiConfig,
	store: Arc<StoreService>,
) -> Result<(), Box<dyn std::error::Error>> {
	let app = build_router(AppState::new(store, &api_config));

	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;

	tracing::info!("Orders API server starting on {}", bind_address);

	axum::serve(listener, app)
		.with_graceful_shutdown(async {
			if let Err(e) = tokio::signal::ctrl_c().await {
				tracing::warn!("Failed to listen for shutdown signal: {}", e);
			}
			tracing::info!("Shutting down API server");
		})
		.await?;

	Ok(())
}

/// Handles GET / requests.
///
/// Reports healthy only while the store answers a ping.
async fn handle_health(State(state): State<AppState>) -> Result<Json<Value>, APIError> {
	match state.store.ping().await {
		Ok(()) => Ok(Json(json!({ "status": "ok" }))),
		Err(e) => {
			tracing::warn!("Health check failed: {}", e);
			Err(APIError::ServiceUnavailable {
				error_type: "STORE_UNAVAILABLE".to_string(),
				message: e.to_string(),
				retry_after: None,
			})
		},
	}
}
