//! Common types module for the orders service.
//!
//! This module defines the core data types shared by the storage backends,
//! the order repository and the HTTP service, so that key naming and the
//! persisted record layout live in exactly one place.

/// API types for HTTP endpoints and request/response structures.
pub mod api;
/// Order and line item entities.
pub mod order;
/// Registry trait for self-registering implementations.
pub mod registry;
/// Storage key naming for persisted orders and the order index.
pub mod storage;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;

// Re-export all types for convenient access
pub use api::*;
pub use order::*;
pub use registry::ImplementationRegistry;
pub use storage::*;
pub use validation::*;
