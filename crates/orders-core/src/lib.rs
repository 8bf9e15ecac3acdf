//! Core persistence logic for the orders service.
//!
//! This crate owns the mapping between [`orders_types::Order`] values and
//! their stored form, and the protocol that keeps each primary record and
//! the `orders` index set consistent. The store itself is injected as a
//! [`orders_storage::StoreService`], so any backend can be substituted.

pub mod error;
pub mod repository;

pub use error::RepositoryError;
pub use repository::{FindAllPage, FindResult, OrderRepository};
