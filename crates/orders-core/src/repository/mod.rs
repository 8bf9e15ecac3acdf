//! Repositories over the key-value store.

mod order;

pub use order::{FindAllPage, FindResult, OrderRepository};
