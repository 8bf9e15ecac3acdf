//! Registry trait for self-registering implementations.
//!
//! Each store backend exposes a `Registry` type so the service can map the
//! name used in configuration to the factory that builds it.

/// Base trait for implementation registries.
///
/// Each backend module provides a Registry struct that implements this
/// trait, declaring its configuration name and its factory function.
pub trait ImplementationRegistry {
	/// The name used in configuration files to reference this implementation,
	/// e.g. "redis" for `storage.implementations.redis`.
	const NAME: &'static str;

	/// The factory function type this implementation provides.
	type Factory;

	/// Get the factory function for this implementation.
	fn factory() -> Self::Factory;
}
