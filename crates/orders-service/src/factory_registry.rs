//! Dynamic factory registry for store implementations.
//!
//! This module collects every store backend the storage crate exports,
//! allowing the backend to be chosen by name in the configuration.

use orders_config::Config;
use orders_storage::{StoreError, StoreFactory, StoreService};
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors that can occur while wiring the store from configuration.
#[derive(Debug, Error)]
pub enum BuildError {
	#[error("Unknown storage implementation '{name}'. Available: [{available}]")]
	UnknownImplementation { name: String, available: String },
	#[error("Primary storage '{0}' has no configuration")]
	MissingPrimary(String),
	#[error("Invalid configuration for storage '{name}': {message}")]
	InvalidConfig { name: String, message: String },
	#[error("Failed to create storage '{name}': {source}")]
	Store {
		name: String,
		#[source]
		source: StoreError,
	},
}

/// Registry of store factories keyed by implementation name.
pub struct FactoryRegistry {
	pub storage: HashMap<String, StoreFactory>,
}

impl FactoryRegistry {
	pub fn new() -> Self {
		Self {
			storage: HashMap::new(),
		}
	}

	/// Register a storage implementation
	pub fn register_storage(&mut self, name: impl Into<String>, factory: StoreFactory) {
		self.storage.insert(name.into(), factory);
	}

	fn available(&self) -> String {
		let mut names: Vec<_> = self.storage.keys().cloned().collect();
		names.sort();
		names.join(", ")
	}
}

impl Default for FactoryRegistry {
	fn default() -> Self {
		Self::new()
	}
}

static REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();

/// Get the global factory registry, populating it on first use.
pub fn get_registry() -> &'static FactoryRegistry {
	REGISTRY.get_or_init(|| {
		let mut registry = FactoryRegistry::new();
		for (name, factory) in orders_storage::get_all_implementations() {
			tracing::debug!("Registering storage implementation: {}", name);
			registry.register_storage(name, factory);
		}
		registry
	})
}

/// Builds the store service named by `storage.primary`.
///
/// Every configured implementation must be known to the registry, even
/// those not selected, so that typos surface at startup.
pub fn build_store_from_config(config: &Config) -> Result<StoreService, BuildError> {
	build_store(get_registry(), config)
}

fn build_store(registry: &FactoryRegistry, config: &Config) -> Result<StoreService, BuildError> {
	for name in config.storage.implementations.keys() {
		if !registry.storage.contains_key(name) {
			return Err(BuildError::UnknownImplementation {
				name: name.clone(),
				available: registry.available(),
			});
		}
	}

	let name = &config.storage.primary;
	let factory =
		registry
			.storage
			.get(name)
			.ok_or_else(|| BuildError::UnknownImplementation {
				name: name.clone(),
				available: registry.available(),
			})?;
	let implementation_config = config
		.storage
		.primary_config()
		.ok_or_else(|| BuildError::MissingPrimary(name.clone()))?;

	let backend = factory(implementation_config).map_err(|source| match source {
		StoreError::Configuration(message) => BuildError::InvalidConfig {
			name: name.clone(),
			message,
		},
		source => BuildError::Store {
			name: name.clone(),
			source,
		},
	})?;

	// Validate the configuration using the implementation's schema
	backend
		.config_schema()
		.validate(implementation_config)
		.map_err(|e| BuildError::InvalidConfig {
			name: name.clone(),
			message: e.to_string(),
		})?;

	tracing::info!(component = "storage", implementation = %name, "Loaded");
	Ok(StoreService::new(backend))
}
