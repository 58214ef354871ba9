//! Storage module for the relay.
//!
//! Provides the key-value abstraction the dedup cache and the submission
//! record store are built on. Backends only deal in raw bytes with an
//! optional time-to-live; [`StorageService`] layers typed values, sets and
//! hashes on top of them.

use async_trait::async_trait;
use relay_types::ConfigSchema;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Not found")]
	NotFound,
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("Backend error: {0}")]
	Backend(String),
}

/// Low-level interface every storage backend implements.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Retrieves raw bytes for the given key. Expired keys are `NotFound`.
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Stores raw bytes with optional time-to-live.
	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError>;

	/// Deletes the value associated with the given key. Missing keys are ok.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	/// Lists live keys starting with `prefix`.
	async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

fn key_of(namespace: &str, id: &str) -> String {
	format!("{}:{}", namespace, id)
}

fn encode<T: Serialize>(data: &T) -> Result<Vec<u8>, StorageError> {
	serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
	serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Typed storage on top of a [`StorageInterface`] backend.
///
/// Values are addressed by `namespace:id` and serialized as JSON. Sets and
/// hashes are stored as a single JSON document per key; their
/// read-modify-write updates are serialized through an internal lock so
/// concurrent callers never lose each other's members.
pub struct StorageService {
	backend: Box<dyn StorageInterface>,
	write_lock: Mutex<()>,
}

impl StorageService {
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self {
			backend,
			write_lock: Mutex::new(()),
		}
	}

	pub async fn store_with_ttl<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		self.backend
			.set_bytes(&key_of(namespace, id), encode(data)?, ttl)
			.await
	}

	pub async fn store<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		self.store_with_ttl(namespace, id, data, None).await
	}

	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let bytes = self.backend.get_bytes(&key_of(namespace, id)).await?;
		decode(&bytes)
	}

	/// Like [`retrieve`](Self::retrieve) but maps `NotFound` to `None`.
	pub async fn retrieve_optional<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<Option<T>, StorageError> {
		match self.retrieve(namespace, id).await {
			Ok(value) => Ok(Some(value)),
			Err(StorageError::NotFound) => Ok(None),
			Err(e) => Err(e),
		}
	}

	pub async fn remove(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		self.backend.delete(&key_of(namespace, id)).await
	}

	pub async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
		self.backend.exists(&key_of(namespace, id)).await
	}

	/// Ids of every live key in `namespace`.
	pub async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
		let prefix = format!("{}:", namespace);
		let keys = self.backend.keys(&prefix).await?;
		Ok(keys
			.into_iter()
			.filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
			.collect())
	}

	/// Adds members to a set, refreshing its time-to-live.
	pub async fn set_add(
		&self,
		namespace: &str,
		id: &str,
		members: &[String],
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let _guard = self.write_lock.lock().await;
		let mut set: BTreeSet<String> = self.retrieve_optional(namespace, id).await?.unwrap_or_default();
		set.extend(members.iter().cloned());
		self.store_with_ttl(namespace, id, &set, ttl).await
	}

	pub async fn set_members(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<BTreeSet<String>, StorageError> {
		Ok(self.retrieve_optional(namespace, id).await?.unwrap_or_default())
	}

	/// Number of members in a set, zero when the set does not exist.
	pub async fn set_card(&self, namespace: &str, id: &str) -> Result<usize, StorageError> {
		Ok(self.set_members(namespace, id).await?.len())
	}

	/// Removes a member; an emptied set is deleted.
	pub async fn set_remove(
		&self,
		namespace: &str,
		id: &str,
		member: &str,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let _guard = self.write_lock.lock().await;
		let Some(mut set) = self
			.retrieve_optional::<BTreeSet<String>>(namespace, id)
			.await?
		else {
			return Ok(());
		};
		set.remove(member);
		if set.is_empty() {
			self.remove(namespace, id).await
		} else {
			self.store_with_ttl(namespace, id, &set, ttl).await
		}
	}

	/// Sets one field of a hash, refreshing its time-to-live.
	pub async fn hash_set<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		field: &str,
		value: &T,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let _guard = self.write_lock.lock().await;
		let mut hash: BTreeMap<String, serde_json::Value> =
			self.retrieve_optional(namespace, id).await?.unwrap_or_default();
		let value =
			serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
		hash.insert(field.to_string(), value);
		self.store_with_ttl(namespace, id, &hash, ttl).await
	}

	/// All fields of a hash, empty when the hash does not exist.
	pub async fn hash_values<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<BTreeMap<String, T>, StorageError> {
		let hash: BTreeMap<String, serde_json::Value> =
			self.retrieve_optional(namespace, id).await?.unwrap_or_default();
		hash.into_iter()
			.map(|(field, value)| {
				serde_json::from_value(value)
					.map(|v| (field, v))
					.map_err(|e| StorageError::Serialization(e.to_string()))
			})
			.collect()
	}

	/// Removes a field; an emptied hash is deleted.
	pub async fn hash_del(
		&self,
		namespace: &str,
		id: &str,
		field: &str,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let _guard = self.write_lock.lock().await;
		let Some(mut hash) = self
			.retrieve_optional::<BTreeMap<String, serde_json::Value>>(namespace, id)
			.await?
		else {
			return Ok(());
		};
		hash.remove(field);
		if hash.is_empty() {
			self.remove(namespace, id).await
		} else {
			self.store_with_ttl(namespace, id, &hash, ttl).await
		}
	}
}
