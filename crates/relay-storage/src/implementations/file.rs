//! File-based storage backend.
//!
//! One file per key under a base directory. Each file starts with an 8-byte
//! big-endian expiry (unix seconds, zero for none) followed by the value.
//! Writes go to a temp file that is renamed into place.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use relay_types::{ConfigSchema, Field, FieldType, Schema, ValidationError};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;

const HEADER_LEN: usize = 8;
const EXTENSION: &str = "bin";

pub struct FileStorage {
	base_path: PathBuf,
}

impl FileStorage {
	pub fn new(base_path: PathBuf) -> Self {
		Self { base_path }
	}

	/// Maps a key to a filesystem-safe file name. The mapping is reversible
	/// so keys can be listed back from the directory.
	fn get_file_path(&self, key: &str) -> PathBuf {
		let safe_key = key.replace('/', "%").replace(':', "@");
		self.base_path.join(format!("{}.{}", safe_key, EXTENSION))
	}

	fn key_from_file_name(name: &str) -> Option<String> {
		let stem = name.strip_suffix(&format!(".{}", EXTENSION))?;
		Some(stem.replace('@', ":").replace('%', "/"))
	}

	async fn read_live(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
		let path = self.get_file_path(key);
		let data = match fs::read(&path).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};
		if data.len() < HEADER_LEN {
			return Err(StorageError::Backend(format!("corrupt entry for {}", key)));
		}

		let mut header = [0u8; HEADER_LEN];
		header.copy_from_slice(&data[..HEADER_LEN]);
		let expires_at = u64::from_be_bytes(header);
		if expires_at != 0 && expires_at <= unix_now() {
			tracing::debug!(key = %key, "Dropping expired entry");
			let _ = fs::remove_file(&path).await;
			return Ok(None);
		}
		Ok(Some(data[HEADER_LEN..].to_vec()))
	}
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or_default()
}

pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(vec![], vec![Field::new("storage_path", FieldType::String)]);
		schema.validate(config)
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}

	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		self.read_live(key).await?.ok_or(StorageError::NotFound)
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let path = self.get_file_path(key);

		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| StorageError::Backend(e.to_string()))?;
		}

		let expires_at = ttl.map_or(0, |ttl| unix_now() + ttl.as_secs().max(1));
		let mut contents = Vec::with_capacity(HEADER_LEN + value.len());
		contents.extend_from_slice(&expires_at.to_be_bytes());
		contents.extend_from_slice(&value);

		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, contents)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		match fs::remove_file(self.get_file_path(key)).await {
			Ok(_) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		Ok(self.read_live(key).await?.is_some())
	}

	async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		let mut dir = match fs::read_dir(&self.base_path).await {
			Ok(dir) => dir,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let mut keys = Vec::new();
		while let Some(entry) = dir
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			let name = entry.file_name();
			let Some(key) = name.to_str().and_then(Self::key_from_file_name) else {
				continue;
			};
			if key.starts_with(prefix) && self.read_live(&key).await?.is_some() {
				keys.push(key);
			}
		}
		Ok(keys)
	}
}

/// Factory function to create a file backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: Base directory for file storage (default: "./data/storage")
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Backend(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage");

	Ok(Box::new(FileStorage::new(PathBuf::from(storage_path))))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn test_roundtrip_and_keys() {
		let dir = TempDir::new().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		storage
			.set_bytes("matcher_ringhash:0xab", b"one".to_vec(), None)
			.await
			.unwrap();
		storage
			.set_bytes("other:1", b"two".to_vec(), None)
			.await
			.unwrap();

		assert_eq!(
			storage.get_bytes("matcher_ringhash:0xab").await.unwrap(),
			b"one".to_vec()
		);
		assert_eq!(
			storage.keys("matcher_ringhash:").await.unwrap(),
			vec!["matcher_ringhash:0xab".to_string()]
		);

		storage.delete("matcher_ringhash:0xab").await.unwrap();
		assert!(!storage.exists("matcher_ringhash:0xab").await.unwrap());
		// Deleting twice is fine
		storage.delete("matcher_ringhash:0xab").await.unwrap();
	}

	#[tokio::test]
	async fn test_expired_entry_is_gone() {
		let dir = TempDir::new().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		// Write an entry whose expiry is already in the past
		let path = storage.get_file_path("k");
		let mut contents = 1u64.to_be_bytes().to_vec();
		contents.extend_from_slice(b"stale");
		tokio::fs::write(&path, contents).await.unwrap();

		assert!(matches!(
			storage.get_bytes("k").await,
			Err(StorageError::NotFound)
		));
		assert!(!path.exists());
	}

	#[test]
	fn test_factory_default_path() {
		let config = toml::Value::Table(toml::map::Map::new());
		assert!(create_storage(&config).is_ok());
	}
}
