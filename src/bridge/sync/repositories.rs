use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Errors raised by a backing store driver
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("Write rejected: {0}")]
	Rejected(String),
}

/// Keyed record storage, one payload per (table, key)
///
/// Each call is atomic for its record; nothing is transactional across records.
#[async_trait::async_trait]
pub trait BackingStore: Send + Sync {
	async fn exists(&self, table: &str, key: &str) -> Result<bool, StoreError>;
	async fn write(&self, table: &str, key: &str, payload: &str) -> Result<(), StoreError>;
	async fn read(&self, table: &str, key: &str) -> Result<Option<String>, StoreError>;
	/// Remove a record, returning whether it existed
	async fn delete(&self, table: &str, key: &str) -> Result<bool, StoreError>;

	/// Largest payload a field of `table` holds, if bounded
	fn field_capacity(&self, _table: &str) -> Option<usize> {
		None
	}
}

/// In-memory store
///
/// With a capacity limit, oversized payloads are cut to fit instead of rejected, the way a
/// non-strict SQL text column behaves.
#[derive(Default)]
pub struct MemoryStore {
	tables: Mutex<HashMap<String, HashMap<String, String>>>,
	capacity: Option<usize>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_capacity_limit(capacity: usize) -> Self {
		Self {
			tables: Mutex::new(HashMap::new()),
			capacity: Some(capacity),
		}
	}

	/// Number of records in `table`
	pub fn record_count(&self, table: &str) -> usize {
		self.tables.lock().get(table).map(HashMap::len).unwrap_or(0)
	}
}

#[async_trait::async_trait]
impl BackingStore for MemoryStore {
	async fn exists(&self, table: &str, key: &str) -> Result<bool, StoreError> {
		Ok(self
			.tables
			.lock()
			.get(table)
			.is_some_and(|records| records.contains_key(key)))
	}

	async fn write(&self, table: &str, key: &str, payload: &str) -> Result<(), StoreError> {
		let stored = match self.capacity {
			Some(capacity) if payload.len() > capacity => {
				let mut end = capacity;
				while !payload.is_char_boundary(end) {
					end -= 1;
				}
				payload[..end].to_string()
			}
			_ => payload.to_string(),
		};
		self.tables
			.lock()
			.entry(table.to_string())
			.or_default()
			.insert(key.to_string(), stored);
		Ok(())
	}

	async fn read(&self, table: &str, key: &str) -> Result<Option<String>, StoreError> {
		Ok(self
			.tables
			.lock()
			.get(table)
			.and_then(|records| records.get(key).cloned()))
	}

	async fn delete(&self, table: &str, key: &str) -> Result<bool, StoreError> {
		Ok(self
			.tables
			.lock()
			.get_mut(table)
			.is_some_and(|records| records.remove(key).is_some()))
	}

	fn field_capacity(&self, _table: &str) -> Option<usize> {
		self.capacity
	}
}

/// On-disk record envelope
#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
	payload: String,
	updated_at: String,
}

/// File-based store: one JSON file per record under `data_dir/<table>/<key>.json`
pub struct FileStore {
	data_dir: PathBuf,
}

impl FileStore {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn record_path(&self, table: &str, key: &str) -> Result<PathBuf, StoreError> {
		for part in [table, key] {
			if part.is_empty() || part.contains(['/', '\\']) || part.starts_with('.') {
				return Err(StoreError::Rejected(format!(
					"invalid table or key name: {:?}",
					part
				)));
			}
		}
		Ok(self.data_dir.join(table).join(format!("{}.json", key)))
	}

	async fn ensure_dir(path: &Path) -> Result<(), StoreError> {
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl BackingStore for FileStore {
	async fn exists(&self, table: &str, key: &str) -> Result<bool, StoreError> {
		let path = self.record_path(table, key)?;
		Ok(tokio::fs::try_exists(&path).await?)
	}

	async fn write(&self, table: &str, key: &str, payload: &str) -> Result<(), StoreError> {
		let path = self.record_path(table, key)?;
		Self::ensure_dir(&path).await?;

		let record = FileRecord {
			payload: payload.to_string(),
			updated_at: chrono::Utc::now().to_rfc3339(),
		};
		let content = serde_json::to_string(&record)?;

		// Write-then-rename keeps the previous record intact if the write is cut short
		let tmp_path = path.with_extension("json.tmp");
		tokio::fs::write(&tmp_path, content).await?;
		tokio::fs::rename(&tmp_path, &path).await?;

		debug!("Saved record {}/{} to {:?}", table, key, path);
		Ok(())
	}

	async fn read(&self, table: &str, key: &str) -> Result<Option<String>, StoreError> {
		let path = self.record_path(table, key)?;
		let content = match tokio::fs::read_to_string(&path).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		let record: FileRecord = serde_json::from_str(&content)?;
		Ok(Some(record.payload))
	}

	async fn delete(&self, table: &str, key: &str) -> Result<bool, StoreError> {
		let path = self.record_path(table, key)?;
		match tokio::fs::remove_file(&path).await {
			Ok(()) => {
				info!("Removed record {}/{}", table, key);
				Ok(true)
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
			Err(e) => Err(e.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn memory_store_crud() {
		let store = MemoryStore::new();
		assert!(!store.exists("t", "k").await.unwrap());
		assert_eq!(store.read("t", "k").await.unwrap(), None);

		store.write("t", "k", "payload").await.unwrap();
		assert!(store.exists("t", "k").await.unwrap());
		assert_eq!(store.read("t", "k").await.unwrap().as_deref(), Some("payload"));
		assert_eq!(store.record_count("t"), 1);

		assert!(store.delete("t", "k").await.unwrap());
		assert!(!store.delete("t", "k").await.unwrap());
		assert_eq!(store.record_count("t"), 0);
	}

	#[tokio::test]
	async fn memory_store_truncates_at_capacity() {
		let store = MemoryStore::with_capacity_limit(4);
		assert_eq!(store.field_capacity("t"), Some(4));
		store.write("t", "k", "abcdefgh").await.unwrap();
		assert_eq!(store.read("t", "k").await.unwrap().as_deref(), Some("abcd"));

		// Never splits a multi-byte character
		store.write("t", "k", "aaaé").await.unwrap();
		assert_eq!(store.read("t", "k").await.unwrap().as_deref(), Some("aaa"));
	}

	#[tokio::test]
	async fn file_store_crud() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStore::new(dir.path().to_path_buf());

		assert!(!store.exists("player_data_money", "abc").await.unwrap());
		assert_eq!(store.read("player_data_money", "abc").await.unwrap(), None);

		store.write("player_data_money", "abc", "12.5").await.unwrap();
		assert!(store.exists("player_data_money", "abc").await.unwrap());
		assert_eq!(
			store.read("player_data_money", "abc").await.unwrap().as_deref(),
			Some("12.5")
		);

		store.write("player_data_money", "abc", "99").await.unwrap();
		assert_eq!(
			store.read("player_data_money", "abc").await.unwrap().as_deref(),
			Some("99")
		);

		assert!(store.delete("player_data_money", "abc").await.unwrap());
		assert!(!store.exists("player_data_money", "abc").await.unwrap());
	}

	#[tokio::test]
	async fn file_store_rejects_path_escapes() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStore::new(dir.path().to_path_buf());
		assert!(matches!(
			store.write("../outside", "k", "x").await,
			Err(StoreError::Rejected(_))
		));
		assert!(matches!(
			store.read("t", "..").await,
			Err(StoreError::Rejected(_))
		));
	}
}
