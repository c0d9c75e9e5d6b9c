//! Key-value persistence with change notifications.

use std::{
	collections::HashMap,
	fmt,
	path::{Path, PathBuf},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{fs, sync::broadcast};
use tracing::{debug, trace};

use crate::error::{FileIOError, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageArea {
	Local,
	Sync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageChange {
	pub old_value: Option<Value>,
	pub new_value: Option<Value>,
}

/// A batch of changes applied to one storage area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageChanges {
	pub area: StorageArea,
	pub changes: HashMap<String, StorageChange>,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync + fmt::Debug {
	/// Values of the requested keys, absent keys are left out.
	async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>, StorageError>;

	async fn set(&self, values: HashMap<String, Value>) -> Result<(), StorageError>;

	fn subscribe(&self) -> broadcast::Receiver<StorageChanges>;
}

/// Applies `values` to `map`, returning what actually changed.
fn apply(
	map: &mut Map<String, Value>,
	values: HashMap<String, Value>,
) -> HashMap<String, StorageChange> {
	values
		.into_iter()
		.filter_map(|(key, new_value)| {
			let old_value = map.insert(key.clone(), new_value.clone());
			(old_value.as_ref() != Some(&new_value)).then(|| {
				(
					key,
					StorageChange {
						old_value,
						new_value: Some(new_value),
					},
				)
			})
		})
		.collect()
}

fn pick(map: &Map<String, Value>, keys: &[String]) -> HashMap<String, Value> {
	keys.iter()
		.filter_map(|key| map.get(key).map(|value| (key.clone(), value.clone())))
		.collect()
}

/// Volatile store, mostly useful for tests and single-process hosts.
#[derive(Debug)]
pub struct MemoryStore {
	area: StorageArea,
	values: RwLock<Map<String, Value>>,
	changes_tx: broadcast::Sender<StorageChanges>,
}

impl MemoryStore {
	pub fn new(area: StorageArea) -> Self {
		let (changes_tx, _) = broadcast::channel(64);
		Self {
			area,
			values: RwLock::new(Map::new()),
			changes_tx,
		}
	}

	/// Simulates another process writing to the same area.
	pub fn apply_external(&self, values: HashMap<String, Value>) {
		let changes = apply(&mut self.values.write(), values);
		self.publish(changes);
	}

	fn publish(&self, changes: HashMap<String, StorageChange>) {
		if !changes.is_empty() {
			let _ = self.changes_tx.send(StorageChanges {
				area: self.area,
				changes,
			});
		}
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new(StorageArea::Local)
	}
}

#[async_trait]
impl KeyValueStore for MemoryStore {
	async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>, StorageError> {
		Ok(pick(&self.values.read(), keys))
	}

	async fn set(&self, values: HashMap<String, Value>) -> Result<(), StorageError> {
		let changes = apply(&mut self.values.write(), values);
		self.publish(changes);
		Ok(())
	}

	fn subscribe(&self) -> broadcast::Receiver<StorageChanges> {
		self.changes_tx.subscribe()
	}
}

/// Store persisted as a single JSON object on disk.
///
/// Writes go through a temporary file followed by a rename so a crash never
/// leaves a truncated file behind.
#[derive(Debug)]
pub struct JsonFileStore {
	path: PathBuf,
	area: StorageArea,
	values: RwLock<Map<String, Value>>,
	write_lock: tokio::sync::Mutex<()>,
	changes_tx: broadcast::Sender<StorageChanges>,
}

impl JsonFileStore {
	pub async fn open(path: impl AsRef<Path>, area: StorageArea) -> Result<Self, StorageError> {
		let path = path.as_ref().to_path_buf();
		let values = Self::read_file(&path).await?;
		let (changes_tx, _) = broadcast::channel(64);

		debug!(path = %path.display(), keys = values.len(), "Opened storage file");

		Ok(Self {
			path,
			area,
			values: RwLock::new(values),
			write_lock: tokio::sync::Mutex::new(()),
			changes_tx,
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Re-read the file and notify subscribers about every key changed by someone else.
	pub async fn reload(&self) -> Result<(), StorageError> {
		let on_disk = Self::read_file(&self.path).await?;

		let changes = {
			let mut values = self.values.write();
			let mut changes = HashMap::new();

			for (key, old_value) in values.iter() {
				if !on_disk.contains_key(key) {
					changes.insert(
						key.clone(),
						StorageChange {
							old_value: Some(old_value.clone()),
							new_value: None,
						},
					);
				}
			}

			for (key, new_value) in &on_disk {
				let old_value = values.get(key);
				if old_value != Some(new_value) {
					changes.insert(
						key.clone(),
						StorageChange {
							old_value: old_value.cloned(),
							new_value: Some(new_value.clone()),
						},
					);
				}
			}

			*values = on_disk;
			changes
		};

		trace!(changed = changes.len(), "Reloaded storage file");

		if !changes.is_empty() {
			let _ = self.changes_tx.send(StorageChanges {
				area: self.area,
				changes,
			});
		}

		Ok(())
	}

	async fn read_file(path: &Path) -> Result<Map<String, Value>, StorageError> {
		match fs::read(path).await {
			Ok(bytes) if bytes.is_empty() => Ok(Map::new()),
			Ok(bytes) => match serde_json::from_slice(&bytes)? {
				Value::Object(map) => Ok(map),
				_ => Err(StorageError::NotAnObject(path.into())),
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
			Err(e) => Err(FileIOError::from_std_io_err_with_msg(
				path,
				e,
				"failed to read storage file",
			)
			.into()),
		}
	}

	async fn write_file(&self, contents: Vec<u8>) -> Result<(), StorageError> {
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| FileIOError::from_std_io_err(parent, e))?;
		}

		let tmp_path = self.path.with_extension("json.tmp");

		fs::write(&tmp_path, contents)
			.await
			.map_err(|e| FileIOError::from_std_io_err(&tmp_path, e))?;

		fs::rename(&tmp_path, &self.path)
			.await
			.map_err(|e| FileIOError::from_std_io_err(&self.path, e))?;

		Ok(())
	}
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
	async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>, StorageError> {
		Ok(pick(&self.values.read(), keys))
	}

	async fn set(&self, values: HashMap<String, Value>) -> Result<(), StorageError> {
		let _guard = self.write_lock.lock().await;

		let (changes, contents) = {
			let mut map = self.values.write();
			let changes = apply(&mut map, values);
			(changes, serde_json::to_vec_pretty(&*map)?)
		};

		if changes.is_empty() {
			return Ok(());
		}

		self.write_file(contents).await?;

		let _ = self.changes_tx.send(StorageChanges {
			area: self.area,
			changes,
		});

		Ok(())
	}

	fn subscribe(&self) -> broadcast::Receiver<StorageChanges> {
		self.changes_tx.subscribe()
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use tempfile::tempdir;

	use super::*;

	#[tokio::test]
	async fn memory_store_only_reports_real_changes() {
		let store = MemoryStore::default();
		let mut rx = store.subscribe();

		store
			.set(HashMap::from([("a".to_string(), json!(1))]))
			.await
			.unwrap();
		let changes = rx.recv().await.unwrap();
		assert_eq!(changes.changes["a"].new_value, Some(json!(1)));

		store
			.set(HashMap::from([("a".to_string(), json!(1))]))
			.await
			.unwrap();
		assert!(rx.try_recv().is_err());

		let got = store.get(&["a".to_string(), "b".to_string()]).await.unwrap();
		assert_eq!(got.len(), 1);
	}

	#[tokio::test]
	async fn json_store_persists_and_diffs_on_reload() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("local.json");

		let store = JsonFileStore::open(&path, StorageArea::Local).await.unwrap();
		store
			.set(HashMap::from([
				("kept".to_string(), json!(1)),
				("dropped".to_string(), json!(2)),
			]))
			.await
			.unwrap();

		let reopened = JsonFileStore::open(&path, StorageArea::Local).await.unwrap();
		let got = reopened.get(&["kept".to_string()]).await.unwrap();
		assert_eq!(got["kept"], json!(1));

		let mut rx = store.subscribe();
		std::fs::write(&path, r#"{ "kept": 5 }"#).unwrap();
		store.reload().await.unwrap();

		let changes = rx.recv().await.unwrap();
		assert_eq!(changes.changes.len(), 2);
		assert_eq!(changes.changes["kept"].new_value, Some(json!(5)));
		assert_eq!(changes.changes["dropped"].new_value, None);
	}

	#[tokio::test]
	async fn non_object_files_are_rejected() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("local.json");
		std::fs::write(&path, "[1, 2]").unwrap();

		assert!(matches!(
			JsonFileStore::open(&path, StorageArea::Local).await,
			Err(StorageError::NotAnObject(_))
		));
	}
}
