//! Metadata cache keyed by entry identity.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::trace;

use crate::entry::{Entry, EntryUrl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataProperty {
	Size,
	ModificationTime,
	IsDirectory,
	ReadOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
	pub size: Option<u64>,
	pub modified_at: Option<DateTime<Utc>>,
	pub is_directory: Option<bool>,
	pub read_only: Option<bool>,
}

impl EntryMetadata {
	fn merge(&mut self, other: Self) {
		self.size = other.size.or(self.size);
		self.modified_at = other.modified_at.or(self.modified_at);
		self.is_directory = other.is_directory.or(self.is_directory);
		self.read_only = other.read_only.or(self.read_only);
	}

	fn has(&self, property: MetadataProperty) -> bool {
		match property {
			MetadataProperty::Size => self.size.is_some(),
			MetadataProperty::ModificationTime => self.modified_at.is_some(),
			MetadataProperty::IsDirectory => self.is_directory.is_some(),
			MetadataProperty::ReadOnly => self.read_only.is_some(),
		}
	}
}

/// Prefetch and invalidation hooks called as entries enter or leave a listing.
#[async_trait]
pub trait MetadataStore: Send + Sync + fmt::Debug {
	/// Metadata for each of `entries`, in the same order. `refresh` bypasses the cache.
	async fn get(
		&self,
		entries: &[Entry],
		properties: &[MetadataProperty],
		refresh: bool,
	) -> Vec<EntryMetadata>;

	fn notify_entries_created(&self, entries: &[Entry]);

	fn notify_entries_removed(&self, urls: &[EntryUrl]);

	fn clear_all_cache(&self) {}
}

/// In-memory [`MetadataStore`], filling misses from the local filesystem.
#[derive(Debug, Default)]
pub struct MetadataCache {
	cache: RwLock<HashMap<EntryUrl, EntryMetadata>>,
}

impl MetadataCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cached(&self, url: &EntryUrl) -> Option<EntryMetadata> {
		self.cache.read().get(url).cloned()
	}

	pub fn len(&self) -> usize {
		self.cache.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.cache.read().is_empty()
	}

	async fn fetch(entry: &Entry, properties: &[MetadataProperty]) -> EntryMetadata {
		let mut metadata = EntryMetadata::default();

		if let Some(path) = entry.url.to_path() {
			match fs::metadata(&path).await {
				Ok(fs_metadata) => {
					for property in properties {
						match property {
							MetadataProperty::Size => metadata.size = Some(fs_metadata.len()),
							MetadataProperty::ModificationTime => {
								metadata.modified_at =
									fs_metadata.modified().ok().map(DateTime::<Utc>::from);
							}
							MetadataProperty::IsDirectory => {
								metadata.is_directory = Some(fs_metadata.is_dir());
							}
							MetadataProperty::ReadOnly => {
								metadata.read_only = Some(fs_metadata.permissions().readonly());
							}
						}
					}
					return metadata;
				}
				Err(e) => trace!(?e, url = %entry.url, "Falling back to listing metadata;"),
			}
		}

		// Entries outside the local filesystem only know what the listing told us
		for property in properties {
			match property {
				MetadataProperty::Size => metadata.size = Some(entry.size),
				MetadataProperty::ModificationTime => metadata.modified_at = entry.modified_at,
				MetadataProperty::IsDirectory => metadata.is_directory = Some(entry.is_directory()),
				MetadataProperty::ReadOnly => {}
			}
		}

		metadata
	}
}

#[async_trait]
impl MetadataStore for MetadataCache {
	async fn get(
		&self,
		entries: &[Entry],
		properties: &[MetadataProperty],
		refresh: bool,
	) -> Vec<EntryMetadata> {
		let mut results = Vec::with_capacity(entries.len());

		for entry in entries {
			if !refresh {
				if let Some(cached) = self.cached(&entry.url) {
					if properties.iter().all(|property| cached.has(*property)) {
						results.push(cached);
						continue;
					}
				}
			}

			let fetched = Self::fetch(entry, properties).await;

			let merged = {
				let mut cache = self.cache.write();
				let slot = cache.entry(entry.url.clone()).or_default();
				slot.merge(fetched);
				slot.clone()
			};

			results.push(merged);
		}

		results
	}

	fn notify_entries_created(&self, entries: &[Entry]) {
		// New entries may reuse the identity of a deleted one
		let mut cache = self.cache.write();
		for entry in entries {
			cache.remove(&entry.url);
		}
	}

	fn notify_entries_removed(&self, urls: &[EntryUrl]) {
		let mut cache = self.cache.write();
		for url in urls {
			cache.remove(url);
		}
	}

	fn clear_all_cache(&self) {
		self.cache.write().clear();
	}
}

#[cfg(test)]
mod tests {
	use tempfile::tempdir;

	use super::*;

	#[tokio::test]
	async fn fills_from_disk_and_invalidates() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("a.txt");
		std::fs::write(&path, b"hello").unwrap();

		let entry = Entry::file(EntryUrl::from_path(&path), "a.txt", 0);
		let cache = MetadataCache::new();

		let metadata = cache
			.get(
				&[entry.clone()],
				&[MetadataProperty::Size, MetadataProperty::IsDirectory],
				false,
			)
			.await;
		assert_eq!(metadata[0].size, Some(5));
		assert_eq!(metadata[0].is_directory, Some(false));
		assert_eq!(cache.len(), 1);

		cache.notify_entries_removed(&[entry.url.clone()]);
		assert!(cache.is_empty());
	}

	#[tokio::test]
	async fn synthetic_entries_use_listing_values() {
		let entry = Entry::file(EntryUrl::new("drive://shared/report.pdf"), "report.pdf", 42);
		let cache = MetadataCache::new();

		let metadata = cache.get(&[entry], &[MetadataProperty::Size], false).await;
		assert_eq!(metadata[0].size, Some(42));

		cache.clear_all_cache();
		assert!(cache.is_empty());
	}
}
