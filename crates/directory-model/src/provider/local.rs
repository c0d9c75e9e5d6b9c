use std::{
	collections::{HashSet, VecDeque},
	fs::Metadata,
	io,
	mem,
	path::{Path, PathBuf},
};

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::fs::{self, ReadDir};
use tracing::{debug, instrument, trace};

use crate::{
	config::DirectoryModelConfig,
	entry::{Container, Entry, EntryUrl, SyntheticRoot},
	error::ScanError,
};

use super::{EntryProvider, EntryStream};

/// Provider over the local filesystem.
///
/// Directories are listed in batches, searches walk the tree below their root
/// matching names case-insensitively, and the `Recent` root lists files touched
/// within a time window across the configured roots.
#[derive(Debug, Clone)]
pub struct LocalFsProvider {
	batch_size: usize,
	search_max_results: usize,
	recent_roots: Vec<PathBuf>,
	recent_window: chrono::Duration,
	recent_max_results: usize,
}

impl LocalFsProvider {
	pub fn new(config: &DirectoryModelConfig) -> Self {
		Self {
			batch_size: config.scan_batch_size.max(1),
			search_max_results: config.search_max_results,
			recent_roots: Vec::new(),
			recent_window: config.recent_window(),
			recent_max_results: config.recent_max_results,
		}
	}

	#[must_use]
	pub fn with_recent_roots(mut self, roots: impl IntoIterator<Item = PathBuf>) -> Self {
		self.recent_roots = roots.into_iter().collect();
		self
	}

	async fn open_dir(path: &Path) -> Result<ReadDir, ScanError> {
		fs::read_dir(path).await.map_err(|e| match e.kind() {
			io::ErrorKind::NotFound => ScanError::NotFound(EntryUrl::from_path(path)),
			_ => ScanError::from_io(path, e),
		})
	}

	fn directory_batches(
		path: PathBuf,
		mut read_dir: ReadDir,
		batch_size: usize,
	) -> impl Stream<Item = Result<Vec<Entry>, ScanError>> + Send + 'static {
		try_stream! {
			let mut batch = Vec::with_capacity(batch_size);

			while let Some(dir_entry) = read_dir
				.next_entry()
				.await
				.map_err(|e| ScanError::from_io(&path, e))?
			{
				if let Some(entry) = load_entry(&dir_entry.path()).await {
					batch.push(entry);
				}

				if batch.len() >= batch_size {
					yield mem::replace(&mut batch, Vec::with_capacity(batch_size));
				}
			}

			if !batch.is_empty() {
				yield batch;
			}
		}
	}

	fn search_batches(
		root: PathBuf,
		root_dir: ReadDir,
		query: String,
		max_results: usize,
	) -> impl Stream<Item = Result<Vec<Entry>, ScanError>> + Send + 'static {
		try_stream! {
			let needle = query.to_lowercase();
			let mut found = 0;
			let mut pending = VecDeque::from([(root.clone(), Some(root_dir))]);
			let mut visited = HashSet::new();
			first_visit(&mut visited, &root).await;

			while let Some((dir, maybe_read_dir)) = pending.pop_front() {
				if found >= max_results {
					break;
				}

				let mut read_dir = match maybe_read_dir {
					Some(read_dir) => read_dir,
					None => match fs::read_dir(&dir).await {
						Ok(read_dir) => read_dir,
						Err(e) => {
							// Unreadable subtrees don't fail the whole search
							debug!(?e, dir = %dir.display(), "Skipping directory during search;");
							continue;
						}
					},
				};

				let mut batch = Vec::new();

				while let Some(dir_entry) = read_dir
					.next_entry()
					.await
					.map_err(|e| ScanError::from_io(&dir, e))?
				{
					let Some(entry) = load_entry(&dir_entry.path()).await else {
						continue;
					};

					if entry.is_directory() && first_visit(&mut visited, &dir_entry.path()).await {
						pending.push_back((dir_entry.path(), None));
					}

					if found < max_results && entry.name.to_lowercase().contains(&needle) {
						found += 1;
						batch.push(entry);
					}
				}

				if !batch.is_empty() {
					yield batch;
				}
			}

			trace!(%found, root = %root.display(), "Search finished");
		}
	}

	fn recent_batches(
		roots: Vec<PathBuf>,
		since: DateTime<Utc>,
		max_results: usize,
		batch_size: usize,
	) -> impl Stream<Item = Result<Vec<Entry>, ScanError>> + Send + 'static {
		try_stream! {
			let mut recent = Vec::new();
			let mut visited = HashSet::new();
			let mut pending = VecDeque::new();

			for root in roots {
				if first_visit(&mut visited, &root).await {
					pending.push_back(root);
				}
			}

			while let Some(dir) = pending.pop_front() {
				let mut read_dir = match fs::read_dir(&dir).await {
					Ok(read_dir) => read_dir,
					Err(e) => {
						debug!(?e, dir = %dir.display(), "Skipping directory for recent files;");
						continue;
					}
				};

				while let Some(dir_entry) = read_dir
					.next_entry()
					.await
					.map_err(|e| ScanError::from_io(&dir, e))?
				{
					let Some(entry) = load_entry(&dir_entry.path()).await else {
						continue;
					};

					if entry.is_directory() {
						if !entry.is_hidden() && first_visit(&mut visited, &dir_entry.path()).await {
							pending.push_back(dir_entry.path());
						}
					} else if entry.modified_at.is_some_and(|modified_at| modified_at >= since) {
						recent.push(entry);
					}
				}
			}

			recent.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
			recent.truncate(max_results);

			let mut recent = recent.into_iter().peekable();
			while recent.peek().is_some() {
				yield recent.by_ref().take(batch_size).collect::<Vec<_>>();
			}
		}
	}
}

#[async_trait]
impl EntryProvider for LocalFsProvider {
	#[instrument(skip(self, container), fields(%container))]
	async fn enumerate(
		&self,
		container: &Container,
		_refresh: bool,
	) -> Result<EntryStream, ScanError> {
		match container {
			Container::Directory(path) => {
				let read_dir = Self::open_dir(path).await?;
				Ok(Box::pin(Self::directory_batches(
					path.clone(),
					read_dir,
					self.batch_size,
				)))
			}

			Container::Search { root, query } => {
				let read_dir = Self::open_dir(root).await?;
				Ok(Box::pin(Self::search_batches(
					root.clone(),
					read_dir,
					query.clone(),
					self.search_max_results,
				)))
			}

			Container::Synthetic(SyntheticRoot::Recent) => Ok(Box::pin(Self::recent_batches(
				self.recent_roots.clone(),
				Utc::now() - self.recent_window,
				self.recent_max_results,
				self.batch_size,
			))),
		}
	}

	async fn resolve(&self, url: &EntryUrl) -> Result<Entry, ScanError> {
		let path = url
			.to_path()
			.ok_or_else(|| ScanError::NotFound(url.clone()))?;

		match fs::metadata(&path).await {
			Ok(metadata) => Ok(entry_from_metadata(&path, &metadata)),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ScanError::NotFound(url.clone())),
			Err(e) => Err(ScanError::from_io(&path, e)),
		}
	}
}

/// Records the directory behind `path`, false if a walk already went through it.
///
/// Symlinks are resolved so a link back up the tree can't loop a walk.
async fn first_visit(visited: &mut HashSet<PathBuf>, path: &Path) -> bool {
	match fs::canonicalize(path).await {
		Ok(canonical) => {
			let first = visited.insert(canonical);
			if !first {
				trace!(path = %path.display(), "Directory already walked");
			}
			first
		}
		Err(e) => {
			debug!(?e, path = %path.display(), "Skipping unresolvable directory;");
			false
		}
	}
}

/// Entry for `path`, following symlinks; `None` if it vanished meanwhile.
async fn load_entry(path: &Path) -> Option<Entry> {
	let metadata = match fs::metadata(path).await {
		Ok(metadata) => metadata,
		// Dangling symlinks are still listed, as files
		Err(_) => match fs::symlink_metadata(path).await {
			Ok(metadata) => metadata,
			Err(e) => {
				trace!(?e, path = %path.display(), "Entry disappeared while listing;");
				return None;
			}
		},
	};

	Some(entry_from_metadata(path, &metadata))
}

fn entry_from_metadata(path: &Path, metadata: &Metadata) -> Entry {
	let url = EntryUrl::from_path(path);
	let name = path
		.file_name()
		.map_or_else(|| path.to_string_lossy(), |name| name.to_string_lossy())
		.into_owned();

	let entry = if metadata.is_dir() {
		Entry::directory(url, name)
	} else {
		Entry::file(url, name, metadata.len())
	};

	match metadata.modified() {
		Ok(modified_at) => entry.with_modified_at(DateTime::<Utc>::from(modified_at)),
		Err(_) => entry,
	}
}

#[cfg(test)]
mod tests {
	use futures::TryStreamExt;
	use tempfile::tempdir;

	use super::*;

	fn provider(batch_size: usize) -> LocalFsProvider {
		LocalFsProvider::new(&DirectoryModelConfig {
			scan_batch_size: batch_size,
			..Default::default()
		})
	}

	#[tokio::test]
	async fn lists_in_batches() {
		let dir = tempdir().unwrap();
		for name in ["a", "b", "c"] {
			std::fs::write(dir.path().join(name), name).unwrap();
		}
		std::fs::create_dir(dir.path().join("sub")).unwrap();

		let batches = provider(2)
			.enumerate(&Container::directory(dir.path()), false)
			.await
			.unwrap()
			.try_collect::<Vec<_>>()
			.await
			.unwrap();

		assert_eq!(batches.len(), 2);
		let entries = batches.concat();
		assert_eq!(entries.len(), 4);
		assert!(entries.iter().any(|e| e.name == "sub" && e.is_directory()));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn searches_survive_symlink_loops() {
		let dir = tempdir().unwrap();
		let root = dir.path().canonicalize().unwrap();
		std::fs::create_dir(root.join("sub")).unwrap();
		std::fs::write(root.join("sub/x.txt"), "x").unwrap();
		std::os::unix::fs::symlink(&root, root.join("sub/back")).unwrap();

		let found = provider(10)
			.enumerate(
				&Container::Search {
					root: root.clone(),
					query: "x".into(),
				},
				false,
			)
			.await
			.unwrap()
			.try_collect::<Vec<_>>()
			.await
			.unwrap()
			.concat();

		assert_eq!(
			found.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
			vec!["x.txt"]
		);
	}

	#[tokio::test]
	async fn missing_directories_fail_up_front() {
		let dir = tempdir().unwrap();
		let result = provider(10)
			.enumerate(&Container::directory(dir.path().join("nope")), false)
			.await;

		assert!(matches!(result, Err(ScanError::NotFound(_))));
	}

	#[tokio::test]
	async fn resolve_reports_missing_entries() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("file.txt");
		std::fs::write(&path, "x").unwrap();

		let provider = provider(10);
		let entry = provider.resolve(&EntryUrl::from_path(&path)).await.unwrap();
		assert_eq!(entry.name, "file.txt");
		assert_eq!(entry.size, 1);

		std::fs::remove_file(&path).unwrap();
		assert!(matches!(
			provider.resolve(&EntryUrl::from_path(&path)).await,
			Err(ScanError::NotFound(_))
		));
	}
}
