//! Watching the displayed directory for changes.
//!
//! [`DirectoryWatcher`] watches one directory at a time, non recursively, and
//! turns raw `notify` events into [`WatcherEvent`]s. Events the backend can
//! describe become a structured list of changed files; overflows, rescan
//! requests and backend errors become an unstructured "something changed".

use std::{
	fmt,
	path::{Path, PathBuf},
	sync::Arc,
};

use async_channel as chan;
use async_trait::async_trait;
use notify::{
	event::{ModifyKind, RenameMode},
	Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{spawn, task::JoinHandle};
use tracing::{debug, error, instrument, trace, warn};

use crate::{
	entry::{Container, EntryUrl},
	error::WatcherError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
	Create,
	Delete,
	Modify,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
	pub url: EntryUrl,
	pub changes: Vec<ChangeKind>,
}

impl ChangedFile {
	pub fn new(url: EntryUrl, change: ChangeKind) -> Self {
		Self {
			url,
			changes: vec![change],
		}
	}

	/// Only a lone deletion is a removal, a file deleted then created again still exists.
	pub fn is_deleted(&self) -> bool {
		self.changes == [ChangeKind::Delete]
	}
}

/// A change inside a watched directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherEvent {
	pub directory: EntryUrl,
	/// `None` when the backend could not tell what changed.
	pub changed_files: Option<Vec<ChangedFile>>,
}

impl WatcherEvent {
	pub const fn unstructured(directory: EntryUrl) -> Self {
		Self {
			directory,
			changed_files: None,
		}
	}
}

/// Points the host's watcher at the displayed container.
#[async_trait]
pub trait WatchRegistrar: Send + Sync + fmt::Debug {
	/// Watch `container` instead of whatever was watched before, `None` stops watching.
	async fn change_watched_directory(
		&self,
		container: Option<&Container>,
	) -> Result<(), WatcherError>;
}

#[derive(Debug)]
pub struct DirectoryWatcher {
	watcher: Mutex<RecommendedWatcher>,
	watched: Arc<Mutex<Option<PathBuf>>>,
	events_rx: chan::Receiver<WatcherEvent>,
	handle: JoinHandle<()>,
}

impl DirectoryWatcher {
	/// Must be called from within a tokio runtime.
	pub fn new() -> Result<Self, WatcherError> {
		let (raw_tx, raw_rx) = chan::unbounded();
		let (events_tx, events_rx) = chan::unbounded();
		let watched = Arc::new(Mutex::new(None));

		let watcher = RecommendedWatcher::new(
			move |result| {
				if !raw_tx.is_closed() {
					// SAFETY: unbounded channel, this never blocks the backend thread
					if raw_tx.send_blocking(result).is_err() {
						error!("Unable to forward file system event;");
					}
				}
			},
			Config::default(),
		)?;

		let handle = spawn(Self::run_loop(raw_rx, events_tx, Arc::clone(&watched)));

		Ok(Self {
			watcher: Mutex::new(watcher),
			watched,
			events_rx,
			handle,
		})
	}

	/// Stream of translated events, shared by every clone of the receiver.
	pub fn events(&self) -> chan::Receiver<WatcherEvent> {
		self.events_rx.clone()
	}

	pub fn watched(&self) -> Option<PathBuf> {
		self.watched.lock().clone()
	}

	async fn run_loop(
		raw_rx: chan::Receiver<notify::Result<Event>>,
		events_tx: chan::Sender<WatcherEvent>,
		watched: Arc<Mutex<Option<PathBuf>>>,
	) {
		while let Ok(result) = raw_rx.recv().await {
			let Some(directory) = watched.lock().clone() else {
				trace!("Dropping event received while nothing is watched");
				continue;
			};

			if let Some(event) = translate(&directory, result) {
				if events_tx.send(event).await.is_err() {
					break;
				}
			}
		}

		debug!("Directory watcher loop finished");
	}
}

#[async_trait]
impl WatchRegistrar for DirectoryWatcher {
	#[instrument(skip(self, container), fields(container = ?container.map(ToString::to_string)))]
	async fn change_watched_directory(
		&self,
		container: Option<&Container>,
	) -> Result<(), WatcherError> {
		let next = match container {
			Some(Container::Directory(path)) => Some(path.clone()),
			Some(other) => return Err(WatcherError::Unwatchable(other.url())),
			None => None,
		};

		let mut watcher = self.watcher.lock();
		let mut watched = self.watched.lock();

		if *watched == next {
			return Ok(());
		}

		if let Some(previous) = watched.take() {
			if let Err(e) = watcher.unwatch(&previous) {
				// The directory may be gone already
				warn!(?e, previous = %previous.display(), "Unable to unwatch directory;");
			}
		}

		if let Some(path) = next {
			watcher.watch(&path, RecursiveMode::NonRecursive)?;
			trace!(path = %path.display(), "Now watching directory");
			*watched = Some(path);
		}

		Ok(())
	}
}

impl Drop for DirectoryWatcher {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

fn translate(directory: &Path, result: notify::Result<Event>) -> Option<WatcherEvent> {
	let directory_url = EntryUrl::from_path(directory);

	let event = match result {
		Ok(event) => event,
		Err(e) => {
			error!(?e, "File system watcher error, asking for a rescan;");
			return Some(WatcherEvent::unstructured(directory_url));
		}
	};

	if event.need_rescan() {
		return Some(WatcherEvent::unstructured(directory_url));
	}

	let changed = |kind| {
		event
			.paths
			.iter()
			.map(|path| ChangedFile::new(EntryUrl::from_path(path), kind))
			.collect::<Vec<_>>()
	};

	let changed_files = match event.kind {
		EventKind::Access(_) => return None,
		EventKind::Create(_) => changed(ChangeKind::Create),
		EventKind::Remove(_) => changed(ChangeKind::Delete),
		EventKind::Modify(ModifyKind::Name(RenameMode::From)) => changed(ChangeKind::Delete),
		EventKind::Modify(ModifyKind::Name(RenameMode::To)) => changed(ChangeKind::Create),
		EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => vec![
			ChangedFile::new(EntryUrl::from_path(&event.paths[0]), ChangeKind::Delete),
			ChangedFile::new(EntryUrl::from_path(&event.paths[1]), ChangeKind::Create),
		],
		EventKind::Modify(ModifyKind::Name(_)) | EventKind::Any | EventKind::Other => {
			return Some(WatcherEvent::unstructured(directory_url));
		}
		EventKind::Modify(_) => changed(ChangeKind::Modify),
	};

	Some(WatcherEvent {
		directory: directory_url,
		changed_files: Some(changed_files),
	})
}

#[cfg(test)]
mod tests {
	use notify::event::{CreateKind, Flag, RemoveKind};

	use super::*;

	fn dir() -> PathBuf {
		PathBuf::from("/d")
	}

	#[test]
	fn renames_become_delete_and_create() {
		let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
			.add_path(dir().join("old"))
			.add_path(dir().join("new"));

		let translated = translate(&dir(), Ok(event)).unwrap();
		assert_eq!(
			translated.changed_files.unwrap(),
			vec![
				ChangedFile::new(EntryUrl::from_path("/d/old"), ChangeKind::Delete),
				ChangedFile::new(EntryUrl::from_path("/d/new"), ChangeKind::Create),
			]
		);
	}

	#[test]
	fn structured_kinds() {
		let created = translate(
			&dir(),
			Ok(Event::new(EventKind::Create(CreateKind::File)).add_path(dir().join("a"))),
		)
		.unwrap();
		assert_eq!(
			created.changed_files.unwrap()[0].changes,
			vec![ChangeKind::Create]
		);

		let removed = translate(
			&dir(),
			Ok(Event::new(EventKind::Remove(RemoveKind::Any)).add_path(dir().join("a"))),
		)
		.unwrap();
		assert!(removed.changed_files.unwrap()[0].is_deleted());
	}

	#[test]
	fn recreated_files_are_not_deletions() {
		let url = EntryUrl::from_path("/d/a");
		assert!(ChangedFile::new(url.clone(), ChangeKind::Delete).is_deleted());

		let recreated = ChangedFile {
			url,
			changes: vec![ChangeKind::Delete, ChangeKind::Create],
		};
		assert!(!recreated.is_deleted());
	}

	#[test]
	fn rescans_and_errors_are_unstructured() {
		let rescan = Event::new(EventKind::Other).set_flag(Flag::Rescan);
		assert_eq!(
			translate(&dir(), Ok(rescan)),
			Some(WatcherEvent::unstructured(EntryUrl::from_path("/d")))
		);

		let error = translate(&dir(), Err(notify::Error::generic("overflow"))).unwrap();
		assert!(error.changed_files.is_none());
	}

	#[tokio::test]
	async fn only_plain_directories_can_be_watched() {
		let watcher = DirectoryWatcher::new().unwrap();
		let search = Container::Search {
			root: dir(),
			query: "x".into(),
		};

		assert!(matches!(
			watcher.change_watched_directory(Some(&search)).await,
			Err(WatcherError::Unwatchable(_))
		));

		watcher.change_watched_directory(None).await.unwrap();
		assert_eq!(watcher.watched(), None);
	}
}
