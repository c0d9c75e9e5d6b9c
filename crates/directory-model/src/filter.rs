//! Entry filtering applied while enumerating containers.

use std::{collections::BTreeMap, fmt, sync::Arc};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use crate::entry::Entry;

type Predicate = Arc<dyn Fn(&Entry) -> bool + Send + Sync>;

/// Decides which entries make it into a listing.
///
/// Hidden entries (dot files) are rejected unless explicitly shown, and every
/// named predicate must accept an entry. Any change bumps a generation counter
/// observable through [`FileFilter::subscribe`].
pub struct FileFilter {
	show_hidden: RwLock<bool>,
	predicates: RwLock<BTreeMap<String, Predicate>>,
	generation: watch::Sender<u64>,
}

impl FileFilter {
	pub fn new() -> Self {
		Self {
			show_hidden: RwLock::new(false),
			predicates: RwLock::new(BTreeMap::new()),
			generation: watch::Sender::new(0),
		}
	}

	pub fn accepts(&self, entry: &Entry) -> bool {
		if entry.is_hidden() && !*self.show_hidden.read() {
			return false;
		}

		self.predicates
			.read()
			.values()
			.all(|predicate| predicate(entry))
	}

	pub fn hidden_files_visible(&self) -> bool {
		*self.show_hidden.read()
	}

	pub fn set_hidden_files_visible(&self, visible: bool) {
		let changed = {
			let mut show_hidden = self.show_hidden.write();
			let changed = *show_hidden != visible;
			*show_hidden = visible;
			changed
		};

		if changed {
			debug!(%visible, "Hidden files visibility changed");
			self.bump();
		}
	}

	pub fn add_filter(
		&self,
		name: impl Into<String>,
		predicate: impl Fn(&Entry) -> bool + Send + Sync + 'static,
	) {
		self.predicates
			.write()
			.insert(name.into(), Arc::new(predicate));
		self.bump();
	}

	pub fn remove_filter(&self, name: &str) {
		if self.predicates.write().remove(name).is_some() {
			self.bump();
		}
	}

	/// Receiver notified every time the filtering criteria change.
	pub fn subscribe(&self) -> watch::Receiver<u64> {
		self.generation.subscribe()
	}

	fn bump(&self) {
		self.generation.send_modify(|generation| *generation += 1);
	}
}

impl Default for FileFilter {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for FileFilter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FileFilter")
			.field("show_hidden", &*self.show_hidden.read())
			.field("predicates", &self.predicates.read().keys().collect::<Vec<_>>())
			.finish()
	}
}
