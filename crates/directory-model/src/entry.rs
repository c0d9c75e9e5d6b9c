//! Entries and the containers that hold them.

use std::{
	fmt,
	path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity of an entry, used to recognize "the same item" across scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryUrl(String);

impl EntryUrl {
	pub fn new(url: impl Into<String>) -> Self {
		Self(url.into())
	}

	pub fn from_path(path: impl AsRef<Path>) -> Self {
		Self(format!("file://{}", path.as_ref().to_string_lossy()))
	}

	/// The local path behind a `file://` url, if any.
	pub fn to_path(&self) -> Option<PathBuf> {
		self.0.strip_prefix("file://").map(PathBuf::from)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for EntryUrl {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
	File,
	Directory,
}

/// A materialized item of a container listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
	pub url: EntryUrl,
	pub name: String,
	pub kind: EntryKind,
	pub size: u64,
	pub modified_at: Option<DateTime<Utc>>,
}

impl Entry {
	pub fn file(url: EntryUrl, name: impl Into<String>, size: u64) -> Self {
		Self {
			url,
			name: name.into(),
			kind: EntryKind::File,
			size,
			modified_at: None,
		}
	}

	pub fn directory(url: EntryUrl, name: impl Into<String>) -> Self {
		Self {
			url,
			name: name.into(),
			kind: EntryKind::Directory,
			size: 0,
			modified_at: None,
		}
	}

	#[must_use]
	pub fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
		self.modified_at = Some(modified_at);
		self
	}

	pub const fn is_directory(&self) -> bool {
		matches!(self.kind, EntryKind::Directory)
	}

	pub fn is_hidden(&self) -> bool {
		self.name.starts_with('.')
	}

	/// Lowercased extension, used as the "type" sort key.
	pub fn extension(&self) -> Option<String> {
		Path::new(&self.name)
			.extension()
			.map(|ext| ext.to_string_lossy().to_lowercase())
	}
}

/// Synthetic roots that aggregate entries from elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyntheticRoot {
	/// Recently modified files across the configured roots.
	Recent,
}

/// Opaque handle to something enumerable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Container {
	Directory(PathBuf),
	Search { root: PathBuf, query: String },
	Synthetic(SyntheticRoot),
}

impl Container {
	pub fn directory(path: impl Into<PathBuf>) -> Self {
		Self::Directory(path.into())
	}

	pub fn url(&self) -> EntryUrl {
		match self {
			Self::Directory(path) => EntryUrl::from_path(path),
			Self::Search { root, query } => {
				EntryUrl::new(format!("search://{}?q={query}", root.to_string_lossy()))
			}
			Self::Synthetic(SyntheticRoot::Recent) => EntryUrl::new("fake-entry://recent"),
		}
	}

	/// Parent container, synthetic roots and filesystem roots have none.
	pub fn parent(&self) -> Option<Self> {
		match self {
			Self::Directory(path) => path.parent().map(|p| Self::Directory(p.to_path_buf())),
			Self::Search { root, .. } => Some(Self::Directory(root.clone())),
			Self::Synthetic(_) => None,
		}
	}

	/// The filesystem location this container resolves to, used for volume lookups.
	pub fn location(&self) -> Option<&Path> {
		match self {
			Self::Directory(path) | Self::Search { root: path, .. } => Some(path),
			Self::Synthetic(_) => None,
		}
	}

	/// The directory a search was started from, or the container itself.
	pub fn base_directory(&self) -> Self {
		match self {
			Self::Search { root, .. } => Self::Directory(root.clone()),
			other => other.clone(),
		}
	}

	pub const fn is_search(&self) -> bool {
		matches!(self, Self::Search { .. })
	}

	pub const fn synthetic_root(&self) -> Option<SyntheticRoot> {
		match self {
			Self::Synthetic(root) => Some(*root),
			_ => None,
		}
	}
}

impl fmt::Display for Container {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.url())
	}
}
