use std::{fmt::Display, io, path::Path, sync::Arc};

use thiserror::Error;

use crate::entry::EntryUrl;

/// Errors raised while enumerating a container or resolving one of its entries.
///
/// Cloneable because the error travels inside broadcast events.
#[derive(Debug, Clone, Error)]
pub enum ScanError {
	#[error("permission denied while scanning: <path='{}'>", .0.display())]
	PermissionDenied(Box<Path>),
	#[error("entry not found: <url='{0}'>")]
	NotFound(EntryUrl),
	#[error("volume disconnected: <path='{}'>", .0.display())]
	Disconnected(Box<Path>),
	/// The backing mount could not be established; retrying will not help until
	/// something outside the scanner changes.
	#[error("connection not established: {0}")]
	ConnectionNotEstablished(String),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("provider error: {0}")]
	Provider(String),
}

impl ScanError {
	/// Classify a raw I/O failure for `path`.
	pub fn from_io(path: impl AsRef<Path>, source: io::Error) -> Self {
		match source.kind() {
			io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.as_ref().into()),
			io::ErrorKind::NotConnected => Self::Disconnected(path.as_ref().into()),
			_ => Self::FileIO(FileIOError::from_std_io_err(path, source)),
		}
	}

	/// Whether a failed scan may be retried automatically.
	pub const fn is_retryable(&self) -> bool {
		!matches!(self, Self::ConnectionNotEstablished(_))
	}
}

/// File I/O error that includes the path that caused the error
#[derive(Error, Debug, Clone)]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: Arc<io::Error>,
	pub maybe_context: Option<String>,
}

impl Display for FileIOError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"file I/O error{}: {}; path: '{}'",
			self.maybe_context
				.as_ref()
				.map(|ctx| format!(" ({ctx})"))
				.unwrap_or_default(),
			self.source,
			self.path.display()
		)
	}
}

impl FileIOError {
	pub fn from_std_io_err(path: impl AsRef<Path>, source: io::Error) -> Self {
		Self {
			path: path.as_ref().into(),
			source: Arc::new(source),
			maybe_context: None,
		}
	}

	pub fn from_std_io_err_with_msg(
		path: impl AsRef<Path>,
		source: io::Error,
		msg: impl Into<String>,
	) -> Self {
		Self {
			path: path.as_ref().into(),
			source: Arc::new(source),
			maybe_context: Some(msg.into()),
		}
	}
}

#[derive(Debug, Error)]
pub enum StorageError {
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("failed to (de)serialize storage file: {0}")]
	Serde(#[from] serde_json::Error),
	#[error("storage file is not a JSON object: <path='{}'>", .0.display())]
	NotAnObject(Box<Path>),
}

#[derive(Debug, Error)]
pub enum VolumeError {
	#[error("volume not found: <id='{0}'>")]
	NotFound(String),
	#[error("volume is not mounted: <id='{0}'>")]
	NotMounted(String),
}

#[derive(Debug, Error)]
pub enum WatcherError {
	#[error(transparent)]
	Notify(#[from] notify::Error),
	#[error("container can't be watched: <url='{0}'>")]
	Unwatchable(EntryUrl),
}

/// Crate level error, for hosts that want a single type to bubble up.
#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Scan(#[from] ScanError),
	#[error(transparent)]
	Storage(#[from] StorageError),
	#[error(transparent)]
	Volume(#[from] VolumeError),
	#[error(transparent)]
	Watcher(#[from] WatcherError),
}
