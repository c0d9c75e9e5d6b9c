//! Sources of entries for a [`Container`].

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{
	entry::{Container, Entry, EntryUrl},
	error::ScanError,
};

mod local;

pub use local::LocalFsProvider;

/// Batches of entries, in display order, ending at the first error.
pub type EntryStream = BoxStream<'static, Result<Vec<Entry>, ScanError>>;

/// Resolves containers into concrete enumerable sources.
#[async_trait]
pub trait EntryProvider: Send + Sync + fmt::Debug {
	/// Start enumerating `container`. `refresh` asks the provider to bypass any
	/// listing cache it keeps.
	async fn enumerate(&self, container: &Container, refresh: bool)
		-> Result<EntryStream, ScanError>;

	/// Materialize a single entry, used to turn watcher urls into entries.
	async fn resolve(&self, url: &EntryUrl) -> Result<Entry, ScanError>;
}
