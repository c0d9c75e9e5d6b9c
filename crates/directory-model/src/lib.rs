//!
//! # Directory Model
//!
//! Coordinates what a file browser displays: which directory or search is
//! shown, the scan enumerating it, the rescans keeping it fresh and the
//! advisory banners shown above it.
//!
//! The [`DirectoryModel`] is the entry point. Directory changes are
//! sequenced through a strict FIFO queue, so at most one scan runs for a
//! directory change at any time, and results of superseded changes are
//! dropped without touching the displayed list. Filesystem notifications from a
//! [`DirectoryWatcher`] become partial updates of the displayed list when
//! they say which files changed, and an aggregated rescan otherwise.
//!
//! The [`BannerController`] picks at most one banner for the displayed
//! location, warnings first, and persists view counters and dismissals in a
//! [`KeyValueStore`].
//!
//! ## Basic example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sd_directory_model::{
//! 	Container, DirectoryModel, DirectoryModelConfig, DirectoryWatcher, LocalFsProvider,
//! 	VolumeRegistry,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DirectoryModelConfig::default();
//! let watcher = Arc::new(DirectoryWatcher::new()?);
//!
//! let model = DirectoryModel::builder(
//! 	config.clone(),
//! 	Arc::new(LocalFsProvider::new(&config)),
//! 	Arc::new(VolumeRegistry::detect()),
//! )
//! .watch_registrar(watcher.clone())
//! .build();
//!
//! model.attach_watcher(watcher.events());
//!
//! let outcome = model.change_directory(Container::Directory("/tmp".into())).await;
//! assert!(outcome.is_displayed());
//!
//! for entry in model.entries() {
//! 	println!("{}", entry.name);
//! }
//! # Ok(())
//! # }
//! ```
#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(
	clippy::missing_errors_doc,
	clippy::module_name_repetitions,
	clippy::missing_panics_doc
)]

pub mod banner;
pub mod config;
pub mod entry;
pub mod error;
pub mod events;
pub mod file_list;
pub mod filter;
pub mod logging;
pub mod metadata;
pub mod model;
pub mod provider;
pub mod queue;
pub mod scan;
pub mod selection;
pub mod storage;
pub mod volume;
pub mod watcher;

pub use banner::{BannerController, BannerEvent, BannerKind, BannerSpec, DiskThreshold};
pub use config::{BannerConfig, DirectoryModelConfig};
pub use entry::{Container, Entry, EntryKind, EntryUrl, SyntheticRoot};
pub use error::{Error, ScanError, StorageError, VolumeError, WatcherError};
pub use file_list::{FileListModel, SortDirection, SortField, SortSpec};
pub use filter::FileFilter;
pub use metadata::{MetadataCache, MetadataStore};
pub use model::{
	ChangeOutcome, DirectoryChange, DirectoryModel, DirectoryModelBuilder, DirectoryModelEvent,
	EntriesChange,
};
pub use provider::{EntryProvider, EntryStream, LocalFsProvider};
pub use scan::{ScanSession, ScanState};
pub use selection::Selection;
pub use storage::{JsonFileStore, KeyValueStore, MemoryStore, StorageArea, StorageChanges};
pub use volume::{DriveConnectionState, Volume, VolumeManager, VolumeRegistry, VolumeType};
pub use watcher::{ChangeKind, ChangedFile, DirectoryWatcher, WatchRegistrar, WatcherEvent};
