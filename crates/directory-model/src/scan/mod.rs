//! Scanning a single container.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
	entry::{Entry, EntryUrl},
	error::ScanError,
	filter::FileFilter,
	metadata::MetadataStore,
	provider::EntryProvider,
};

mod session;

pub use session::ScanSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanState {
	Idle,
	Scanning,
	Completed,
	Failed,
	Cancelled,
}

impl ScanState {
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
	}
}

/// Entries that entered or changed, and identities that left, in one step of a scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanDelta {
	pub changed: Vec<Entry>,
	pub removed: Vec<EntryUrl>,
}

impl ScanDelta {
	pub fn is_empty(&self) -> bool {
		self.changed.is_empty() && self.removed.is_empty()
	}
}

/// Published by a [`ScanSession`]; every run ends with exactly one terminal event.
#[derive(Debug, Clone)]
pub enum ScanEvent {
	Updated(ScanDelta),
	Completed,
	Failed(ScanError),
	Cancelled,
}

impl ScanEvent {
	pub const fn is_terminal(&self) -> bool {
		!matches!(self, Self::Updated(_))
	}
}

/// How a scan or partial update ended.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
	Completed,
	Failed(ScanError),
	Cancelled,
}

/// Collaborators shared by every session of a coordinator.
#[derive(Debug, Clone)]
pub struct ScanContext {
	pub provider: Arc<dyn EntryProvider>,
	pub filter: Arc<FileFilter>,
	pub metadata: Arc<dyn MetadataStore>,
	pub metadata_chunk_size: usize,
	pub event_capacity: usize,
}

impl ScanContext {
	pub fn new(
		provider: Arc<dyn EntryProvider>,
		filter: Arc<FileFilter>,
		metadata: Arc<dyn MetadataStore>,
	) -> Self {
		Self {
			provider,
			filter,
			metadata,
			metadata_chunk_size: 25,
			event_capacity: 1024,
		}
	}
}
